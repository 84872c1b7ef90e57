//! Structured file operations derived from a runtime's raw primitives.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::path::{self, normalize};
use crate::backend::protocol::{Backend, FileTransfer, SandboxBackend};
use crate::backend::text::{self, PathGlob};
use crate::backend::types::{
    EditResult, ExecuteResponse, FileDownloadResponse, FileInfo, FileUploadResponse, GrepOutcome,
    WriteResult,
};
use crate::error::{FileOperationError, Result};
use crate::sandbox::script::{self, ScriptOp};
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime};

struct ScriptOutput {
    text: String,
    truncated: bool,
}

/// Wraps any [`SandboxRuntime`] and exposes the full backend protocol.
pub struct BaseSandbox<R> {
    runtime: R,
}

impl<R: SandboxRuntime> BaseSandbox<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn info(&self) -> SandboxInfo {
        self.runtime.info()
    }

    /// Run one script op; lifecycle errors surface as `Err`.
    ///
    /// A cut stream keeps only whole records and comes back flagged.
    async fn run(&self, op: ScriptOp, args: &[&str]) -> Result<ScriptOutput> {
        let response = self.runtime.execute_script(&script::command(op, args)).await?;
        debug!(
            runtime = self.runtime.name(),
            op = ?op,
            exit_code = ?response.exit_code,
            "Script op finished"
        );

        let mut text = response.output;
        if response.truncated {
            warn!(
                runtime = self.runtime.name(),
                op = ?op,
                bytes = text.len(),
                "Script output was truncated; results are partial"
            );
            let whole = text.rfind('\n').map_or(0, |end| end + 1);
            text.truncate(whole);
        }
        Ok(ScriptOutput {
            text,
            truncated: response.truncated,
        })
    }

    async fn upload_one(&self, path: &str, bytes: Vec<u8>) -> Option<FileOperationError> {
        match self.runtime.upload_files(&[(path.to_string(), bytes)]).await {
            Ok(mut responses) => responses.pop().and_then(|r| r.error),
            Err(e) => {
                warn!(path = %path, error = %e, "Upload failed");
                Some(FileOperationError::PermissionDenied)
            }
        }
    }
}

#[async_trait]
impl<R: SandboxRuntime> Backend for BaseSandbox<R> {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    async fn ls_info(&self, path: &str) -> Vec<FileInfo> {
        let Ok(dir) = normalize(path) else {
            return Vec::new();
        };
        match self.run(ScriptOp::Ls, &[&dir]).await {
            Ok(output) => script::parse_entries(&output.text),
            Err(e) => {
                warn!(path = %dir, error = %e, "Listing failed");
                Vec::new()
            }
        }
    }

    async fn read(&self, path: &str, offset: usize, limit: usize) -> String {
        let file = match normalize(path) {
            Ok(file) => file,
            Err(e) => return format!("Error: {}", e),
        };
        let (off, lim) = (offset.to_string(), limit.to_string());
        match self.run(ScriptOp::Read, &[&file, &off, &lim]).await {
            Ok(output) if output.truncated => format!(
                "Error reading file '{}': the requested window exceeds the sandbox output limit; read fewer lines",
                path
            ),
            Ok(output) => script::parse_read(&output.text, path, offset, limit),
            Err(e) => format!("Error reading file '{}': {}", path, e),
        }
    }

    async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome {
        let base = normalize(path).map_err(|e| format!("Error: {}", e))?;
        let prefix = path::as_dir_prefix(&base).map_err(|e| format!("Error: {}", e))?;
        let filter = glob.map(PathGlob::include_filter).transpose()?;
        // grep's --include only sees file names
        let include = glob.filter(|g| !g.contains('/')).unwrap_or("");

        let output = self
            .run(ScriptOp::Grep, &[pattern, &base, include])
            .await
            .map_err(|e| format!("Error: {}", e))?;
        let mut matches = script::parse_grep(&output.text, output.truncated)?;
        if let Some(filter) = filter {
            matches.retain(|m| filter.matches(&path::strip_prefix(&m.path, &prefix), false));
        }
        Ok(matches)
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo> {
        let (Ok(base), Ok(glob)) = (normalize(path), PathGlob::new(pattern)) else {
            return Vec::new();
        };
        let Ok(prefix) = path::as_dir_prefix(&base) else {
            return Vec::new();
        };

        let output = match self.run(ScriptOp::Find, &[&base]).await {
            Ok(output) => output,
            Err(e) => {
                warn!(path = %base, error = %e, "Glob failed");
                return Vec::new();
            }
        };
        script::parse_entries(&output.text)
            .into_iter()
            .filter(|info| {
                let relative = path::strip_prefix(info.path.trim_end_matches('/'), &prefix);
                glob.matches(&relative, info.is_dir)
            })
            .collect()
    }

    async fn write(&self, path: &str, content: &str) -> WriteResult {
        let file = match normalize(path) {
            Ok(file) => file,
            Err(e) => return WriteResult::err(path, format!("Error: {}", e)),
        };

        let exists = match self.run(ScriptOp::Exists, &[&file]).await {
            Ok(output) => script::parse_exists(&output.text),
            Err(e) => return WriteResult::err(&file, format!("Error writing file '{}': {}", file, e)),
        };
        match exists {
            Some(true) => WriteResult::err(&file, text::already_exists(&file)),
            None => WriteResult::err(
                &file,
                format!("Error writing file '{}': could not check for an existing file", file),
            ),
            Some(false) => match self.upload_one(&file, content.as_bytes().to_vec()).await {
                None => WriteResult::ok(file),
                Some(err) => WriteResult::err(&file, format!("Error writing file '{}': {}", file, err)),
            },
        }
    }

    async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult {
        let file = match normalize(path) {
            Ok(file) => file,
            Err(e) => return EditResult::err(path, format!("Error: {}", e)),
        };

        let downloaded = match self.runtime.download_files(&[file.clone()]).await {
            Ok(mut responses) => responses.pop(),
            Err(e) => return EditResult::err(&file, format!("Error editing file '{}': {}", file, e)),
        };
        let bytes = match downloaded {
            Some(FileDownloadResponse {
                content: Some(bytes),
                error: None,
                ..
            }) => bytes,
            Some(FileDownloadResponse {
                error: Some(FileOperationError::FileNotFound),
                ..
            })
            | None => return EditResult::err(&file, text::file_not_found(path)),
            Some(response) => {
                let reason = response
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no content".to_string());
                return EditResult::err(&file, format!("Error editing file '{}': {}", file, reason));
            }
        };
        let Ok(content) = String::from_utf8(bytes) else {
            return EditResult::err(&file, format!("Error: '{}' is not a text file", file));
        };

        match text::replace_literal(&content, old, new, replace_all) {
            Ok((updated, occurrences)) => match self.upload_one(&file, updated.into_bytes()).await {
                None => EditResult::ok(file, occurrences),
                Some(err) => EditResult::err(&file, format!("Error editing file '{}': {}", file, err)),
            },
            Err(message) => EditResult::err(&file, message),
        }
    }

    fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        Some(self)
    }

    fn sandbox(&self) -> Option<&dyn SandboxBackend> {
        Some(self)
    }
}

#[async_trait]
impl<R: SandboxRuntime> FileTransfer for BaseSandbox<R> {
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        let mut valid = Vec::new();
        let mut slots = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            match normalize(path) {
                Ok(normalized) => {
                    slots.push(None);
                    valid.push((normalized, bytes.clone()));
                }
                Err(e) => slots.push(Some(FileUploadResponse::err(path, e.into()))),
            }
        }

        let mut uploaded = self.runtime.upload_files(&valid).await?.into_iter();
        Ok(slots
            .into_iter()
            .zip(files)
            .map(|(slot, (path, _))| {
                slot.unwrap_or_else(|| match uploaded.next() {
                    Some(response) => FileUploadResponse {
                        path: path.clone(),
                        error: response.error,
                    },
                    None => FileUploadResponse::err(path, FileOperationError::PermissionDenied),
                })
            })
            .collect())
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        let mut valid = Vec::new();
        let mut slots = Vec::with_capacity(paths.len());
        for path in paths {
            match normalize(path) {
                Ok(normalized) => {
                    slots.push(None);
                    valid.push(normalized);
                }
                Err(e) => slots.push(Some(FileDownloadResponse::err(path, e.into()))),
            }
        }

        let mut downloaded = self.runtime.download_files(&valid).await?.into_iter();
        Ok(slots
            .into_iter()
            .zip(paths)
            .map(|(slot, path)| {
                slot.unwrap_or_else(|| match downloaded.next() {
                    Some(response) => FileDownloadResponse {
                        path: path.clone(),
                        content: response.content,
                        error: response.error,
                    },
                    None => FileDownloadResponse::err(path, FileOperationError::FileNotFound),
                })
            })
            .collect())
    }
}

#[async_trait]
impl<R: SandboxRuntime> SandboxBackend for BaseSandbox<R> {
    fn id(&self) -> &str {
        self.runtime.id()
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
        self.runtime.execute(command).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime.shutdown().await
    }
}
