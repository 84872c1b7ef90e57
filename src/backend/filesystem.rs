//! Backend over a real host directory.
//!
//! In virtual mode every path is confined to `root_dir`: `/a/b` maps to
//! `<root_dir>/a/b` and resolved paths may not escape the root through
//! symlinks. Outside virtual mode virtual paths are host paths.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::backend::path::{self, normalize};
use crate::backend::protocol::{Backend, FileTransfer};
use crate::backend::text::{self, PathGlob};
use crate::backend::types::{
    EditResult, FileDownloadResponse, FileInfo, FileUploadResponse, GrepMatch, GrepOutcome,
    WriteResult,
};
use crate::error::{FileOperationError, Result};

/// Files larger than this are skipped by grep.
const MAX_GREP_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root_dir: PathBuf,
    virtual_mode: bool,
}

/// One entry found while walking the host tree.
struct WalkEntry {
    host: PathBuf,
    virtual_path: String,
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
}

fn rfc3339(time: Option<SystemTime>) -> Option<String> {
    time.map(|t| DateTime::<Utc>::from(t).to_rfc3339())
}

impl FilesystemBackend {
    /// A backend confined to `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            virtual_mode: true,
        }
    }

    /// A backend addressing host paths directly.
    pub fn host() -> Self {
        Self {
            root_dir: PathBuf::from("/"),
            virtual_mode: false,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn resolve(&self, virtual_path: &str) -> std::result::Result<PathBuf, String> {
        let normalized = normalize(virtual_path).map_err(|e| format!("Error: {}", e))?;
        if !self.virtual_mode {
            return Ok(PathBuf::from(normalized));
        }

        let full = self.root_dir.join(normalized.trim_start_matches('/'));
        if !self.stays_inside_root(&full) {
            return Err(format!("Error: Path traversal not allowed: {}", virtual_path));
        }
        Ok(full)
    }

    /// Canonicalize the nearest existing ancestor of `full` and require it
    /// under the root. A dangling symlink on the way is refused outright.
    fn stays_inside_root(&self, full: &Path) -> bool {
        let root = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());

        let mut current = full;
        while current.starts_with(&self.root_dir) {
            match current.canonicalize() {
                Ok(canonical) => return canonical.starts_with(&root),
                Err(_) if current.symlink_metadata().is_ok() => return false,
                Err(_) => match current.parent() {
                    Some(parent) => current = parent,
                    None => break,
                },
            }
        }
        true
    }

    fn to_virtual(&self, host: &Path) -> String {
        if !self.virtual_mode {
            return host.display().to_string();
        }
        match host.strip_prefix(&self.root_dir) {
            Ok(rel) => format!("/{}", rel.to_string_lossy().trim_start_matches('/')),
            Err(_) => host.display().to_string(),
        }
    }

    /// Depth-first walk below `dir`, not following symlinked directories.
    async fn walk(&self, dir: &Path) -> Vec<WalkEntry> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(path = %current.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let metadata = entry.metadata().await.ok();
                let host = entry.path();
                if file_type.is_dir() {
                    pending.push(host.clone());
                }
                let virtual_path = self.to_virtual(&host);
                found.push(WalkEntry {
                    virtual_path,
                    host,
                    is_dir: file_type.is_dir(),
                    size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
                    modified: metadata.and_then(|m| m.modified().ok()),
                });
            }
        }

        found.sort_by(|a, b| a.virtual_path.cmp(&b.virtual_path));
        found
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn ls_info(&self, path: &str) -> Vec<FileInfo> {
        let Ok(dir) = self.resolve(path) else {
            return Vec::new();
        };
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut infos = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let virtual_path = self.to_virtual(&entry.path());
            let modified = rfc3339(metadata.modified().ok());
            if metadata.is_dir() {
                infos.push(FileInfo::dir(virtual_path, modified));
            } else {
                infos.push(FileInfo::file(virtual_path, Some(metadata.len()), modified));
            }
        }

        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }

    async fn read(&self, path: &str, offset: usize, limit: usize) -> String {
        let host = match self.resolve(path) {
            Ok(host) => host,
            Err(message) => return message,
        };
        match fs::read(&host).await {
            Ok(bytes) => text::read_window(&String::from_utf8_lossy(&bytes), offset, limit),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => text::file_not_found(path),
            Err(e) => format!("Error reading file '{}': {}", path, e),
        }
    }

    async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome {
        let base = self.resolve(path)?;
        let filter = glob.map(PathGlob::include_filter).transpose()?;
        let base_virtual = path::as_dir_prefix(path).map_err(|e| format!("Error: {}", e))?;

        let candidates: Vec<(PathBuf, String)> = match fs::metadata(&base).await {
            Ok(meta) if meta.is_file() => vec![(base.clone(), self.to_virtual(&base))],
            Ok(_) => self
                .walk(&base)
                .await
                .into_iter()
                .filter(|e| !e.is_dir && e.size <= MAX_GREP_FILE_BYTES)
                .map(|e| (e.host, e.virtual_path))
                .collect(),
            Err(_) => return Ok(Vec::new()),
        };

        let mut matches = Vec::new();
        for (host, virtual_path) in candidates {
            if let Some(filter) = &filter {
                if !filter.matches(&path::strip_prefix(&virtual_path, &base_virtual), false) {
                    continue;
                }
            }
            let Ok(bytes) = fs::read(&host).await else {
                continue;
            };
            let Ok(content) = std::str::from_utf8(&bytes) else {
                continue;
            };
            for (line, text) in text::grep_literal(content, pattern) {
                matches.push(GrepMatch {
                    path: virtual_path.clone(),
                    line,
                    text,
                });
            }
        }

        Ok(matches)
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo> {
        let (Ok(base), Ok(glob), Ok(prefix)) = (
            self.resolve(path),
            PathGlob::new(pattern),
            path::as_dir_prefix(path),
        ) else {
            return Vec::new();
        };

        self.walk(&base)
            .await
            .into_iter()
            .filter(|e| glob.matches(&path::strip_prefix(&e.virtual_path, &prefix), e.is_dir))
            .map(|e| {
                let modified = rfc3339(e.modified);
                if e.is_dir {
                    FileInfo::dir(e.virtual_path, modified)
                } else {
                    FileInfo::file(e.virtual_path, Some(e.size), modified)
                }
            })
            .collect()
    }

    async fn write(&self, path: &str, content: &str) -> WriteResult {
        let host = match self.resolve(path) {
            Ok(host) => host,
            Err(message) => return WriteResult::err(path, message),
        };
        if let Some(parent) = host.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return WriteResult::err(path, format!("Error writing file '{}': {}", path, e));
            }
        }

        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&host)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return WriteResult::err(path, text::already_exists(path));
            }
            Err(e) => return WriteResult::err(path, format!("Error writing file '{}': {}", path, e)),
        };
        if let Err(e) = file.write_all(content.as_bytes()).await {
            return WriteResult::err(path, format!("Error writing file '{}': {}", path, e));
        }

        debug!(path = %path, bytes = content.len(), "Wrote file");
        WriteResult::ok(path)
    }

    async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult {
        let host = match self.resolve(path) {
            Ok(host) => host,
            Err(message) => return EditResult::err(path, message),
        };
        let content = match fs::read_to_string(&host).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return EditResult::err(path, text::file_not_found(path));
            }
            Err(e) => return EditResult::err(path, format!("Error editing file '{}': {}", path, e)),
        };

        match text::replace_literal(&content, old, new, replace_all) {
            Ok((updated, occurrences)) => match fs::write(&host, updated).await {
                Ok(()) => EditResult::ok(path, occurrences),
                Err(e) => EditResult::err(path, format!("Error editing file '{}': {}", path, e)),
            },
            Err(message) => EditResult::err(path, message),
        }
    }

    fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        Some(self)
    }
}

#[async_trait]
impl FileTransfer for FilesystemBackend {
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        let mut responses = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let Ok(host) = self.resolve(path) else {
                responses.push(FileUploadResponse::err(path, FileOperationError::InvalidPath));
                continue;
            };
            if let Some(parent) = host.parent() {
                if let Err(e) = fs::create_dir_all(parent).await {
                    responses.push(FileUploadResponse::err(path, (&e).into()));
                    continue;
                }
            }
            match fs::write(&host, bytes).await {
                Ok(()) => responses.push(FileUploadResponse::ok(path)),
                Err(e) => {
                    warn!(path = %path, error = %e, "Upload failed");
                    responses.push(FileUploadResponse::err(path, (&e).into()));
                }
            }
        }
        Ok(responses)
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            let Ok(host) = self.resolve(path) else {
                responses.push(FileDownloadResponse::err(path, FileOperationError::InvalidPath));
                continue;
            };
            let response = match fs::metadata(&host).await {
                Ok(meta) if meta.is_dir() => {
                    FileDownloadResponse::err(path, FileOperationError::IsDirectory)
                }
                _ => match fs::read(&host).await {
                    Ok(bytes) => FileDownloadResponse::ok(path, bytes),
                    Err(e) => FileDownloadResponse::err(path, (&e).into()),
                },
            };
            responses.push(response);
        }
        Ok(responses)
    }
}
