use async_trait::async_trait;

use crate::backend::types::{
    EditResult, ExecuteResponse, FileDownloadResponse, FileInfo, FileUploadResponse, GrepOutcome,
    WriteResult,
};
use crate::error::Result;

/// Capability flags summarizing which optional interfaces a backend offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Supports `execute` and carries a sandbox id
    pub execute: bool,
    /// Supports bulk `upload_files`
    pub upload: bool,
    /// Supports bulk `download_files`
    pub download: bool,
}

/// The structured file protocol every storage or runtime adapter implements.
///
/// Operational failures (missing file, no match, traversal) are reported in
/// the returned values, never as panics or errors, so callers can branch on
/// them cheaply.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name used in logs (e.g. "filesystem", "composite")
    fn name(&self) -> &str;

    /// Immediate children of `path`; directories end with `/`.
    async fn ls_info(&self, path: &str) -> Vec<FileInfo>;

    /// Numbered lines `[offset, offset + limit)` of a file.
    async fn read(&self, path: &str, offset: usize, limit: usize) -> String;

    /// Literal (never regex) recursive search under `path`.
    async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome;

    /// Recursive glob relative to `path`, sorted by path.
    async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo>;

    /// Create a new file; fails if it already exists.
    async fn write(&self, path: &str, content: &str) -> WriteResult;

    /// Exact string replacement within an existing file.
    async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult;

    /// Bulk transfer capability, if supported.
    fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        None
    }

    /// Command execution capability, if supported.
    fn sandbox(&self) -> Option<&dyn SandboxBackend> {
        None
    }

    fn capabilities(&self) -> BackendCapabilities {
        let transfer = self.file_transfer();
        BackendCapabilities {
            execute: self.sandbox().is_some(),
            upload: transfer.map(|t| t.supports_upload()).unwrap_or(false),
            download: transfer.map(|t| t.supports_download()).unwrap_or(false),
        }
    }
}

/// Optional bulk byte transfer. Results are returned in input order with a
/// per-item error; `Err` is reserved for lifecycle misuse.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>>;

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>>;

    fn supports_upload(&self) -> bool {
        true
    }

    fn supports_download(&self) -> bool {
        true
    }
}

/// Optional command execution. A sandbox always carries an identity.
#[async_trait]
pub trait SandboxBackend: Backend {
    fn id(&self) -> &str;

    async fn execute(&self, command: &str) -> Result<ExecuteResponse>;

    /// Release whatever the sandbox holds (containers, engines). Idempotent.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Guard used before offering an "execute" tool: the backend must expose
/// the execution capability and a non-empty id.
pub fn is_sandbox_backend(backend: &dyn Backend) -> bool {
    backend
        .sandbox()
        .map(|sandbox| !sandbox.id().is_empty())
        .unwrap_or(false)
}
