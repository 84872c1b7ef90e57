use std::collections::HashMap;

use async_trait::async_trait;

use crate::backend::types::{ExecuteResponse, FileDownloadResponse, FileUploadResponse};
use crate::error::Result;

/// Information about the running sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Runtime type identifier
    pub backend_type: String,
    /// Instance identifier (container ID, remote sandbox ID, etc.)
    pub instance_id: Option<String>,
    /// Whether the sandbox is currently running
    pub running: bool,
    /// Additional runtime-specific metadata
    pub metadata: HashMap<String, String>,
}

/// The minimal surface a sandbox runtime provides.
///
/// Everything else (listing, reading, grep, glob, write, edit) is derived
/// from these primitives by [`BaseSandbox`](crate::sandbox::base::BaseSandbox).
/// Paths are absolute paths inside the sandbox.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Returns the runtime name (e.g., "local", "docker")
    fn name(&self) -> &str;

    /// Stable identity of this sandbox instance; never empty.
    fn id(&self) -> &str;

    /// Execute a shell command inside the sandbox
    async fn execute(&self, command: &str) -> Result<ExecuteResponse>;

    /// Execute one of the structured script ops. Runtimes that can lift the
    /// user output budget do so here; the rest fall back to `execute` and
    /// report a cut through `ExecuteResponse::truncated`.
    async fn execute_script(&self, command: &str) -> Result<ExecuteResponse> {
        self.execute(command).await
    }

    /// Write files, creating parent directories. One response per input, in order.
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>>;

    /// Read files. One response per input, in order.
    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>>;

    /// Get information about the sandbox instance
    fn info(&self) -> SandboxInfo;

    /// Release the sandbox. Idempotent; safe before full initialization.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Check if the runtime is healthy and ready to accept commands.
    async fn health_check(&self) -> Result<bool> {
        match self.execute("echo ok").await {
            Ok(result) => Ok(result.success()),
            Err(_) => Ok(false),
        }
    }
}
