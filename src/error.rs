use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Lifecycle errors
    #[error("Sandbox '{backend}' is not initialized")]
    NotInitialized { backend: String },

    #[error("Sandbox '{backend}' is already initialized")]
    AlreadyInitialized { backend: String },

    #[error("Sandbox '{backend}' has been closed")]
    Closed { backend: String },

    #[error("Backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    #[error("Execution engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Default backend does not support command execution")]
    ExecutionUnsupported,

    // Sandbox errors
    #[error("Sandbox initialization failed: {0}")]
    SandboxInit(String),

    #[error("Command execution failed in sandbox: {0}")]
    SandboxExecution(String),

    #[error("Mount sync failed for '{prefix}': {reason}")]
    MountSync { prefix: String, reason: String },

    #[error("WASM package not found: {path}")]
    WasmNotFound { path: String },

    // Remote sandbox errors
    #[error("Remote sandbox API error: {message}")]
    RemoteApi {
        message: String,
        status: Option<u16>,
    },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MountletError {
    /// Stable, machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::ConfigNotFound { .. } | Self::TomlParse(_) => "config_error",
            Self::NotInitialized { .. } => "not_initialized",
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::Closed { .. } => "closed",
            Self::BackendNotAvailable { .. } => "backend_not_available",
            Self::EngineUnavailable(_) => "engine_unavailable",
            Self::ExecutionUnsupported => "execution_unsupported",
            Self::SandboxInit(_) => "sandbox_init_failed",
            Self::SandboxExecution(_) => "sandbox_execution_failed",
            Self::MountSync { .. } => "mount_sync_failed",
            Self::WasmNotFound { .. } => "wasm_not_found",
            Self::RemoteApi { .. } => "remote_api_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Http(_) => "http_error",
            Self::Other(_) => "internal_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::RemoteApi { status, .. } => matches!(status, Some(429) | Some(502..=504)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MountletError>;

/// Normalized file operation failure reported per item by every backend.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationError {
    #[error("file_not_found")]
    FileNotFound,
    #[error("permission_denied")]
    PermissionDenied,
    #[error("is_directory")]
    IsDirectory,
    #[error("invalid_path")]
    InvalidPath,
}

impl FileOperationError {
    /// Map an HTTP status returned by a remote sandbox provider.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            404 | 410 => Self::FileNotFound,
            401 | 403 => Self::PermissionDenied,
            409 => Self::IsDirectory,
            _ => Self::InvalidPath,
        }
    }

    /// Map the stderr of a failed shell-level file command.
    pub fn from_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("is a directory") {
            Self::IsDirectory
        } else if lower.contains("permission denied") || lower.contains("read-only") {
            Self::PermissionDenied
        } else if lower.contains("no such file") || lower.contains("not found") {
            Self::FileNotFound
        } else {
            Self::InvalidPath
        }
    }
}

impl From<std::io::ErrorKind> for FileOperationError {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::NotFound => Self::FileNotFound,
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => Self::PermissionDenied,
            ErrorKind::IsADirectory => Self::IsDirectory,
            _ => Self::InvalidPath,
        }
    }
}

impl From<&std::io::Error> for FileOperationError {
    fn from(err: &std::io::Error) -> Self {
        err.kind().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = MountletError::NotInitialized {
            backend: "wasmer".to_string(),
        };
        assert_eq!(err.code(), "not_initialized");
        assert_eq!(MountletError::ExecutionUnsupported.code(), "execution_unsupported");
    }

    #[test]
    fn test_io_kind_mapping() {
        use std::io::ErrorKind;
        assert_eq!(FileOperationError::from(ErrorKind::NotFound), FileOperationError::FileNotFound);
        assert_eq!(
            FileOperationError::from(ErrorKind::PermissionDenied),
            FileOperationError::PermissionDenied
        );
        assert_eq!(FileOperationError::from(ErrorKind::IsADirectory), FileOperationError::IsDirectory);
        assert_eq!(FileOperationError::from(ErrorKind::InvalidInput), FileOperationError::InvalidPath);
    }

    #[test]
    fn test_http_and_stderr_mapping() {
        assert_eq!(FileOperationError::from_http_status(404), FileOperationError::FileNotFound);
        assert_eq!(FileOperationError::from_http_status(403), FileOperationError::PermissionDenied);
        assert_eq!(
            FileOperationError::from_stderr("cat: /x: No such file or directory"),
            FileOperationError::FileNotFound
        );
        assert_eq!(
            FileOperationError::from_stderr("cat: /tmp: Is a directory"),
            FileOperationError::IsDirectory
        );
    }

    #[test]
    fn test_file_operation_error_serializes_snake_case() {
        let json = serde_json::to_string(&FileOperationError::FileNotFound).unwrap();
        assert_eq!(json, "\"file_not_found\"");
    }
}
