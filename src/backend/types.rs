use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::FileOperationError;

/// Default number of lines returned by `read`.
pub const DEFAULT_READ_LIMIT: usize = 500;

/// One directory listing or glob entry. Directory paths end with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl FileInfo {
    pub fn file(path: impl Into<String>, size: Option<u64>, modified_at: Option<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size,
            modified_at,
        }
    }

    pub fn dir(path: impl Into<String>, modified_at: Option<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            path,
            is_dir: true,
            size: Some(0),
            modified_at,
        }
    }
}

/// How `FileData::content` should be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// A file held by the state and store backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub content: Vec<String>,
    pub created_at: String,
    pub modified_at: String,
    #[serde(default)]
    pub encoding: FileEncoding,
}

impl FileData {
    pub fn new(content: &str) -> Self {
        let now = now_rfc3339();
        Self {
            content: split_lines(content),
            created_at: now.clone(),
            modified_at: now,
            encoding: FileEncoding::Utf8,
        }
    }

    /// Build from raw bytes, falling back to base64 when they are not UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::new(text),
            Err(_) => {
                let now = now_rfc3339();
                Self {
                    content: vec![base64::engine::general_purpose::STANDARD.encode(bytes)],
                    created_at: now.clone(),
                    modified_at: now,
                    encoding: FileEncoding::Base64,
                }
            }
        }
    }

    /// Replace the content, keeping the creation time.
    pub fn updated(&self, content: &str) -> Self {
        Self {
            content: split_lines(content),
            created_at: self.created_at.clone(),
            modified_at: now_rfc3339(),
            encoding: FileEncoding::Utf8,
        }
    }

    pub fn text(&self) -> String {
        match self.encoding {
            FileEncoding::Utf8 => self.content.join("\n"),
            FileEncoding::Base64 => String::from_utf8_lossy(&self.to_bytes()).into_owned(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self.encoding {
            FileEncoding::Utf8 => self.content.join("\n").into_bytes(),
            FileEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(self.content.concat())
                .unwrap_or_default(),
        }
    }

    pub fn size(&self) -> u64 {
        self.to_bytes().len() as u64
    }
}

/// Split text into lines the way every backend counts them: `\n` separated,
/// keeping a trailing empty line so that joining restores the original.
pub fn split_lines(content: &str) -> Vec<String> {
    content.split('\n').map(str::to_string).collect()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// One literal grep hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

/// Grep either succeeds with a list or reports why the search failed.
pub type GrepOutcome = std::result::Result<Vec<GrepMatch>, String>;

/// Pending changes for callers whose own state backs the files.
pub type FilesUpdate = BTreeMap<String, Option<FileData>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_update: Option<FilesUpdate>,
}

impl WriteResult {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn err(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: Some(error.into()),
            files_update: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditResult {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrences: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_update: Option<FilesUpdate>,
}

impl EditResult {
    pub fn ok(path: impl Into<String>, occurrences: usize) -> Self {
        Self {
            path: path.into(),
            error: None,
            occurrences: Some(occurrences),
            files_update: None,
        }
    }

    pub fn err(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of running a command in a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
    /// `None` when the command did not finish (timeout or kill).
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl ExecuteResponse {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadResponse {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FileOperationError>,
}

impl FileUploadResponse {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: None,
        }
    }

    pub fn err(path: impl Into<String>, error: FileOperationError) -> Self {
        Self {
            path: path.into(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadResponse {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FileOperationError>,
}

impl FileDownloadResponse {
    pub fn ok(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            error: None,
        }
    }

    pub fn err(path: impl Into<String>, error: FileOperationError) -> Self {
        Self {
            path: path.into(),
            content: None,
            error: Some(error),
        }
    }
}
