//! Backend over the caller's own in-memory file state.
//!
//! The backend never mutates that state: writes and edits hand back a
//! `files_update` which the owner merges (see [`StateBackend::apply`]).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::backend::path::{self, as_dir_prefix, is_under, normalize};
use crate::backend::protocol::{Backend, FileTransfer};
use crate::backend::text::{self, PathGlob};
use crate::backend::types::{
    EditResult, FileData, FileDownloadResponse, FileInfo, FileUploadResponse, FilesUpdate,
    GrepMatch, GrepOutcome, WriteResult,
};
use crate::error::{FileOperationError, Result};

pub type SharedFiles = Arc<RwLock<BTreeMap<String, FileData>>>;

#[derive(Debug, Clone, Default)]
pub struct StateBackend {
    files: SharedFiles,
}

impl StateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files(files: BTreeMap<String, FileData>) -> Self {
        Self {
            files: Arc::new(RwLock::new(files)),
        }
    }

    /// Share an existing state map owned by the caller.
    pub fn with_shared(files: SharedFiles) -> Self {
        Self { files }
    }

    /// Merge a `files_update` returned by `write`/`edit` into the state.
    pub fn apply(&self, update: &FilesUpdate) {
        if let Ok(mut files) = self.files.write() {
            for (path, data) in update {
                match data {
                    Some(data) => {
                        files.insert(path.clone(), data.clone());
                    }
                    None => {
                        files.remove(path);
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, FileData> {
        self.files.read().map(|f| f.clone()).unwrap_or_default()
    }

    fn get(&self, path: &str) -> Option<FileData> {
        self.files.read().ok().and_then(|f| f.get(path).cloned())
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files
            .read()
            .map(|f| f.keys().any(|k| k.starts_with(&prefix)))
            .unwrap_or(false)
    }
}

/// Immediate children of `prefix` within a flat path → data map.
pub(crate) fn list_children(
    files: &BTreeMap<String, FileData>,
    prefix: &str,
) -> Vec<FileInfo> {
    let mut entries = Vec::new();
    let mut dirs = BTreeSet::new();

    for (key, data) in files.iter().filter(|(k, _)| k.starts_with(prefix)) {
        let rest = &key[prefix.len()..];
        match rest.split_once('/') {
            Some((dir, _)) => {
                dirs.insert(format!("{}{}/", prefix, dir));
            }
            None if !rest.is_empty() => entries.push(FileInfo::file(
                key.clone(),
                Some(data.size()),
                Some(data.modified_at.clone()),
            )),
            None => {}
        }
    }

    entries.extend(dirs.into_iter().map(|d| FileInfo::dir(d, None)));
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

pub(crate) fn grep_files(
    files: &BTreeMap<String, FileData>,
    pattern: &str,
    search: &str,
    glob: Option<&str>,
) -> GrepOutcome {
    let prefix = as_dir_prefix(search).map_err(|e| format!("Error: {}", e))?;
    let filter = glob.map(PathGlob::include_filter).transpose()?;
    let mut matches = Vec::new();

    for (key, data) in files.iter().filter(|(k, _)| is_under(k, &prefix)) {
        if let Some(filter) = &filter {
            if !filter.matches(&path::strip_prefix(key, &prefix), false) {
                continue;
            }
        }
        for (line, text) in text::grep_literal(&data.text(), pattern) {
            matches.push(GrepMatch {
                path: key.clone(),
                line,
                text,
            });
        }
    }

    Ok(matches)
}

pub(crate) fn glob_files(
    files: &BTreeMap<String, FileData>,
    pattern: &str,
    search: &str,
) -> Vec<FileInfo> {
    let (Ok(prefix), Ok(glob)) = (as_dir_prefix(search), PathGlob::new(pattern)) else {
        return Vec::new();
    };

    let mut results = Vec::new();
    if glob.wants_dirs() {
        let mut dirs = BTreeSet::new();
        for key in files.keys().filter(|k| is_under(k, &prefix)) {
            let rel = path::strip_prefix(key, &prefix);
            let segments: Vec<&str> = rel.trim_start_matches('/').split('/').collect();
            for depth in 1..segments.len() {
                dirs.insert(segments[..depth].join("/"));
            }
        }
        for dir in dirs.into_iter().filter(|d| glob.matches(d, true)) {
            results.push(FileInfo::dir(path::add_prefix(&format!("/{}", dir), &prefix), None));
        }
    } else {
        for (key, data) in files.iter().filter(|(k, _)| is_under(k, &prefix)) {
            if glob.matches(&path::strip_prefix(key, &prefix), false) {
                results.push(FileInfo::file(
                    key.clone(),
                    Some(data.size()),
                    Some(data.modified_at.clone()),
                ));
            }
        }
    }

    results.sort_by(|a, b| a.path.cmp(&b.path));
    results
}

#[async_trait]
impl Backend for StateBackend {
    fn name(&self) -> &str {
        "state"
    }

    async fn ls_info(&self, path: &str) -> Vec<FileInfo> {
        let Ok(prefix) = as_dir_prefix(path) else {
            return Vec::new();
        };
        self.files
            .read()
            .map(|files| list_children(&files, &prefix))
            .unwrap_or_default()
    }

    async fn read(&self, path: &str, offset: usize, limit: usize) -> String {
        let key = match normalize(path) {
            Ok(key) => key,
            Err(e) => return format!("Error: {}", e),
        };
        match self.get(&key) {
            Some(data) => text::read_window(&data.text(), offset, limit),
            None => text::file_not_found(path),
        }
    }

    async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome {
        let files = self
            .files
            .read()
            .map_err(|_| "Error: state lock poisoned".to_string())?;
        grep_files(&files, pattern, path, glob)
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo> {
        self.files
            .read()
            .map(|files| glob_files(&files, pattern, path))
            .unwrap_or_default()
    }

    async fn write(&self, path: &str, content: &str) -> WriteResult {
        let key = match normalize(path) {
            Ok(key) => key,
            Err(e) => return WriteResult::err(path, format!("Error: {}", e)),
        };
        if self.get(&key).is_some() {
            return WriteResult::err(&key, text::already_exists(&key));
        }

        debug!(path = %key, bytes = content.len(), "State write");
        let mut update = FilesUpdate::new();
        update.insert(key.clone(), Some(FileData::new(content)));
        WriteResult {
            path: key,
            error: None,
            files_update: Some(update),
        }
    }

    async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult {
        let key = match normalize(path) {
            Ok(key) => key,
            Err(e) => return EditResult::err(path, format!("Error: {}", e)),
        };
        let Some(data) = self.get(&key) else {
            return EditResult::err(&key, text::file_not_found(path));
        };

        match text::replace_literal(&data.text(), old, new, replace_all) {
            Ok((content, occurrences)) => {
                let mut update = FilesUpdate::new();
                update.insert(key.clone(), Some(data.updated(&content)));
                EditResult {
                    path: key,
                    error: None,
                    occurrences: Some(occurrences),
                    files_update: Some(update),
                }
            }
            Err(message) => EditResult::err(&key, message),
        }
    }

    fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        Some(self)
    }
}

#[async_trait]
impl FileTransfer for StateBackend {
    /// The state belongs to the caller; uploads cannot be merged from here.
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        Ok(files
            .iter()
            .map(|(path, _)| FileUploadResponse::err(path, FileOperationError::PermissionDenied))
            .collect())
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        Ok(paths
            .iter()
            .map(|path| match normalize(path) {
                Err(e) => FileDownloadResponse::err(path, e.into()),
                Ok(key) => match self.get(&key) {
                    Some(data) => FileDownloadResponse::ok(path, data.to_bytes()),
                    None if self.is_dir(&key) => {
                        FileDownloadResponse::err(path, FileOperationError::IsDirectory)
                    }
                    None => FileDownloadResponse::err(path, FileOperationError::FileNotFound),
                },
            })
            .collect())
    }

    fn supports_upload(&self) -> bool {
        false
    }
}
