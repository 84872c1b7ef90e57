//! Backend over a durable key-value store.
//!
//! Keys are normalized virtual paths, values are [`FileData`]. Unlike the
//! state backend, writes land in the store directly and no `files_update`
//! is returned.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::path::{as_dir_prefix, normalize};
use crate::backend::protocol::{Backend, FileTransfer};
use crate::backend::state::{glob_files, grep_files, list_children};
use crate::backend::text;
use crate::backend::types::{
    EditResult, FileData, FileDownloadResponse, FileInfo, FileUploadResponse, GrepOutcome,
    WriteResult,
};
use crate::error::{FileOperationError, Result};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<FileData>>;

    async fn put(&self, key: &str, value: &FileData) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Process-local store, mostly for tests and `kind = "memory"` routes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, FileData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<FileData>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &FileData) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One pretty-printed JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let name = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key);
        self.dir.join(format!("{}.json", name))
    }

    fn key_from_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(".json")?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(stem)
            .ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl KeyValueStore for JsonDirStore {
    async fn get(&self, key: &str) -> Result<Option<FileData>> {
        let path = self.entry_path(key);
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &FileData) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.entry_path(key);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).await?;
        debug!(key = %key, path = %path.display(), "Saved store entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_dir().await?;

        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match name.to_str().and_then(Self::key_from_file_name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => debug!(file = ?name, "Ignoring foreign file in store directory"),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[derive(Clone)]
pub struct StoreBackend {
    store: Arc<dyn KeyValueStore>,
}

impl StoreBackend {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn json_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonDirStore::new(dir)))
    }

    /// Load every entry at or below a directory prefix.
    async fn load_under(&self, prefix: &str) -> Result<BTreeMap<String, FileData>> {
        let mut files = BTreeMap::new();
        for key in self.store.keys(prefix).await? {
            if let Some(data) = self.store.get(&key).await? {
                files.insert(key, data);
            }
        }
        Ok(files)
    }

    async fn is_dir(&self, key: &str) -> bool {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.store
            .keys(&prefix)
            .await
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Backend for StoreBackend {
    fn name(&self) -> &str {
        "store"
    }

    async fn ls_info(&self, path: &str) -> Vec<FileInfo> {
        let Ok(prefix) = as_dir_prefix(path) else {
            return Vec::new();
        };
        match self.load_under(&prefix).await {
            Ok(files) => list_children(&files, &prefix),
            Err(e) => {
                warn!(path = %path, error = %e, "Store listing failed");
                Vec::new()
            }
        }
    }

    async fn read(&self, path: &str, offset: usize, limit: usize) -> String {
        let key = match normalize(path) {
            Ok(key) => key,
            Err(e) => return format!("Error: {}", e),
        };
        match self.store.get(&key).await {
            Ok(Some(data)) => text::read_window(&data.text(), offset, limit),
            Ok(None) => text::file_not_found(path),
            Err(e) => format!("Error reading file '{}': {}", path, e),
        }
    }

    async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome {
        let prefix = as_dir_prefix(path).map_err(|e| format!("Error: {}", e))?;
        let scope = if prefix == "/" { "/".to_string() } else { prefix.trim_end_matches('/').to_string() };
        let files = self
            .load_under(&scope)
            .await
            .map_err(|e| format!("Error searching store: {}", e))?;
        grep_files(&files, pattern, path, glob)
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo> {
        let Ok(prefix) = as_dir_prefix(path) else {
            return Vec::new();
        };
        match self.load_under(&prefix).await {
            Ok(files) => glob_files(&files, pattern, path),
            Err(e) => {
                warn!(path = %path, error = %e, "Store glob failed");
                Vec::new()
            }
        }
    }

    async fn write(&self, path: &str, content: &str) -> WriteResult {
        let key = match normalize(path) {
            Ok(key) => key,
            Err(e) => return WriteResult::err(path, format!("Error: {}", e)),
        };
        match self.store.get(&key).await {
            Ok(Some(_)) => return WriteResult::err(&key, text::already_exists(&key)),
            Ok(None) => {}
            Err(e) => return WriteResult::err(&key, format!("Error writing file '{}': {}", key, e)),
        }

        match self.store.put(&key, &FileData::new(content)).await {
            Ok(()) => WriteResult::ok(key),
            Err(e) => WriteResult::err(&key, format!("Error writing file '{}': {}", key, e)),
        }
    }

    async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult {
        let key = match normalize(path) {
            Ok(key) => key,
            Err(e) => return EditResult::err(path, format!("Error: {}", e)),
        };
        let data = match self.store.get(&key).await {
            Ok(Some(data)) => data,
            Ok(None) => return EditResult::err(&key, text::file_not_found(path)),
            Err(e) => return EditResult::err(&key, format!("Error editing file '{}': {}", key, e)),
        };

        let (content, occurrences) = match text::replace_literal(&data.text(), old, new, replace_all) {
            Ok(replaced) => replaced,
            Err(message) => return EditResult::err(&key, message),
        };
        match self.store.put(&key, &data.updated(&content)).await {
            Ok(()) => EditResult::ok(key, occurrences),
            Err(e) => EditResult::err(&key, format!("Error editing file '{}': {}", key, e)),
        }
    }

    fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        Some(self)
    }
}

#[async_trait]
impl FileTransfer for StoreBackend {
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        let mut responses = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let key = match normalize(path) {
                Ok(key) => key,
                Err(e) => {
                    responses.push(FileUploadResponse::err(path, e.into()));
                    continue;
                }
            };

            let mut data = FileData::from_bytes(bytes);
            if let Ok(Some(existing)) = self.store.get(&key).await {
                data.created_at = existing.created_at;
            }
            match self.store.put(&key, &data).await {
                Ok(()) => responses.push(FileUploadResponse::ok(path)),
                Err(e) => {
                    warn!(path = %path, error = %e, "Store upload failed");
                    responses.push(FileUploadResponse::err(path, FileOperationError::PermissionDenied));
                }
            }
        }
        debug!(count = files.len(), "Store upload batch");
        Ok(responses)
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            let key = match normalize(path) {
                Ok(key) => key,
                Err(e) => {
                    responses.push(FileDownloadResponse::err(path, e.into()));
                    continue;
                }
            };
            let response = match self.store.get(&key).await {
                Ok(Some(data)) => FileDownloadResponse::ok(path, data.to_bytes()),
                Ok(None) if self.is_dir(&key).await => {
                    FileDownloadResponse::err(path, FileOperationError::IsDirectory)
                }
                Ok(None) => FileDownloadResponse::err(path, FileOperationError::FileNotFound),
                Err(e) => {
                    warn!(path = %path, error = %e, "Store download failed");
                    FileDownloadResponse::err(path, FileOperationError::PermissionDenied)
                }
            };
            responses.push(response);
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_is_durable_without_update() {
        let backend = StoreBackend::in_memory();
        let result = backend.write("/notes/a.md", "remember").await;
        assert!(result.is_ok());
        assert!(result.files_update.is_none());
        assert!(backend.read("/notes/a.md", 0, 10).await.contains("remember"));
    }

    #[tokio::test]
    async fn test_json_dir_store_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        {
            let backend = StoreBackend::json_dir(temp.path());
            backend.write("/memories/x.md", "one\ntwo").await;
        }
        let reopened = StoreBackend::json_dir(temp.path());
        let listing = reopened.ls_info("/").await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, "/memories/");
        assert!(reopened.read("/memories/x.md", 1, 1).await.contains("two"));
    }

    #[tokio::test]
    async fn test_binary_upload_download_round_trip() {
        let temp = TempDir::new().unwrap();
        let backend = StoreBackend::json_dir(temp.path());
        let bytes = vec![0u8, 159, 146, 150, 255];

        let up = backend
            .upload_files(&[("/bin/blob".to_string(), bytes.clone())])
            .await
            .unwrap();
        assert!(up[0].error.is_none());

        let down = backend.download_files(&["/bin/blob".to_string()]).await.unwrap();
        assert_eq!(down[0].content.as_ref(), Some(&bytes));
    }

    #[tokio::test]
    async fn test_edit_multiple_occurrences() {
        let backend = StoreBackend::in_memory();
        backend.write("/f.txt", "x x x").await;

        let refused = backend.edit("/f.txt", "x", "y", false).await;
        assert!(refused.error.unwrap().contains("multiple occurrences"));

        let all = backend.edit("/f.txt", "x", "y", true).await;
        assert_eq!(all.occurrences, Some(3));
        assert!(backend.read("/f.txt", 0, 1).await.contains("y y y"));
    }

    #[tokio::test]
    async fn test_grep_only_searches_scope() {
        let backend = StoreBackend::in_memory();
        backend.write("/a/one.txt", "needle").await;
        backend.write("/ab/two.txt", "needle").await;

        let matches = backend.grep_raw("needle", "/a", None).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "/a/one.txt");
    }

    #[tokio::test]
    async fn test_missing_download_reports_not_found() {
        let backend = StoreBackend::in_memory();
        let down = backend.download_files(&["/nope".to_string()]).await.unwrap();
        assert_eq!(down[0].error, Some(FileOperationError::FileNotFound));
    }
}
