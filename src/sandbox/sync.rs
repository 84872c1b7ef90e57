//! Moving mount contents into a per-run host directory and back.
//!
//! A run goes `Mount::populate` → [`PopulatedMount`] (holding the
//! pre-run [`Snapshot`]) → `reconcile` → [`SyncReport`]. Files deleted
//! inside the VM stay in the backend.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::backend::path;
use crate::error::{FileOperationError, MountletError, Result};
use crate::sandbox::mount::Mount;

/// Pre-run file contents of one mount, keyed by backend path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, Vec<u8>>,
}

impl Snapshot {
    pub fn get(&self, backend_path: &str) -> Option<&[u8]> {
        self.files.get(backend_path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A mount whose files have been written to `host_dir`.
#[derive(Debug)]
pub struct PopulatedMount {
    mount: Mount,
    host_dir: PathBuf,
    snapshot: Snapshot,
}

/// Outcome of reconciling one mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub prefix: String,
    /// Files sent back to the backend
    pub uploaded: usize,
    /// Files identical to the snapshot
    pub unchanged: usize,
    /// Changes dropped because the backend cannot take uploads
    pub skipped: usize,
    /// Per-file upload failures
    pub failed: Vec<(String, FileOperationError)>,
}

/// Every file path reachable from `/` on the mount's backend.
async fn discover(mount: &Mount) -> Vec<String> {
    let backend = mount.backend();
    let mut files = Vec::new();
    let mut visited = HashSet::new();
    let mut pending = vec!["/".to_string()];

    while let Some(dir) = pending.pop() {
        if !visited.insert(dir.clone()) {
            continue;
        }
        for entry in backend.ls_info(&dir).await {
            if entry.is_dir {
                pending.push(entry.path);
            } else {
                files.push(entry.path);
            }
        }
    }
    files.sort();
    files
}

fn sync_failed(prefix: &str, error: MountletError) -> MountletError {
    MountletError::MountSync {
        prefix: prefix.to_string(),
        reason: error.to_string(),
    }
}

fn host_file(host_dir: &Path, backend_path: &str) -> PathBuf {
    host_dir.join(backend_path.trim_start_matches('/'))
}

/// Write `files` (relative paths → bytes) under `dir`, creating parents.
pub async fn write_tree(dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    fs::create_dir_all(dir).await?;
    for (relative, bytes) in files {
        let target = host_file(dir, relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, bytes).await?;
    }
    Ok(())
}

/// Read every regular file under `dir` into a map keyed by `/relative/path`.
/// Symlinks are not followed.
pub async fn read_tree(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let host = entry.path();
            if file_type.is_dir() {
                pending.push(host);
            } else if file_type.is_file() {
                let Ok(relative) = host.strip_prefix(dir) else {
                    continue;
                };
                let key = format!("/{}", relative.to_string_lossy().replace('\\', "/"));
                files.insert(key, fs::read(&host).await?);
            }
        }
    }
    Ok(files)
}

impl Mount {
    /// Materialize the backend's files under `host_dir` and snapshot them.
    ///
    /// A backend that cannot download gets an empty directory.
    pub async fn populate(self, host_dir: &Path) -> Result<PopulatedMount> {
        fs::create_dir_all(host_dir).await?;

        let can_download = self
            .backend()
            .file_transfer()
            .is_some_and(|t| t.supports_download());
        if !can_download {
            debug!(prefix = %self.prefix(), "Backend cannot download, mounting empty directory");
            return Ok(PopulatedMount {
                mount: self,
                host_dir: host_dir.to_path_buf(),
                snapshot: Snapshot::default(),
            });
        }

        let paths = discover(&self).await;
        let mut files = BTreeMap::new();
        if let (false, Some(transfer)) = (paths.is_empty(), self.backend().file_transfer()) {
            let responses = transfer
                .download_files(&paths)
                .await
                .map_err(|e| sync_failed(self.prefix(), e))?;
            for response in responses {
                match (response.content, response.error) {
                    (Some(bytes), None) => {
                        files.insert(response.path, bytes);
                    }
                    (_, error) => {
                        warn!(prefix = %self.prefix(), path = %response.path, error = ?error, "Skipping file during populate");
                    }
                }
            }
        }
        write_tree(host_dir, &files).await?;

        info!(prefix = %self.prefix(), files = files.len(), "Mount populated");
        Ok(PopulatedMount {
            mount: self,
            host_dir: host_dir.to_path_buf(),
            snapshot: Snapshot { files },
        })
    }
}

impl PopulatedMount {
    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Upload new or changed files, batched into one call.
    pub async fn reconcile(self) -> Result<SyncReport> {
        let current = read_tree(&self.host_dir)
            .await
            .map_err(|e| sync_failed(self.mount.prefix(), e))?;
        let mut report = SyncReport {
            prefix: self.mount.prefix().to_string(),
            ..SyncReport::default()
        };

        let mut changed = Vec::new();
        for (backend_path, bytes) in current {
            if self.snapshot.get(&backend_path) == Some(bytes.as_slice()) {
                report.unchanged += 1;
            } else {
                changed.push((backend_path, bytes));
            }
        }
        if changed.is_empty() {
            debug!(prefix = %report.prefix, unchanged = report.unchanged, "Mount unchanged");
            return Ok(report);
        }

        let transfer = self
            .mount
            .backend()
            .file_transfer()
            .filter(|t| t.supports_upload());
        let Some(transfer) = transfer else {
            report.skipped = changed.len();
            debug!(prefix = %report.prefix, skipped = report.skipped, "Backend cannot upload, dropping changes");
            return Ok(report);
        };

        let responses = transfer
            .upload_files(&changed)
            .await
            .map_err(|e| sync_failed(&report.prefix, e))?;
        for response in responses {
            match response.error {
                None => report.uploaded += 1,
                Some(error) => {
                    warn!(prefix = %report.prefix, path = %response.path, error = %error, "Sync upload failed");
                    report.failed.push((self.mount.guest_path(&response.path), error));
                }
            }
        }

        info!(
            prefix = %report.prefix,
            uploaded = report.uploaded,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "Mount reconciled"
        );
        Ok(report)
    }
}

/// Host directory name for a mount inside a run directory.
///
/// `_` is written as `__` and `/` as `_-`, so distinct prefixes never share
/// a directory.
pub fn mount_dir_name(prefix: &str) -> String {
    let normalized = path::normalize(prefix).unwrap_or_default();
    let mut name = String::from("m_");
    for c in normalized.trim_matches('/').chars() {
        match c {
            '_' => name.push_str("__"),
            '/' => name.push_str("_-"),
            c => name.push(c),
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::protocol::{Backend, FileTransfer};
    use crate::backend::state::StateBackend;
    use crate::backend::store::StoreBackend;
    use crate::backend::types::{
        EditResult, FileDownloadResponse, FileInfo, FileUploadResponse, GrepOutcome, WriteResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Store backend that records every uploaded path.
    struct Counting {
        inner: StoreBackend,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        upload_calls: AtomicUsize,
        offline: AtomicBool,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                inner: StoreBackend::in_memory(),
                uploads: Mutex::new(Vec::new()),
                upload_calls: AtomicUsize::new(0),
                offline: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Backend for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn ls_info(&self, path: &str) -> Vec<FileInfo> {
            self.inner.ls_info(path).await
        }
        async fn read(&self, path: &str, offset: usize, limit: usize) -> String {
            self.inner.read(path, offset, limit).await
        }
        async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome {
            self.inner.grep_raw(pattern, path, glob).await
        }
        async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo> {
            self.inner.glob_info(pattern, path).await
        }
        async fn write(&self, path: &str, content: &str) -> WriteResult {
            self.inner.write(path, content).await
        }
        async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult {
            self.inner.edit(path, old, new, replace_all).await
        }
        fn file_transfer(&self) -> Option<&dyn FileTransfer> {
            Some(self)
        }
    }

    #[async_trait]
    impl FileTransfer for Counting {
        async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(MountletError::Closed {
                    backend: "counting".to_string(),
                });
            }
            self.uploads.lock().unwrap().extend(files.iter().cloned());
            self.inner.upload_files(files).await
        }
        async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
            self.inner.download_files(paths).await
        }
    }

    #[tokio::test]
    async fn test_unmodified_files_are_not_uploaded() {
        let backend = Arc::new(Counting::new());
        backend.write("/a.txt", "alpha").await;
        backend.write("/nested/b.txt", "beta").await;

        let temp = TempDir::new().unwrap();
        let mount = Mount::new("/work", backend.clone()).unwrap();
        let populated = mount.populate(temp.path()).await.unwrap();
        assert_eq!(populated.snapshot().len(), 2);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("nested/b.txt")).unwrap(),
            "beta"
        );

        let report = populated.reconcile().await.unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.uploaded, 0);
        assert_eq!(backend.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_modified_file_uploads_once_with_new_bytes() {
        let backend = Arc::new(Counting::new());
        backend.write("/a.txt", "alpha").await;
        backend.write("/b.txt", "beta").await;

        let temp = TempDir::new().unwrap();
        let populated = Mount::new("/work", backend.clone())
            .unwrap()
            .populate(temp.path())
            .await
            .unwrap();

        std::fs::write(temp.path().join("a.txt"), "ALPHA").unwrap();
        std::fs::create_dir_all(temp.path().join("new")).unwrap();
        std::fs::write(temp.path().join("new/c.txt"), "gamma").unwrap();
        std::fs::remove_file(temp.path().join("b.txt")).unwrap();

        let report = populated.reconcile().await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.unchanged, 0);
        assert_eq!(backend.upload_calls.load(Ordering::SeqCst), 1);

        let uploads = backend.uploads.lock().unwrap().clone();
        assert_eq!(
            uploads,
            vec![
                ("/a.txt".to_string(), b"ALPHA".to_vec()),
                ("/new/c.txt".to_string(), b"gamma".to_vec()),
            ]
        );
        // deletions stay in the backend
        assert!(backend.read("/b.txt", 0, 10).await.contains("beta"));
    }

    #[tokio::test]
    async fn test_failed_batch_upload_names_the_mount() {
        let backend = Arc::new(Counting::new());
        backend.write("/a.txt", "alpha").await;

        let temp = TempDir::new().unwrap();
        let populated = Mount::new("/work", backend.clone())
            .unwrap()
            .populate(temp.path())
            .await
            .unwrap();
        std::fs::write(temp.path().join("a.txt"), "changed").unwrap();
        backend.offline.store(true, Ordering::SeqCst);

        let err = populated.reconcile().await.unwrap_err();
        assert_eq!(err.code(), "mount_sync_failed");
        match err {
            MountletError::MountSync { prefix, reason } => {
                assert_eq!(prefix, "/work");
                assert!(reason.contains("closed"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_without_upload_is_skipped() {
        let state = Arc::new(StateBackend::new());
        let temp = TempDir::new().unwrap();
        let populated = Mount::new("/scratch", state).unwrap().populate(temp.path()).await.unwrap();
        assert!(populated.snapshot().is_empty());

        std::fs::write(temp.path().join("made.txt"), "x").unwrap();
        let report = populated.reconcile().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.uploaded, 0);
    }

    #[tokio::test]
    async fn test_read_tree_round_trip() {
        let temp = TempDir::new().unwrap();
        let files = BTreeMap::from([
            ("/x.bin".to_string(), vec![0u8, 255]),
            ("/d/e/f.txt".to_string(), b"deep".to_vec()),
        ]);
        write_tree(temp.path(), &files).await.unwrap();
        assert_eq!(read_tree(temp.path()).await.unwrap(), files);
    }

    #[test]
    fn test_mount_dir_name() {
        assert_eq!(mount_dir_name("/work"), "m_work");
        assert_eq!(mount_dir_name("/a/b/"), "m_a_-b");
        assert_eq!(mount_dir_name("/a__b"), "m_a____b");
        assert_ne!(mount_dir_name("/a__b"), mount_dir_name("/a/b"));
        assert_ne!(mount_dir_name("/a_-b"), mount_dir_name("/a/b"));
    }
}
