//! Routes backend operations by longest path-prefix match.
//!
//! A routed backend sees paths relative to its own root (`/memories/x.md`
//! arrives as `/x.md`); every path it returns is re-prefixed on the way out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::path::{self, as_dir_prefix, is_under, normalize};
use crate::backend::protocol::{Backend, FileTransfer, SandboxBackend};
use crate::backend::text::PathGlob;
use crate::backend::types::{
    EditResult, ExecuteResponse, FileDownloadResponse, FileInfo, FileUploadResponse, FilesUpdate,
    GrepOutcome, WriteResult,
};
use crate::error::{FileOperationError, MountletError, Result};

#[derive(Clone)]
struct Route {
    /// Directory form: `/memories/`
    prefix: String,
    backend: Arc<dyn Backend>,
}

/// Where a path lands: the owning route (`None` for the default) and the
/// path as the owning backend should see it.
struct Resolved<'a> {
    route: Option<&'a Route>,
    inner: String,
}

impl Resolved<'_> {
    fn prefix(&self) -> &str {
        self.route.map(|r| r.prefix.as_str()).unwrap_or("/")
    }

    fn outer(&self, inner: &str) -> String {
        path::add_prefix(inner, self.prefix())
    }
}

pub struct CompositeBackend {
    default: Arc<dyn Backend>,
    /// Sorted longest prefix first.
    routes: Vec<Route>,
}

impl std::fmt::Debug for CompositeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBackend")
            .field("default", &self.default.name())
            .field(
                "routes",
                &self.routes.iter().map(|r| (&r.prefix, r.backend.name())).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CompositeBackend {
    pub fn new(default: Arc<dyn Backend>) -> Self {
        Self {
            default,
            routes: Vec::new(),
        }
    }

    /// Mount `backend` at `prefix`. A prefix registered twice is replaced.
    pub fn with_route(mut self, prefix: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        let prefix = as_dir_prefix(prefix)
            .map_err(|e| MountletError::Config(format!("invalid route prefix: {}", e)))?;
        if prefix == "/" {
            return Err(MountletError::Config(
                "route prefix '/' would shadow the default backend".to_string(),
            ));
        }

        self.routes.retain(|r| r.prefix != prefix);
        self.routes.push(Route { prefix, backend });
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then(a.prefix.cmp(&b.prefix)));
        Ok(self)
    }

    pub fn default_backend(&self) -> &Arc<dyn Backend> {
        &self.default
    }

    pub fn route_prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.prefix.as_str()).collect()
    }

    fn resolve(&self, path: &str) -> Resolved<'_> {
        let Ok(normalized) = normalize(path) else {
            return Resolved {
                route: None,
                inner: path.to_string(),
            };
        };
        match self.routes.iter().find(|r| is_under(&normalized, &r.prefix)) {
            Some(route) => Resolved {
                route: Some(route),
                inner: path::strip_prefix(&normalized, &route.prefix),
            },
            None => Resolved {
                route: None,
                inner: path.to_string(),
            },
        }
    }

    fn backend_of<'a>(&'a self, resolved: &Resolved<'a>) -> &'a Arc<dyn Backend> {
        resolved.route.map(|r| &r.backend).unwrap_or(&self.default)
    }

    /// Routes strictly below `dir` that the owning backend (rooted at
    /// `owner_prefix`) does not itself cover.
    fn routes_below<'a>(&'a self, dir: &'a str, owner_prefix: &'a str) -> impl Iterator<Item = &'a Route> + 'a {
        self.routes.iter().filter(move |r| {
            r.prefix != dir && r.prefix.starts_with(dir) && r.prefix.len() > owner_prefix.len()
        })
    }

    fn shadowed(&self, path: &str, owner_prefix: &str) -> bool {
        self.routes
            .iter()
            .any(|r| r.prefix.len() > owner_prefix.len() && is_under(path, &r.prefix))
    }

    fn prefix_update(update: Option<FilesUpdate>, prefix: &str) -> Option<FilesUpdate> {
        update.map(|files| {
            files
                .into_iter()
                .map(|(key, data)| (path::add_prefix(&key, prefix), data))
                .collect()
        })
    }
}

#[async_trait]
impl Backend for CompositeBackend {
    fn name(&self) -> &str {
        "composite"
    }

    async fn ls_info(&self, path: &str) -> Vec<FileInfo> {
        let Ok(dir) = as_dir_prefix(path) else {
            return self.default.ls_info(path).await;
        };
        let resolved = self.resolve(&dir);
        let owner_prefix = resolved.prefix().to_string();

        let mut entries: Vec<FileInfo> = self
            .backend_of(&resolved)
            .ls_info(&resolved.inner)
            .await
            .into_iter()
            .map(|mut info| {
                info.path = resolved.outer(&info.path);
                info
            })
            .filter(|info| !self.shadowed(info.path.trim_end_matches('/'), &owner_prefix))
            .collect();

        let mut synthetic = BTreeSet::new();
        for route in self.routes_below(&dir, &owner_prefix) {
            let rest = &route.prefix[dir.len()..];
            if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                synthetic.insert(format!("{}{}/", dir, child));
            }
        }
        for child in synthetic {
            if !entries.iter().any(|e| e.path == child) {
                entries.push(FileInfo::dir(child, None));
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    async fn read(&self, path: &str, offset: usize, limit: usize) -> String {
        let resolved = self.resolve(path);
        self.backend_of(&resolved)
            .read(&resolved.inner, offset, limit)
            .await
    }

    async fn grep_raw(&self, pattern: &str, path: &str, glob: Option<&str>) -> GrepOutcome {
        let dir = as_dir_prefix(path).map_err(|e| format!("Error: {}", e))?;
        let resolved = self.resolve(path);
        let owner_prefix = resolved.prefix().to_string();

        let mut searches = vec![(owner_prefix.clone(), self.backend_of(&resolved).clone(), resolved.inner.clone())];
        for route in self.routes_below(&dir, &owner_prefix) {
            searches.push((route.prefix.clone(), route.backend.clone(), "/".to_string()));
        }

        let mut matches = Vec::new();
        let mut failures = Vec::new();
        for (prefix, backend, inner) in searches {
            match backend.grep_raw(pattern, &inner, glob).await {
                Ok(found) => matches.extend(
                    found
                        .into_iter()
                        .map(|mut m| {
                            m.path = path::add_prefix(&m.path, &prefix);
                            m
                        })
                        .filter(|m| !self.shadowed(&m.path, &prefix)),
                ),
                Err(e) => {
                    warn!(backend = backend.name(), prefix = %prefix, error = %e, "Grep failed on routed backend");
                    failures.push(e);
                }
            }
        }

        if matches.is_empty() && !failures.is_empty() {
            return Err(failures.join("\n"));
        }
        Ok(matches)
    }

    async fn glob_info(&self, pattern: &str, path: &str) -> Vec<FileInfo> {
        let (Ok(dir), Ok(glob)) = (as_dir_prefix(path), PathGlob::new(pattern)) else {
            return Vec::new();
        };
        let resolved = self.resolve(path);
        let owner_prefix = resolved.prefix().to_string();

        let mut results: Vec<FileInfo> = self
            .backend_of(&resolved)
            .glob_info(pattern, &resolved.inner)
            .await
            .into_iter()
            .map(|mut info| {
                info.path = resolved.outer(&info.path);
                info
            })
            .filter(|info| !self.shadowed(info.path.trim_end_matches('/'), &owner_prefix))
            .collect();

        // Routed backends are listed exhaustively and filtered against the
        // pattern relative to the original search root.
        let everything = if glob.wants_dirs() { "**/" } else { "**" };
        for route in self.routes_below(&dir, &owner_prefix) {
            for mut info in route.backend.glob_info(everything, "/").await {
                info.path = path::add_prefix(&info.path, &route.prefix);
                let relative = path::strip_prefix(info.path.trim_end_matches('/'), &dir);
                if glob.matches(&relative, info.is_dir)
                    && !self.shadowed(info.path.trim_end_matches('/'), &route.prefix)
                {
                    results.push(info);
                }
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        results
    }

    async fn write(&self, path: &str, content: &str) -> WriteResult {
        let resolved = self.resolve(path);
        let mut result = self.backend_of(&resolved).write(&resolved.inner, content).await;
        if resolved.route.is_some() {
            result.path = resolved.outer(&result.path);
            result.files_update = Self::prefix_update(result.files_update, resolved.prefix());
        }
        result
    }

    async fn edit(&self, path: &str, old: &str, new: &str, replace_all: bool) -> EditResult {
        let resolved = self.resolve(path);
        let mut result = self
            .backend_of(&resolved)
            .edit(&resolved.inner, old, new, replace_all)
            .await;
        if resolved.route.is_some() {
            result.path = resolved.outer(&result.path);
            result.files_update = Self::prefix_update(result.files_update, resolved.prefix());
        }
        result
    }

    fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        Some(self)
    }

    fn sandbox(&self) -> Option<&dyn SandboxBackend> {
        self.default.sandbox().map(|_| self as &dyn SandboxBackend)
    }
}

impl CompositeBackend {
    /// Group item indices by owning backend, keyed by route prefix.
    fn partition<'p>(
        &self,
        paths: impl Iterator<Item = &'p String>,
    ) -> BTreeMap<String, (Arc<dyn Backend>, Vec<(usize, String)>)> {
        let mut groups: BTreeMap<String, (Arc<dyn Backend>, Vec<(usize, String)>)> = BTreeMap::new();
        for (index, path) in paths.enumerate() {
            let resolved = self.resolve(path);
            let backend = self.backend_of(&resolved).clone();
            groups
                .entry(resolved.prefix().to_string())
                .or_insert_with(|| (backend, Vec::new()))
                .1
                .push((index, resolved.inner));
        }
        groups
    }
}

#[async_trait]
impl FileTransfer for CompositeBackend {
    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        let mut slots: Vec<Option<FileUploadResponse>> = vec![None; files.len()];

        for (prefix, (backend, items)) in self.partition(files.iter().map(|(p, _)| p)) {
            let supported = backend.file_transfer().filter(|t| t.supports_upload());
            let Some(transfer) = supported else {
                for (index, _) in items {
                    slots[index] = Some(FileUploadResponse::err(&files[index].0, FileOperationError::PermissionDenied));
                }
                continue;
            };

            let batch: Vec<(String, Vec<u8>)> = items
                .iter()
                .map(|(index, inner)| (inner.clone(), files[*index].1.clone()))
                .collect();
            debug!(prefix = %prefix, count = batch.len(), "Routing upload batch");
            let responses = match transfer.upload_files(&batch).await {
                Ok(responses) => responses,
                Err(e) => {
                    warn!(prefix = %prefix, backend = backend.name(), error = %e, "Upload batch failed");
                    for (index, _) in items {
                        slots[index] = Some(FileUploadResponse::err(&files[index].0, FileOperationError::PermissionDenied));
                    }
                    continue;
                }
            };
            for ((index, _), response) in items.into_iter().zip(responses) {
                slots[index] = Some(FileUploadResponse {
                    path: files[index].0.clone(),
                    error: response.error,
                });
            }
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| FileUploadResponse::err(&files[i].0, FileOperationError::InvalidPath)))
            .collect())
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        let mut slots: Vec<Option<FileDownloadResponse>> = vec![None; paths.len()];

        for (prefix, (backend, items)) in self.partition(paths.iter()) {
            let supported = backend.file_transfer().filter(|t| t.supports_download());
            let Some(transfer) = supported else {
                for (index, _) in items {
                    slots[index] = Some(FileDownloadResponse::err(&paths[index], FileOperationError::PermissionDenied));
                }
                continue;
            };

            let batch: Vec<String> = items.iter().map(|(_, inner)| inner.clone()).collect();
            debug!(prefix = %prefix, count = batch.len(), "Routing download batch");
            let responses = match transfer.download_files(&batch).await {
                Ok(responses) => responses,
                Err(e) => {
                    warn!(prefix = %prefix, backend = backend.name(), error = %e, "Download batch failed");
                    for (index, _) in items {
                        slots[index] = Some(FileDownloadResponse::err(&paths[index], FileOperationError::PermissionDenied));
                    }
                    continue;
                }
            };
            for ((index, _), response) in items.into_iter().zip(responses) {
                slots[index] = Some(FileDownloadResponse {
                    path: paths[index].clone(),
                    content: response.content,
                    error: response.error,
                });
            }
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| FileDownloadResponse::err(&paths[i], FileOperationError::InvalidPath)))
            .collect())
    }
}

#[async_trait]
impl SandboxBackend for CompositeBackend {
    fn id(&self) -> &str {
        self.default.sandbox().map(|s| s.id()).unwrap_or("")
    }

    /// Always runs on the default backend, never on a route.
    async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
        match self.default.sandbox() {
            Some(sandbox) => sandbox.execute(command).await,
            None => Err(MountletError::ExecutionUnsupported),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        match self.default.sandbox() {
            Some(sandbox) => sandbox.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::protocol::is_sandbox_backend;
    use crate::backend::state::StateBackend;
    use crate::backend::store::StoreBackend;
    use crate::backend::types::GrepMatch;

    /// Every search fails or comes back empty; every batch is refused whole.
    struct Broken;

    #[async_trait]
    impl Backend for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn ls_info(&self, _path: &str) -> Vec<FileInfo> {
            Vec::new()
        }
        async fn read(&self, path: &str, _offset: usize, _limit: usize) -> String {
            format!("Error: File '{}' not found", path)
        }
        async fn grep_raw(&self, _pattern: &str, _path: &str, _glob: Option<&str>) -> GrepOutcome {
            Err("Error: search failed: disk gone".to_string())
        }
        async fn glob_info(&self, _pattern: &str, _path: &str) -> Vec<FileInfo> {
            Vec::new()
        }
        async fn write(&self, path: &str, _content: &str) -> WriteResult {
            WriteResult::err(path, "Error: broken".to_string())
        }
        async fn edit(&self, path: &str, _old: &str, _new: &str, _replace_all: bool) -> EditResult {
            EditResult::err(path, "Error: broken".to_string())
        }
        fn file_transfer(&self) -> Option<&dyn FileTransfer> {
            Some(self)
        }
    }

    #[async_trait]
    impl FileTransfer for Broken {
        async fn upload_files(&self, _files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
            Err(MountletError::Closed {
                backend: "broken".to_string(),
            })
        }
        async fn download_files(&self, _paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
            Err(MountletError::Closed {
                backend: "broken".to_string(),
            })
        }
    }

    fn with_broken_route() -> CompositeBackend {
        CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/zz/", Arc::new(Broken))
            .unwrap()
    }

    fn composite() -> CompositeBackend {
        CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/memories", Arc::new(StoreBackend::in_memory()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_route_shows_as_single_entry() {
        let backend = composite();
        assert!(backend.write("/memories/x.md", "note").await.is_ok());
        assert!(backend.write("/top.txt", "top").await.is_ok());

        let root: Vec<String> = backend.ls_info("/").await.into_iter().map(|e| e.path).collect();
        assert_eq!(root, vec!["/memories/", "/top.txt"]);

        let inside: Vec<String> = backend
            .ls_info("/memories/")
            .await
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(inside, vec!["/memories/x.md"]);
    }

    #[tokio::test]
    async fn test_route_sees_relative_paths() {
        let memories = Arc::new(StoreBackend::in_memory());
        let backend = CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/memories/", memories.clone())
            .unwrap();

        backend.write("/memories/notes/a.md", "a").await;
        assert!(memories.read("/notes/a.md", 0, 5).await.contains('a'));
        assert!(backend.read("/notes/a.md", 0, 5).await.contains("not found"));
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let outer = Arc::new(StoreBackend::in_memory());
        let inner = Arc::new(StoreBackend::in_memory());
        let backend = CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/data/", outer.clone())
            .unwrap()
            .with_route("/data/cache/", inner.clone())
            .unwrap();

        backend.write("/data/cache/hit", "1").await;
        backend.write("/data/raw", "2").await;
        assert!(inner.read("/hit", 0, 1).await.contains('1'));
        assert!(outer.read("/raw", 0, 1).await.contains('2'));

        let data: Vec<String> = backend.ls_info("/data").await.into_iter().map(|e| e.path).collect();
        assert_eq!(data, vec!["/data/cache/", "/data/raw"]);
    }

    #[tokio::test]
    async fn test_grep_fans_out_and_reprefixes() {
        let backend = composite();
        backend.write("/a.txt", "needle here").await;
        backend.write("/memories/b.txt", "another needle").await;

        let mut paths: Vec<String> = backend
            .grep_raw("needle", "/", None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["/a.txt", "/memories/b.txt"]);

        let scoped = backend.grep_raw("needle", "/memories", None).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].path, "/memories/b.txt");
    }

    #[tokio::test]
    async fn test_glob_filters_routes_relative_to_search_root() {
        let backend = composite();
        backend.write("/top.md", "").await;
        backend.write("/memories/x.md", "").await;

        let shallow: Vec<String> = backend.glob_info("*.md", "/").await.into_iter().map(|e| e.path).collect();
        assert_eq!(shallow, vec!["/top.md"]);
        let deep: Vec<String> = backend.glob_info("**/*.md", "/").await.into_iter().map(|e| e.path).collect();
        assert_eq!(deep, vec!["/memories/x.md", "/top.md"]);
    }

    #[tokio::test]
    async fn test_batch_transfer_keeps_order() {
        let backend = CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/memories/", Arc::new(StoreBackend::in_memory()))
            .unwrap()
            .with_route("/state/", Arc::new(StateBackend::new()))
            .unwrap();

        let uploads = backend
            .upload_files(&[
                ("/memories/a".to_string(), b"A".to_vec()),
                ("/b".to_string(), vec![0xff, 0x01]),
                ("/state/c".to_string(), b"C".to_vec()),
                ("/memories/d".to_string(), b"D".to_vec()),
            ])
            .await
            .unwrap();
        let paths: Vec<&str> = uploads.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["/memories/a", "/b", "/state/c", "/memories/d"]);
        assert!(uploads[0].error.is_none());
        assert_eq!(uploads[2].error, Some(FileOperationError::PermissionDenied));

        let downloads = backend
            .download_files(&["/memories/d".to_string(), "/b".to_string(), "/memories/a".to_string()])
            .await
            .unwrap();
        assert_eq!(downloads[0].content.as_deref(), Some(&b"D"[..]));
        assert_eq!(downloads[1].content.as_deref(), Some(&[0xff, 0x01][..]));
        assert_eq!(downloads[2].path, "/memories/a");
    }

    #[tokio::test]
    async fn test_failing_route_does_not_hide_default_results() {
        let backend = with_broken_route();
        backend.write("/a.txt", "needle").await;
        backend.write("/docs/b.md", "needle again").await;

        let hits: Vec<GrepMatch> = backend.grep_raw("needle", "/", None).await.unwrap();
        let mut paths: Vec<&str> = hits.iter().map(|m| m.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/a.txt", "/docs/b.md"]);

        let globbed: Vec<String> = backend.glob_info("**/*.md", "/").await.into_iter().map(|e| e.path).collect();
        assert_eq!(globbed, vec!["/docs/b.md"]);

        let only_broken = backend.grep_raw("needle", "/zz/", None).await.unwrap_err();
        assert!(only_broken.contains("disk gone"));
    }

    #[tokio::test]
    async fn test_failing_route_in_batch_transfer() {
        let backend = with_broken_route();

        let uploads = backend
            .upload_files(&[
                ("/a.txt".to_string(), b"A".to_vec()),
                ("/zz/b".to_string(), b"B".to_vec()),
                ("/c.txt".to_string(), b"C".to_vec()),
            ])
            .await
            .unwrap();
        assert!(uploads[0].error.is_none());
        assert_eq!(uploads[1].path, "/zz/b");
        assert_eq!(uploads[1].error, Some(FileOperationError::PermissionDenied));
        assert!(uploads[2].error.is_none());

        let downloads = backend
            .download_files(&["/zz/b".to_string(), "/a.txt".to_string()])
            .await
            .unwrap();
        assert_eq!(downloads[0].error, Some(FileOperationError::PermissionDenied));
        assert!(downloads[0].content.is_none());
        assert_eq!(downloads[1].content.as_deref(), Some(&b"A"[..]));
    }

    #[tokio::test]
    async fn test_files_update_is_reprefixed() {
        let backend = CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/scratch/", Arc::new(StateBackend::new()))
            .unwrap();
        let result = backend.write("/scratch/tmp.txt", "x").await;
        assert_eq!(result.path, "/scratch/tmp.txt");
        let update = result.files_update.unwrap();
        assert!(update.contains_key("/scratch/tmp.txt"));
    }

    #[tokio::test]
    async fn test_execute_requires_sandbox_default() {
        let backend = composite();
        assert!(!is_sandbox_backend(&backend));
        assert!(backend.sandbox().is_none());
        let err = SandboxBackend::execute(&backend, "echo hi").await.unwrap_err();
        assert_eq!(err.code(), "execution_unsupported");
    }

    #[test]
    fn test_root_prefix_is_rejected() {
        let result = CompositeBackend::new(Arc::new(StoreBackend::in_memory()))
            .with_route("/", Arc::new(StoreBackend::in_memory()));
        assert!(result.is_err());
    }
}
