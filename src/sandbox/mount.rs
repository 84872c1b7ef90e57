//! Backends attached to a VM run at fixed guest path prefixes.

use std::sync::Arc;

use crate::backend::path;
use crate::backend::protocol::Backend;
use crate::error::{MountletError, Result};

/// Guest directory holding the `subagent` helper.
pub const BIN_MOUNT: &str = "/.bin";

/// Guest directory holding the RPC spool.
pub const RPC_MOUNT: &str = "/.rpc";

/// A backend bound to a guest path prefix for the duration of a run.
///
/// The backend sees paths relative to the prefix: guest `/work/a.txt` under
/// a `/work` mount is `/a.txt` to the backend.
#[derive(Clone)]
pub struct Mount {
    prefix: String,
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("prefix", &self.prefix)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Mount {
    pub fn new(prefix: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        let prefix = path::normalize(prefix).map_err(|e| MountletError::Config(e.to_string()))?;
        if prefix == "/" {
            return Err(MountletError::Config(
                "a mount cannot cover the whole guest filesystem".to_string(),
            ));
        }
        for reserved in [BIN_MOUNT, RPC_MOUNT] {
            if path::is_under(&prefix, &format!("{}/", reserved)) {
                return Err(MountletError::Config(format!(
                    "mount prefix '{}' is reserved",
                    prefix
                )));
            }
        }
        Ok(Self { prefix, backend })
    }

    /// Normalized guest prefix without a trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn dir_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn contains(&self, guest_path: &str) -> bool {
        path::is_under(guest_path, &self.dir_prefix())
    }

    /// Guest path to backend path.
    pub fn backend_path(&self, guest_path: &str) -> String {
        path::strip_prefix(guest_path, &self.dir_prefix())
    }

    /// Backend path to guest path.
    pub fn guest_path(&self, backend_path: &str) -> String {
        path::add_prefix(backend_path, &self.dir_prefix())
    }
}

/// Mounts ordered longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new(mounts: Vec<Mount>) -> Result<Self> {
        let mut table = Self::default();
        for mount in mounts {
            table.insert(mount)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, mount: Mount) -> Result<()> {
        if self.mounts.iter().any(|m| m.prefix == mount.prefix) {
            return Err(MountletError::Config(format!(
                "duplicate mount prefix '{}'",
                mount.prefix
            )));
        }
        self.mounts.push(mount);
        self.mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(())
    }

    /// The mount owning `guest_path` (longest prefix wins).
    pub fn resolve(&self, guest_path: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.contains(guest_path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::store::StoreBackend;

    fn store() -> Arc<dyn Backend> {
        Arc::new(StoreBackend::in_memory())
    }

    #[test]
    fn test_paths_translate_both_ways() {
        let mount = Mount::new("/work/", store()).unwrap();
        assert_eq!(mount.prefix(), "/work");
        assert!(mount.contains("/work/a.txt"));
        assert!(!mount.contains("/workshop/a.txt"));
        assert_eq!(mount.backend_path("/work/src/a.txt"), "/src/a.txt");
        assert_eq!(mount.guest_path("/src/a.txt"), "/work/src/a.txt");
    }

    #[test]
    fn test_invalid_prefixes() {
        assert!(Mount::new("/", store()).is_err());
        assert!(Mount::new("/.rpc/x", store()).is_err());
        assert!(Mount::new("/a/../b", store()).is_err());
    }

    #[test]
    fn test_longest_prefix_resolution() {
        let table = MountTable::new(vec![
            Mount::new("/data", store()).unwrap(),
            Mount::new("/data/cache", store()).unwrap(),
        ])
        .unwrap();
        assert_eq!(table.resolve("/data/cache/x").unwrap().prefix(), "/data/cache");
        assert_eq!(table.resolve("/data/x").unwrap().prefix(), "/data");
        assert!(table.resolve("/other").is_none());
        assert!(MountTable::new(vec![
            Mount::new("/a", store()).unwrap(),
            Mount::new("/a/", store()).unwrap()
        ])
        .is_err());
    }
}
