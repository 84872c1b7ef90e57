//! Virtual path handling shared by every backend.
//!
//! Virtual paths are absolute and POSIX-style. `.` segments and repeated
//! slashes are dropped; `..` is never resolved and always rejected.

use thiserror::Error;

use crate::error::FileOperationError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path traversal not allowed: {0}")]
    Traversal(String),
    #[error("Invalid path: {0}")]
    Invalid(String),
}

impl From<PathError> for FileOperationError {
    fn from(_: PathError) -> Self {
        FileOperationError::InvalidPath
    }
}

/// Normalize a virtual path to `/a/b` form (no trailing slash except root).
pub fn normalize(path: &str) -> Result<String, PathError> {
    if path.contains('\0') {
        return Err(PathError::Invalid(path.replace('\0', "\\0")));
    }
    if path.starts_with('~') {
        return Err(PathError::Invalid(path.to_string()));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(PathError::Traversal(path.to_string())),
            other => segments.push(other),
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Normalize a directory path into prefix form: `/`, `/a/`, `/a/b/`.
pub fn as_dir_prefix(path: &str) -> Result<String, PathError> {
    let normalized = normalize(path)?;
    if normalized == "/" {
        Ok(normalized)
    } else {
        Ok(format!("{}/", normalized))
    }
}

/// Join a normalized directory with a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name.trim_start_matches('/'))
    } else {
        format!("{}/{}", dir, name.trim_start_matches('/'))
    }
}

/// Parent directory of a normalized path, in prefix form.
pub fn parent_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => format!("{}/", &trimmed[..idx]),
    }
}

/// Whether `path` lies at or below the directory `prefix` (prefix form).
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let bare = prefix.trim_end_matches('/');
    path == bare || path.starts_with(prefix)
}

/// Strip a directory prefix, keeping the leading slash.
pub fn strip_prefix(path: &str, prefix: &str) -> String {
    if prefix == "/" {
        return path.to_string();
    }
    let bare = prefix.trim_end_matches('/');
    match path.strip_prefix(bare) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Re-attach a directory prefix to a backend-relative path.
pub fn add_prefix(path: &str, prefix: &str) -> String {
    if prefix == "/" {
        return path.to_string();
    }
    let bare = prefix.trim_end_matches('/');
    if path == "/" {
        format!("{}/", bare)
    } else {
        format!("{}/{}", bare, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a//b/./c/").unwrap(), "/a/b/c");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("").unwrap(), "/");
    }

    #[test]
    fn test_traversal_is_rejected() {
        assert!(matches!(normalize("/a/../../etc/passwd"), Err(PathError::Traversal(_))));
        assert!(matches!(normalize("../x"), Err(PathError::Traversal(_))));
        assert!(normalize("~/x").is_err());
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(as_dir_prefix("/memories").unwrap(), "/memories/");
        assert_eq!(parent_prefix("/memories/"), "/");
        assert_eq!(parent_prefix("/a/b/"), "/a/");
        assert!(is_under("/memories/x.md", "/memories/"));
        assert!(is_under("/memories", "/memories/"));
        assert!(!is_under("/memoriesx", "/memories/"));
        assert_eq!(strip_prefix("/memories/x.md", "/memories/"), "/x.md");
        assert_eq!(strip_prefix("/memories", "/memories/"), "/");
        assert_eq!(add_prefix("/x.md", "/memories/"), "/memories/x.md");
        assert_eq!(add_prefix("/", "/memories/"), "/memories/");
    }
}
