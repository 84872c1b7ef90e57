use std::path::{Path, PathBuf};

use crate::config::types::MountletConfig;
use crate::error::{MountletError, Result};

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "mountlet", "mountlet")
}

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".mountlet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly given path must exist; the default location may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<MountletConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(MountletError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => {
            let path = get_config_path();
            if !path.exists() {
                return Ok(MountletConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<MountletConfig> {
    toml::from_str(content).map_err(|e| MountletError::TomlParse(e.to_string()))
}

/// Get the cache directory for the wasmer binary and WEBC packages
pub fn get_cache_dir() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.cache_dir().to_path_buf()
    } else {
        dirs_fallback().join(".cache").join("mountlet")
    }
}

/// Get the data directory (default home of `store` routes)
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("mountlet")
    }
}
