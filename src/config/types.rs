use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountletConfig {
    pub sandbox: SandboxConfig,
    /// Backends routed by path prefix in front of the default backend
    pub routes: Vec<RouteConfig>,
    /// Backends attached to the WASM engine as VM mounts
    pub mounts: Vec<RouteConfig>,
}

/// The type of sandbox runtime to use as the default backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Shell on the host, confined to a working directory
    #[default]
    Local,
    /// Docker container sandbox
    Docker,
    /// WebAssembly sandbox using Wasmer (cross-platform)
    Wasmer,
    /// Cloud sandbox reached over HTTP
    Remote,
    /// No command execution; files only, rooted at the local root
    Filesystem,
    /// Docker when the daemon is reachable, the local shell otherwise
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which runtime to use
    pub backend: BackendType,
    /// Working directory inside the sandbox
    pub workdir: String,
    /// Command timeout in seconds
    pub timeout_seconds: u64,
    /// Output budget per command, in bytes
    pub max_output_bytes: usize,
    /// Environment variables set for every command
    pub env: BTreeMap<String, String>,
    pub local: LocalConfig,
    pub docker: DockerConfig,
    pub wasmer: WasmerConfig,
    pub remote: RemoteConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            workdir: "/workspace".to_string(),
            timeout_seconds: 30,
            max_output_bytes: 100_000,
            env: BTreeMap::new(),
            local: LocalConfig::default(),
            docker: DockerConfig::default(),
            wasmer: WasmerConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Local shell configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Host directory commands run in (default: current directory)
    pub root: Option<PathBuf>,
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Custom Docker image name (default: mountlet-sandbox:latest)
    pub image: Option<String>,
    /// Automatically build the image if it doesn't exist (default: true)
    pub build_image: bool,
    /// Enable networking in the container (default: false)
    pub enable_networking: bool,
    /// Memory limit in MB
    pub memory_limit_mb: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: None,
            build_image: true,
            enable_networking: false,
            memory_limit_mb: 256,
        }
    }
}

/// Wasmer-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmerConfig {
    /// Path to a custom WEBC package (default: bash from the registry)
    pub wasm_binary: Option<PathBuf>,
    /// Extra registry packages exposed to commands (`wasmer run --use`)
    pub packages: Vec<String>,
    /// WASI build of `mountlet-agent` installed as `/.bin/subagent`
    /// (default: a shell script with the same interface)
    pub subagent_wasm: Option<PathBuf>,
}

/// Remote sandbox provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Provider API base URL
    pub base_url: Option<String>,
    /// Sandbox to attach to
    pub sandbox_id: Option<String>,
    /// Bearer token (falls back to MOUNTLET_REMOTE_API_KEY)
    pub api_key: Option<String>,
}

/// Storage substrate for a route or VM mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// A host directory
    Filesystem,
    /// Durable JSON key-value store
    Store,
    /// Process-local key-value store
    Memory,
}

/// One `[[routes]]` or `[[mounts]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Virtual path prefix, e.g. "/memories/"
    pub prefix: String,
    pub kind: RouteKind,
    /// Host directory for `filesystem`
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Store directory for `store` (default: data dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}
