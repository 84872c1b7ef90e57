use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::composite::CompositeBackend;
use crate::backend::filesystem::FilesystemBackend;
use crate::backend::protocol::Backend;
use crate::backend::store::StoreBackend;
use crate::config::loader::get_data_dir;
use crate::config::types::{BackendType, MountletConfig, RouteConfig, RouteKind};
use crate::error::{MountletError, Result};
use crate::sandbox::backends::{DockerRuntime, LocalShellRuntime, RemoteRuntime};
use crate::sandbox::base::BaseSandbox;
use crate::sandbox::traits::SandboxRuntime;

#[cfg(feature = "wasmer")]
use crate::sandbox::backends::WasmSandbox;
#[cfg(feature = "wasmer")]
use crate::sandbox::mount::{Mount, MountTable};

/// Create the default backend named by `[sandbox] backend`.
///
/// Every runtime comes back fully initialized and wrapped in
/// [`BaseSandbox`]; `filesystem` yields a files-only backend.
pub async fn create_sandbox(config: &MountletConfig) -> Result<Arc<dyn Backend>> {
    let sandbox = &config.sandbox;
    let backend_type = resolve_backend_type(&sandbox.backend)?;
    info!(backend = ?backend_type, "Creating default backend");

    match backend_type {
        BackendType::Local => Ok(Arc::new(BaseSandbox::new(LocalShellRuntime::from_config(sandbox)?))),
        BackendType::Docker => checked(DockerRuntime::new(sandbox).await?).await,
        BackendType::Remote => checked(RemoteRuntime::from_config(sandbox)?).await,
        BackendType::Filesystem => {
            let root = match &sandbox.local.root {
                Some(root) => root.clone(),
                None => std::env::current_dir()?,
            };
            Ok(Arc::new(FilesystemBackend::new(root)))
        }

        #[cfg(feature = "wasmer")]
        BackendType::Wasmer => {
            let mut mounts = MountTable::default();
            for mount in &config.mounts {
                mounts.insert(Mount::new(&mount.prefix, build_route(mount)?)?)?;
            }
            let wasm = WasmSandbox::new(sandbox, mounts);
            wasm.initialize().await?;
            Ok(Arc::new(BaseSandbox::new(wasm)))
        }
        #[cfg(not(feature = "wasmer"))]
        BackendType::Wasmer => Err(MountletError::BackendNotAvailable {
            backend: "wasmer".to_string(),
            reason: "Wasmer support was not compiled in".to_string(),
        }),

        BackendType::Auto => Err(MountletError::Config(
            "backend type must be resolved before creation".to_string(),
        )),
    }
}

/// Wrap a runtime that lives outside this process once it answers a
/// trivial command; otherwise release it.
async fn checked<R: SandboxRuntime + 'static>(runtime: R) -> Result<Arc<dyn Backend>> {
    if runtime.health_check().await? {
        return Ok(Arc::new(BaseSandbox::new(runtime)));
    }
    let backend = runtime.name().to_string();
    if let Err(e) = runtime.shutdown().await {
        warn!(backend = %backend, error = %e, "Releasing unhealthy sandbox failed");
    }
    Err(MountletError::BackendNotAvailable {
        backend,
        reason: "sandbox did not answer a health check".to_string(),
    })
}

/// Build the backend for one `[[routes]]` or `[[mounts]]` entry.
pub fn build_route(route: &RouteConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match route.kind {
        RouteKind::Filesystem => {
            let root = route.root.clone().ok_or_else(|| {
                MountletError::Config(format!("route '{}' needs a root directory", route.prefix))
            })?;
            Arc::new(FilesystemBackend::new(root))
        }
        RouteKind::Store => {
            let dir = route.dir.clone().unwrap_or_else(|| default_store_dir(&route.prefix));
            Arc::new(StoreBackend::json_dir(dir))
        }
        RouteKind::Memory => Arc::new(StoreBackend::in_memory()),
    };
    Ok(backend)
}

/// `<data dir>/store/<prefix>` so distinct routes never share keys.
fn default_store_dir(prefix: &str) -> PathBuf {
    let name = prefix.trim_matches('/').replace('/', "_");
    let name = if name.is_empty() { "root".to_string() } else { name };
    get_data_dir().join("store").join(name)
}

/// The default backend with every configured route in front of it.
pub async fn build_backend(config: &MountletConfig) -> Result<CompositeBackend> {
    let mut composite = CompositeBackend::new(create_sandbox(config).await?);
    for route in &config.routes {
        composite = composite.with_route(&route.prefix, build_route(route)?)?;
    }
    Ok(composite)
}

/// Resolve the backend type, handling Auto selection.
pub fn resolve_backend_type(requested: &BackendType) -> Result<BackendType> {
    match requested {
        BackendType::Auto => {
            if DockerRuntime::is_available() {
                Ok(BackendType::Docker)
            } else {
                Ok(BackendType::Local)
            }
        }
        BackendType::Docker if !DockerRuntime::is_available() => Err(MountletError::BackendNotAvailable {
            backend: "docker".to_string(),
            reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                .to_string(),
        }),
        BackendType::Local if !LocalShellRuntime::is_available() => {
            Err(MountletError::BackendNotAvailable {
                backend: "local".to_string(),
                reason: "No POSIX shell (sh) found".to_string(),
            })
        }
        other => Ok(other.clone()),
    }
}

/// Get information about available backends on this system.
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    let local = LocalShellRuntime::is_available();
    backends.push(BackendInfo {
        name: "local",
        available: local,
        description: "Host shell confined to a working directory (no isolation)",
        unavailable_reason: (!local).then_some("No POSIX shell (sh) found"),
    });

    let docker = DockerRuntime::is_available();
    backends.push(BackendInfo {
        name: "docker",
        available: docker,
        description: "Docker container sandbox",
        unavailable_reason: (!docker).then_some("Docker daemon not accessible"),
    });

    #[cfg(feature = "wasmer")]
    backends.push(BackendInfo {
        name: "wasmer",
        available: WasmSandbox::is_available(),
        description: "WebAssembly VM per command, with mount sync (cross-platform)",
        unavailable_reason: None,
    });
    #[cfg(not(feature = "wasmer"))]
    backends.push(BackendInfo {
        name: "wasmer",
        available: false,
        description: "WebAssembly VM per command, with mount sync (cross-platform)",
        unavailable_reason: Some("Not compiled in (use --features wasmer)"),
    });

    backends.push(BackendInfo {
        name: "remote",
        available: true,
        description: "Cloud sandbox over HTTP (needs [sandbox.remote])",
        unavailable_reason: None,
    });

    backends.push(BackendInfo {
        name: "filesystem",
        available: true,
        description: "Files only, rooted at a host directory (no execution)",
        unavailable_reason: None,
    });

    backends
}

/// Information about a sandbox backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::protocol::{is_sandbox_backend, SandboxBackend};
    use crate::config::types::SandboxConfig;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_config(root: &std::path::Path) -> MountletConfig {
        let mut config = MountletConfig::default();
        config.sandbox.local.root = Some(root.to_path_buf());
        config.routes.push(RouteConfig {
            prefix: "/memories/".to_string(),
            kind: RouteKind::Memory,
            root: None,
            dir: None,
        });
        config
    }

    #[tokio::test]
    async fn test_build_local_composite() {
        let temp = TempDir::new().unwrap();
        let backend = build_backend(&local_config(temp.path())).await.unwrap();

        assert!(is_sandbox_backend(&backend));
        assert_eq!(backend.route_prefixes(), vec!["/memories/"]);
        let response = backend.execute("echo composite").await.unwrap();
        assert_eq!(response.output, "composite\n");

        assert!(backend.write("/memories/a.md", "remember").await.is_ok());
        assert!(backend.read("/memories/a.md", 0, 5).await.contains("remember"));
        assert!(backend.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_filesystem_default_cannot_execute() {
        let temp = TempDir::new().unwrap();
        let mut config = local_config(temp.path());
        config.sandbox.backend = BackendType::Filesystem;
        let backend = build_backend(&config).await.unwrap();

        assert!(!is_sandbox_backend(&backend));
        let err = backend.execute("true").await.unwrap_err();
        assert_eq!(err.code(), "execution_unsupported");
    }

    #[test]
    fn test_route_kinds() {
        let temp = TempDir::new().unwrap();
        let fs_route = RouteConfig {
            prefix: "/data".to_string(),
            kind: RouteKind::Filesystem,
            root: Some(temp.path().to_path_buf()),
            dir: None,
        };
        assert_eq!(build_route(&fs_route).unwrap().name(), "filesystem");

        let missing_root = RouteConfig { root: None, ..fs_route };
        assert!(matches!(build_route(&missing_root), Err(MountletError::Config(_))));
    }

    #[test]
    fn test_remote_requires_settings() {
        let config = MountletConfig {
            sandbox: SandboxConfig {
                backend: BackendType::Remote,
                ..SandboxConfig::default()
            },
            ..MountletConfig::default()
        };
        let rt = tokio::runtime::Runtime::new().unwrap();
        assert!(rt.block_on(create_sandbox(&config)).is_err());
    }

    fn remote_config(server: &MockServer) -> MountletConfig {
        let mut config = MountletConfig::default();
        config.sandbox.backend = BackendType::Remote;
        config.sandbox.remote.base_url = Some(server.uri());
        config.sandbox.remote.sandbox_id = Some("sbx-1".to_string());
        config.sandbox.remote.api_key = Some("secret".to_string());
        config
    }

    #[tokio::test]
    async fn test_remote_is_health_checked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sbx-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "output": "ok\n",
                "exit_code": 0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = create_sandbox(&remote_config(&server)).await.unwrap();
        assert_eq!(backend.name(), "remote");
        assert!(backend.sandbox().is_some());
    }

    #[tokio::test]
    async fn test_unresponsive_remote_is_not_available() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sbx-1/exec"))
            .respond_with(ResponseTemplate::new(503).set_body_string("sandbox asleep"))
            .mount(&server)
            .await;

        let err = create_sandbox(&remote_config(&server)).await.err().unwrap();
        assert_eq!(err.code(), "backend_not_available");
        assert!(err.to_string().contains("remote"));
    }

    #[test]
    fn test_available_backends_lists_every_kind() {
        let names: Vec<&str> = available_backends().iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["local", "docker", "wasmer", "remote", "filesystem"]);
    }

    #[test]
    fn test_default_store_dir_per_prefix() {
        assert!(default_store_dir("/memories/").ends_with("store/memories"));
        assert!(default_store_dir("/").ends_with("store/root"));
    }
}
