use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backend::types::{ExecuteResponse, FileDownloadResponse, FileUploadResponse};
use crate::config::types::{DockerConfig, SandboxConfig};
use crate::error::{FileOperationError, MountletError, Result};
use crate::sandbox::process::{run_with_timeout, ProcessLimits};
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime};

/// Default Docker image name for the sandbox
const DEFAULT_IMAGE: &str = "mountlet-sandbox:latest";

/// Path to the Dockerfile relative to the crate root
const DOCKERFILE_PATH: &str = "docker/Dockerfile.sandbox";

/// Writes stdin to `$1`, creating parent directories.
const UPLOAD_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

/// Streams `$1` to stdout; directories are refused with a recognisable message.
const DOWNLOAD_SCRIPT: &str =
    r#"if [ -d "$1" ]; then echo "$1: Is a directory" >&2; exit 1; fi; cat -- "$1""#;

/// Docker sandbox runtime.
///
/// One long-lived container per runtime, started detached with
/// `tail -f /dev/null`; every command and file transfer goes through
/// `docker exec`.
pub struct DockerRuntime {
    image: String,
    env: BTreeMap<String, String>,
    workdir: String,
    memory_limit_mb: u64,
    enable_networking: bool,
    limits: ProcessLimits,
    /// Container ID while running; `None` once shut down
    container_id: Mutex<Option<String>>,
    /// ID kept after shutdown so the runtime's identity never changes
    stable_id: String,
}

impl DockerRuntime {
    /// Start a session container for `config`.
    pub async fn new(config: &SandboxConfig) -> Result<Self> {
        if !Self::is_available() {
            return Err(MountletError::BackendNotAvailable {
                backend: "docker".to_string(),
                reason: "Docker daemon is not accessible. Ensure Docker is installed and running."
                    .to_string(),
            });
        }

        let DockerConfig {
            image,
            build_image,
            enable_networking,
            memory_limit_mb,
        } = config.docker.clone();
        let image = image.unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        if !Self::image_exists(&image).await {
            if build_image {
                Self::build_image(&image).await?;
            } else {
                return Err(MountletError::BackendNotAvailable {
                    backend: "docker".to_string(),
                    reason: format!(
                        "Docker image '{}' not found. Set build_image=true to auto-build, or build manually with: docker build -t {} -f {} .",
                        image, image, DOCKERFILE_PATH
                    ),
                });
            }
        }

        let mut runtime = Self {
            image,
            env: config.env.clone(),
            workdir: config.workdir.clone(),
            memory_limit_mb,
            enable_networking,
            limits: ProcessLimits {
                timeout: Duration::from_secs(config.timeout_seconds),
                max_output_bytes: config.max_output_bytes,
            },
            container_id: Mutex::new(None),
            stable_id: String::new(),
        };
        let container_id = runtime.start_container().await?;
        runtime.stable_id = container_id.chars().take(12).collect();
        *runtime
            .container_id
            .get_mut()
            .map_err(|e| MountletError::SandboxInit(format!("Failed to acquire lock: {}", e)))? =
            Some(container_id);

        info!(image = %runtime.image, id = %runtime.stable_id, "Docker runtime initialized");
        Ok(runtime)
    }

    async fn start_container(&self) -> Result<String> {
        info!("Starting Docker sandbox container...");

        let mut cmd = Command::new("docker");
        cmd.args(["run", "-d"]);
        if !self.enable_networking {
            cmd.arg("--network=none");
        }
        cmd.arg(format!("--memory={}m", self.memory_limit_mb));
        for (key, value) in &self.env {
            cmd.arg("-e");
            cmd.arg(format!("{}={}", key, value));
        }
        // the image may not ship the workdir
        cmd.args(["-w", "/"]);
        cmd.arg(&self.image);
        cmd.args(["tail", "-f", "/dev/null"]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            MountletError::SandboxInit(format!("Failed to start Docker container: {}", e))
        })?;
        if !output.status.success() {
            return Err(MountletError::SandboxInit(format!(
                "Failed to start Docker container: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let mkdir = Command::new("docker")
            .args(["exec", &container_id, "mkdir", "-p", &self.workdir])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        if let Ok(out) = mkdir {
            if !out.status.success() {
                warn!(workdir = %self.workdir, error = %String::from_utf8_lossy(&out.stderr), "Could not create workdir");
            }
        }

        info!(container_id = %container_id, "Docker sandbox container started");
        Ok(container_id)
    }

    /// Check if the Docker backend is available on this system.
    ///
    /// Returns true if Docker daemon is accessible.
    pub fn is_available() -> bool {
        match std::process::Command::new("docker")
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn image_exists(image: &str) -> bool {
        match Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn build_image(image: &str) -> Result<()> {
        info!(image = %image, "Building Docker sandbox image...");

        let dockerfile = Self::find_dockerfile()?.canonicalize().map_err(|e| {
            MountletError::SandboxInit(format!("Cannot resolve Dockerfile path: {}", e))
        })?;
        let context = dockerfile
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| MountletError::SandboxInit("Cannot determine build context".to_string()))?;

        let output = Command::new("docker")
            .arg("build")
            .args(["-t", image])
            .arg("-f")
            .arg(&dockerfile)
            .arg(".")
            .current_dir(context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| MountletError::SandboxInit(format!("Failed to run docker build: {}", e)))?;

        if !output.status.success() {
            return Err(MountletError::SandboxInit(format!(
                "Failed to build Docker image: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        info!(image = %image, "Docker sandbox image built successfully");
        Ok(())
    }

    fn find_dockerfile() -> Result<PathBuf> {
        let mut candidates = vec![PathBuf::from(DOCKERFILE_PATH)];
        if let Ok(exe_path) = std::env::current_exe() {
            candidates.extend(exe_path.ancestors().skip(1).take(6).map(|dir| dir.join(DOCKERFILE_PATH)));
        }
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            candidates.push(PathBuf::from(manifest_dir).join(DOCKERFILE_PATH));
        }

        candidates.into_iter().find(|p| p.exists()).ok_or_else(|| {
            MountletError::SandboxInit(format!(
                "Dockerfile not found at {}. Build the image manually with: docker build -t {} -f {} .",
                DOCKERFILE_PATH, DEFAULT_IMAGE, DOCKERFILE_PATH
            ))
        })
    }

    fn running_container(&self) -> Result<String> {
        self.container_id
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| MountletError::Closed {
                backend: "docker".to_string(),
            })
    }

    /// Run a helper script with one path argument, optionally feeding stdin.
    async fn exec_raw(
        &self,
        container_id: &str,
        script: &str,
        path: &str,
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args([container_id, "sh", "-c", script, "sh", path]);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            MountletError::SandboxExecution(format!("Failed to execute docker exec: {}", e))
        })?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }
        Ok(child.wait_with_output().await?)
    }
}

/// Arguments for `docker exec` running `command` under `sh -c`.
fn exec_args(
    container_id: &str,
    workdir: &str,
    env: &BTreeMap<String, String>,
    command: &str,
) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "-w".to_string(), workdir.to_string()];
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend([
        container_id.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]);
    args
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn id(&self) -> &str {
        &self.stable_id
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
        let container_id = self.running_container()?;
        debug!(container_id = %container_id, command_len = command.len(), "Executing via docker exec");

        let mut cmd = Command::new("docker");
        cmd.args(exec_args(&container_id, &self.workdir, &self.env, command));
        run_with_timeout(cmd, None, self.limits).await
    }

    async fn execute_script(&self, command: &str) -> Result<ExecuteResponse> {
        let container_id = self.running_container()?;
        let mut cmd = Command::new("docker");
        cmd.args(exec_args(&container_id, &self.workdir, &self.env, command));
        run_with_timeout(cmd, None, self.limits.for_scripts()).await
    }

    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        let container_id = self.running_container()?;
        let mut responses = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let output = self
                .exec_raw(&container_id, UPLOAD_SCRIPT, path, Some(bytes))
                .await?;
            responses.push(if output.status.success() {
                FileUploadResponse::ok(path)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                FileUploadResponse::err(path, FileOperationError::from_stderr(&stderr))
            });
        }
        Ok(responses)
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        let container_id = self.running_container()?;
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            let output = self.exec_raw(&container_id, DOWNLOAD_SCRIPT, path, None).await?;
            responses.push(if output.status.success() {
                FileDownloadResponse::ok(path, output.stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                FileDownloadResponse::err(path, FileOperationError::from_stderr(&stderr))
            });
        }
        Ok(responses)
    }

    fn info(&self) -> SandboxInfo {
        let container_id = self.container_id.lock().ok().and_then(|guard| guard.clone());
        SandboxInfo {
            backend_type: "docker".to_string(),
            running: container_id.is_some(),
            instance_id: container_id,
            metadata: HashMap::from([
                ("image".to_string(), self.image.clone()),
                ("workdir".to_string(), self.workdir.clone()),
                ("networking".to_string(), self.enable_networking.to_string()),
            ]),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let taken = self.container_id.lock().ok().and_then(|mut guard| guard.take());
        let Some(container_id) = taken else {
            return Ok(());
        };
        info!(container_id = %container_id, "Removing Docker sandbox container...");

        let output = Command::new("docker")
            .args(["rm", "-f", &container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                MountletError::SandboxExecution(format!("Failed to remove container: {}", e))
            })?;
        if !output.status.success() {
            warn!(
                container_id = %container_id,
                error = %String::from_utf8_lossy(&output.stderr),
                "Failed to remove container"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_args_keep_command_as_one_argument() {
        let env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        let args = exec_args("abc123", "/workspace", &env, "echo 'hi' && ls");
        assert_eq!(
            args,
            vec!["exec", "-w", "/workspace", "-e", "A=1", "abc123", "sh", "-c", "echo 'hi' && ls"]
        );
    }

    #[test]
    fn test_download_script_refuses_directories() {
        let stderr = "/workspace: Is a directory\n";
        assert!(DOWNLOAD_SCRIPT.contains("Is a directory"));
        assert_eq!(FileOperationError::from_stderr(stderr), FileOperationError::IsDirectory);
    }
}
