use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::path;
use crate::backend::types::{ExecuteResponse, FileDownloadResponse, FileUploadResponse};
use crate::config::loader::get_cache_dir;
use crate::config::types::{SandboxConfig, WasmerConfig};
use crate::error::{FileOperationError, MountletError, Result};
use crate::sandbox::generate_sandbox_id;
use crate::sandbox::mount::{Mount, MountTable, BIN_MOUNT, RPC_MOUNT};
use crate::sandbox::process::{run_with_timeout, ProcessLimits};
use crate::sandbox::rpc::{RpcSpool, SpawnRequest, RPC_DIR_ENV, SUBAGENT_SCRIPT};
use crate::sandbox::shell::ShellSession;
use crate::sandbox::sync::{mount_dir_name, read_tree, write_tree, PopulatedMount, SyncReport};
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime};

/// Wasmer version to download if not installed
const WASMER_VERSION: &str = "v6.0.0";

/// Wasmer registry WEBC download URL for bash
const WASMER_BASH_WEBC_URL: &str =
    "https://cdn.wasmer.io/webcimages/6616eee914dd95cb9751a0ef1d17a908055176781bc0b6090e33da5bbc325417.webc";

const GUEST_PATH: &str = "/.bin:/usr/local/bin:/usr/bin:/bin";

const WORKDIR_ENV: &str = "MOUNTLET_WORKDIR";

/// Get the Wasmer binary download URL for the current platform.
fn get_wasmer_download_url() -> Result<String> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "windows",
        other => return Err(MountletError::EngineUnavailable(format!("Unsupported OS: {}", other))),
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => {
            return Err(MountletError::EngineUnavailable(format!(
                "Unsupported architecture: {}",
                other
            )))
        }
    };

    Ok(format!(
        "https://github.com/wasmerio/wasmer/releases/download/{}/wasmer-{}-{}.tar.gz",
        WASMER_VERSION, os, arch
    ))
}

/// Paths of a usable engine: the `wasmer` CLI and the shell package it runs.
#[derive(Debug, Clone)]
pub struct WasmEngine {
    pub wasmer_binary: PathBuf,
    pub package: PathBuf,
}

impl WasmEngine {
    /// Locate or download the CLI and the package named by `config`.
    pub async fn resolve(config: &WasmerConfig) -> Result<Self> {
        let wasmer_binary = get_or_download_wasmer().await?;
        let package = match &config.wasm_binary {
            Some(path) if !path.exists() => {
                return Err(MountletError::WasmNotFound {
                    path: path.display().to_string(),
                })
            }
            Some(path) => path.clone(),
            None => get_or_download_webc().await?,
        };
        info!(webc = %package.display(), "Using WEBC package");
        Ok(Self {
            wasmer_binary,
            package,
        })
    }

    /// `wasmer run` arguments up to and including `--`.
    fn run_args(
        &self,
        mapdirs: &[(String, PathBuf)],
        env: &BTreeMap<String, String>,
        packages: &[String],
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["run".into()];
        for (key, value) in env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value).into());
        }
        for (guest, host) in mapdirs {
            args.push("--mapdir".into());
            let mut spec = OsString::from(format!("{}:", guest));
            spec.push(host.as_os_str());
            args.push(spec);
        }
        for package in packages {
            args.push("--use".into());
            args.push(package.into());
        }
        args.push(self.package.as_os_str().to_owned());
        args.push("--".into());
        args
    }
}

enum EngineState {
    Uninitialized,
    Ready(WasmEngine),
    Closed,
}

/// Host-side state of one VM run: the scratch directory and what was
/// materialized into it.
pub(crate) struct RunDir {
    _scratch: TempDir,
    mapdirs: Vec<(String, PathBuf)>,
    populated: Vec<PopulatedMount>,
    legacy_dir: Option<PathBuf>,
    spool: RpcSpool,
}

/// Shared state of a [`WasmSandbox`], also held by live shell sessions.
pub(crate) struct WasmInner {
    id: String,
    config: WasmerConfig,
    workdir: String,
    env: BTreeMap<String, String>,
    limits: ProcessLimits,
    mounts: MountTable,
    /// Working-directory contents when no mounts are attached
    legacy: Mutex<BTreeMap<String, Vec<u8>>>,
    state: RwLock<EngineState>,
    /// One run at a time per sandbox
    run_lock: Arc<Mutex<()>>,
    pending: Mutex<Vec<SpawnRequest>>,
    last_sync: Mutex<Vec<SyncReport>>,
}

/// Sandbox backed by an ephemeral Wasmer VM per command.
///
/// Each run materializes the attached mounts into a scratch directory, maps
/// them into the VM, and syncs changes back afterwards. Spawn requests the
/// VM leaves in the RPC spool are queued for [`drain_spawn_requests`].
///
/// [`drain_spawn_requests`]: WasmSandbox::drain_spawn_requests
pub struct WasmSandbox {
    inner: Arc<WasmInner>,
}

impl WasmSandbox {
    /// Create an uninitialized sandbox; call [`initialize`](Self::initialize)
    /// before running anything.
    pub fn new(config: &SandboxConfig, mounts: MountTable) -> Self {
        Self {
            inner: Arc::new(WasmInner {
                id: generate_sandbox_id("wasm"),
                config: config.wasmer.clone(),
                workdir: path::normalize(&config.workdir).unwrap_or_else(|_| "/workspace".to_string()),
                env: config.env.clone(),
                limits: ProcessLimits {
                    timeout: Duration::from_secs(config.timeout_seconds),
                    max_output_bytes: config.max_output_bytes,
                },
                mounts,
                legacy: Mutex::new(BTreeMap::new()),
                state: RwLock::new(EngineState::Uninitialized),
                run_lock: Arc::new(Mutex::new(())),
                pending: Mutex::new(Vec::new()),
                last_sync: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Check if the Wasmer backend is available on this system.
    ///
    /// Returns true since wasmer can be auto-downloaded at runtime.
    pub fn is_available() -> bool {
        true
    }

    /// Locate (downloading if needed) the engine.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_uninitialized().await?;
        let engine = WasmEngine::resolve(&self.inner.config).await?;
        self.initialize_with(engine).await
    }

    /// Initialize with an already located engine.
    pub async fn initialize_with(&self, engine: WasmEngine) -> Result<()> {
        let mut state = self.inner.state.write().await;
        match *state {
            EngineState::Uninitialized => {
                info!(id = %self.inner.id, binary = %engine.wasmer_binary.display(), "WASM sandbox initialized");
                *state = EngineState::Ready(engine);
                Ok(())
            }
            EngineState::Ready(_) => Err(MountletError::AlreadyInitialized {
                backend: "wasmer".to_string(),
            }),
            EngineState::Closed => Err(MountletError::Closed {
                backend: "wasmer".to_string(),
            }),
        }
    }

    async fn ensure_uninitialized(&self) -> Result<()> {
        match *self.inner.state.read().await {
            EngineState::Uninitialized => Ok(()),
            EngineState::Ready(_) => Err(MountletError::AlreadyInitialized {
                backend: "wasmer".to_string(),
            }),
            EngineState::Closed => Err(MountletError::Closed {
                backend: "wasmer".to_string(),
            }),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(*self.inner.state.read().await, EngineState::Ready(_))
    }

    /// Release the engine. Idempotent, and fine before initialization.
    pub async fn close(&self) {
        let mut state = self.inner.state.write().await;
        if !matches!(*state, EngineState::Closed) {
            debug!(id = %self.inner.id, "Closing WASM sandbox");
        }
        *state = EngineState::Closed;
    }

    /// Spawn requests collected from finished runs, oldest first.
    pub async fn drain_spawn_requests(&self) -> Vec<SpawnRequest> {
        std::mem::take(&mut *self.inner.pending.lock().await)
    }

    /// Sync reports of the most recent run.
    pub async fn last_sync_reports(&self) -> Vec<SyncReport> {
        self.inner.last_sync.lock().await.clone()
    }

    pub fn mounts(&self) -> &MountTable {
        &self.inner.mounts
    }

    /// Start an interactive shell in a fresh VM run.
    pub async fn shell(&self) -> Result<ShellSession> {
        let guard = self.inner.run_lock.clone().lock_owned().await;
        let engine = self.inner.engine().await?;
        let run = self.inner.prepare_run().await?;

        let mut cmd = Command::new(&engine.wasmer_binary);
        cmd.args(engine.run_args(&run.mapdirs, &self.inner.guest_env(), &self.inner.config.packages));
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| MountletError::SandboxExecution(format!("Failed to start wasmer: {}", e)))?;
        info!(id = %self.inner.id, "Interactive shell started");
        Ok(ShellSession::new(child, run, self.inner.clone(), guard))
    }

    async fn run_command(&self, command: &str, limits: ProcessLimits) -> Result<ExecuteResponse> {
        let _guard = self.inner.run_lock.lock().await;
        let engine = self.inner.engine().await?;
        debug!(id = %self.inner.id, command_len = command.len(), "Executing in WASM sandbox");

        let run = self.inner.prepare_run().await?;
        let mut cmd = Command::new(&engine.wasmer_binary);
        cmd.args(engine.run_args(&run.mapdirs, &self.inner.guest_env(), &self.inner.config.packages));
        cmd.arg("-c");
        cmd.arg(format!("cd \"${}\" 2>/dev/null; {}", WORKDIR_ENV, command));

        let outcome = run_with_timeout(cmd, None, limits).await;
        // sync back even after a timeout or a failed spawn
        let synced = self.inner.finish_run(run).await;
        let response = outcome?;
        synced?;
        Ok(response)
    }
}

impl WasmInner {
    async fn engine(&self) -> Result<WasmEngine> {
        match &*self.state.read().await {
            EngineState::Ready(engine) => Ok(engine.clone()),
            EngineState::Uninitialized => Err(MountletError::NotInitialized {
                backend: "wasmer".to_string(),
            }),
            EngineState::Closed => Err(MountletError::Closed {
                backend: "wasmer".to_string(),
            }),
        }
    }

    fn guest_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("PATH".to_string(), GUEST_PATH.to_string());
        env.insert(RPC_DIR_ENV.to_string(), format!("{}/requests", RPC_MOUNT));
        env.insert(WORKDIR_ENV.to_string(), self.workdir.clone());
        env
    }

    async fn install_helper(&self, bin_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(bin_dir).await?;
        let target = bin_dir.join("subagent");
        match &self.config.subagent_wasm {
            Some(wasm) => {
                tokio::fs::copy(wasm, &target).await?;
            }
            None => tokio::fs::write(&target, SUBAGENT_SCRIPT).await?,
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(())
    }

    /// Materialize mounts, the helper and the spool into a scratch directory.
    pub(crate) async fn prepare_run(&self) -> Result<RunDir> {
        let scratch = tempfile::Builder::new().prefix("mountlet-run-").tempdir()?;
        let root = scratch.path().to_path_buf();
        let mut mapdirs = Vec::new();
        let mut populated = Vec::new();
        let mut legacy_dir = None;

        if self.mounts.is_empty() {
            let dir = root.join("legacy");
            write_tree(&dir, &*self.legacy.lock().await).await?;
            mapdirs.push((self.workdir.clone(), dir.clone()));
            legacy_dir = Some(dir);
        } else {
            for mount in self.mounts.iter() {
                let dir = root.join("mounts").join(mount_dir_name(mount.prefix()));
                let ready = mount.clone().populate(&dir).await?;
                mapdirs.push((mount.prefix().to_string(), dir));
                populated.push(ready);
            }
        }

        let bin_dir = root.join("bin");
        self.install_helper(&bin_dir).await?;
        mapdirs.push((BIN_MOUNT.to_string(), bin_dir));

        let spool = RpcSpool::new(root.join("rpc"));
        spool.ensure().await?;
        mapdirs.push((RPC_MOUNT.to_string(), spool.root().to_path_buf()));

        debug!(id = %self.id, mounts = populated.len(), legacy = legacy_dir.is_some(), "Run prepared");
        Ok(RunDir {
            _scratch: scratch,
            mapdirs,
            populated,
            legacy_dir,
            spool,
        })
    }

    /// Sync back every mount, then queue spawn requests. Runs whatever the
    /// command's outcome was.
    pub(crate) async fn finish_run(&self, run: RunDir) -> Result<Vec<SyncReport>> {
        let mut reports = Vec::new();
        let mut first_error = None;

        for mount in run.populated {
            match mount.reconcile().await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(error = %e, "Mount reconcile failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(dir) = &run.legacy_dir {
            match read_tree(dir).await {
                Ok(tree) => *self.legacy.lock().await = tree,
                Err(e) => {
                    warn!(error = %e, "Reading back the working directory failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match run.spool.collect().await {
            Ok(requests) => {
                let mut pending = self.pending.lock().await;
                for request in requests {
                    if pending.iter().all(|p| p.id != request.id) {
                        info!(id = %request.id, "Spawn request received");
                        pending.push(request);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Collecting spawn requests failed");
                first_error.get_or_insert(e);
            }
        }

        *self.last_sync.lock().await = reports.clone();
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Key of `guest_path` in the legacy tree; `None` outside the workdir.
    fn legacy_key(&self, guest_path: &str) -> Option<String> {
        let prefix = format!("{}/", self.workdir.trim_end_matches('/'));
        path::is_under(guest_path, &prefix).then(|| path::strip_prefix(guest_path, &prefix))
    }
}

/// Where one transfer item goes.
enum Destination {
    Mount(Mount, String),
    Legacy(String),
    Refused(FileOperationError),
}

impl WasmInner {
    fn destination(&self, guest_path: &str) -> Destination {
        let Ok(normalized) = path::normalize(guest_path) else {
            return Destination::Refused(FileOperationError::InvalidPath);
        };
        if self.mounts.is_empty() {
            return match self.legacy_key(&normalized) {
                Some(key) if key == "/" => Destination::Refused(FileOperationError::IsDirectory),
                Some(key) => Destination::Legacy(key),
                None => Destination::Refused(FileOperationError::PermissionDenied),
            };
        }
        match self.mounts.resolve(&normalized) {
            Some(mount) => {
                let inner = mount.backend_path(&normalized);
                if inner == "/" {
                    Destination::Refused(FileOperationError::IsDirectory)
                } else {
                    Destination::Mount(mount.clone(), inner)
                }
            }
            None => Destination::Refused(FileOperationError::PermissionDenied),
        }
    }
}

#[async_trait]
impl SandboxRuntime for WasmSandbox {
    fn name(&self) -> &str {
        "wasmer"
    }

    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
        self.run_command(command, self.inner.limits).await
    }

    async fn execute_script(&self, command: &str) -> Result<ExecuteResponse> {
        self.run_command(command, self.inner.limits.for_scripts()).await
    }

    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        if matches!(*self.inner.state.read().await, EngineState::Closed) {
            return Err(MountletError::Closed {
                backend: "wasmer".to_string(),
            });
        }

        let mut responses: Vec<Option<FileUploadResponse>> = vec![None; files.len()];
        let mut batches: BTreeMap<String, (Mount, Vec<(usize, String, Vec<u8>)>)> = BTreeMap::new();
        for (index, (guest_path, bytes)) in files.iter().enumerate() {
            match self.inner.destination(guest_path) {
                Destination::Mount(mount, inner) => {
                    batches
                        .entry(mount.prefix().to_string())
                        .or_insert_with(|| (mount.clone(), Vec::new()))
                        .1
                        .push((index, inner, bytes.clone()));
                }
                Destination::Legacy(key) => {
                    self.inner.legacy.lock().await.insert(key, bytes.clone());
                    responses[index] = Some(FileUploadResponse::ok(guest_path));
                }
                Destination::Refused(error) => {
                    responses[index] = Some(FileUploadResponse::err(guest_path, error));
                }
            }
        }

        for (mount, items) in batches.into_values() {
            let transfer = mount.backend().file_transfer().filter(|t| t.supports_upload());
            let Some(transfer) = transfer else {
                for (index, _, _) in items {
                    responses[index] = Some(FileUploadResponse::err(
                        &files[index].0,
                        FileOperationError::PermissionDenied,
                    ));
                }
                continue;
            };
            let batch: Vec<(String, Vec<u8>)> =
                items.iter().map(|(_, inner, bytes)| (inner.clone(), bytes.clone())).collect();
            let results = match transfer.upload_files(&batch).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(mount = %mount.prefix(), error = %e, "Mount upload failed");
                    for (index, _, _) in items {
                        responses[index] = Some(FileUploadResponse::err(
                            &files[index].0,
                            FileOperationError::PermissionDenied,
                        ));
                    }
                    continue;
                }
            };
            for ((index, _, _), result) in items.into_iter().zip(results) {
                responses[index] = Some(FileUploadResponse {
                    path: files[index].0.clone(),
                    error: result.error,
                });
            }
        }

        Ok(responses
            .into_iter()
            .zip(files)
            .map(|(slot, (guest_path, _))| {
                slot.unwrap_or_else(|| FileUploadResponse::err(guest_path, FileOperationError::PermissionDenied))
            })
            .collect())
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        if matches!(*self.inner.state.read().await, EngineState::Closed) {
            return Err(MountletError::Closed {
                backend: "wasmer".to_string(),
            });
        }

        let mut responses: Vec<Option<FileDownloadResponse>> = vec![None; paths.len()];
        let mut batches: BTreeMap<String, (Mount, Vec<(usize, String)>)> = BTreeMap::new();
        for (index, guest_path) in paths.iter().enumerate() {
            match self.inner.destination(guest_path) {
                Destination::Mount(mount, inner) => {
                    batches
                        .entry(mount.prefix().to_string())
                        .or_insert_with(|| (mount.clone(), Vec::new()))
                        .1
                        .push((index, inner));
                }
                Destination::Legacy(key) => {
                    let tree = self.inner.legacy.lock().await;
                    let dir_prefix = format!("{}/", key);
                    responses[index] = Some(match tree.get(&key) {
                        Some(bytes) => FileDownloadResponse::ok(guest_path, bytes.clone()),
                        None if tree.keys().any(|k| k.starts_with(&dir_prefix)) => {
                            FileDownloadResponse::err(guest_path, FileOperationError::IsDirectory)
                        }
                        None => FileDownloadResponse::err(guest_path, FileOperationError::FileNotFound),
                    });
                }
                Destination::Refused(error) => {
                    responses[index] = Some(FileDownloadResponse::err(guest_path, error));
                }
            }
        }

        for (mount, items) in batches.into_values() {
            let transfer = mount.backend().file_transfer().filter(|t| t.supports_download());
            let Some(transfer) = transfer else {
                for (index, _) in items {
                    responses[index] = Some(FileDownloadResponse::err(
                        &paths[index],
                        FileOperationError::PermissionDenied,
                    ));
                }
                continue;
            };
            let batch: Vec<String> = items.iter().map(|(_, inner)| inner.clone()).collect();
            let results = match transfer.download_files(&batch).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(mount = %mount.prefix(), error = %e, "Mount download failed");
                    for (index, _) in items {
                        responses[index] = Some(FileDownloadResponse::err(
                            &paths[index],
                            FileOperationError::PermissionDenied,
                        ));
                    }
                    continue;
                }
            };
            for ((index, _), result) in items.into_iter().zip(results) {
                responses[index] = Some(FileDownloadResponse {
                    path: paths[index].clone(),
                    content: result.content,
                    error: result.error,
                });
            }
        }

        Ok(responses
            .into_iter()
            .zip(paths)
            .map(|(slot, guest_path)| {
                slot.unwrap_or_else(|| FileDownloadResponse::err(guest_path, FileOperationError::FileNotFound))
            })
            .collect())
    }

    fn info(&self) -> SandboxInfo {
        let running = self
            .inner
            .state
            .try_read()
            .map(|state| matches!(*state, EngineState::Ready(_)))
            .unwrap_or(true);
        let mounts: Vec<&str> = self.inner.mounts.iter().map(|m| m.prefix()).collect();
        SandboxInfo {
            backend_type: "wasmer".to_string(),
            instance_id: Some(self.inner.id.clone()),
            running,
            metadata: HashMap::from([
                ("workdir".to_string(), self.inner.workdir.clone()),
                (
                    "mode".to_string(),
                    if mounts.is_empty() { "legacy" } else { "mounts" }.to_string(),
                ),
                ("mounts".to_string(), mounts.join(",")),
            ]),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.close().await;
        Ok(())
    }
}

async fn fetch(url: &str, what: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| MountletError::SandboxInit(format!("Failed to create HTTP client: {}", e)))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| MountletError::SandboxInit(format!("Failed to download {}: {}", what, e)))?;
    if !response.status().is_success() {
        return Err(MountletError::SandboxInit(format!(
            "Failed to download {}: HTTP {}",
            what,
            response.status()
        )));
    }
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| MountletError::SandboxInit(format!("Failed to read {}: {}", what, e)))
}

/// Run `binary --version`, returning the version line when it works.
fn probe_wasmer(binary: &Path) -> Option<String> {
    let output = std::process::Command::new(binary).arg("--version").output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Get or download the Wasmer binary.
///
/// Checks in order:
/// 1. System PATH
/// 2. Cached download
/// 3. Downloads from GitHub releases
async fn get_or_download_wasmer() -> Result<PathBuf> {
    if let Some(version) = probe_wasmer(Path::new("wasmer")) {
        info!(version = %version, "Using system wasmer");
        return Ok(PathBuf::from("wasmer"));
    }

    let cache_dir = get_cache_dir().join("wasmer");
    let binary_name = if cfg!(windows) { "wasmer.exe" } else { "wasmer" };
    let binary_path = cache_dir.join(binary_name);

    if binary_path.exists() {
        if let Some(version) = probe_wasmer(&binary_path) {
            info!(version = %version, path = %binary_path.display(), "Using cached wasmer");
            return Ok(binary_path);
        }
    }

    let url = get_wasmer_download_url()?;
    info!(url = %url, "Downloading Wasmer {}...", WASMER_VERSION);
    tokio::fs::create_dir_all(&cache_dir).await?;
    let archive_bytes = fetch(&url, "Wasmer").await?;

    info!("Extracting Wasmer...");
    let temp_extract = cache_dir.join("extract_temp");
    tokio::fs::create_dir_all(&temp_extract).await?;
    let tar = flate2::read::GzDecoder::new(std::io::Cursor::new(archive_bytes));
    tar::Archive::new(tar)
        .unpack(&temp_extract)
        .map_err(|e| MountletError::SandboxInit(format!("Failed to extract Wasmer: {}", e)))?;

    let extracted = [
        temp_extract.join("bin").join(binary_name),
        temp_extract.join(binary_name),
    ]
    .into_iter()
    .find(|candidate| candidate.exists())
    .ok_or_else(|| MountletError::SandboxInit("Could not find wasmer binary in archive".to_string()))?;
    tokio::fs::rename(&extracted, &binary_path).await?;
    let _ = tokio::fs::remove_dir_all(&temp_extract).await;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&binary_path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    let version = probe_wasmer(&binary_path).ok_or_else(|| {
        MountletError::EngineUnavailable("Downloaded Wasmer binary not working".to_string())
    })?;
    info!(version = %version, path = %binary_path.display(), "Wasmer ready");
    Ok(binary_path)
}

/// Get the cached WEBC package or download it from wasmer registry
async fn get_or_download_webc() -> Result<PathBuf> {
    let cache_dir = get_cache_dir();
    let webc_path = cache_dir.join("bash.webc");
    if webc_path.exists() {
        info!(path = %webc_path.display(), "Using cached WEBC package");
        return Ok(webc_path);
    }

    info!("Downloading bash WEBC from wasmer registry...");
    tokio::fs::create_dir_all(&cache_dir).await?;
    let webc_bytes = fetch(WASMER_BASH_WEBC_URL, "WEBC").await?;
    if webc_bytes.len() < 8 || &webc_bytes[0..4] != b"\0web" {
        warn!("Downloaded file might not be a valid WEBC (unexpected header)");
    }

    tokio::fs::write(&webc_path, &webc_bytes).await?;
    info!(path = %webc_path.display(), size = webc_bytes.len(), "Cached WEBC package");
    Ok(webc_path)
}
