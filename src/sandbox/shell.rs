//! Interactive shell sessions on the WASM engine.

use std::sync::Arc;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::error::{MountletError, Result};
use crate::sandbox::backends::wasmer::{RunDir, WasmInner};
use crate::sandbox::sync::SyncReport;

/// How a shell session ended.
#[derive(Debug, Clone)]
pub struct ShellExit {
    /// `None` when the session was killed
    pub exit_code: Option<i32>,
    pub sync: Vec<SyncReport>,
}

/// A live shell inside one VM run.
///
/// The sandbox is reserved for the session until [`wait`](Self::wait)
/// returns. Dropping the session without waiting kills the VM and skips
/// sync-back.
pub struct ShellSession {
    child: Child,
    run: Option<RunDir>,
    sandbox: Arc<WasmInner>,
    killed: bool,
    _guard: OwnedMutexGuard<()>,
}

impl ShellSession {
    pub(crate) fn new(
        child: Child,
        run: RunDir,
        sandbox: Arc<WasmInner>,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            child,
            run: Some(run),
            sandbox,
            killed: false,
            _guard: guard,
        }
    }

    /// Writable end of the shell's stdin; take it to write and drop it to
    /// send EOF.
    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Kill the VM. Calling it again, or after exit, does nothing.
    pub async fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;
        if let Err(e) = self.child.start_kill() {
            // already exited
            debug!(error = %e, "Shell already gone");
        }
        Ok(())
    }

    /// Wait for the shell to exit, then sync mounts back and collect spawn
    /// requests.
    pub async fn wait(mut self) -> Result<ShellExit> {
        drop(self.child.stdin.take());
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| MountletError::SandboxExecution(format!("Failed to wait for shell: {}", e)))?;
        let exit_code = if self.killed { None } else { status.code() };
        info!(exit_code = ?exit_code, "Shell session ended");

        let sync = match self.run.take() {
            Some(run) => self.sandbox.finish_run(run).await?,
            None => Vec::new(),
        };
        Ok(ShellExit { exit_code, sync })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::protocol::Backend;
    use crate::backend::store::StoreBackend;
    use crate::config::types::SandboxConfig;
    use crate::sandbox::backends::wasmer::{WasmEngine, WasmSandbox};
    use crate::sandbox::mount::{Mount, MountTable};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fake_engine(dir: &TempDir) -> WasmEngine {
        use std::os::unix::fs::PermissionsExt;
        // ignores guest mappings except the first mount; enough for a shell
        let script = "#!/bin/sh\nwhile [ $# -gt 0 ]; do case \"$1\" in --mapdir) [ -n \"${d:-}\" ] || d=${2#*:}; shift 2 ;; --) shift; break ;; *) shift ;; esac; done\ncd \"$d\" && exec sh \"$@\"\n";
        let fake = dir.path().join("wasmer");
        std::fs::write(&fake, script).unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        WasmEngine {
            wasmer_binary: fake,
            package: dir.path().join("bash.webc"),
        }
    }

    async fn sandbox_with_store() -> (TempDir, Arc<StoreBackend>, WasmSandbox) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StoreBackend::in_memory());
        store.write("/seed.txt", "seed").await;
        let mounts = MountTable::new(vec![Mount::new("/work", store.clone()).unwrap()]).unwrap();
        let sandbox = WasmSandbox::new(&SandboxConfig::default(), mounts);
        sandbox.initialize_with(fake_engine(&dir)).await.unwrap();
        (dir, store, sandbox)
    }

    #[tokio::test]
    async fn test_wait_syncs_back() {
        let (_dir, store, sandbox) = sandbox_with_store().await;
        let mut session = sandbox.shell().await.unwrap();

        let mut stdin = session.stdin().unwrap();
        stdin.write_all(b"cat seed.txt\nprintf made > new.txt\n").await.unwrap();
        drop(stdin);
        let mut stdout = session.stdout().unwrap();
        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();

        let exit = session.wait().await.unwrap();
        assert_eq!(output, "seed");
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(exit.sync[0].uploaded, 1);
        assert!(store.read("/new.txt", 0, 1).await.contains("made"));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (_dir, _store, sandbox) = sandbox_with_store().await;
        let mut session = sandbox.shell().await.unwrap();
        session.kill().await.unwrap();
        session.kill().await.unwrap();
        let exit = session.wait().await.unwrap();
        assert_eq!(exit.exit_code, None);
    }
}
