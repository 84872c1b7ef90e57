//! Child-process execution with a deadline and an output budget.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::types::ExecuteResponse;
use crate::error::{MountletError, Result};

/// How long to wait for pipes to drain after a timed-out process is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 100_000,
        }
    }
}

/// Output ceiling for internal script ops. Their records must arrive whole,
/// so the user-facing `max_output_bytes` does not apply to them.
pub const SCRIPT_OUTPUT_BYTES: usize = 64 * 1024 * 1024;

impl ProcessLimits {
    /// Same deadline, with the output budget lifted to [`SCRIPT_OUTPUT_BYTES`].
    pub fn for_scripts(self) -> Self {
        Self {
            max_output_bytes: self.max_output_bytes.max(SCRIPT_OUTPUT_BYTES),
            ..self
        }
    }
}

pub fn timeout_sentinel(timeout: Duration) -> String {
    format!("[Command timed out after {} seconds]", timeout.as_secs())
}

fn spawn_reader<R>(mut pipe: R) -> (Arc<Mutex<Vec<u8>>>, tokio::task::JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buffer, handle)
}

fn take(buffer: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    buffer.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default()
}

/// Cut `output` to at most `max` bytes on a char boundary.
pub fn truncate_output(output: &mut String, max: usize) -> bool {
    if output.len() <= max {
        return false;
    }
    let mut cut = max;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    true
}

/// Combine stdout and stderr (stderr appended) into one response.
pub fn combine(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>, max: usize) -> ExecuteResponse {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&stderr);
    }
    let truncated = truncate_output(&mut output, max);
    ExecuteResponse {
        output,
        exit_code,
        truncated,
    }
}

#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>) {}

/// Run `cmd` to completion or until `limits.timeout`, feeding `stdin` if given.
///
/// On timeout the whole process group is killed and the partial output is
/// returned with a sentinel line and `exit_code: None`.
pub async fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: ProcessLimits,
) -> Result<ExecuteResponse> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| MountletError::SandboxExecution(format!("Failed to spawn process: {}", e)))?;
    let pid = child.id();

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            let _ = pipe.write_all(&bytes).await;
            let _ = pipe.shutdown().await;
        });
    }

    let (stdout, stdout_task) = match child.stdout.take() {
        Some(pipe) => {
            let (buf, task) = spawn_reader(pipe);
            (buf, Some(task))
        }
        None => (Arc::new(Mutex::new(Vec::new())), None),
    };
    let (stderr, stderr_task) = match child.stderr.take() {
        Some(pipe) => {
            let (buf, task) = spawn_reader(pipe);
            (buf, Some(task))
        }
        None => (Arc::new(Mutex::new(Vec::new())), None),
    };

    let exit_code = match tokio::time::timeout(limits.timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status.code().unwrap_or(-1)),
        Ok(Err(e)) => {
            return Err(MountletError::SandboxExecution(format!(
                "Failed to wait for process: {}",
                e
            )))
        }
        Err(_) => {
            warn!(pid = ?pid, timeout_secs = limits.timeout.as_secs(), "Command timed out, killing");
            kill_process_group(pid).await;
            let _ = child.kill().await;
            None
        }
    };

    for mut task in [stdout_task, stderr_task].into_iter().flatten() {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }

    let mut response = combine(&take(&stdout), &take(&stderr), exit_code, limits.max_output_bytes);
    if exit_code.is_none() {
        if !response.output.is_empty() && !response.output.ends_with('\n') {
            response.output.push('\n');
        }
        response.output.push_str(&timeout_sentinel(limits.timeout));
    }

    debug!(
        exit_code = ?response.exit_code,
        output_len = response.output.len(),
        truncated = response.truncated,
        "Process finished"
    );
    Ok(response)
}
