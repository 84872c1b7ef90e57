use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use crate::backend::types::{ExecuteResponse, FileDownloadResponse, FileUploadResponse};
use crate::config::types::SandboxConfig;
use crate::error::{FileOperationError, Result};
use crate::sandbox::generate_sandbox_id;
use crate::sandbox::process::{run_with_timeout, ProcessLimits};
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime};

/// Runs commands with the host's `sh`, working directory set to `root`.
///
/// No isolation: file paths are host paths and commands see the host.
pub struct LocalShellRuntime {
    id: String,
    root: PathBuf,
    env: BTreeMap<String, String>,
    limits: ProcessLimits,
}

impl LocalShellRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            id: generate_sandbox_id("local"),
            root: root.into(),
            env: BTreeMap::new(),
            limits: ProcessLimits::default(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let root = match &config.local.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        Ok(Self::new(root)
            .with_env(config.env.clone())
            .with_limits(ProcessLimits {
                timeout: Duration::from_secs(config.timeout_seconds),
                max_output_bytes: config.max_output_bytes,
            }))
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_limits(mut self, limits: ProcessLimits) -> Self {
        self.limits = limits;
        self
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&self.root);
        cmd.envs(&self.env);
        cmd
    }

    /// Check if a POSIX shell is available on this system.
    pub fn is_available() -> bool {
        std::process::Command::new("sh")
            .args(["-c", "true"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SandboxRuntime for LocalShellRuntime {
    fn name(&self) -> &str {
        "local"
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
        debug!(command_len = command.len(), root = %self.root.display(), "Executing local command");
        run_with_timeout(self.shell(command), None, self.limits).await
    }

    async fn execute_script(&self, command: &str) -> Result<ExecuteResponse> {
        run_with_timeout(self.shell(command), None, self.limits.for_scripts()).await
    }

    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        let mut responses = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let target = PathBuf::from(path);
            if let Some(parent) = target.parent() {
                if let Err(e) = fs::create_dir_all(parent).await {
                    responses.push(FileUploadResponse::err(path, (&e).into()));
                    continue;
                }
            }
            match fs::write(&target, bytes).await {
                Ok(()) => responses.push(FileUploadResponse::ok(path)),
                Err(e) => responses.push(FileUploadResponse::err(path, (&e).into())),
            }
        }
        Ok(responses)
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            let response = match fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => {
                    FileDownloadResponse::err(path, FileOperationError::IsDirectory)
                }
                _ => match fs::read(path).await {
                    Ok(bytes) => FileDownloadResponse::ok(path, bytes),
                    Err(e) => FileDownloadResponse::err(path, (&e).into()),
                },
            };
            responses.push(response);
        }
        Ok(responses)
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "local".to_string(),
            instance_id: Some(self.id.clone()),
            running: true,
            metadata: HashMap::from([
                ("root".to_string(), self.root.display().to_string()),
                (
                    "timeout_seconds".to_string(),
                    self.limits.timeout.as_secs().to_string(),
                ),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::composite::CompositeBackend;
    use crate::backend::protocol::{is_sandbox_backend, Backend, FileTransfer, SandboxBackend};
    use crate::backend::store::StoreBackend;
    use crate::sandbox::base::BaseSandbox;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: String,
        sandbox: BaseSandbox<LocalShellRuntime>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_string_lossy().into_owned();
            let sandbox = BaseSandbox::new(LocalShellRuntime::new(temp.path()));
            Self {
                _temp: temp,
                root,
                sandbox,
            }
        }

        fn p(&self, rel: &str) -> String {
            format!("{}/{}", self.root, rel.trim_start_matches('/'))
        }
    }

    #[tokio::test]
    async fn test_execute_runs_in_root() {
        let fx = Fixture::new();
        let response = fx.sandbox.execute("pwd; echo oops >&2; exit 4").await.unwrap();
        assert!(response.output.contains(fx.root.as_str()) || response.output.contains("tmp"));
        assert!(response.output.ends_with("oops\n"));
        assert_eq!(response.exit_code, Some(4));
        assert!(is_sandbox_backend(&fx.sandbox));
    }

    #[tokio::test]
    async fn test_write_then_ls_immediate_children() {
        let fx = Fixture::new();
        assert!(fx.sandbox.write(&fx.p("a.txt"), "a").await.is_ok());
        assert!(fx.sandbox.write(&fx.p("sub/b.txt"), "b").await.is_ok());
        assert!(fx.sandbox.write(&fx.p("sub/deep/c.txt"), "c").await.is_ok());

        let entries = fx.sandbox.ls_info(&fx.root).await;
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec![fx.p("a.txt"), fx.p("sub/")]);
        assert_eq!(entries[0].size, Some(1));

        assert!(fx.sandbox.ls_info(&fx.p("missing")).await.is_empty());
    }

    #[tokio::test]
    async fn test_write_refuses_existing_file() {
        let fx = Fixture::new();
        fx.sandbox.write(&fx.p("once.txt"), "1").await;
        let again = fx.sandbox.write(&fx.p("once.txt"), "2").await;
        assert!(again.error.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn test_read_windows() {
        let fx = Fixture::new();
        let body: Vec<String> = (1..=100).map(|i| format!("Row_{}_content", i)).collect();
        fx.sandbox.write(&fx.p("rows.txt"), &body.join("\n")).await;

        let first = fx.sandbox.read(&fx.p("rows.txt"), 0, 5).await;
        for i in 1..=5 {
            assert!(first.contains(&format!("Row_{}_content", i)));
        }
        assert!(!first.contains("Row_6_content"));

        let tail = fx.sandbox.read(&fx.p("rows.txt"), 98, 10).await;
        assert_eq!(tail.lines().count(), 2);
        assert!(tail.starts_with("    99\tRow_99_content"));

        assert_eq!(fx.sandbox.read(&fx.p("rows.txt"), 100, 5).await, "");
        let missing = fx.p("nope.txt");
        assert_eq!(
            fx.sandbox.read(&missing, 0, 5).await,
            format!("Error: File '{}' not found", missing)
        );
    }

    fn long_lines(count: usize, width: usize) -> String {
        (1..=count)
            .map(|i| format!("L{:04}:{}", i, "x".repeat(width)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn test_read_window_larger_than_output_budget() {
        let fx = Fixture::new();
        let path = fx.p("wide.txt");
        fx.sandbox.write(&path, &long_lines(500, 200)).await;

        let window = fx.sandbox.read(&path, 0, 500).await;
        assert_eq!(window.lines().count(), 500);
        assert!(window.starts_with("     1\tL0001:"));
        assert!(window.contains("   500\tL0500:"));
    }

    #[tokio::test]
    async fn test_grep_beyond_output_budget() {
        let fx = Fixture::new();
        let body = vec!["needle ".repeat(40); 600].join("\n");
        fx.sandbox.write(&fx.p("hay/many.txt"), &body).await;

        let hits = fx.sandbox.grep_raw("needle", &fx.root, None).await.unwrap();
        assert_eq!(hits.len(), 600);
        assert_eq!(hits[599].line, 600);
    }

    /// A runtime that cannot lift its output budget for script ops.
    struct Budgeted(LocalShellRuntime);

    #[async_trait]
    impl SandboxRuntime for Budgeted {
        fn name(&self) -> &str {
            "budgeted"
        }

        fn id(&self) -> &str {
            self.0.id()
        }

        async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
            self.0.execute(command).await
        }

        async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
            self.0.upload_files(files).await
        }

        async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
            self.0.download_files(paths).await
        }

        fn info(&self) -> SandboxInfo {
            self.0.info()
        }
    }

    #[tokio::test]
    async fn test_truncated_script_output_is_flagged() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_string_lossy().into_owned();
        let sandbox = BaseSandbox::new(Budgeted(LocalShellRuntime::new(temp.path()).with_limits(
            ProcessLimits {
                timeout: Duration::from_secs(30),
                max_output_bytes: 20_000,
            },
        )));
        let path = format!("{}/wide.txt", root);
        sandbox.write(&path, &long_lines(500, 200)).await;

        let window = sandbox.read(&path, 0, 500).await;
        assert!(window.starts_with("Error reading file"));
        assert!(!window.contains("     1\t"));

        let hits = sandbox.grep_raw("x", &root, None).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.len() < 500);
        assert!(hits.iter().all(|m| m.text.len() == 206));
    }

    #[tokio::test]
    async fn test_edit_outcomes() {
        let fx = Fixture::new();
        let path = fx.p("edit.txt");
        fx.sandbox.write(&path, "alpha beta beta").await;

        let missing = fx.sandbox.edit(&fx.p("none.txt"), "a", "b", false).await;
        assert!(missing.error.unwrap().contains("not found"));

        let multiple = fx.sandbox.edit(&path, "beta", "gamma", false).await;
        assert!(multiple.error.unwrap().contains("multiple occurrences"));

        let once = fx.sandbox.edit(&path, "alpha", "ALPHA", false).await;
        assert_eq!(once.occurrences, Some(1));
        let back = fx.sandbox.edit(&path, "ALPHA", "alpha", false).await;
        assert!(back.is_ok());

        let all = fx.sandbox.edit(&path, "beta", "gamma", true).await;
        assert_eq!(all.occurrences, Some(2));
        assert!(fx.sandbox.read(&path, 0, 1).await.contains("alpha gamma gamma"));
    }

    #[tokio::test]
    async fn test_grep_literal_and_scenario() {
        let fx = Fixture::new();
        fx.sandbox.write(&fx.p("gr-basic/file1.txt"), "Hello world\nGoodbye world").await;
        fx.sandbox.write(&fx.p("gr-basic/file2.txt"), "Hello there\nGoodbye friend").await;
        fx.sandbox.write(&fx.p("regex/pat.txt"), "abc\n[a-z]*\n").await;

        let hits = fx.sandbox.grep_raw("Hello", &fx.p("gr-basic"), None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|m| m.line == 1));

        let literal = fx.sandbox.grep_raw("[a-z]*", &fx.root, None).await.unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0].line, 2);
        assert_eq!(literal[0].text, "[a-z]*");

        let filtered = fx.sandbox.grep_raw("Hello", &fx.root, Some("*.md")).await.unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_glob_info() {
        let fx = Fixture::new();
        fx.sandbox.write(&fx.p("main.py"), "").await;
        fx.sandbox.write(&fx.p("pkg/util.py"), "").await;
        fx.sandbox.write(&fx.p("pkg/readme.md"), "").await;

        let shallow: Vec<String> = fx.sandbox.glob_info("*.py", &fx.root).await.into_iter().map(|e| e.path).collect();
        assert_eq!(shallow, vec![fx.p("main.py")]);

        let deep: Vec<String> = fx.sandbox.glob_info("**/*.py", &fx.root).await.into_iter().map(|e| e.path).collect();
        assert_eq!(deep, vec![fx.p("main.py"), fx.p("pkg/util.py")]);
    }

    #[tokio::test]
    async fn test_binary_round_trip() {
        let fx = Fixture::new();
        let bytes: Vec<u8> = (0..=255).collect();
        let path = fx.p("bin/all.bytes");

        let up = fx.sandbox.upload_files(&[(path.clone(), bytes.clone())]).await.unwrap();
        assert!(up[0].error.is_none());
        let down = fx
            .sandbox
            .download_files(&[path.clone(), fx.p("bin"), "/../x".to_string()])
            .await
            .unwrap();
        assert_eq!(down[0].content.as_ref(), Some(&bytes));
        assert_eq!(down[1].error, Some(FileOperationError::IsDirectory));
        assert_eq!(down[2].error, Some(FileOperationError::InvalidPath));
    }

    #[tokio::test]
    async fn test_composite_delegates_execute_to_default() {
        let fx = Fixture::new();
        let root = fx.root.clone();
        let composite = CompositeBackend::new(Arc::new(fx.sandbox))
            .with_route("/memories/", Arc::new(StoreBackend::in_memory()))
            .unwrap();

        assert!(is_sandbox_backend(&composite));
        let response = SandboxBackend::execute(&composite, "echo routed").await.unwrap();
        assert_eq!(response.output, "routed\n");

        composite.write("/memories/x.md", "note").await;
        let listing = composite.ls_info(&root).await;
        assert!(listing.iter().all(|e| !e.path.starts_with("/memories")));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let fx = Fixture::new();
        assert!(fx.sandbox.read("/tmp/../etc/passwd", 0, 5).await.contains("traversal"));
        assert!(fx.sandbox.write("/../x", "x").await.error.unwrap().contains("traversal"));
    }
}
