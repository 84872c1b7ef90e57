use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::types::{ExecuteResponse, FileDownloadResponse, FileUploadResponse};
use crate::config::types::SandboxConfig;
use crate::error::{FileOperationError, MountletError, Result};
use crate::sandbox::process::{truncate_output, SCRIPT_OUTPUT_BYTES};
use crate::sandbox::traits::{SandboxInfo, SandboxRuntime};

const API_KEY_ENV: &str = "MOUNTLET_REMOTE_API_KEY";

/// Slack on top of the command timeout before the HTTP call itself gives up.
const REQUEST_GRACE: Duration = Duration::from_secs(10);

/// A cloud sandbox reached over the provider's HTTP API.
pub struct RemoteRuntime {
    client: Client,
    base_url: String,
    sandbox_id: String,
    api_key: Option<String>,
    timeout_seconds: u64,
    max_output_bytes: usize,
}

impl RemoteRuntime {
    pub fn new(base_url: impl Into<String>, sandbox_id: impl Into<String>, api_key: Option<String>) -> Self {
        let defaults = SandboxConfig::default();
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sandbox_id: sandbox_id.into(),
            api_key,
            timeout_seconds: defaults.timeout_seconds,
            max_output_bytes: defaults.max_output_bytes,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let remote = &config.remote;
        let base_url = remote
            .base_url
            .clone()
            .ok_or_else(|| MountletError::Config("sandbox.remote.base_url is required".to_string()))?;
        let sandbox_id = remote
            .sandbox_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MountletError::Config("sandbox.remote.sandbox_id is required".to_string()))?;
        let api_key = remote.api_key.clone().or_else(|| std::env::var(API_KEY_ENV).ok());

        let mut runtime = Self::new(base_url, sandbox_id, api_key);
        runtime.timeout_seconds = config.timeout_seconds;
        runtime.max_output_bytes = config.max_output_bytes;
        Ok(runtime)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/v1/sandboxes/{}/{}", self.base_url, self.sandbox_id, endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    /// POST the command; the server may cut output on its own as well.
    async fn exec(&self, command: &str, max_output_bytes: usize) -> Result<ExecuteResponse> {
        debug!(sandbox_id = %self.sandbox_id, command_len = command.len(), "Executing remote command");

        let response = self
            .authorize(self.client.post(self.url("exec")))
            .timeout(Duration::from_secs(self.timeout_seconds) + REQUEST_GRACE)
            .json(&ExecRequest {
                command,
                timeout_seconds: self.timeout_seconds,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MountletError::RemoteApi {
                message,
                status: Some(status.as_u16()),
            });
        }

        let reply: ExecReply = response.json().await?;
        let mut output = reply.output;
        let truncated = truncate_output(&mut output, max_output_bytes) || reply.truncated;
        Ok(ExecuteResponse {
            output,
            exit_code: reply.exit_code,
            truncated,
        })
    }
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    timeout_seconds: u64,
}

#[derive(Deserialize)]
struct ExecReply {
    #[serde(default)]
    output: String,
    exit_code: Option<i32>,
    #[serde(default)]
    truncated: bool,
}

#[async_trait]
impl SandboxRuntime for RemoteRuntime {
    fn name(&self) -> &str {
        "remote"
    }

    fn id(&self) -> &str {
        &self.sandbox_id
    }

    async fn execute(&self, command: &str) -> Result<ExecuteResponse> {
        self.exec(command, self.max_output_bytes).await
    }

    async fn execute_script(&self, command: &str) -> Result<ExecuteResponse> {
        self.exec(command, SCRIPT_OUTPUT_BYTES).await
    }

    async fn upload_files(&self, files: &[(String, Vec<u8>)]) -> Result<Vec<FileUploadResponse>> {
        debug!(sandbox_id = %self.sandbox_id, count = files.len(), "Uploading files");
        let mut responses = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let response = self
                .authorize(self.client.put(self.url("files")))
                .query(&[("path", path)])
                .body(bytes.clone())
                .send()
                .await?;
            let status = response.status();
            responses.push(if status.is_success() {
                FileUploadResponse::ok(path)
            } else {
                FileUploadResponse::err(path, FileOperationError::from_http_status(status.as_u16()))
            });
        }
        Ok(responses)
    }

    async fn download_files(&self, paths: &[String]) -> Result<Vec<FileDownloadResponse>> {
        debug!(sandbox_id = %self.sandbox_id, count = paths.len(), "Downloading files");
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            let response = self
                .authorize(self.client.get(self.url("files")))
                .query(&[("path", path)])
                .send()
                .await?;
            let status = response.status();
            responses.push(if status.is_success() {
                FileDownloadResponse::ok(path, response.bytes().await?.to_vec())
            } else {
                FileDownloadResponse::err(path, FileOperationError::from_http_status(status.as_u16()))
            });
        }
        Ok(responses)
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: "remote".to_string(),
            instance_id: Some(self.sandbox_id.clone()),
            running: true,
            metadata: HashMap::from([("base_url".to_string(), self.base_url.clone())]),
        }
    }
}
