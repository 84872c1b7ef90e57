//! The spool through which code inside a VM asks the host for work.
//!
//! Guest code drops one JSON file per request into `requests/`; after each
//! run the host collects them. Every file read is deleted, valid or not, so a
//! request is delivered at most once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;

/// Subdirectory of the spool the guest writes into.
pub const REQUESTS_DIR: &str = "requests";

/// Guest-side override for the requests directory.
pub const RPC_DIR_ENV: &str = "MOUNTLET_RPC_DIR";

pub const SPAWN_METHOD: &str = "spawn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnArgs {
    pub task: String,
}

/// A request from inside the VM to spawn a sub-agent on `args.task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub id: String,
    pub method: String,
    pub args: SpawnArgs,
    pub timestamp: String,
}

impl SpawnRequest {
    pub fn spawn(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: SPAWN_METHOD.to_string(),
            args: SpawnArgs { task: task.into() },
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Lenient shape used to validate whatever the guest wrote.
#[derive(Deserialize)]
struct RawRequest {
    id: Option<String>,
    method: Option<String>,
    args: Option<RawArgs>,
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
struct RawArgs {
    task: Option<String>,
}

fn timestamp_or_now(raw: Option<Value>, now: DateTime<Utc>) -> String {
    let given = match raw {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let is_zero = given.trim().parse::<f64>().map(|v| v == 0.0).unwrap_or(false);
    if given.trim().is_empty() || is_zero {
        now.to_rfc3339()
    } else {
        given
    }
}

/// Validate one request file body. `None` when it is not a usable request.
fn parse_request(body: &str, now: DateTime<Utc>) -> Option<SpawnRequest> {
    let raw: RawRequest = serde_json::from_str(body).ok()?;
    let id = raw.id.filter(|id| !id.trim().is_empty())?;
    if raw.method.as_deref() != Some(SPAWN_METHOD) {
        return None;
    }
    let task = raw.args?.task.filter(|t| !t.trim().is_empty())?;
    Some(SpawnRequest {
        id,
        method: SPAWN_METHOD.to_string(),
        args: SpawnArgs { task },
        timestamp: timestamp_or_now(raw.timestamp, now),
    })
}

/// Host side of the spool; `root` is what the guest sees as `/.rpc`.
#[derive(Debug, Clone)]
pub struct RpcSpool {
    root: PathBuf,
}

impl RpcSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root.join(REQUESTS_DIR)
    }

    pub async fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.requests_dir()).await?;
        Ok(())
    }

    /// Queue a request the way the guest helper does.
    pub async fn write_request(&self, request: &SpawnRequest) -> Result<PathBuf> {
        self.ensure().await?;
        let target = self.requests_dir().join(format!("{}.json", request.id));
        fs::write(&target, serde_json::to_vec_pretty(request)?).await?;
        Ok(target)
    }

    /// Parse, de-duplicate and delete every `*.json` request file.
    pub async fn collect(&self) -> Result<Vec<SpawnRequest>> {
        let dir = self.requests_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut requests = Vec::new();
        for file in files {
            let parsed = match fs::read_to_string(&file).await {
                Ok(body) => parse_request(&body, now),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Unreadable RPC request");
                    None
                }
            };
            if let Err(e) = fs::remove_file(&file).await {
                warn!(file = %file.display(), error = %e, "Could not remove RPC request");
            }
            match parsed {
                Some(request) if seen.insert(request.id.clone()) => requests.push(request),
                Some(request) => debug!(id = %request.id, "Dropping duplicate RPC request"),
                None => warn!(file = %file.display(), "Skipping malformed RPC request"),
            }
        }

        if !requests.is_empty() {
            debug!(count = requests.len(), "Collected RPC requests");
        }
        Ok(requests)
    }
}

/// POSIX sh stand-in for the guest helper, installed as `/.bin/subagent`
/// when no WASI build of the helper is configured.
pub const SUBAGENT_SCRIPT: &str = r#"#!/bin/sh
usage() { echo "Usage: subagent spawn <task_description>" >&2; }
if [ "$#" -lt 1 ]; then usage; exit 1; fi
case "$1" in
  help|-h|--help) usage; exit 0 ;;
  spawn) shift ;;
  *) usage; echo "Error: Unknown command: $1" >&2; exit 1 ;;
esac
if [ "$#" -lt 1 ]; then usage; echo "Error: spawn requires a task description" >&2; exit 1; fi
dir="${MOUNTLET_RPC_DIR:-/.rpc/requests}"
mkdir -p "$dir" || exit 1
task=$(printf '%s' "$*" | sed -e 's/\\/\\\\/g' -e 's/"/\\"/g' -e 's/	/\\t/g' | sed -e ':a' -e 'N' -e '$!ba' -e 's/\n/\\n/g')
n=0
id="spawn-$$-$n"
while [ -e "$dir/$id.json" ]; do n=$((n + 1)); id="spawn-$$-$n"; done
printf '{"id":"%s","method":"spawn","args":{"task":"%s"},"timestamp":"0"}\n' "$id" "$task" > "$dir/.$id.tmp" || exit 1
mv "$dir/.$id.tmp" "$dir/$id.json" || exit 1
echo "Spawn request $id submitted"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_request_missing_method_is_skipped() {
        let temp = TempDir::new().unwrap();
        let spool = RpcSpool::new(temp.path());
        spool.ensure().await.unwrap();
        std::fs::write(
            spool.requests_dir().join("bad.json"),
            r#"{"id": "x", "args": {"task": "t"}, "timestamp": "1"}"#,
        )
        .unwrap();
        std::fs::write(spool.requests_dir().join("junk.json"), "not json").unwrap();

        assert!(spool.collect().await.unwrap().is_empty());
        // malformed files are purged too
        assert_eq!(std::fs::read_dir(spool.requests_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_valid_request_delivered_exactly_once() {
        let temp = TempDir::new().unwrap();
        let spool = RpcSpool::new(temp.path());
        let request = SpawnRequest::spawn("r1", "summarize the logs");
        spool.write_request(&request).await.unwrap();

        let first = spool.collect().await.unwrap();
        assert_eq!(first, vec![request]);
        assert!(spool.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_timestamp_is_backfilled_and_ids_deduplicated() {
        let temp = TempDir::new().unwrap();
        let spool = RpcSpool::new(temp.path());
        spool.ensure().await.unwrap();
        let body = r#"{"id": "dup", "method": "spawn", "args": {"task": "t"}, "timestamp": "0"}"#;
        std::fs::write(spool.requests_dir().join("a.json"), body).unwrap();
        std::fs::write(spool.requests_dir().join("b.json"), body).unwrap();
        std::fs::write(spool.requests_dir().join("notes.txt"), "ignored").unwrap();

        let requests = spool.collect().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(DateTime::parse_from_rfc3339(&requests[0].timestamp).is_ok());
        assert!(spool.requests_dir().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_spool_is_empty() {
        let temp = TempDir::new().unwrap();
        let spool = RpcSpool::new(temp.path().join("nowhere"));
        assert!(spool.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shell_helper_writes_parseable_request() {
        let temp = TempDir::new().unwrap();
        let spool = RpcSpool::new(temp.path());
        let script = temp.path().join("subagent");
        std::fs::write(&script, SUBAGENT_SCRIPT).unwrap();

        let status = tokio::process::Command::new("sh")
            .arg(&script)
            .args(["spawn", "fix", "the \"quoted\" bug"])
            .env(RPC_DIR_ENV, spool.requests_dir())
            .stdout(std::process::Stdio::null())
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let requests = spool.collect().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].args.task, "fix the \"quoted\" bug");
        assert!(requests[0].id.starts_with("spawn-"));
    }
}
