//! Mountlet Guest Helper
//!
//! Installed inside WASM VMs as `/.bin/subagent`. It never talks to the host
//! directly: each request is one JSON file dropped into the RPC spool, which
//! the host collects after the command finishes.
//!
//! Usage:
//! - `subagent spawn <task...>` queues a sub-agent for the task
//!
//! Build for the VM with `--target wasm32-wasip1 --profile release-agent`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use serde::Serialize;

/// Spool directory as mapped by the host
const DEFAULT_RPC_DIR: &str = "/.rpc/requests";

/// Overrides the spool directory (set by the host for every run)
const RPC_DIR_ENV: &str = "MOUNTLET_RPC_DIR";

#[derive(Debug, Serialize)]
struct SpawnRequest {
    id: String,
    method: &'static str,
    args: SpawnArgs,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct SpawnArgs {
    task: String,
}

fn rpc_dir() -> PathBuf {
    std::env::var_os(RPC_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RPC_DIR))
}

/// `<pid>-<secs>-<nanos>`; unique enough for one VM run.
#[cfg(not(target_os = "wasi"))]
fn generate_id(_dir: &Path) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{}-{}", process::id(), ts.as_secs(), ts.subsec_nanos())
}

/// WASI has no process ids; count past requests already in the spool.
#[cfg(target_os = "wasi")]
fn generate_id(dir: &Path) -> String {
    let mut n = fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0);
    loop {
        let id = format!("spawn-{}", n);
        if !dir.join(format!("{}.json", id)).exists() {
            return id;
        }
        n += 1;
    }
}

/// Unix time as `secs.millis`.
#[cfg(not(target_os = "wasi"))]
fn get_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", ts.as_secs(), ts.subsec_millis())
}

/// The guest clock is not trusted; "0" asks the host to stamp the request.
#[cfg(target_os = "wasi")]
fn get_timestamp() -> String {
    "0".to_string()
}

fn print_usage() {
    eprintln!("Usage: subagent <command> [args...]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  spawn <task_description>    Spawn a subagent with the given task");
}

/// Write the request atomically so the host never sees a partial file.
fn submit(dir: &Path, task: &str) -> Result<String, String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;

    let request = SpawnRequest {
        id: generate_id(dir),
        method: "spawn",
        args: SpawnArgs {
            task: task.to_string(),
        },
        timestamp: get_timestamp(),
    };
    let json = serde_json::to_string_pretty(&request)
        .map_err(|e| format!("Failed to serialize request: {}", e))?;

    let tmp = dir.join(format!(".{}.tmp", request.id));
    let target = dir.join(format!("{}.json", request.id));
    fs::write(&tmp, json).map_err(|e| format!("Failed to write {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, &target).map_err(|e| format!("Failed to write {}: {}", target.display(), e))?;

    Ok(request.id)
}

fn run(args: &[String]) -> Result<(), String> {
    let Some(command) = args.first() else {
        print_usage();
        return Err("No command specified".to_string());
    };

    match command.as_str() {
        "spawn" => {
            let task = args[1..].join(" ");
            if task.trim().is_empty() {
                print_usage();
                return Err("spawn requires a task description".to_string());
            }
            let id = submit(&rpc_dir(), &task)?;
            println!("Spawn request {} submitted", id);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            Err(format!("Unknown command: {}", other))
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
