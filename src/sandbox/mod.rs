pub mod backends;
pub mod base;
pub mod factory;
pub mod mount;
pub mod process;
pub mod rpc;
pub mod script;
#[cfg(feature = "wasmer")]
pub mod shell;
pub mod sync;
pub mod traits;

#[cfg(feature = "wasmer")]
pub use backends::{WasmEngine, WasmSandbox};
#[cfg(feature = "wasmer")]
pub use shell::{ShellExit, ShellSession};

pub use backends::{DockerRuntime, LocalShellRuntime, RemoteRuntime};
pub use base::BaseSandbox;
pub use factory::{available_backends, build_backend, build_route, create_sandbox, BackendInfo};
pub use mount::{Mount, MountTable};
pub use rpc::{RpcSpool, SpawnRequest};
pub use sync::SyncReport;
pub use traits::{SandboxInfo, SandboxRuntime};

/// Generate a short, process-unique sandbox id such as `wasm-1x9k2a0`.
pub(crate) fn generate_sandbox_id(kind: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    // Timestamp + counter, base36 for compactness
    let combined = (timestamp & 0xFFFFFF) << 8 | (counter as u64 & 0xFF);
    format!("{}-{}", kind, format_base36(combined))
}

/// Format a number as base36 string
fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut result = String::new();
    while n > 0 {
        result.insert(0, CHARS[(n % 36) as usize] as char);
        n /= 36;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_base36() {
        assert_eq!(format_base36(0), "0");
        assert_eq!(format_base36(35), "z");
        assert_eq!(format_base36(36), "10");
    }

    #[test]
    fn test_sandbox_ids_are_distinct() {
        let a = generate_sandbox_id("local");
        let b = generate_sandbox_id("local");
        assert!(a.starts_with("local-"));
        assert_ne!(a, b);
    }
}
