#[cfg(feature = "wasmer")]
pub mod wasmer;

#[cfg(feature = "wasmer")]
pub use wasmer::{WasmEngine, WasmSandbox};

pub mod docker;
pub mod local;
pub mod remote;

pub use docker::DockerRuntime;
pub use local::LocalShellRuntime;
pub use remote::RemoteRuntime;
