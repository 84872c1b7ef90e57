pub mod loader;
pub mod types;

pub use loader::{get_cache_dir, get_config_path, get_data_dir, load_config};
pub use types::{BackendType, MountletConfig, RouteConfig, RouteKind, SandboxConfig};
