pub mod composite;
pub mod filesystem;
pub mod path;
pub mod protocol;
pub mod state;
pub mod store;
pub mod text;
pub mod types;

pub use composite::CompositeBackend;
pub use filesystem::FilesystemBackend;
pub use protocol::{is_sandbox_backend, Backend, BackendCapabilities, FileTransfer, SandboxBackend};
pub use state::StateBackend;
pub use store::{InMemoryStore, JsonDirStore, KeyValueStore, StoreBackend};
pub use types::{
    EditResult, ExecuteResponse, FileData, FileDownloadResponse, FileEncoding, FileInfo,
    FileUploadResponse, FilesUpdate, GrepMatch, GrepOutcome, WriteResult, DEFAULT_READ_LIMIT,
};
