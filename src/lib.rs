pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod sandbox;

pub use error::{MountletError, Result};
