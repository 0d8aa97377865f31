pub mod cli;
pub mod commands;
pub mod display;
pub mod error;
pub mod image;
pub mod network;
pub mod paths;
pub mod profile;
pub mod qemu;
pub mod readiness;
pub mod session;
pub mod ssh;
pub mod state;
pub mod sync;
pub mod types;
pub mod utils;

// Re-export core types for convenience
pub use error::QvmError;
pub use types::{Arch, GuestSpec, OsFamily};
