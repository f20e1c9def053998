//! Chartpack Core - shared error and configuration types
//!
//! Foundational types used by the bundling engine and the CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{is_loopback_registry, LogLevel, PackConfig, DEFAULT_CONCURRENCY, DEFAULT_STAGE};
pub use error::{PackError, Result};

/// Chartpack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
