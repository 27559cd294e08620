//! Wharf Core - Foundational Types
//!
//! Shared types used across the wharf ecosystem: the error taxonomy,
//! registry credentials, and pull configuration.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{Credentials, PullConfig};
pub use error::{PullError, Result};

/// Wharf version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
