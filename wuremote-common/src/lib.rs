//! # WuRemote Common
//!
//! Shared utilities for the WuRemote binaries.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use wuremote_common::{init_logging_with_format, LogFormat};
//!
//! init_logging_with_format("info", LogFormat::Pretty)?;
//! tracing::info!(phase = "search", "Phase started");
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json, init_logging_with_format, LogFormat};
