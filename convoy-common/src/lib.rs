//! Convoy Common - Shared types and utilities for the Convoy coordination core.
//!
//! This crate provides:
//! - Configuration types and environment-driven loading
//! - Configuration validation
//! - The unified error type and context helpers
//! - Logging setup and tracing helpers
//! - Small parsing and redaction utilities

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    CircuitConfig, Config, LockBackoffConfig, ObservabilityConfig, RetryConfig, StoreBackend,
    StoreConfig, TableNames, TtlConfig,
};
pub use error::{Error, Result, ResultExt};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, StoreConfig};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}
