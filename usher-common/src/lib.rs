//! Usher Common - Shared types, configuration, and utilities for the usher
//! admission-control and session-history core.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types and handling utilities
//! - Logging setup

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    AdmissionConfig, Config, MetricsConfig, ObservabilityConfig, SessionConfig,
};
pub use error::{Error, Result};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{AdmissionConfig, Config, MetricsConfig, SessionConfig};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
