//! MetaIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! used by the metadata I/O pipeline and its clients.

pub mod config;
pub mod error;
pub mod types;

pub use config::MetaIoConfig;
pub use error::{Error, Result};
pub use types::*;
