//! packstore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, payload checksums and
//! configuration types used by the archive engine and the HTTP server.

pub mod checksum;
pub mod config;
pub mod error;

pub use checksum::{Checksum, checksum};
pub use config::{Config, VhostConfig};
pub use error::{Error, Result};
