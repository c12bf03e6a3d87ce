//! VolGuard Common - Shared types and utilities
//!
//! This crate provides the core data model (volumes, lock classes, use
//! records), the error taxonomy, key layout helpers, and configuration
//! used across all VolGuard components.

pub mod config;
pub mod error;
pub mod keys;
pub mod types;

pub use config::Config;
pub use error::{Result, UseError};
pub use types::*;
