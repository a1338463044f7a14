//! # Configuration Modules
//!
//! The validated, immutable runtime settings every actor is constructed from.

/// The `Settings` record and its defaults.
pub mod settings;
