//! Configuration module for the transcode orchestrator
//!
//! Handles loading configuration from TOML files, environment variable overrides,
//! and validation of the resource and schedule settings.

pub mod config;
pub mod schedule;

pub use config::*;
pub use schedule::*;
