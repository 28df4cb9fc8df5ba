//! Configuration Module
//!
//! Service settings are read once at startup from environment variables.

pub mod settings;

pub use settings::{ConfigError, ServiceConfig};
