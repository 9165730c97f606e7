//! Common types, errors, and configuration for tessera.
//!
//! This crate provides shared functionality used across the tessera workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, sandboxes, model and pool
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    EngineConfig, ModelConfig, OutputMode, PoolSettings, RuntimeConfig, SandboxConfig,
};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::RuntimeError;
