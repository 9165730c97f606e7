//! Configuration file structures for tessera.
//!
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`GuestEntry`]: Location of the guest engine module
//! - [`ModelEntry`]: Trained model file plus [`ModelConfig`]

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ModelConfig, PoolSettings, RuntimeConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = true
/// max_instances = 16
///
/// [runtime.sandbox]
/// max_memory_mb = 512
/// guest_stderr = "discard"
///
/// [pool]
/// workers = 4
/// startup_timeout_secs = 30
///
/// [guest]
/// path = "./tesseract-core.wasm"
///
/// [model]
/// path = "./eng.traineddata"
/// language = "eng"
///
/// [model.variables]
/// tessedit_pageseg_mode = "6"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine + sandbox settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Guest engine module.
    #[serde(default)]
    pub guest: GuestEntry,

    /// Trained model and its settings.
    #[serde(default)]
    pub model: ModelEntry,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Guest module entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestEntry {
    /// Path to the guest `.wasm`, or a `.cwasm` produced by `tessera precompile`.
    pub path: Option<String>,
}

/// Trained model entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelEntry {
    /// Path to the trained model file.
    pub path: Option<String>,

    /// Language and variables.
    #[serde(flatten)]
    pub config: ModelConfig,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}
