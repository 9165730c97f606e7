//! Configuration structures for tessera.
//!
//! - [`RuntimeConfig`]: Wasmtime engine and per-sandbox settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, caching)
//! - [`SandboxConfig`]: Per-client sandbox limits and guest output handling
//! - [`ModelConfig`]: Language and tuning variables applied to every client
//! - [`PoolSettings`]: Worker count and startup deadline

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Variable applied when the caller provides none: automatic page
/// segmentation.
pub const DEFAULT_VARIABLE: (&str, &str) = ("tessedit_pageseg_mode", "3");

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-client sandbox configuration.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Wasmtime engine configuration.
///
/// These settings are shared by every sandbox compiled from the same engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator.
    ///
    /// Clients are long-lived, so on-demand allocation is the default. The
    /// pool also caps how many sandboxes may exist at once.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent sandboxes when pooling is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Linear memory reserved per pooled sandbox, in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Cache compiled guest code on disk using Wasmtime's default cache.
    #[serde(default = "defaults::cache_compiled_modules")]
    pub cache_compiled_modules: bool,

    /// Path to a Wasmtime cache configuration file.
    ///
    /// Takes precedence over the default cache location.
    #[serde(default)]
    pub cache_config: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            cache_compiled_modules: defaults::cache_compiled_modules(),
            cache_config: None,
        }
    }
}

/// Where a guest output stream goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Write to the host process' stream.
    #[default]
    Inherit,
    /// Drop everything.
    Discard,
}

/// Per-client sandbox configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Upper bound on a client's linear memory, in megabytes.
    ///
    /// Guest memory only grows, so this is also the lifetime footprint cap.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Destination of the guest's stdout.
    #[serde(default)]
    pub guest_stdout: OutputMode,

    /// Destination of the guest's stderr.
    #[serde(default)]
    pub guest_stderr: OutputMode,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: defaults::max_memory_mb(),
            guest_stdout: OutputMode::default(),
            guest_stderr: OutputMode::default(),
        }
    }
}

impl SandboxConfig {
    /// Memory limit in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Model settings applied to every client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Model variant tag passed to the engine with the trained data.
    #[serde(default = "defaults::language")]
    pub language: String,

    /// Engine tuning variables.
    ///
    /// When empty, [`DEFAULT_VARIABLE`] is applied instead.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            language: defaults::language(),
            variables: BTreeMap::new(),
        }
    }
}

impl ModelConfig {
    /// The language, falling back to the default for an empty tag.
    pub fn language_or_default(&self) -> &str {
        if self.language.is_empty() {
            defaults::LANGUAGE
        } else {
            &self.language
        }
    }

    /// The variables to apply, falling back to [`DEFAULT_VARIABLE`].
    pub fn variables_or_default(&self) -> BTreeMap<String, String> {
        if self.variables.is_empty() {
            let (key, value) = DEFAULT_VARIABLE;
            BTreeMap::from([(key.to_string(), value.to_string())])
        } else {
            self.variables.clone()
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Number of engine clients.
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// How long pool construction may take, in seconds.
    #[serde(default = "defaults::startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            startup_timeout_secs: defaults::startup_timeout_secs(),
        }
    }
}

impl PoolSettings {
    /// Get the startup deadline as a `Duration`.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const LANGUAGE: &str = "eng";

    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        64
    }

    pub const fn instance_memory_mb() -> u32 {
        512
    }

    pub const fn cache_compiled_modules() -> bool {
        false
    }

    pub const fn max_memory_mb() -> u32 {
        1024
    }

    pub fn language() -> String {
        LANGUAGE.to_string()
    }

    pub const fn workers() -> usize {
        4
    }

    pub const fn startup_timeout_secs() -> u64 {
        60
    }
}
