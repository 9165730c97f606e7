//! Guest engine module compilation and sharing.
//!
//! [`GuestModule`] wraps the compiled guest engine. Compiling the engine is
//! by far the most expensive step of bringing a client up, so one
//! `GuestModule` is meant to be compiled once and cloned into every client
//! and every pool that runs the same guest.
//!
//! # Compilation Strategies
//!
//! - **JIT**: Compile from Wasm bytes at runtime (slower cold start)
//! - **AOT**: Pre-compile with [`GuestModule::serialize`] and load the
//!   artifact with [`GuestModule::from_precompiled`] (fast cold start)

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::Module;

use crate::WasmEngine;
use tessera_common::RuntimeError;

/// File extension of precompiled guest artifacts.
pub const PRECOMPILED_EXTENSION: &str = "cwasm";

/// A compiled guest engine module.
///
/// Cloning is cheap and shares the compiled code.
#[derive(Clone)]
pub struct GuestModule {
    engine: WasmEngine,
    module: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,

    /// Sandboxes currently alive for this module, across all clones.
    live: Arc<AtomicUsize>,
}

impl GuestModule {
    /// Compile a guest module from WebAssembly bytes.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &WasmEngine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine.inner(), bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Guest module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Guest module compiled"
        );

        Ok(Self::new(engine, module, content_hash))
    }

    /// Compile a guest module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &WasmEngine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine.inner(), wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        debug!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self::new(engine, module, content_hash))
    }

    /// Load a guest module from disk.
    ///
    /// Files ending in `.cwasm` are treated as precompiled artifacts,
    /// anything else is compiled.
    pub fn from_file(engine: &WasmEngine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        if path
            .extension()
            .is_some_and(|ext| ext == PRECOMPILED_EXTENSION)
        {
            return Self::from_precompiled(engine, path);
        }

        let bytes = std::fs::read(path)?;
        Self::from_bytes(engine, &bytes)
    }

    /// Load a precompiled guest module from disk.
    ///
    /// # Safety
    ///
    /// This deserializes machine code. Only load artifacts produced by
    /// [`GuestModule::serialize`] with the same Wasmtime version and engine
    /// settings.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(
        engine: &WasmEngine,
        path: impl AsRef<Path>,
    ) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let start = Instant::now();

        // SAFETY: artifacts come from `tessera precompile`
        let module = unsafe { Module::deserialize_file(engine.inner(), path) }.map_err(|e| {
            RuntimeError::compilation_failed(format!(
                "Failed to load precompiled module from {}: {e}",
                path.display()
            ))
        })?;

        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        debug!(
            path = %path.display(),
            content_hash = %content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled module loaded"
        );

        Ok(Self::new(engine, module, content_hash))
    }

    fn new(engine: &WasmEngine, module: Module, content_hash: String) -> Self {
        Self {
            engine: engine.clone(),
            module,
            content_hash,
            compiled_at: Instant::now(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serialize the compiled module for AOT loading.
    pub fn serialize(&self) -> Result<Vec<u8>, RuntimeError> {
        self.module.serialize().map_err(|e| {
            RuntimeError::compilation_failed(format!("Module serialization failed: {e}"))
        })
    }

    /// The engine this module was compiled with.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Number of sandboxes currently instantiated from this module.
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Count a new sandbox until the returned guard drops.
    pub(crate) fn track_instance(&self) -> LiveInstance {
        self.live.fetch_add(1, Ordering::AcqRel);
        LiveInstance {
            live: Arc::clone(&self.live),
        }
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestModule")
            .field("content_hash", &self.content_hash)
            .field("live_instances", &self.live_instances())
            .finish_non_exhaustive()
    }
}

/// Decrements the live sandbox count of a [`GuestModule`] on drop.
#[derive(Debug)]
pub(crate) struct LiveInstance {
    live: Arc<AtomicUsize>,
}

impl Drop for LiveInstance {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(GuestModule::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = GuestModule::validate_wasm_header(&[0x00, 0x61]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = GuestModule::validate_wasm_header(bad_wasm);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_module_compilation() {
        let module = GuestModule::from_bytes(&engine(), MINIMAL_WASM).unwrap();

        assert!(!module.content_hash().is_empty());
        assert_eq!(module.live_instances(), 0);
    }

    #[test]
    fn test_live_instances_shared_between_clones() {
        let module = GuestModule::from_wat(&engine(), "(module)").unwrap();
        let clone = module.clone();

        let guard = module.track_instance();
        assert_eq!(clone.live_instances(), 1);

        drop(guard);
        assert_eq!(module.live_instances(), 0);
    }

    #[test]
    fn test_serialize_then_load_precompiled() {
        let engine = engine();
        let module = GuestModule::from_wat(&engine, "(module)").unwrap();
        let artifact = module.serialize().unwrap();

        let path = std::env::temp_dir().join(format!(
            "tessera-{}-{}.{PRECOMPILED_EXTENSION}",
            std::process::id(),
            module.content_hash()
        ));
        std::fs::write(&path, artifact).unwrap();

        let loaded = GuestModule::from_file(&engine, &path);
        std::fs::remove_file(&path).unwrap();

        assert!(loaded.is_ok());
    }

    #[test]
    fn test_module_debug() {
        let module = GuestModule::from_bytes(&engine(), MINIMAL_WASM).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("GuestModule"));
        assert!(debug_str.contains("content_hash"));
    }
}
