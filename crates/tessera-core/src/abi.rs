//! Binding to the guest engine's exported call contract.
//!
//! A guest engine is a core WebAssembly module exporting `memory`, an
//! allocator pair (`malloc`/`free`) and a small set of `engine_*` functions
//! operating on an opaque engine handle. String results and error messages
//! are guest-allocated NUL-terminated strings that the host reads and then
//! frees; a null pointer means "no message".
//!
//! [`GuestExports`] resolves every export once, right after instantiation,
//! so a guest missing part of the contract is rejected before any client
//! uses it.

use std::sync::Arc;

use wasmtime::{Instance, Memory, Store, TypedFunc};

use crate::store::ClientContext;
use tessera_common::RuntimeError;

/// The only call contract revision this host speaks.
pub const ABI_VERSION: i32 = 1;

/// Receives extraction progress as a percentage in `0..=100`.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Which representation the engine should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputKind {
    /// Plain UTF-8 text.
    #[default]
    Text,
    /// hOCR markup.
    Hocr,
}

impl OutputKind {
    /// Kind code passed to `engine_extract`.
    pub fn code(self) -> i32 {
        match self {
            OutputKind::Text => 0,
            OutputKind::Hocr => 1,
        }
    }
}

/// Options for loading an input into the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Ask the engine to remove underlines before recognition.
    pub remove_underlines: bool,
}

impl LoadOptions {
    const REMOVE_UNDERLINES: i32 = 1;

    /// Flag word passed to `engine_load_input`.
    pub fn flags(self) -> i32 {
        if self.remove_underlines {
            Self::REMOVE_UNDERLINES
        } else {
            0
        }
    }
}

/// Options for a full load-then-extract cycle.
#[derive(Clone, Default)]
pub struct ExtractOptions {
    pub output: OutputKind,
    pub load: LoadOptions,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("output", &self.output)
            .field("load", &self.load)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Typed handles to every export of the call contract.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub malloc: TypedFunc<i32, i32>,
    pub free: TypedFunc<i32, ()>,
    pub engine_new: TypedFunc<(), i32>,
    pub engine_delete: TypedFunc<i32, ()>,
    pub engine_load_model: TypedFunc<(i32, i32, i32, i32), i32>,
    pub engine_set_variable: TypedFunc<(i32, i32, i32), i32>,
    pub engine_clear_input: TypedFunc<i32, ()>,
    pub engine_load_input: TypedFunc<(i32, i32, i32, i32), i32>,
    pub engine_extract: TypedFunc<(i32, i32), i32>,
    pub engine_last_error: TypedFunc<i32, i32>,
}

impl GuestExports {
    /// Resolve and version-check the exports of a fresh instance.
    ///
    /// # Errors
    ///
    /// Returns `AbiMismatch` if an export is missing, has the wrong
    /// signature, or the guest reports another contract version.
    pub(crate) async fn resolve(
        instance: &Instance,
        store: &mut Store<ClientContext>,
    ) -> Result<Self, RuntimeError> {
        let version = typed::<(), i32>(instance, store, "engine_abi_version")?
            .call_async(&mut *store, ())
            .await
            .map_err(|e| RuntimeError::trap("engine_abi_version", e.to_string()))?;
        if version != ABI_VERSION {
            return Err(RuntimeError::abi_mismatch(format!(
                "guest speaks version {version}, host expects {ABI_VERSION}"
            )));
        }

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| RuntimeError::abi_mismatch("missing exported memory `memory`"))?;

        Ok(Self {
            memory,
            malloc: typed(instance, store, "malloc")?,
            free: typed(instance, store, "free")?,
            engine_new: typed(instance, store, "engine_new")?,
            engine_delete: typed(instance, store, "engine_delete")?,
            engine_load_model: typed(instance, store, "engine_load_model")?,
            engine_set_variable: typed(instance, store, "engine_set_variable")?,
            engine_clear_input: typed(instance, store, "engine_clear_input")?,
            engine_load_input: typed(instance, store, "engine_load_input")?,
            engine_extract: typed(instance, store, "engine_extract")?,
            engine_last_error: typed(instance, store, "engine_last_error")?,
        })
    }
}

fn typed<P, R>(
    instance: &Instance,
    store: &mut Store<ClientContext>,
    name: &str,
) -> Result<TypedFunc<P, R>, RuntimeError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| RuntimeError::abi_mismatch(format!("export `{name}`: {e}")))
}
