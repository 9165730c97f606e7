//! Host function registration for Wasmtime linkers.
//!
//! This module wires everything a guest engine imports:
//! - WASI preview1, which the engine's libc needs
//! - `env.log` and `env.engine_progress`
//! - trapping stubs for any other import the guest declares

use tessera_common::RuntimeError;
use tessera_core::store::ClientContext;
use tessera_core::{GuestModule, SandboxRunner};
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use crate::logging::{LoggingHost, level_from_i32};
use crate::progress::ProgressHost;

/// Build a [`SandboxRunner`] for `module` with every host import linked.
///
/// Imports the host does not provide are defined to trap when called, so a
/// guest declaring them still instantiates.
pub fn create_sandbox_runner(module: &GuestModule) -> Result<SandboxRunner, RuntimeError> {
    let mut runner = SandboxRunner::new(module.clone());
    let linker = runner.linker_mut();

    register_all(linker)?;
    linker
        .define_unknown_imports_as_traps(module.inner())
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to stub unknown imports: {e}"))
        })?;

    debug!(content_hash = module.content_hash(), "Sandbox runner ready");
    Ok(runner)
}

/// Register all standard host functions on a core module linker.
///
/// This registers the following host functions:
/// - WASI preview1 (`wasi_snapshot_preview1::*`)
/// - `env::log` - Logging function for guest code
/// - `env::engine_progress` - Extraction progress reports
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<ClientContext>) -> Result<(), RuntimeError> {
    register_wasi(linker)?;
    register_logging(linker)?;
    register_progress(linker)?;
    Ok(())
}

/// Register the WASI preview1 imports.
pub fn register_wasi(linker: &mut Linker<ClientContext>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, ClientContext::wasi_mut).map_err(|e| {
        RuntimeError::invalid_config(format!("Failed to register WASI preview1: {e}"))
    })
}

/// Register the logging host function.
///
/// Registers `env::log(level: i32, ptr: i32, len: i32)` which allows guest
/// code to emit logs at various levels (debug, info, warn, error).
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Pointer to the message string in guest memory
/// - `len`: Length of the message in bytes (UTF-8)
pub fn register_logging(linker: &mut Linker<ClientContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, ClientContext>, level: i32, ptr: i32, len: i32| {
                if ptr < 0 || len < 0 {
                    warn!(ptr, len, "Invalid pointer or length (negative value)");
                    return;
                }

                let Some(memory) = caller
                    .get_export("memory")
                    .and_then(wasmtime::Extern::into_memory)
                else {
                    warn!("Memory export not found in guest module");
                    return;
                };

                // Owned copy so the context can be borrowed mutably below
                #[allow(clippy::cast_sign_loss)]
                let message = {
                    let data = memory.data(&caller);
                    let start = ptr as usize;
                    let Some(end) = start.checked_add(len as usize) else {
                        warn!(ptr, len, "Pointer + length overflow");
                        return;
                    };

                    let Some(bytes) = data.get(start..end) else {
                        warn!(
                            start,
                            end,
                            memory_size = data.len(),
                            "Memory access out of bounds"
                        );
                        return;
                    };

                    String::from_utf8_lossy(bytes).into_owned()
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register the progress host function.
///
/// Registers `env::engine_progress(percent: i32)`.
pub fn register_progress(linker: &mut Linker<ClientContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "engine_progress",
            |mut caller: Caller<'_, ClientContext>, percent: i32| {
                ProgressHost::report(caller.data_mut(), percent);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register progress function: {e}"))
        })?;

    Ok(())
}
