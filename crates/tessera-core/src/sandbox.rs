//! Sandbox instantiation and guarded guest calls.
//!
//! [`SandboxRunner`] pairs a compiled [`GuestModule`] with the linker that
//! provides the guest's imports. It is built once and shared by every
//! client of a pool.
//!
//! A [`Sandbox`] is one live instance of the guest with its own store. Every
//! guest call goes through [`Sandbox::call`], which distinguishes a call
//! that failed to execute (a trap) from a call that returned normally. After
//! a trap the sandbox is closed for good: guest state may be inconsistent,
//! so every later call is refused.

use std::time::Instant;

use tracing::{debug, error, instrument};
use wasmtime::{Instance, Linker, Store, Trap, TypedFunc, WasmParams, WasmResults};

use crate::GuestModule;
use crate::abi::GuestExports;
use crate::module::LiveInstance;
use crate::store::ClientContext;
use tessera_common::RuntimeError;

/// Instantiates sandboxes of one guest module.
///
/// Thread-safe; share it behind an `Arc`.
pub struct SandboxRunner {
    module: GuestModule,
    linker: Linker<ClientContext>,
}

impl SandboxRunner {
    /// Create a runner with an empty linker.
    ///
    /// Host functions are registered through [`SandboxRunner::linker_mut`].
    pub fn new(module: GuestModule) -> Self {
        let linker = Linker::new(module.engine().inner());
        Self { module, linker }
    }

    /// Get a mutable reference to the linker.
    pub fn linker_mut(&mut self) -> &mut Linker<ClientContext> {
        &mut self.linker
    }

    /// The module this runner instantiates.
    pub fn module(&self) -> &GuestModule {
        &self.module
    }

    /// Instantiate the guest into `store`.
    ///
    /// Runs the optional `_initialize` reactor export once, then resolves
    /// and version-checks the call contract.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `CompilationFailed` if instantiation fails (unsatisfied import,
    ///   pooling limit reached, memory limit exceeded)
    /// - `AbiMismatch` if the guest does not implement the contract
    /// - `Trap` if `_initialize` traps
    #[instrument(skip(self, store), fields(client_id = %store.data().client_id))]
    pub async fn instantiate(
        &self,
        mut store: Store<ClientContext>,
    ) -> Result<Sandbox, RuntimeError> {
        let start = Instant::now();

        let instance = self
            .linker
            .instantiate_async(&mut store, self.module.inner())
            .await
            .map_err(|e| RuntimeError::compilation_failed(format!("Instantiation failed: {e}")))?;

        // The guard must exist before any guest code runs
        let live = self.module.track_instance();

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            debug!("Running reactor initializer");
            init.call_async(&mut store, ())
                .await
                .map_err(|e| RuntimeError::trap("_initialize", describe_trap(&e)))?;
        }

        let exports = GuestExports::resolve(&instance, &mut store).await?;

        debug!(
            duration_ms = start.elapsed().as_millis(),
            "Sandbox instantiated"
        );

        Ok(Sandbox {
            store,
            instance,
            exports,
            closed: false,
            _live: live,
        })
    }
}

impl std::fmt::Debug for SandboxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRunner")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// One live guest instance.
pub struct Sandbox {
    store: Store<ClientContext>,
    instance: Instance,
    exports: GuestExports,
    closed: bool,
    _live: LiveInstance,
}

impl Sandbox {
    /// Call a guest export.
    ///
    /// `select` picks the export from the resolved contract.
    ///
    /// # Errors
    ///
    /// - `Unrecoverable` if the sandbox is already closed
    /// - `Trap` if the call fails to execute; the sandbox is closed
    pub async fn call<P, R>(
        &mut self,
        operation: &'static str,
        select: impl FnOnce(&GuestExports) -> &TypedFunc<P, R>,
        params: P,
    ) -> Result<R, RuntimeError>
    where
        P: WasmParams + Send + Sync,
        R: WasmResults + Send + Sync,
    {
        if self.closed {
            return Err(RuntimeError::unrecoverable(format!(
                "'{operation}' called on a closed sandbox"
            )));
        }

        let func = select(&self.exports).clone();
        match func.call_async(&mut self.store, params).await {
            Ok(results) => Ok(results),
            Err(e) => {
                let message = describe_trap(&e);
                error!(
                    client_id = %self.store.data().client_id,
                    operation,
                    trap_message = %message,
                    "Guest call trapped, closing sandbox"
                );
                self.closed = true;
                Err(RuntimeError::trap(operation, message))
            }
        }
    }

    /// Look up an export outside the call contract.
    pub fn get_typed_func<P, R>(&mut self, name: &str) -> Result<TypedFunc<P, R>, RuntimeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| RuntimeError::abi_mismatch(format!("export `{name}`: {e}")))
    }

    /// Returns `true` once the sandbox trapped or was shut down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refuse every further guest call.
    pub fn shutdown(&mut self) {
        self.closed = true;
    }

    /// The guest's linear memory.
    pub fn memory(&self) -> &[u8] {
        self.exports.memory.data(&self.store)
    }

    /// The guest's linear memory, mutably.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.exports.memory.data_mut(&mut self.store)
    }

    /// The resolved call contract.
    pub fn exports(&self) -> &GuestExports {
        &self.exports
    }

    pub fn store(&self) -> &Store<ClientContext> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<ClientContext> {
        &mut self.store
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("client_id", &self.store.data().client_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Human-readable description of a failed guest call.
fn describe_trap(error: &wasmtime::Error) -> String {
    match error.downcast_ref::<Trap>() {
        Some(trap) => format!("{error} ({trap:?})"),
        None => error.to_string(),
    }
}
