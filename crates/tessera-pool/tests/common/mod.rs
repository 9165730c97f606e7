//! Shared fixtures for the pool integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parking_lot::Condvar;
use tokio::sync::mpsc;

use tessera_common::EngineConfig;
use tessera_core::store::{OutputRedirection, OutputSink};
use tessera_core::{GuestModule, ProgressCallback, Sandbox, WasmEngine};
use tessera_pool::PoolConfig;

pub const MOCK_ENGINE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../fixtures/mock_engine.wat"
));

/// Model data the mock engine accepts.
pub const MODEL: &[u8] = b"MODEL v1 weights";

pub fn module() -> GuestModule {
    module_with(&EngineConfig::default())
}

pub fn module_with(config: &EngineConfig) -> GuestModule {
    let engine = WasmEngine::new(config).unwrap();
    GuestModule::from_wat(&engine, MOCK_ENGINE).unwrap()
}

pub fn quiet() -> OutputRedirection {
    OutputRedirection {
        stdout: OutputSink::Discard,
        stderr: OutputSink::Discard,
    }
}

pub fn pool_config(module: GuestModule) -> PoolConfig {
    PoolConfig {
        output: quiet(),
        startup_timeout: Some(Duration::from_secs(30)),
        ..PoolConfig::new(module, MODEL)
    }
}

pub async fn live_allocations(sandbox: &mut Sandbox) -> i32 {
    let func = sandbox
        .get_typed_func::<(), i32>("debug_live_allocations")
        .unwrap();
    func.call_async(sandbox.store_mut(), ()).await.unwrap()
}

/// Blocks progress callbacks until opened.
///
/// Progress callbacks run synchronously inside the guest call, so a closed
/// gate holds a worker mid-request.
#[derive(Default)]
pub struct Gate {
    open: parking_lot::Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

/// Progress callback that records every report, announces the first one on
/// `entered`, and then waits for `gate`.
pub fn gated_progress(
    gate: Arc<Gate>,
    entered: mpsc::UnboundedSender<()>,
    seen: Arc<Mutex<Vec<u8>>>,
) -> ProgressCallback {
    Arc::new(move |percent| {
        seen.lock().unwrap().push(percent);
        if percent == 0 {
            let _ = entered.send(());
            gate.wait();
        }
    })
}

/// Progress callback that only records.
pub fn recording_progress(seen: Arc<Mutex<Vec<u8>>>) -> ProgressCallback {
    Arc::new(move |percent| seen.lock().unwrap().push(percent))
}
