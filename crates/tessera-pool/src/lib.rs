//! Engine clients and the worker pool for tessera.
//!
//! - [`EngineClient`]: One sandbox plus one engine handle, driven through
//!   `&mut self`
//! - [`EnginePool`]: A fixed number of clients, each owned by its own tokio
//!   task, handed requests only when idle
//!
//! # Example
//!
//! ```ignore
//! use tessera_common::EngineConfig;
//! use tessera_core::{GuestModule, WasmEngine};
//! use tessera_pool::{EnginePool, PoolConfig, SubmitOptions};
//!
//! let engine = WasmEngine::new(&EngineConfig::default())?;
//! let module = GuestModule::from_file(&engine, "tesseract-core.wasm")?;
//! let pool = EnginePool::new(4, PoolConfig::new(module, std::fs::read("eng.traineddata")?)).await?;
//!
//! let text = pool.submit(std::fs::read("scan.png")?, SubmitOptions::default()).await?;
//! pool.close().await?;
//! ```

pub mod client;
pub mod pool;
pub mod request;
mod worker;

pub use client::{ClientConfig, ClientState, EngineClient};
pub use pool::{EnginePool, PoolConfig};
pub use request::SubmitOptions;
pub use worker::WorkerState;
