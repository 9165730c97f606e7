//! Core Wasmtime runtime for tessera.
//!
//! This crate provides everything needed to drive one guest engine:
//! - [`WasmEngine`]: Configured Wasmtime engine, shared process-wide
//! - [`GuestModule`]: Compiled guest, shared by every client
//! - [`ClientContext`]: Per-client store state
//! - [`SandboxRunner`] and [`Sandbox`]: Instantiation and guarded guest calls
//! - [`memory`]: The bridge moving byte streams in and strings out
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared by every pool, thread-safe)                    │
//! │  - Optional pooling allocator                           │
//! │  - Compiled code cache                                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │             GuestModule + SandboxRunner                 │
//! │  (Compiled once, linker shared by a pool's clients)     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │            Sandbox (Store<ClientContext>)               │
//! │  (One per client, lives as long as the client)          │
//! │  - Linear memory, grows only                            │
//! │  - Guest logs and progress callback                     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod engine;
pub mod memory;
pub mod module;
pub mod sandbox;
pub mod store;

pub use abi::{ExtractOptions, GuestExports, LoadOptions, OutputKind, ProgressCallback};
pub use engine::WasmEngine;
pub use memory::{GuestRegion, InputSource};
pub use module::GuestModule;
pub use sandbox::{Sandbox, SandboxRunner};
pub use store::{ClientContext, LogEntry, LogLevel, OutputRedirection, OutputSink};
