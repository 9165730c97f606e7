//! Host functions implementation for tessera.
//!
//! This crate provides the host side of everything a guest engine imports.
//!
//! # Interfaces
//!
//! - [`logging`]: `env.log`, guest diagnostics re-emitted through `tracing`
//! - [`progress`]: `env.engine_progress`, forwarded to the caller's callback
//! - [`linker`]: WASI preview1 wiring, trapping stubs for unused imports and
//!   [`create_sandbox_runner`]

pub mod linker;
pub mod logging;
pub mod progress;

pub use linker::{create_sandbox_runner, register_all};
pub use logging::LoggingHost;
pub use progress::ProgressHost;
