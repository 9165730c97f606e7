//! Per-client store context and store creation.
//!
//! This module provides:
//! - [`ClientContext`]: Per-client state reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`OutputRedirection`]: Where the guest's stdout and stderr go
//!
//! Unlike a per-request store, a client's store lives as long as the client
//! itself, so everything kept here is bounded.

use std::collections::VecDeque;
use std::time::Instant;

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use crate::abi::ProgressCallback;
use tessera_common::{OutputMode, RuntimeError, SandboxConfig};

/// Number of guest log lines kept per client.
pub const GUEST_LOG_CAPACITY: usize = 64;

/// Per-client execution context.
///
/// Host functions reach this through [`wasmtime::Caller::data_mut`].
pub struct ClientContext {
    /// WASI preview1 context.
    wasi: WasiP1Ctx,

    /// Memory limits enforced on the guest.
    limits: StoreLimits,

    /// Client identifier for tracing.
    pub client_id: String,

    progress: ProgressState,

    /// Most recent guest log lines, oldest first.
    logs: VecDeque<LogEntry>,
}

/// Progress forwarding state for the guest call in flight.
#[derive(Default)]
pub struct ProgressState {
    /// Callback installed for the current extraction, if any.
    pub callback: Option<ProgressCallback>,

    /// Last percentage forwarded to the callback.
    pub last: Option<u8>,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl ClientContext {
    fn new(wasi: WasiP1Ctx, limits: StoreLimits, client_id: String) -> Self {
        Self {
            wasi,
            limits,
            client_id,
            progress: ProgressState::default(),
            logs: VecDeque::with_capacity(GUEST_LOG_CAPACITY),
        }
    }

    /// The WASI context, for linking preview1 imports.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Record a guest log line, evicting the oldest when full.
    pub fn log(&mut self, level: LogLevel, message: String) {
        if self.logs.len() == GUEST_LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Recent guest log lines, oldest first.
    pub fn logs(&self) -> impl ExactSizeIterator<Item = &LogEntry> {
        self.logs.iter()
    }

    /// Install the progress callback for the next guest call.
    pub fn set_progress(&mut self, callback: Option<ProgressCallback>) {
        self.progress = ProgressState {
            callback,
            last: None,
        };
    }

    /// Progress state, for the progress host function.
    pub fn progress_mut(&mut self) -> &mut ProgressState {
        &mut self.progress
    }
}

/// Destination of one guest output stream.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// Write to the host process' stream.
    #[default]
    Inherit,
    /// Drop everything.
    Discard,
    /// Keep everything in memory, readable through the pipe's `contents()`.
    Capture(MemoryOutputPipe),
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Inherit => write!(f, "Inherit"),
            OutputSink::Discard => write!(f, "Discard"),
            OutputSink::Capture(_) => write!(f, "Capture"),
        }
    }
}

impl From<OutputMode> for OutputSink {
    fn from(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Inherit => OutputSink::Inherit,
            OutputMode::Discard => OutputSink::Discard,
        }
    }
}

/// Where the guest's stdout and stderr go.
#[derive(Debug, Clone, Default)]
pub struct OutputRedirection {
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl OutputRedirection {
    /// Redirection described by a sandbox configuration.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            stdout: config.guest_stdout.into(),
            stderr: config.guest_stderr.into(),
        }
    }

    fn apply(&self, builder: &mut WasiCtxBuilder) {
        match &self.stdout {
            OutputSink::Inherit => {
                builder.inherit_stdout();
            }
            // The builder's default stream is a sink
            OutputSink::Discard => {}
            OutputSink::Capture(pipe) => {
                builder.stdout(pipe.clone());
            }
        }
        match &self.stderr {
            OutputSink::Inherit => {
                builder.inherit_stderr();
            }
            OutputSink::Discard => {}
            OutputSink::Capture(pipe) => {
                builder.stderr(pipe.clone());
            }
        }
    }
}

/// Create a new Wasmtime store for one client.
///
/// # Errors
///
/// Returns `InvalidConfig` if the memory limit is zero.
pub fn create_store(
    engine: &WasmEngine,
    config: &SandboxConfig,
    output: &OutputRedirection,
    client_id: String,
) -> Result<Store<ClientContext>, RuntimeError> {
    if config.max_memory_mb == 0 {
        return Err(RuntimeError::invalid_config(
            "Sandbox memory limit must be greater than zero",
        ));
    }

    let mut builder = WasiCtxBuilder::new();
    output.apply(&mut builder);
    let wasi = builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size(config.max_memory_bytes())
        .instances(1)
        .build();

    let mut store = Store::new(engine.inner(), ClientContext::new(wasi, limits, client_id));
    store.limiter(|ctx| &mut ctx.limits);

    Ok(store)
}
