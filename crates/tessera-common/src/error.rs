//! Error types for tessera.
//!
//! Every layer reports through [`RuntimeError`], built with `thiserror`.
//! The variants are grouped by who is at fault:
//! - configuration and input problems detected on the host
//! - memory bridge failures (allocation, overflow, short copies)
//! - guest failures, split into domain errors the engine reported itself
//!   ([`RuntimeError::Engine`]) and guest calls that failed to execute at all
//!   ([`RuntimeError::Trap`])
//! - pool-level waiting failures (timeout, cancellation)

use std::fmt;
use std::io;

use thiserror::Error;

/// Top-level tessera errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Required input was missing or invalid (no trained model, zero workers).
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// The guest module could not be compiled or instantiated.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The guest module does not implement the engine ABI.
    #[error("Guest ABI mismatch: {reason}")]
    AbiMismatch {
        /// Which export was missing or had the wrong shape.
        reason: String,
    },

    /// An input stream had no bytes.
    #[error("Input is empty")]
    EmptyInput,

    /// A size does not fit the guest's 32-bit address space.
    #[error("Size of {size} bytes exceeds the guest address space")]
    Overflow {
        /// The requested size in bytes.
        size: u64,
    },

    /// The guest allocator could not provide the requested region.
    #[error("Guest allocation of {size} bytes failed")]
    AllocationFailed {
        /// The requested size in bytes.
        size: u64,
    },

    /// A copy across the memory boundary was short.
    #[error("Short copy into guest memory: wrote {written} of {expected} bytes")]
    Marshal {
        /// Bytes actually copied.
        written: u64,
        /// Bytes that should have been copied.
        expected: u64,
    },

    /// The engine rejected an operation and said why.
    #[error("Engine rejected {operation}: {message}")]
    Engine {
        /// The guest operation that failed.
        operation: String,
        /// The guest's own error message.
        message: String,
    },

    /// A guest call failed to execute (trap, stack overflow, memory fault).
    ///
    /// The sandbox is unusable afterwards.
    #[error("Guest call '{operation}' trapped: {message}")]
    Trap {
        /// The guest export that was being called.
        operation: String,
        /// Description of the trap.
        message: String,
    },

    /// A deadline expired while waiting.
    #[error("Timed out {stage}")]
    Timeout {
        /// What the caller was waiting for.
        stage: &'static str,
    },

    /// The caller or the pool gave up while waiting.
    #[error("Cancelled {stage}: {reason}")]
    Cancelled {
        /// What the caller was waiting for.
        stage: &'static str,
        /// Who cancelled.
        reason: String,
    },

    /// An internal invariant was violated (use after close, double free).
    #[error("Unrecoverable: {reason}")]
    Unrecoverable {
        /// Description of the violated invariant.
        reason: String,
    },

    /// A pool worker could not bring its client up.
    #[error("Worker {worker} failed to start: {source}")]
    WorkerStartup {
        /// Index of the worker.
        worker: usize,
        /// Why the worker failed.
        #[source]
        source: Box<RuntimeError>,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Several independent failures, e.g. from closing every pool worker.
    #[error("{}", DisplayMultiple(.0))]
    Multiple(Vec<RuntimeError>),
}

struct DisplayMultiple<'a>(&'a [RuntimeError]);

impl fmt::Display for DisplayMultiple<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl RuntimeError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `AbiMismatch` error.
    pub fn abi_mismatch(reason: impl Into<String>) -> Self {
        Self::AbiMismatch {
            reason: reason.into(),
        }
    }

    /// Create a new `Engine` error carrying the guest's message.
    pub fn engine(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Trap {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new `Cancelled` error.
    pub fn cancelled(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            stage,
            reason: reason.into(),
        }
    }

    /// Create a new `Unrecoverable` error.
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::Unrecoverable {
            reason: reason.into(),
        }
    }

    /// Combine independent results into one.
    ///
    /// Returns `Ok` for no errors, the error itself for exactly one, and
    /// [`RuntimeError::Multiple`] otherwise.
    pub fn join(errors: impl IntoIterator<Item = RuntimeError>) -> Result<(), Self> {
        let mut errors: Vec<_> = errors.into_iter().collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Returns `true` for configuration errors.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Returns `true` if the guest could not provide memory.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. } | Self::Overflow { .. })
    }

    /// Returns `true` for a short copy across the memory boundary.
    pub fn is_marshal(&self) -> bool {
        matches!(self, Self::Marshal { .. })
    }

    /// Returns `true` if the engine reported a domain error.
    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine { .. })
    }

    /// Returns `true` if a deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if the caller or the pool cancelled the wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if the affected client must not be used again.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. } | Self::Trap { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::engine("load_model", "model rejected");
        assert_eq!(err.to_string(), "Engine rejected load_model: model rejected");

        let err = RuntimeError::Marshal {
            written: 3,
            expected: 10,
        };
        assert_eq!(
            err.to_string(),
            "Short copy into guest memory: wrote 3 of 10 bytes"
        );

        let err = RuntimeError::Timeout {
            stage: "waiting for a response",
        };
        assert_eq!(err.to_string(), "Timed out waiting for a response");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let runtime_err: RuntimeError = io_err.into();

        assert!(matches!(runtime_err, RuntimeError::Io(_)));
    }

    #[test]
    fn test_join_empty_is_ok() {
        assert!(RuntimeError::join(Vec::new()).is_ok());
    }

    #[test]
    fn test_join_single_is_unwrapped() {
        let err = RuntimeError::join([RuntimeError::EmptyInput]).unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyInput));
    }

    #[test]
    fn test_join_many_lists_every_error() {
        let err = RuntimeError::join([
            RuntimeError::unrecoverable("worker 0 lost its client"),
            RuntimeError::engine("engine_delete", "busy"),
        ])
        .unwrap_err();

        let RuntimeError::Multiple(ref errors) = err else {
            panic!("expected Multiple, got {err:?}");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(
            err.to_string(),
            "Unrecoverable: worker 0 lost its client\nEngine rejected engine_delete: busy"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(RuntimeError::invalid_config("zero workers").is_config());
        assert!(RuntimeError::Overflow { size: 1 << 33 }.is_allocation());
        assert!(RuntimeError::AllocationFailed { size: 8 }.is_allocation());
        assert!(RuntimeError::trap("engine_extract", "unreachable").is_unrecoverable());
        assert!(RuntimeError::unrecoverable("use after close").is_unrecoverable());
        assert!(RuntimeError::cancelled("waiting", "pool shut down").is_cancelled());
        assert!(!RuntimeError::engine("x", "y").is_unrecoverable());
    }

    #[test]
    fn test_worker_startup_keeps_source() {
        let err = RuntimeError::WorkerStartup {
            worker: 2,
            source: Box::new(RuntimeError::engine("load_model", "model rejected")),
        };
        assert_eq!(
            err.to_string(),
            "Worker 2 failed to start: Engine rejected load_model: model rejected"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
