//! Logging host function implementation.
//!
//! Guest engines report diagnostics through `env.log`. Each line is kept in
//! the client's bounded log ring and re-emitted through `tracing`.

use tessera_core::store::{ClientContext, LogLevel};
use tracing::{debug, error, info, warn};

/// Host implementation of `env.log`.
///
/// Logs are both:
/// 1. Stored in the [`ClientContext`] for later retrieval
/// 2. Emitted via the `tracing` crate for observability
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(ctx: &mut ClientContext, level: LogLevel, message: &str) {
        let client_id = ctx.client_id.as_str();
        match level {
            LogLevel::Debug => debug!(client_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(client_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(client_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(client_id, guest_log = true, "{}", message),
        }

        ctx.log(level, message.to_string());
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error. Unknown values map to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::{EngineConfig, SandboxConfig};
    use tessera_core::store::{OutputRedirection, create_store};
    use tessera_core::WasmEngine;

    #[test]
    fn test_logging_stores_in_context() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut store = create_store(
            &engine,
            &SandboxConfig::default(),
            &OutputRedirection::default(),
            "test-123".into(),
        )
        .unwrap();
        let ctx = store.data_mut();

        LoggingHost::log(ctx, LogLevel::Info, "Hello");
        LoggingHost::log(ctx, LogLevel::Error, "World");

        let logs: Vec<_> = ctx.logs().collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "Hello");
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[1].message, "World");
        assert_eq!(logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }
}
