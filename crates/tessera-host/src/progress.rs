//! Progress host function implementation.
//!
//! The guest reports extraction progress through `env.engine_progress`.
//! Reports are forwarded to the callback installed for the current call,
//! clamped to `0..=100`, and dropped if they would move progress backwards.

use tessera_core::store::ClientContext;
use tracing::trace;

/// Host implementation of `env.engine_progress`.
pub struct ProgressHost;

impl ProgressHost {
    /// Forward one progress report.
    ///
    /// Returns `true` if the installed callback was invoked.
    pub fn report(ctx: &mut ClientContext, percent: i32) -> bool {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = percent.clamp(0, 100) as u8;

        let state = ctx.progress_mut();
        let Some(callback) = state.callback.clone() else {
            return false;
        };
        if state.last.is_some_and(|last| percent < last) {
            trace!(percent, "Dropping regressing progress report");
            return false;
        }
        state.last = Some(percent);

        callback(percent);
        true
    }
}
