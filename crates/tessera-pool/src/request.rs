//! Requests travelling from callers to pool workers.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tessera_common::RuntimeError;
use tessera_core::{ExtractOptions, InputSource};

/// Result delivered to the submitter.
pub(crate) type Response = Result<String, RuntimeError>;

/// Slot an idle worker offers; a submitter fills it with one request.
pub(crate) type Slot = oneshot::Sender<Request>;

/// One unit of work for a worker.
///
/// The response slot holds one value, so a worker never blocks on a
/// submitter that stopped waiting.
pub(crate) struct Request {
    pub(crate) id: Uuid,
    pub(crate) input: InputSource,
    pub(crate) options: ExtractOptions,
    pub(crate) respond: oneshot::Sender<Response>,
}

impl Request {
    /// Create a request and the receiver for its response.
    pub(crate) fn new(
        input: InputSource,
        options: ExtractOptions,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (respond, response) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            input,
            options,
            respond,
        };
        (request, response)
    }

    /// Returns `true` once the submitter stopped waiting.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.respond.is_closed()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Per-call options for [`EnginePool::submit`](crate::EnginePool::submit).
///
/// The deadline and cancellation token only bound how long the caller
/// waits. Work a worker has already started always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Output kind, load flags and progress callback.
    pub extract: ExtractOptions,

    /// Give up waiting at this instant.
    pub deadline: Option<Instant>,

    /// Give up waiting once this token is cancelled.
    pub cancel: Option<CancellationToken>,
}

impl SubmitOptions {
    /// Options that give up waiting after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Options that give up waiting once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Options with the given extraction settings.
    pub fn with_extract(mut self, extract: ExtractOptions) -> Self {
        self.extract = extract;
        self
    }
}
