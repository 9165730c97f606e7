//! Worker task owning one engine client.
//!
//! A worker initializes its client, reports the outcome exactly once, then
//! serves requests until the pool shuts down. It pulls work: while idle it
//! offers a [`Slot`] on the pool's ready channel, and only a submitter that
//! takes the slot hands it a request. The client never leaves the worker's
//! task.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use tessera_common::RuntimeError;
use tessera_core::SandboxRunner;

use crate::client::{ClientConfig, EngineClient};
use crate::request::{Request, Slot};

/// Lifecycle of a pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Initializing its engine client.
    Starting,
    /// Waiting for a request.
    Ready,
    /// Processing a request.
    Busy,
    /// Closing its engine client.
    ShuttingDown,
    /// Finished.
    Closed,
}

/// Startup outcome of one worker.
pub(crate) type StartupReport = (usize, Result<(), RuntimeError>);

pub(crate) struct Worker {
    pub index: usize,
    pub runner: Arc<SandboxRunner>,
    pub config: ClientConfig,
    pub ready: mpsc::Sender<Slot>,
    pub shutdown: CancellationToken,
    pub state: watch::Sender<WorkerState>,
    pub startup: mpsc::Sender<StartupReport>,
}

impl Worker {
    /// Run until shutdown.
    ///
    /// Returns the client's close result. A worker that failed to start
    /// returns `Ok`: its error was already delivered as its startup report.
    pub(crate) async fn run(self) -> Result<(), RuntimeError> {
        let Worker {
            index,
            runner,
            config,
            ready,
            shutdown,
            state,
            startup,
        } = self;

        let initialized =
            EngineClient::initialize(&runner, format!("worker-{index}"), config).await;
        let mut client = match initialized {
            Ok(client) => {
                state.send_replace(WorkerState::Ready);
                let _ = startup.send((index, Ok(()))).await;
                client
            }
            Err(e) => {
                state.send_replace(WorkerState::Closed);
                let _ = startup.send((index, Err(e))).await;
                return Ok(());
            }
        };
        drop(startup);

        while let Some(request) = next_request(&ready, &shutdown).await {
            if request.is_abandoned() {
                debug!(request_id = %request.id, "Submitter stopped waiting; request skipped");
                continue;
            }

            state.send_replace(WorkerState::Busy);
            let Request {
                id,
                input,
                options,
                respond,
            } = request;

            let start = Instant::now();
            let result = client
                .process(input, &options)
                .instrument(info_span!("request", request_id = %id))
                .await;

            match &result {
                Ok(text) => info!(
                    request_id = %id,
                    duration_ms = start.elapsed().as_millis(),
                    bytes_len = text.len(),
                    "Request processed"
                ),
                Err(e) => warn!(
                    request_id = %id,
                    duration_ms = start.elapsed().as_millis(),
                    error = %e,
                    "Request failed"
                ),
            }

            if respond.send(result).is_err() {
                debug!(request_id = %id, "Submitter stopped waiting; response dropped");
            }

            if client.is_closed() {
                state.send_replace(WorkerState::Closed);
                return Err(RuntimeError::unrecoverable(format!(
                    "worker {index} lost its engine client to a guest trap"
                )));
            }
            state.send_replace(WorkerState::Ready);
        }

        state.send_replace(WorkerState::ShuttingDown);
        let result = client.close().await;
        state.send_replace(WorkerState::Closed);
        debug!("Worker stopped");
        result
    }
}

/// Offer a slot and wait for a submitter to fill it.
///
/// Returns `None` on shutdown or once the pool stopped taking slots. A
/// request handed over before shutdown is still returned.
async fn next_request(
    ready: &mpsc::Sender<Slot>,
    shutdown: &CancellationToken,
) -> Option<Request> {
    loop {
        let (slot, filled) = oneshot::channel();
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return None,
            offered = ready.send(slot) => offered.ok()?,
        }

        tokio::select! {
            biased;
            request = filled => match request {
                Ok(request) => return Some(request),
                // The pool dropped the slot unused
                Err(_) => continue,
            },
            () = shutdown.cancelled() => return None,
        }
    }
}
