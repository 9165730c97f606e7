//! Fixed-size pool of engine clients.
//!
//! [`EnginePool`] runs one tokio task per engine client. Idle workers offer
//! themselves on a ready channel; a submitter waits for the next offer and
//! hands its request straight to that worker, which answers on the
//! request's private response slot. Nothing is queued, so a submitter that
//! gives up before a worker is free leaves no work behind.
//!
//! # Startup
//!
//! Startup is all-or-nothing: [`EnginePool::new`] waits until every worker
//! has reported, and if any of them fails (or the startup deadline passes)
//! the ones that did start are shut down before the error is returned.
//!
//! # Memory
//!
//! Guest linear memory grows but never shrinks, so each client's footprint
//! is the largest it has ever needed. There is no recycling; to release the
//! memory, close the pool and build a new one. Compiling the guest is the
//! expensive part of that, and the [`GuestModule`] in [`PoolConfig`] is
//! shared, so rebuilding does not recompile.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use tessera_common::{ModelConfig, RuntimeError, SandboxConfig};
use tessera_core::store::OutputRedirection;
use tessera_core::{GuestModule, InputSource};
use tessera_host::create_sandbox_runner;

use crate::client::ClientConfig;
use crate::request::{Request, Slot, SubmitOptions};
use crate::worker::{StartupReport, Worker, WorkerState};

const WAITING_FOR_WORKER: &str = "waiting for an available worker";
const WAITING_FOR_RESPONSE: &str = "waiting for the worker's response";
const STARTING_WORKERS: &str = "starting workers";

/// Everything shared by the clients of one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Compiled guest; clone one module into many pools.
    pub module: GuestModule,

    /// Trained model data, shared by every client.
    pub training_data: Bytes,

    /// Language and variables.
    pub model: ModelConfig,

    /// Per-client memory limit and output modes.
    pub sandbox: SandboxConfig,

    /// Guest stdout and stderr destinations.
    pub output: OutputRedirection,

    /// Upper bound on the whole startup. `None` waits indefinitely.
    pub startup_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Configuration with default model, sandbox and output settings.
    pub fn new(module: GuestModule, training_data: impl Into<Bytes>) -> Self {
        let sandbox = SandboxConfig::default();
        Self {
            module,
            training_data: training_data.into(),
            model: ModelConfig::default(),
            output: OutputRedirection::from_config(&sandbox),
            sandbox,
            startup_timeout: None,
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            model: Some(InputSource::Bytes(self.training_data.clone())),
            model_config: self.model.clone(),
            sandbox: self.sandbox.clone(),
            output: self.output.clone(),
        }
    }
}

struct WorkerHandle {
    index: usize,
    task: JoinHandle<Result<(), RuntimeError>>,
}

/// A fixed-size pool of engine clients.
///
/// Share it behind an `Arc` to submit from many tasks.
pub struct EnginePool {
    ready: Mutex<mpsc::Receiver<Slot>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<WorkerHandle>>,
    states: Vec<watch::Receiver<WorkerState>>,
}

impl EnginePool {
    /// Start `count` workers and wait until every one of them is ready.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` for a zero count or empty training data; no worker
    ///   is started
    /// - `WorkerStartup` for each worker that failed, joined with
    ///   [`RuntimeError::join`]
    /// - `Timeout` if `startup_timeout` passed first
    #[instrument(skip(config), fields(module = config.module.content_hash()))]
    pub async fn new(count: usize, config: PoolConfig) -> Result<Self, RuntimeError> {
        if count == 0 {
            return Err(RuntimeError::invalid_config(
                "worker count must be greater than zero",
            ));
        }
        if config.training_data.is_empty() {
            return Err(RuntimeError::invalid_config("training data is empty"));
        }

        let runner = Arc::new(create_sandbox_runner(&config.module)?);
        // Only workers hold senders: the channel closes once all have exited
        let (ready_tx, ready) = mpsc::channel(count);
        let shutdown = CancellationToken::new();
        let (startup_tx, mut startup_rx) = mpsc::channel(count);

        let mut workers = Vec::with_capacity(count);
        let mut states = Vec::with_capacity(count);
        for index in 0..count {
            let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
            let worker = Worker {
                index,
                runner: Arc::clone(&runner),
                config: config.client_config(),
                ready: ready_tx.clone(),
                shutdown: shutdown.clone(),
                state: state_tx,
                startup: startup_tx.clone(),
            };
            let task = tokio::spawn(worker.run().instrument(info_span!("worker", worker = index)));
            workers.push(WorkerHandle { index, task });
            states.push(state_rx);
        }
        drop(startup_tx);
        drop(ready_tx);

        let pool = Self {
            ready: Mutex::new(ready),
            shutdown,
            workers: Mutex::new(workers),
            states,
        };

        let outcome = await_startup(count, &mut startup_rx, config.startup_timeout).await;
        if let Err(first) = outcome {
            pool.shutdown.cancel();
            // Close errors are a consequence of the failure being reported
            let _ = pool.join_workers().await;

            // Workers still starting when the first failure arrived have
            // reported by now
            let mut errors = vec![first];
            while let Ok((worker, report)) = startup_rx.try_recv() {
                if let Err(source) = report {
                    errors.push(RuntimeError::WorkerStartup {
                        worker,
                        source: Box::new(source),
                    });
                }
            }
            warn!(failures = errors.len(), "Pool startup failed");
            return Err(flatten(errors));
        }

        info!(workers = count, "Engine pool ready");
        Ok(pool)
    }

    /// Process `input` on the next idle worker.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the deadline passes while waiting
    /// - `Cancelled` if the caller's token fires or the pool shuts down while
    ///   waiting; work a worker already accepted still completes
    /// - `Unrecoverable` if every worker has exited
    /// - any error from the engine client
    pub async fn submit(
        &self,
        input: impl Into<InputSource>,
        options: SubmitOptions,
    ) -> Result<String, RuntimeError> {
        let SubmitOptions {
            extract,
            deadline,
            cancel,
        } = options;
        let cancel = cancel.unwrap_or_default();
        let (mut request, response) = Request::new(input.into(), extract);
        let request_id = request.id;

        let expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        loop {
            let slot = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    return Err(RuntimeError::cancelled(WAITING_FOR_WORKER, "pool is shutting down"));
                }
                () = cancel.cancelled() => {
                    return Err(RuntimeError::cancelled(WAITING_FOR_WORKER, "caller cancelled"));
                }
                () = &mut expired => {
                    return Err(RuntimeError::Timeout { stage: WAITING_FOR_WORKER });
                }
                slot = self.next_slot() => slot.ok_or_else(|| {
                    RuntimeError::unrecoverable("every worker has exited")
                })?,
            };
            match slot.send(request) {
                Ok(()) => break,
                // The worker behind this slot exited before taking it
                Err(returned) => request = returned,
            }
        }
        debug!(request_id = %request_id, "Request accepted by a worker");

        tokio::select! {
            biased;
            response = response => response.unwrap_or_else(|_| {
                Err(RuntimeError::unrecoverable(format!(
                    "request {request_id} was dropped without a response"
                )))
            }),
            () = self.shutdown.cancelled() => {
                Err(RuntimeError::cancelled(WAITING_FOR_RESPONSE, "pool is shutting down"))
            }
            () = cancel.cancelled() => {
                Err(RuntimeError::cancelled(WAITING_FOR_RESPONSE, "caller cancelled"))
            }
            () = &mut expired => Err(RuntimeError::Timeout { stage: WAITING_FOR_RESPONSE }),
        }
    }

    /// Shut the pool down and close every client.
    ///
    /// Requests already accepted by a worker finish first. Close errors from
    /// all workers are joined. Concurrent callers all wait for the same
    /// shutdown; every call after the first returns `Ok`.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        self.shutdown.cancel();
        let errors = self.join_workers().await;

        info!(errors = errors.len(), "Engine pool closed");
        RuntimeError::join(errors)
    }

    /// Current state of every worker, by index.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states.iter().map(|state| *state.borrow()).collect()
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Always `false`: a pool has at least one worker.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    async fn next_slot(&self) -> Option<Slot> {
        self.ready.lock().await.recv().await
    }

    /// Join every worker. The lock is held throughout, so a concurrent
    /// caller returns only after the workers have exited.
    async fn join_workers(&self) -> Vec<RuntimeError> {
        let mut workers = self.workers.lock().await;

        let mut errors = Vec::new();
        for WorkerHandle { index, task } in workers.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(RuntimeError::unrecoverable(format!(
                    "worker {index} panicked: {e}"
                ))),
            }
        }
        errors
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        // Workers still close their clients; nobody waits for them
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("workers", &self.worker_states())
            .finish_non_exhaustive()
    }
}

/// Wait for `count` startup reports, stopping at the first failure or when
/// `timeout` passes.
async fn await_startup(
    count: usize,
    reports: &mut mpsc::Receiver<StartupReport>,
    timeout: Option<Duration>,
) -> Result<(), RuntimeError> {
    let startup = collect_reports(count, reports);
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, startup)
            .await
            .unwrap_or(Err(RuntimeError::Timeout {
                stage: STARTING_WORKERS,
            })),
        None => startup.await,
    }
}

async fn collect_reports(
    count: usize,
    reports: &mut mpsc::Receiver<StartupReport>,
) -> Result<(), RuntimeError> {
    for _ in 0..count {
        match reports.recv().await {
            Some((_, Ok(()))) => {}
            Some((worker, Err(source))) => {
                return Err(RuntimeError::WorkerStartup {
                    worker,
                    source: Box::new(source),
                });
            }
            None => {
                return Err(RuntimeError::unrecoverable(
                    "a worker exited without reporting its startup",
                ));
            }
        }
    }
    Ok(())
}

fn flatten(errors: Vec<RuntimeError>) -> RuntimeError {
    match RuntimeError::join(errors) {
        Err(e) => e,
        Ok(()) => RuntimeError::unrecoverable("pool startup failed"),
    }
}
