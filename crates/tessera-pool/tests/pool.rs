//! Integration tests for the engine pool.
//!
//! These tests run real workers against the mock engine and verify:
//! - All-or-nothing startup
//! - Fair dispatch and per-request isolation under concurrency
//! - Deadlines and cancellation while waiting
//! - Graceful shutdown with work in flight

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use tessera_common::{EngineConfig, RuntimeError};
use tessera_core::ExtractOptions;
use tessera_pool::{EnginePool, PoolConfig, SubmitOptions, WorkerState};

mod common;

use common::{Gate, gated_progress, module, module_with, pool_config, recording_progress};

async fn pool(count: usize) -> Arc<EnginePool> {
    Arc::new(EnginePool::new(count, pool_config(module())).await.unwrap())
}

fn gated(
    gate: &Arc<Gate>,
    entered: &mpsc::UnboundedSender<()>,
) -> (SubmitOptions, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress = gated_progress(Arc::clone(gate), entered.clone(), Arc::clone(&seen));
    let options = SubmitOptions::default().with_extract(ExtractOptions {
        progress: Some(progress),
        ..Default::default()
    });
    (options, seen)
}

/// Every individual failure inside a startup error.
fn startup_failures(err: &RuntimeError) -> Vec<&RuntimeError> {
    match err {
        RuntimeError::Multiple(errors) => errors.iter().collect(),
        other => vec![other],
    }
}

// ============================================================================
// Test: Startup
// ============================================================================

#[tokio::test]
async fn test_zero_workers_is_rejected() {
    let module = module();

    let err = assert_err!(EnginePool::new(0, pool_config(module.clone())).await);

    assert!(err.is_config());
    assert_eq!(module.live_instances(), 0);
}

#[tokio::test]
async fn test_empty_training_data_is_rejected() {
    let config = PoolConfig {
        training_data: Bytes::new(),
        ..pool_config(module())
    };

    let err = assert_err!(EnginePool::new(2, config).await);

    assert!(err.is_config());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_reports_worker_failure() {
    let module = module();
    let config = PoolConfig {
        training_data: b"junk"[..].into(),
        ..pool_config(module.clone())
    };

    let err = assert_err!(EnginePool::new(1, config).await);

    let RuntimeError::WorkerStartup { worker, source } = &err else {
        panic!("expected WorkerStartup, got {err:?}");
    };
    assert_eq!(*worker, 0);
    assert!(source.is_engine());
    assert_eq!(module.live_instances(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_startup_failure_shuts_down_started_workers() {
    let engine_config = EngineConfig {
        pooling_allocator: true,
        max_instances: 2,
        instance_memory_mb: 64,
        ..Default::default()
    };
    let module = module_with(&engine_config);

    let err = assert_err!(EnginePool::new(3, pool_config(module.clone())).await);

    let failures = startup_failures(&err);
    assert!(!failures.is_empty());
    assert!(
        failures
            .iter()
            .all(|e| matches!(e, RuntimeError::WorkerStartup { .. })),
        "got {err:?}"
    );
    assert_eq!(module.live_instances(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_ready_after_startup() {
    let pool = pool(3).await;

    assert_eq!(pool.len(), 3);
    assert!(!pool.is_empty());
    assert_eq!(pool.worker_states(), vec![WorkerState::Ready; 3]);

    assert_ok!(pool.close().await);
    assert_eq!(pool.worker_states(), vec![WorkerState::Closed; 3]);
}

// ============================================================================
// Test: Submit
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_returns_text() {
    let pool = pool(1).await;

    let text = pool
        .submit(b"scanned page".to_vec(), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(text, "scanned page");
    assert_ok!(pool.close().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_get_their_own_results() {
    let pool = pool(5).await;

    let mut tasks = JoinSet::new();
    for i in 0..10 {
        let pool = Arc::clone(&pool);
        tasks.spawn(async move {
            let input = if i % 2 == 0 {
                format!("alpha-{i}")
            } else {
                format!("beta-{i}")
            };
            let text = pool
                .submit(input.clone().into_bytes(), SubmitOptions::default())
                .await;
            (input, text)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (input, text) = joined.unwrap();
        assert_eq!(text.unwrap(), input);
    }
    assert_ok!(pool.close().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_error_reaches_submitter() {
    let pool = pool(1).await;

    let err = assert_err!(pool.submit(b"!bad".to_vec(), SubmitOptions::default()).await);
    assert!(err.is_engine());

    // The worker survives a domain error
    let text = pool
        .submit(b"next".to_vec(), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "next");
    assert_ok!(pool.close().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn test_deadline_expires_while_workers_are_busy() {
    let pool = pool(2).await;
    let gate = Gate::new();
    let (entered_tx, mut entered) = mpsc::unbounded_channel();

    let mut busy = JoinSet::new();
    for input in ["first", "second"] {
        let pool = Arc::clone(&pool);
        let (options, _) = gated(&gate, &entered_tx);
        busy.spawn(async move { pool.submit(input.as_bytes().to_vec(), options).await });
    }
    entered.recv().await.unwrap();
    entered.recv().await.unwrap();

    let options = SubmitOptions::default().with_timeout(Duration::from_millis(200));
    let err = assert_err!(pool.submit(b"third".to_vec(), options).await);
    assert_eq!(err.to_string(), "Timed out waiting for an available worker");

    gate.open();
    while let Some(joined) = busy.join_next().await {
        assert_ok!(joined.unwrap());
    }
    assert_ok!(pool.close().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_cancellation_while_waiting() {
    let pool = pool(1).await;
    let gate = Gate::new();
    let (entered_tx, mut entered) = mpsc::unbounded_channel();

    let (options, _) = gated(&gate, &entered_tx);
    let busy = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.submit(b"busy".to_vec(), options).await }
    });
    entered.recv().await.unwrap();

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        }
    });
    let err = assert_err!(
        pool.submit(b"waiting".to_vec(), SubmitOptions::default().with_cancel(token))
            .await
    );
    assert!(err.is_cancelled(), "got {err:?}");

    gate.open();
    assert_eq!(busy.await.unwrap().unwrap(), "busy");
    assert_ok!(pool.close().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_request_is_never_processed() {
    let pool = pool(1).await;
    let gate = Gate::new();
    let (entered_tx, mut entered) = mpsc::unbounded_channel();

    let (options, _) = gated(&gate, &entered_tx);
    let busy = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.submit(b"busy".to_vec(), options).await }
    });
    entered.recv().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let options = SubmitOptions::default()
        .with_extract(ExtractOptions {
            progress: Some(recording_progress(Arc::clone(&seen))),
            ..Default::default()
        })
        .with_timeout(Duration::from_millis(100));
    let err = assert_err!(pool.submit(b"abandoned".to_vec(), options).await);
    assert_eq!(err.to_string(), "Timed out waiting for an available worker");

    gate.open();
    assert_eq!(busy.await.unwrap().unwrap(), "busy");

    // The worker is idle again and must not have picked up the request
    let text = pool
        .submit(b"after".to_vec(), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "after");
    assert_ok!(pool.close().await);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_fails_once_every_worker_exited() {
    let pool = pool(1).await;

    let err = assert_err!(pool.submit(b"#trap".to_vec(), SubmitOptions::default()).await);
    assert!(matches!(err, RuntimeError::Trap { .. }), "got {err:?}");

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        pool.submit(b"after".to_vec(), SubmitOptions::default()),
    )
    .await
    .expect("submit must not wait for a worker that no longer exists");

    let err = assert_err!(outcome);
    assert!(
        matches!(err, RuntimeError::Unrecoverable { .. }),
        "got {err:?}"
    );
    assert_eq!(pool.worker_states(), vec![WorkerState::Closed]);
}

// ============================================================================
// Test: Shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_waits_for_workers() {
    let pool = pool(1).await;
    let gate = Gate::new();
    let (entered_tx, mut entered) = mpsc::unbounded_channel();

    let (options, _) = gated(&gate, &entered_tx);
    let submitter = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.submit(b"in flight".to_vec(), options).await }
    });
    entered.recv().await.unwrap();

    let first = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.close().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move {
            let result = pool.close().await;
            (result, pool.worker_states())
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());
    assert_eq!(pool.worker_states(), vec![WorkerState::Busy]);

    gate.open();
    assert_ok!(first.await.unwrap());
    let (result, states) = second.await.unwrap();
    assert_ok!(result);
    assert_eq!(states, vec![WorkerState::Closed]);
    assert_err!(submitter.await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_waits_for_in_flight_work() {
    let pool = pool(1).await;
    let gate = Gate::new();
    let (entered_tx, mut entered) = mpsc::unbounded_channel();

    let (options, seen) = gated(&gate, &entered_tx);
    let submitter = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.submit(b"in flight".to_vec(), options).await }
    });
    entered.recv().await.unwrap();

    let closer = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.close().await }
    });

    // The submitter stops waiting as soon as shutdown begins
    let err = assert_err!(submitter.await.unwrap());
    assert!(err.is_cancelled(), "got {err:?}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closer.is_finished());

    gate.open();
    assert_ok!(closer.await.unwrap());
    assert_eq!(*seen.lock().unwrap(), vec![0, 50, 100]);
    assert_eq!(pool.worker_states(), vec![WorkerState::Closed]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_after_close_is_cancelled() {
    let pool = pool(1).await;
    assert_ok!(pool.close().await);

    let err = assert_err!(pool.submit(b"late".to_vec(), SubmitOptions::default()).await);

    assert!(err.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_twice() {
    let module = module();
    let pool = EnginePool::new(2, pool_config(module.clone())).await.unwrap();
    assert_eq!(module.live_instances(), 2);

    assert_ok!(pool.close().await);
    assert_ok!(pool.close().await);
    assert_eq!(module.live_instances(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trap_is_reported_on_close() {
    let module = module();
    let pool = EnginePool::new(1, pool_config(module.clone())).await.unwrap();

    let err = assert_err!(pool.submit(b"#trap".to_vec(), SubmitOptions::default()).await);
    assert!(matches!(err, RuntimeError::Trap { .. }), "got {err:?}");

    let err = assert_err!(pool.close().await);
    assert!(err.is_unrecoverable());
    assert_eq!(pool.worker_states(), vec![WorkerState::Closed]);
    assert_eq!(module.live_instances(), 0);
}
