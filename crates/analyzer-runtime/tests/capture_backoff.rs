//! Capture worker reconnect behaviour on a paused clock.

mod common;

use analyzer_core::retry::BackoffPolicy;
use analyzer_core::{StatusKind, WorkerState};
use analyzer_mock::{AfterLimit, SyntheticConfig};
use analyzer_runtime::workers::CaptureWorker;
use common::{eventually, fast_config, stream, Harness};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn policy(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_secs(1),
        factor: 2.0,
        ceiling: Duration::from_secs(30),
        max_retries,
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_then_running() {
    let mut config = fast_config();
    config.capture.reconnect = policy(10);
    let source = SyntheticConfig {
        refuse_first_connects: 3,
        ..SyntheticConfig::default()
    };
    let harness = Harness::new(config, source);
    let worker = CaptureWorker::new(harness.ctx.clone(), stream("cam1", 8, 8, 25.0));
    let cancel = CancellationToken::new();
    let started = Instant::now();
    let task = tokio::spawn(worker.run(cancel.clone()));

    assert!(
        eventually(Duration::from_secs(60), || {
            harness.ctx.status.state(StatusKind::Stream, "cam1") == Some(WorkerState::Running)
        })
        .await
    );
    assert!(started.elapsed() >= Duration::from_secs(7));
    cancel.cancel();
    let report = task.await.unwrap();

    assert_eq!(
        report.history,
        vec![
            WorkerState::Starting,
            WorkerState::Connecting,
            WorkerState::Connecting,
            WorkerState::Connecting,
            WorkerState::Connecting,
            WorkerState::Running,
            WorkerState::Stopped,
        ]
    );
    // 1s + 2s + 4s
    assert_eq!(report.total_backoff, Duration::from_secs(7));
    assert_eq!(report.connections, 1);
    assert_eq!(harness.connector.connect_attempts(), 4);
    let record = harness.record(StatusKind::Stream, "cam1").unwrap();
    assert_eq!(record.errors, 3);
    assert_eq!(record.fps, Some(25.0));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped_by_ceiling() {
    let mut config = fast_config();
    config.capture.reconnect = BackoffPolicy {
        ceiling: Duration::from_secs(3),
        ..policy(10)
    };
    let source = SyntheticConfig {
        refuse_first_connects: 4,
        ..SyntheticConfig::default()
    };
    let harness = Harness::new(config, source);
    let worker = CaptureWorker::new(harness.ctx.clone(), stream("cam1", 8, 8, 25.0));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(worker.run(cancel.clone()));

    assert!(
        eventually(Duration::from_secs(60), || harness.connector.connections() == 1).await
    );
    cancel.cancel();
    let report = task.await.unwrap();
    // 1s + 2s + 3s + 3s
    assert_eq!(report.total_backoff, Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_retries() {
    let mut config = fast_config();
    config.capture.reconnect = policy(2);
    let source = SyntheticConfig {
        refuse_first_connects: u32::MAX,
        ..SyntheticConfig::default()
    };
    let harness = Harness::new(config, source);
    let worker = CaptureWorker::new(harness.ctx.clone(), stream("cam1", 8, 8, 25.0));

    let report = worker.run(CancellationToken::new()).await;

    assert_eq!(report.history.last(), Some(&WorkerState::Error));
    assert_eq!(report.total_backoff, Duration::from_secs(3));
    assert_eq!(harness.connector.connect_attempts(), 3);
    let record = harness.record(StatusKind::Stream, "cam1").unwrap();
    assert_eq!(record.state, WorkerState::Error);
    assert!(record.message.unwrap().contains("gave up"));
}

#[tokio::test(start_paused = true)]
async fn test_read_failures_force_reconnect() {
    let mut config = fast_config();
    config.capture.max_consecutive_failures = 2;
    config.capture.reconnect = policy(10);
    let source = SyntheticConfig {
        failing_reads: HashSet::from([3, 4]),
        after_limit: AfterLimit::Idle,
        ..SyntheticConfig::default()
    };
    let harness = Harness::new(config, source);
    let worker = CaptureWorker::new(harness.ctx.clone(), stream("cam1", 8, 8, 25.0));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(worker.run(cancel.clone()));

    assert!(
        eventually(Duration::from_secs(10), || harness.connector.connections() >= 2).await
    );
    cancel.cancel();
    let report = task.await.unwrap();

    assert!(report.history.contains(&WorkerState::Reconnecting));
    assert_eq!(report.total_backoff, Duration::ZERO);
    assert!(harness.connector.closes() >= 1);
    assert!(report.frames >= 2);
}
