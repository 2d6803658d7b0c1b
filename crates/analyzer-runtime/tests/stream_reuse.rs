//! Two tasks on one stream share a single capture worker.

mod common;

use analyzer_core::config::OutputTarget;
use analyzer_core::retry::BackoffPolicy;
use analyzer_core::{StatusKind, WorkerState};
use analyzer_mock::SyntheticConfig;
use analyzer_runtime::{ProcessManager, StaticCatalog};
use common::{algorithm, eventually, fast_config, stream, Harness};
use std::time::Duration;

fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_stream(stream("cam1", 32, 32, 25.0))
        .with_algorithm(algorithm("person", serde_json::json!({ "label": "person" })))
        .with_algorithm(algorithm("vehicle", serde_json::json!({ "label": "car" })))
}

async fn process_ids(manager: &ProcessManager) -> Vec<String> {
    manager
        .get_status()
        .await
        .processes
        .into_iter()
        .map(|p| p.id)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_capture_two_inference_workers() {
    let harness = Harness::new(fast_config(), SyntheticConfig::default());
    let manager = harness.manager(catalog());

    manager
        .create_task("t1", "cam1", "person", OutputTarget::default())
        .await
        .unwrap();
    manager
        .create_task("t2", "cam1", "vehicle", OutputTarget::default())
        .await
        .unwrap();

    assert_eq!(
        process_ids(&manager).await,
        vec!["stream_cam1", "algo_cam1_person", "algo_cam1_vehicle", "alarm_handler"]
    );
    assert_eq!(manager.get_status().await.stream_refs.get("cam1"), Some(&2));

    // both algorithms see the stream
    assert!(
        eventually(Duration::from_secs(3), || {
            ["cam1/person", "cam1/vehicle"].iter().all(|key| {
                harness
                    .record(StatusKind::Algo, key)
                    .is_some_and(|r| r.processed > 0)
            })
        })
        .await
    );
    assert_eq!(harness.connector.connections(), 1);

    manager.stop_task("t1", true, true).await.unwrap();
    assert_eq!(
        process_ids(&manager).await,
        vec!["stream_cam1", "algo_cam1_vehicle", "alarm_handler"]
    );
    assert_eq!(manager.get_status().await.stream_refs.get("cam1"), Some(&1));
    assert_eq!(
        harness.ctx.status.state(StatusKind::Algo, "cam1/person"),
        Some(WorkerState::Stopped)
    );
    assert_eq!(
        harness.ctx.status.state(StatusKind::Stream, "cam1"),
        Some(WorkerState::Running)
    );

    manager.stop_task("t2", true, true).await.unwrap();
    assert_eq!(process_ids(&manager).await, vec!["alarm_handler"]);
    assert!(manager.get_status().await.stream_refs.is_empty());
    assert_eq!(
        harness.ctx.status.state(StatusKind::Stream, "cam1"),
        Some(WorkerState::Stopped)
    );
    assert_eq!(harness.connector.closes(), 1);

    // models nobody uses any more are unloaded
    let models = manager.get_status().await.models;
    assert_eq!(models.len(), 2);
    assert!(models
        .iter()
        .all(|m| m.status == analyzer_models::ModelStatus::Unloaded && m.pool_size == 0));

    let report = manager.shutdown().await;
    assert_eq!(report.graceful, vec!["alarm_handler".to_string()]);
    assert_eq!(harness.ctx.arena.stats().busy, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_stream_after_last_task() {
    let harness = Harness::new(fast_config(), SyntheticConfig::default());
    let manager = harness.manager(catalog());

    manager
        .create_task("t1", "cam1", "person", OutputTarget::default())
        .await
        .unwrap();
    manager.stop_task("t1", false, true).await.unwrap();
    manager
        .create_task("t1", "cam1", "person", OutputTarget::default())
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(2), || harness.connector.connections() == 2).await
    );
    assert_eq!(manager.get_status().await.stream_refs.get("cam1"), Some(&1));
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_capture_is_replaced_by_next_task() {
    let mut config = fast_config();
    config.capture.reconnect = BackoffPolicy {
        max_retries: 0,
        ..BackoffPolicy::default()
    };
    let source = SyntheticConfig {
        refuse_first_connects: 1,
        ..SyntheticConfig::default()
    };
    let harness = Harness::new(config, source);
    let manager = harness.manager(catalog());

    manager
        .create_task("t1", "cam1", "person", OutputTarget::default())
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = manager.get_status().await;
        if status.processes.iter().any(|p| p.id == "stream_cam1" && !p.alive) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "capture never gave up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        harness.ctx.status.state(StatusKind::Stream, "cam1"),
        Some(WorkerState::Error)
    );
    assert_eq!(harness.connector.connections(), 0);

    manager
        .create_task("t2", "cam1", "vehicle", OutputTarget::default())
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(3), || harness.connector.connections() == 1).await
    );
    let status = manager.get_status().await;
    let capture = status.processes.iter().find(|p| p.id == "stream_cam1").unwrap();
    assert!(capture.alive);
    assert_eq!(status.stream_refs.get("cam1"), Some(&2));

    // the replacement feeds the task that was already waiting too
    assert!(
        eventually(Duration::from_secs(3), || {
            ["cam1/person", "cam1/vehicle"].iter().all(|key| {
                harness
                    .record(StatusKind::Algo, key)
                    .is_some_and(|r| r.processed > 0)
            })
        })
        .await
    );
    manager.shutdown().await;
}
