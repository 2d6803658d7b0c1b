//! Full pipeline through the process manager with mock collaborators.

mod common;

use analyzer_core::capabilities::{EncoderLauncher, EncoderParams, EncoderSession};
use analyzer_core::config::{AnalyzerConfig, OutputTarget};
use analyzer_core::{AnalyzerResult, StatusBoard, StatusKind, WorkerState};
use analyzer_mock::{AfterLimit, FramePattern, RecordingEncoderLauncher, SyntheticConfig};
use analyzer_runtime::StaticCatalog;
use async_trait::async_trait;
use common::{algorithm, eventually, fast_config, stream, Harness};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records whether the pair was already `Ready` when the encoder was started.
struct ReadyCheckingLauncher {
    inner: RecordingEncoderLauncher,
    status: parking_lot::Mutex<Option<StatusBoard>>,
    ready_at_spawn: AtomicBool,
}

#[async_trait]
impl EncoderLauncher for ReadyCheckingLauncher {
    async fn spawn(&self, params: &EncoderParams) -> AnalyzerResult<Box<dyn EncoderSession>> {
        let ready = self
            .status
            .lock()
            .as_ref()
            .and_then(|status| status.state(StatusKind::Algo, "cam1/person"))
            == Some(WorkerState::Ready);
        self.ready_at_spawn.store(ready, Ordering::SeqCst);
        self.inner.spawn(params).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ten_frames_with_frame_skip_one() {
    let mut config = fast_config();
    config.inference.frame_skip = 1;
    let source = SyntheticConfig {
        fps: Some(10.0),
        frame_limit: Some(10),
        pattern: FramePattern::Solid(7),
        after_limit: AfterLimit::Idle,
        ..SyntheticConfig::default()
    };

    let recorder = RecordingEncoderLauncher::new();
    let launcher = Arc::new(ReadyCheckingLauncher {
        inner: recorder.clone(),
        status: parking_lot::Mutex::new(None),
        ready_at_spawn: AtomicBool::new(false),
    });
    let harness = Harness::with_encoders(config, source, recorder, launcher.clone());
    *launcher.status.lock() = Some(harness.ctx.status.clone());

    let manager = harness.manager(
        StaticCatalog::new()
            .with_stream(stream("cam1", 64, 64, 10.0))
            .with_algorithm(algorithm("person", serde_json::json!({ "label": "person" }))),
    );
    let output = OutputTarget {
        enabled: true,
        url: Some("rtsp://localhost:8554/cam1_person".into()),
    };
    manager.create_task("t1", "cam1", "person", output).await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || harness.encoder.frame_count() == 5).await,
        "encoder received {} frames",
        harness.encoder.frame_count()
    );
    // let any stray frame surface
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.connector.frames_served(), 10);
    let algo = harness.record(StatusKind::Algo, "cam1/person").unwrap();
    assert_eq!(algo.processed, 5);
    assert_eq!(algo.skipped, 5);
    assert_eq!(algo.state, WorkerState::Ready);
    assert_eq!(harness.detector.counters().inferences(), 5);

    let results = harness
        .ctx
        .queues
        .result_queue(&analyzer_core::PairKey::new("cam1", "person"))
        .stats();
    assert_eq!(results.pushed, 5);

    assert!(launcher.ready_at_spawn.load(Ordering::SeqCst));
    let spawns = harness.encoder.spawns();
    assert_eq!(spawns.len(), 1);
    assert_eq!((spawns[0].width, spawns[0].height), (64, 64));
    assert_eq!(spawns[0].fps, 10.0);
    assert!(harness.encoder.frames().iter().all(|f| f.len == 64 * 64 * 3));

    // one alarm: the rest fall inside the cooldown window
    assert!(eventually(Duration::from_secs(2), || harness.sink.records().len() == 1).await);
    let record = &harness.sink.records()[0];
    assert_eq!(record["type"], "alarm");
    assert_eq!(record["stream_id"], "cam1");
    assert_eq!(record["task_id"], "t1");
    assert_eq!(record["label"], "person");

    let report = manager.shutdown().await;
    assert!(!report.deadline_exceeded);
    assert!(report.killed.is_empty());
    assert_eq!(harness.ctx.arena.stats().busy, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_reports_pipeline() {
    let harness = Harness::new(fast_config(), SyntheticConfig::default());
    let manager = harness.manager(
        StaticCatalog::new()
            .with_stream(stream("cam1", 32, 32, 25.0))
            .with_algorithm(algorithm("person", serde_json::json!({}))),
    );
    manager
        .create_task("t1", "cam1", "person", OutputTarget::default())
        .await
        .unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            harness
                .record(StatusKind::Algo, "cam1/person")
                .is_some_and(|r| r.processed > 0)
        })
        .await
    );

    let status = manager.get_status().await;
    assert_eq!(status.tasks.len(), 1);
    assert_eq!(status.stream_refs.get("cam1"), Some(&1));
    assert!(status.processes.iter().all(|p| p.alive));
    assert!(status.workers.streams.contains_key("cam1"));
    assert!(status.workers.algos.contains_key("cam1/person"));
    assert_eq!(status.models.len(), 1);
    assert_eq!(status.arena.capacity, harness.ctx.config.arena.slot_count);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["processes"][0]["id"], "stream_cam1");

    manager.shutdown().await;
}

/// Eight slots, with queues that together pin at most six of them.
fn small_arena_config() -> AnalyzerConfig {
    let mut config = fast_config();
    config.arena.slot_count = 8;
    config.arena.slot_capacity_bytes = 32 * 32 * 3;
    config.queues.frame_capacity = 4;
    config.queues.result_capacity = 2;
    config.validate().unwrap();
    config
}

fn small_catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_stream(stream("cam1", 32, 32, 100.0))
        .with_algorithm(algorithm("person", serde_json::json!({ "label": "person" })))
}

fn processed(harness: &Harness) -> u64 {
    harness
        .record(StatusKind::Algo, "cam1/person")
        .map_or(0, |r| r.processed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_without_output_runs_past_slot_count() {
    let config = small_arena_config();
    let slots = config.arena.slot_count as u64;
    let source = SyntheticConfig {
        fps: Some(100.0),
        ..SyntheticConfig::default()
    };
    let harness = Harness::new(config, source);
    let manager = harness.manager(small_catalog());
    manager
        .create_task("t1", "cam1", "person", OutputTarget::default())
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), || processed(&harness) > 4 * slots).await,
        "inference stalled after {} frames",
        processed(&harness)
    );
    let status = manager.get_status().await;
    assert!(status.queues.iter().all(|q| !q.name.starts_with("results:")));
    assert!(status.arena.busy < status.arena.capacity);
    assert!(harness.encoder.spawns().is_empty());

    manager.shutdown().await;
    assert_eq!(harness.ctx.arena.stats().busy, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inference_continues_after_output_gives_up() {
    let mut config = small_arena_config();
    config.output.max_encoder_restarts = 1;
    let slots = config.arena.slot_count as u64;
    let source = SyntheticConfig {
        fps: Some(100.0),
        ..SyntheticConfig::default()
    };
    let encoder = RecordingEncoderLauncher::new();
    encoder.fail_next_spawns(u32::MAX);
    let harness = Harness::with_encoders(config, source, encoder.clone(), Arc::new(encoder));
    let manager = harness.manager(small_catalog());
    let output = OutputTarget {
        enabled: true,
        url: Some("rtsp://localhost:8554/cam1_person".into()),
    };
    manager.create_task("t1", "cam1", "person", output).await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || {
            harness.ctx.status.state(StatusKind::Output, "cam1/person") == Some(WorkerState::Error)
        })
        .await
    );
    let pair = analyzer_core::PairKey::new("cam1", "person");
    assert!(!harness.ctx.queues.has_output(&pair));

    // nobody reads the result queue any more, inference must not pin the arena with it
    let before = processed(&harness);
    assert!(
        eventually(Duration::from_secs(5), || processed(&harness) > before + 4 * slots).await,
        "inference stalled after {} frames",
        processed(&harness)
    );
    let results = harness.ctx.queues.result_queue(&pair).stats();
    assert_eq!(results.len, 0);
    assert!(harness.ctx.arena.stats().busy < slots as usize);

    manager.shutdown().await;
    assert_eq!(harness.ctx.arena.stats().busy, 0);
}
