//! Alarm cooldown in the inference worker and delivery through the alarm worker.

mod common;

use analyzer_core::{AlarmEvent, BBox, Detection, FrameId, PairKey, StatusKind};
use analyzer_mock::SyntheticConfig;
use analyzer_runtime::workers::{AlarmWorker, InferenceWorker};
use common::{eventually, fast_config, Harness};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn pair() -> PairKey {
    PairKey::new("cam1", "person")
}

fn load_detector(harness: &Harness, config: serde_json::Value) -> String {
    let model_id = harness.ctx.models.register("mock", "detector", config).unwrap();
    harness.ctx.models.load(&model_id, 1).unwrap();
    model_id
}

async fn processed(harness: &Harness, count: u64) -> bool {
    eventually(Duration::from_secs(30), || {
        harness
            .record(StatusKind::Algo, "cam1/person")
            .is_some_and(|r| r.processed >= count)
    })
    .await
}

fn event(label: &str) -> AlarmEvent {
    let detection = Detection::new(label, 0.9, BBox::new(0.0, 0.0, 4.0, 4.0));
    AlarmEvent::new("t1", &pair(), FrameId(1), &detection, vec![detection.clone()])
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_suppresses_second_alarm() {
    let mut config = fast_config();
    config.inference.frame_skip = 0;
    config.inference.alarm_cooldown = Duration::from_secs(10);
    let harness = Harness::new(config, SyntheticConfig::default());
    let model_id = load_detector(&harness, serde_json::json!({ "confidence": 0.9 }));
    let frames = harness.ctx.queues.frame_queue(&pair());
    let worker = InferenceWorker::new(harness.ctx.clone(), "t1", pair(), model_id, 0.6);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(worker.run(cancel.clone()));

    frames.push(harness.frame("cam1", 16, 16, 1)).await;
    assert!(processed(&harness, 1).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    frames.push(harness.frame("cam1", 16, 16, 2)).await;
    assert!(processed(&harness, 2).await);

    assert_eq!(harness.ctx.queues.alarms().len(), 1);

    // outside the window a new alarm is raised
    tokio::time::sleep(Duration::from_secs(11)).await;
    frames.push(harness.frame("cam1", 16, 16, 3)).await;
    assert!(processed(&harness, 3).await);

    cancel.cancel();
    let report = task.await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.alarms, 2);
    assert_eq!(harness.ctx.queues.alarms().len(), 2);
    assert_eq!(harness.record(StatusKind::Algo, "cam1/person").unwrap().alarms, 2);
}

#[tokio::test(start_paused = true)]
async fn test_threshold_is_inclusive() {
    let mut config = fast_config();
    config.inference.frame_skip = 0;
    let harness = Harness::new(config, SyntheticConfig::default());
    let model_id = load_detector(&harness, serde_json::json!({ "confidence": 0.5 }));
    let frames = harness.ctx.queues.frame_queue(&pair());

    let cancel = CancellationToken::new();
    let below = InferenceWorker::new(harness.ctx.clone(), "t1", pair(), model_id.clone(), 0.51);
    let task = tokio::spawn(below.run(cancel.clone()));
    frames.push(harness.frame("cam1", 16, 16, 1)).await;
    assert!(processed(&harness, 1).await);
    cancel.cancel();
    assert_eq!(task.await.unwrap().alarms, 0);

    let cancel = CancellationToken::new();
    let at = InferenceWorker::new(harness.ctx.clone(), "t1", pair(), model_id, 0.5);
    let task = tokio::spawn(at.run(cancel.clone()));
    frames.push(harness.frame("cam1", 16, 16, 2)).await;
    assert!(processed(&harness, 2).await);
    cancel.cancel();
    assert_eq!(task.await.unwrap().alarms, 1);
}

#[tokio::test(start_paused = true)]
async fn test_alarm_worker_reconnects_and_retries() {
    let harness = Harness::new(fast_config(), SyntheticConfig::default());
    harness.sink.refuse_next_connects(2);
    harness.sink.fail_next_sends(1);
    let alarms = harness.ctx.queues.alarms();
    for label in ["a", "b", "c"] {
        assert!(alarms.push(event(label)).await);
    }

    let cancel = CancellationToken::new();
    let task = tokio::spawn(AlarmWorker::new(harness.ctx.clone()).run(cancel.clone()));
    assert!(eventually(Duration::from_secs(10), || harness.sink.records().len() == 3).await);
    cancel.cancel();
    let report = task.await.unwrap();

    let labels: Vec<_> = harness
        .sink
        .records()
        .iter()
        .map(|r| r["label"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["a", "b", "c"]);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.dropped, 0);
    // two refused, the first session, and the session after the failed send
    assert_eq!(harness.sink.connects(), 4);
    assert_eq!(report.connections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_alarm_dropped_after_failed_retry() {
    let harness = Harness::new(fast_config(), SyntheticConfig::default());
    harness.sink.fail_next_sends(2);
    let alarms = harness.ctx.queues.alarms();
    for label in ["a", "b"] {
        assert!(alarms.push(event(label)).await);
    }

    let cancel = CancellationToken::new();
    let task = tokio::spawn(AlarmWorker::new(harness.ctx.clone()).run(cancel.clone()));
    assert!(eventually(Duration::from_secs(10), || harness.sink.records().len() == 1).await);
    cancel.cancel();
    let report = task.await.unwrap();

    assert_eq!(harness.sink.records()[0]["label"], "b");
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 1);
    let errors = harness.ctx.health.get_error_history(None).await;
    assert!(errors.iter().any(|e| e.module_name == "alarm_handler"));
}

#[tokio::test]
async fn test_alarm_worker_stops_while_sink_down() {
    let harness = Harness::new(fast_config(), SyntheticConfig::default());
    harness.sink.refuse_next_connects(u32::MAX);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(AlarmWorker::new(harness.ctx.clone()).run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(report.connections, 0);
    assert!(harness.sink.connects() >= 2);
}
