//! Services shared by every worker of one pipeline.
//!
//! A [`PipelineContext`] is built once by the process manager and cloned into each
//! worker at spawn time. It owns the only state that crosses worker boundaries: the
//! frame arena, the queues, the status board and the alarm cooldown table.

use analyzer_core::capabilities::{EncoderLauncher, MediaRecorder, NotificationSink, SourceConnector};
use analyzer_core::config::AnalyzerConfig;
use analyzer_core::health::{HealthMonitorConfig, SystemHealthMonitor};
use analyzer_core::{
    AlarmEvent, BoundedQueue, FrameArena, FrameRef, OverflowPolicy, PairKey, QueueStats,
    ResultRef, StatusBoard,
};
use analyzer_models::{ModelRegistry, PackageTable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::io::{FfmpegEncoderLauncher, FfmpegSourceConnector, LogSink, RawSnapshotRecorder, TcpJsonSink};

/// Frame queues (one per inference subscriber), result queues and the alarm queue.
///
/// A capture worker fans every frame out to all frame queues of its stream, so two
/// algorithms on one stream each see every frame. Each queued copy holds its own arena
/// reference.
///
/// Results are only worth queueing while a stream-out worker reads them. The worker
/// holds an [`OutputLease`] for its pair; inference checks
/// [`has_output`](Self::has_output) before producing a result, and the last lease to go
/// drains whatever is left so no slot stays pinned by an unread queue.
pub struct QueueHub {
    frame_capacity: usize,
    result_capacity: usize,
    frames: Mutex<HashMap<PairKey, Arc<BoundedQueue<FrameRef>>>>,
    results: Mutex<HashMap<PairKey, Arc<BoundedQueue<ResultRef>>>>,
    outputs: Mutex<HashMap<PairKey, usize>>,
    alarms: Arc<BoundedQueue<AlarmEvent>>,
}

/// A stream-out worker's claim on its pair's result queue.
///
/// Dropping the lease, including when the worker task is aborted, detaches the
/// consumer.
pub struct OutputLease {
    hub: Arc<QueueHub>,
    pair: PairKey,
}

impl OutputLease {
    /// The leased result queue.
    pub fn results(&self) -> Arc<BoundedQueue<ResultRef>> {
        self.hub.result_queue(&self.pair)
    }
}

impl Drop for OutputLease {
    fn drop(&mut self) {
        self.hub.detach_output(&self.pair);
    }
}

impl QueueHub {
    /// Empty hub with the given capacities.
    pub fn new(
        frame_capacity: usize,
        result_capacity: usize,
        alarm_capacity: usize,
        alarm_push_timeout: Duration,
    ) -> Self {
        Self {
            frame_capacity,
            result_capacity,
            frames: Mutex::default(),
            results: Mutex::default(),
            outputs: Mutex::default(),
            alarms: Arc::new(BoundedQueue::new(
                "alarms",
                alarm_capacity,
                OverflowPolicy::Block {
                    timeout: alarm_push_timeout,
                },
            )),
        }
    }

    /// Frame queue feeding the pair's inference worker, created on first use.
    pub fn frame_queue(&self, pair: &PairKey) -> Arc<BoundedQueue<FrameRef>> {
        let mut frames = self.frames.lock();
        let queue = frames.entry(pair.clone()).or_insert_with(|| {
            Arc::new(BoundedQueue::new(
                format!("frames:{pair}"),
                self.frame_capacity,
                OverflowPolicy::DropOldest,
            ))
        });
        Arc::clone(queue)
    }

    /// Every frame queue subscribed to `stream_id`.
    pub fn frame_subscribers(&self, stream_id: &str) -> Vec<Arc<BoundedQueue<FrameRef>>> {
        self.frames
            .lock()
            .iter()
            .filter(|(pair, _)| pair.stream_id == stream_id)
            .map(|(_, queue)| Arc::clone(queue))
            .collect()
    }

    /// Result queue between the pair's inference and stream-out workers.
    pub fn result_queue(&self, pair: &PairKey) -> Arc<BoundedQueue<ResultRef>> {
        let mut results = self.results.lock();
        let queue = results.entry(pair.clone()).or_insert_with(|| {
            Arc::new(BoundedQueue::new(
                format!("results:{pair}"),
                self.result_capacity,
                OverflowPolicy::DropOldest,
            ))
        });
        Arc::clone(queue)
    }

    /// Register a result consumer for `pair`.
    pub fn attach_output(self: &Arc<Self>, pair: &PairKey) -> OutputLease {
        *self.outputs.lock().entry(pair.clone()).or_insert(0) += 1;
        self.result_queue(pair);
        OutputLease {
            hub: Arc::clone(self),
            pair: pair.clone(),
        }
    }

    /// Whether a stream-out worker currently reads `pair`'s results.
    pub fn has_output(&self, pair: &PairKey) -> bool {
        self.outputs.lock().get(pair).is_some_and(|n| *n > 0)
    }

    fn detach_output(&self, pair: &PairKey) {
        let last = {
            let mut outputs = self.outputs.lock();
            match outputs.get_mut(pair) {
                Some(n) if *n > 1 => {
                    *n -= 1;
                    false
                }
                Some(_) => {
                    outputs.remove(pair);
                    true
                }
                None => false,
            }
        };
        if !last {
            return;
        }
        let queue = self.results.lock().get(pair).cloned();
        let drained = queue.map_or(0, |q| q.drain());
        debug!(%pair, drained, "result consumer detached");
    }

    /// The process-wide alarm queue.
    pub fn alarms(&self) -> Arc<BoundedQueue<AlarmEvent>> {
        Arc::clone(&self.alarms)
    }

    /// Unsubscribe a pair, releasing everything still queued for it.
    pub fn remove_pair(&self, pair: &PairKey) -> usize {
        let frames = self.frames.lock().remove(pair);
        let results = self.results.lock().remove(pair);
        let drained = frames.map_or(0, |q| q.drain()) + results.map_or(0, |q| q.drain());
        debug!(%pair, drained, "pair queues removed");
        drained
    }

    /// Empty every queue. Queued frames are released exactly once.
    pub fn drain_all(&self) -> usize {
        let frames: Vec<_> = self.frames.lock().values().cloned().collect();
        let results: Vec<_> = self.results.lock().values().cloned().collect();
        frames.iter().map(|q| q.drain()).sum::<usize>()
            + results.iter().map(|q| q.drain()).sum::<usize>()
            + self.alarms.drain()
    }

    /// Counters of every queue, sorted by name.
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self.frames.lock().values().map(|q| q.stats()).collect();
        stats.extend(self.results.lock().values().map(|q| q.stats()));
        stats.push(self.alarms.stats());
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

/// Last alarm time per (stream, algorithm) pair.
///
/// Kept outside the inference worker so a restarted worker honours the window its
/// predecessor opened.
#[derive(Default)]
pub struct CooldownTracker {
    last_alarm: Mutex<HashMap<PairKey, Instant>>,
}

impl CooldownTracker {
    /// Claim an alarm slot for `pair`. Returns `false` while the pair is cooling down.
    pub fn try_acquire(&self, pair: &PairKey, cooldown: Duration) -> bool {
        let now = Instant::now();
        let mut last_alarm = self.last_alarm.lock();
        match last_alarm.get(pair) {
            Some(last) if now.duration_since(*last) < cooldown => false,
            _ => {
                last_alarm.insert(pair.clone(), now);
                true
            }
        }
    }

    /// Forget a pair's window.
    pub fn reset(&self, pair: &PairKey) {
        self.last_alarm.lock().remove(pair);
    }
}

/// Everything a worker needs, passed explicitly at spawn time.
#[derive(Clone)]
pub struct PipelineContext {
    /// Loaded configuration.
    pub config: Arc<AnalyzerConfig>,
    /// Shared frame slots.
    pub arena: FrameArena,
    /// All hand-off queues.
    pub queues: Arc<QueueHub>,
    /// Status snapshot surface.
    pub status: StatusBoard,
    /// Model pools.
    pub models: ModelRegistry,
    /// Heartbeats and error history.
    pub health: SystemHealthMonitor,
    /// Per-pair alarm cooldown.
    pub cooldowns: Arc<CooldownTracker>,
    /// Opens capture sources.
    pub sources: Arc<dyn SourceConnector>,
    /// Starts encoders.
    pub encoders: Arc<dyn EncoderLauncher>,
    /// Alarm destination.
    pub sink: Arc<dyn NotificationSink>,
    /// Optional alarm media recorder.
    pub recorder: Option<Arc<dyn MediaRecorder>>,
}

impl PipelineContext {
    /// Start building a context from configuration and registered packages.
    pub fn builder(config: AnalyzerConfig, packages: PackageTable) -> PipelineContextBuilder {
        PipelineContextBuilder {
            config,
            packages,
            sources: None,
            encoders: None,
            sink: None,
            recorder: None,
        }
    }
}

/// Builder for [`PipelineContext`]. Adapters left unset come from configuration.
pub struct PipelineContextBuilder {
    config: AnalyzerConfig,
    packages: PackageTable,
    sources: Option<Arc<dyn SourceConnector>>,
    encoders: Option<Arc<dyn EncoderLauncher>>,
    sink: Option<Arc<dyn NotificationSink>>,
    recorder: Option<Arc<dyn MediaRecorder>>,
}

impl PipelineContextBuilder {
    /// Use `sources` instead of the ffmpeg capture source.
    pub fn with_sources(mut self, sources: Arc<dyn SourceConnector>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Use `encoders` instead of the ffmpeg encoder.
    pub fn with_encoders(mut self, encoders: Arc<dyn EncoderLauncher>) -> Self {
        self.encoders = Some(encoders);
        self
    }

    /// Use `sink` instead of the configured notification endpoint.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Record alarm media with `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn MediaRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Assemble the context.
    pub fn build(self) -> PipelineContext {
        let config = self.config;
        let queues = QueueHub::new(
            config.queues.frame_capacity,
            config.queues.result_capacity,
            config.queues.alarm_capacity,
            config.queues.alarm_push_timeout,
        );
        let status = match &config.status.snapshot_dir {
            Some(dir) => StatusBoard::with_snapshot_dir(dir),
            None => StatusBoard::new(),
        };
        let sources = self
            .sources
            .unwrap_or_else(|| {
                Arc::new(FfmpegSourceConnector::new(&config.capture.decoder_binary)) as Arc<dyn SourceConnector>
            });
        let encoders = self
            .encoders
            .unwrap_or_else(|| {
                Arc::new(FfmpegEncoderLauncher::new(&config.output.encoder_binary)) as Arc<dyn EncoderLauncher>
            });
        let sink = self.sink.unwrap_or_else(|| match &config.alarm.sink_addr {
            Some(addr) => Arc::new(TcpJsonSink::new(addr.clone())) as Arc<dyn NotificationSink>,
            None => Arc::new(LogSink),
        });
        let recorder = self.recorder.or_else(|| {
            config
                .inference
                .snapshot_dir
                .as_ref()
                .map(|dir| Arc::new(RawSnapshotRecorder::new(dir)) as Arc<dyn MediaRecorder>)
        });

        PipelineContext {
            arena: FrameArena::new(config.arena.slot_count, config.arena.slot_capacity_bytes),
            queues: Arc::new(queues),
            status,
            models: ModelRegistry::new(self.packages),
            health: SystemHealthMonitor::new(HealthMonitorConfig {
                heartbeat_timeout: config.supervisor.heartbeat_timeout,
                ..Default::default()
            }),
            cooldowns: Arc::default(),
            sources,
            encoders,
            sink,
            recorder,
            config: Arc::new(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_core::{FrameShape, PixelDtype};

    #[test]
    fn test_fan_out_subscribers_per_stream() {
        let hub = QueueHub::new(4, 4, 4, Duration::from_millis(10));
        hub.frame_queue(&PairKey::new("cam", "a"));
        hub.frame_queue(&PairKey::new("cam", "b"));
        hub.frame_queue(&PairKey::new("other", "a"));
        assert_eq!(hub.frame_subscribers("cam").len(), 2);
        assert_eq!(hub.frame_subscribers("missing").len(), 0);
        // same pair, same queue
        assert!(Arc::ptr_eq(
            &hub.result_queue(&PairKey::new("cam", "a")),
            &hub.result_queue(&PairKey::new("cam", "a"))
        ));
    }

    #[tokio::test]
    async fn test_drain_all_releases_frames() {
        let arena = FrameArena::new(2, 12);
        let hub = QueueHub::new(4, 4, 4, Duration::from_millis(10));
        let pair = PairKey::new("cam", "a");
        let slot = arena.allocate("cam").unwrap();
        let frame = arena
            .write(slot, &[1; 12], FrameShape::bgr(2, 2), PixelDtype::U8)
            .unwrap();
        hub.frame_queue(&pair).push(frame.clone()).await;
        hub.result_queue(&pair)
            .push(ResultRef {
                frame,
                detections: Vec::new(),
                annotated: false,
            })
            .await;
        assert_eq!(arena.stats().free, 1);

        assert_eq!(hub.drain_all(), 2);
        assert_eq!(arena.stats().free, 2);
    }

    #[tokio::test]
    async fn test_output_lease_releases_unread_results() {
        let arena = FrameArena::new(4, 12);
        let hub = Arc::new(QueueHub::new(4, 4, 4, Duration::from_millis(10)));
        let pair = PairKey::new("cam", "a");
        assert!(!hub.has_output(&pair));

        let lease = hub.attach_output(&pair);
        assert!(hub.has_output(&pair));
        for value in 0..3u8 {
            let slot = arena.allocate("cam").unwrap();
            let frame = arena
                .write(slot, &[value; 12], FrameShape::bgr(2, 2), PixelDtype::U8)
                .unwrap();
            lease
                .results()
                .push(ResultRef {
                    frame,
                    detections: Vec::new(),
                    annotated: false,
                })
                .await;
        }
        assert_eq!(arena.stats().busy, 3);

        let second = hub.attach_output(&pair);
        drop(lease);
        // another consumer still reads the queue
        assert!(hub.has_output(&pair));
        assert_eq!(arena.stats().busy, 3);

        drop(second);
        assert!(!hub.has_output(&pair));
        assert_eq!(arena.stats().busy, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_window() {
        let tracker = CooldownTracker::default();
        let pair = PairKey::new("cam", "a");
        let cooldown = Duration::from_secs(10);

        assert!(tracker.try_acquire(&pair, cooldown));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!tracker.try_acquire(&pair, cooldown));
        assert!(tracker.try_acquire(&PairKey::new("cam", "b"), cooldown));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(tracker.try_acquire(&pair, cooldown));
    }
}
