//! Capture worker: opens a stream, decodes frames into the arena and fans them out.
//!
//! ```text
//! Starting ─► Connecting ──ok──► Running ──too many read failures──► Reconnecting ─┐
//!                 ▲  │                                                            │
//!                 │  └─fail: backoff sleep, retry (bounded) ─► Error              │
//!                 └───────────────────────────────────────────────────────────────┘
//! any state ── stop token ──► Stopped
//! ```

use super::Heartbeat;
use crate::context::PipelineContext;
use analyzer_core::capabilities::{DecodedFrame, FrameSource};
use analyzer_core::config::StreamDefinition;
use analyzer_core::health::ErrorSeverity;
use analyzer_core::{limits, StatusKind, WorkerState};
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a capture run did, for tests and logs.
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    /// Every state the worker published, in order.
    pub history: Vec<WorkerState>,
    /// Sum of reconnect backoff sleeps.
    pub total_backoff: Duration,
    /// Frames written into the arena.
    pub frames: u64,
    /// Frames dropped because the arena refused them.
    pub dropped: u64,
    /// Successful connections.
    pub connections: u32,
}

enum StreamEnd {
    Stopped,
    Reconnect,
}

/// Capture state machine for one stream.
pub struct CaptureWorker {
    ctx: PipelineContext,
    stream: StreamDefinition,
    report: CaptureReport,
    heartbeat: Heartbeat,
    drop_log: DropLog,
}

/// Folds frame drops into one warning per interval.
struct DropLog {
    interval: Duration,
    last_warned: Option<Instant>,
    suppressed: u64,
}

impl DropLog {
    /// Count a drop. Returns the number of drops the warning covers when one is due.
    fn record(&mut self) -> Option<u64> {
        self.suppressed += 1;
        let now = Instant::now();
        if self.last_warned.is_some_and(|at| now.duration_since(at) < self.interval) {
            return None;
        }
        self.last_warned = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}

impl CaptureWorker {
    /// Worker for `stream`.
    pub fn new(ctx: PipelineContext, stream: StreamDefinition) -> Self {
        let heartbeat = Heartbeat::new(
            ctx.health.clone(),
            format!("stream_{}", stream.id),
            ctx.config.supervisor.heartbeat_interval,
        );
        Self {
            ctx,
            stream,
            report: CaptureReport::default(),
            heartbeat,
            drop_log: DropLog {
                interval: limits::DROP_LOG_INTERVAL,
                last_warned: None,
                suppressed: 0,
            },
        }
    }

    async fn beat(&mut self) {
        let (frames, dropped) = (self.report.frames, self.report.dropped);
        self.heartbeat
            .beat(|| format!("{frames} frames, {dropped} dropped"))
            .await;
    }

    fn set_state(&mut self, state: WorkerState, message: Option<String>) {
        self.report.history.push(state);
        self.ctx
            .status
            .set_state(StatusKind::Stream, &self.stream.id, state, message);
    }

    /// Run until stopped or the reconnect budget is exhausted.
    pub async fn run(mut self, cancel: CancellationToken) -> CaptureReport {
        let policy = self.ctx.config.capture.reconnect.clone();
        let module = format!("stream_{}", self.stream.id);
        self.set_state(WorkerState::Starting, None);

        let mut retries = 0u32;
        let mut failed = false;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.beat().await;
            self.set_state(WorkerState::Connecting, None);
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.ctx.sources.open(&self.stream) => opened,
            };

            let mut source = match opened {
                Ok(source) => source,
                Err(e) => {
                    retries += 1;
                    self.bump_errors();
                    if policy.exhausted(retries) {
                        let message = format!("gave up after {} retries: {e}", retries - 1);
                        error!(stream_id = %self.stream.id, %message, "capture failed");
                        self.ctx
                            .health
                            .report_error(&module, ErrorSeverity::Error, message.clone())
                            .await;
                        self.set_state(WorkerState::Error, Some(message));
                        failed = true;
                        break;
                    }
                    let delay = policy.delay_for(retries);
                    warn!(
                        stream_id = %self.stream.id,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect failed, backing off"
                    );
                    self.report.total_backoff += delay;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            retries = 0;
            self.report.connections += 1;
            let fps = source
                .fps()
                .filter(|fps| fps.is_finite() && *fps > 0.0)
                .unwrap_or(self.ctx.config.output.default_fps);
            let (width, height) = (self.stream.width, self.stream.height);
            self.ctx.status.update(StatusKind::Stream, &self.stream.id, |r| {
                r.width = Some(width);
                r.height = Some(height);
                r.fps = Some(fps);
            });
            info!(stream_id = %self.stream.id, fps, "stream connected");
            self.set_state(WorkerState::Running, None);

            let end = self.stream_frames(source.as_mut(), fps, &cancel).await;
            source.close().await;
            match end {
                StreamEnd::Stopped => break,
                StreamEnd::Reconnect => self.set_state(WorkerState::Reconnecting, None),
            }
        }

        if !failed {
            self.set_state(WorkerState::Stopped, None);
        }
        info!(stream_id = %self.stream.id, frames = self.report.frames, "capture stopped");
        self.report
    }

    async fn stream_frames(
        &mut self,
        source: &mut dyn FrameSource,
        fps: f64,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let config = self.ctx.config.capture.clone();
        let frame_interval = Duration::from_secs_f64(1.0 / fps);
        let mut failures = 0u32;
        let mut next_frame = Instant::now();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Stopped,
                read = source.read_frame() => read,
            };

            match read {
                Ok(frame) => {
                    failures = 0;
                    self.publish(frame).await;
                }
                Err(e) => {
                    failures += 1;
                    self.bump_errors();
                    debug!(stream_id = %self.stream.id, failures, error = %e, "frame read failed");
                    if failures >= config.max_consecutive_failures {
                        warn!(stream_id = %self.stream.id, failures, "too many read failures, reconnecting");
                        return StreamEnd::Reconnect;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return StreamEnd::Stopped,
                        _ = tokio::time::sleep(config.failure_pause) => continue,
                    }
                }
            }

            self.beat().await;

            next_frame += frame_interval;
            let now = Instant::now();
            if next_frame < now {
                next_frame = now;
            }
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Stopped,
                _ = tokio::time::sleep_until(next_frame) => {}
            }
        }
    }

    /// Write a frame into the arena and push a reference to every subscriber.
    async fn publish(&mut self, frame: DecodedFrame) {
        let written = self
            .ctx
            .arena
            .allocate(&self.stream.id)
            .and_then(|slot| self.ctx.arena.write(slot, &frame.pixels, frame.shape, frame.dtype));
        let frame_ref = match written {
            Ok(frame_ref) => frame_ref,
            Err(e) => {
                self.report.dropped += 1;
                self.ctx
                    .status
                    .update(StatusKind::Stream, &self.stream.id, |r| r.dropped += 1);
                if let Some(dropped) = self.drop_log.record() {
                    warn!(stream_id = %self.stream.id, dropped, error = %e, "frames dropped");
                }
                return;
            }
        };

        for queue in self.ctx.queues.frame_subscribers(&self.stream.id) {
            queue.push(frame_ref.clone()).await;
        }
        drop(frame_ref);

        self.report.frames += 1;
        self.ctx.status.update(StatusKind::Stream, &self.stream.id, |r| {
            r.frames += 1;
            r.last_activity = Some(Utc::now());
        });
    }

    fn bump_errors(&self) {
        self.ctx
            .status
            .update(StatusKind::Stream, &self.stream.id, |r| r.errors += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_drop_warnings_are_rate_limited() {
        let mut log = DropLog {
            interval: Duration::from_secs(5),
            last_warned: None,
            suppressed: 0,
        };
        assert_eq!(log.record(), Some(1));
        for _ in 0..99 {
            assert_eq!(log.record(), None);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        // the next warning carries everything swallowed since the last one
        assert_eq!(log.record(), Some(100));
        assert_eq!(log.record(), None);
    }
}
