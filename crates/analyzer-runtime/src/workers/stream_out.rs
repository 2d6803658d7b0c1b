//! Stream-out worker: re-encodes a pair's results to an outbound stream.
//!
//! Start-up is ordered behind the inference worker: the encoder is only spawned once
//! the pair is `Ready` and the first result has told us the frame geometry.
//!
//! The worker leases the pair's result queue from the moment it is constructed, so
//! inference starts queueing results before the first poll. Encoder restarts are
//! bounded per stable period: a session that ran for `restart_reset_after` refills
//! the budget when it exits.

use super::Heartbeat;
use crate::context::{OutputLease, PipelineContext};
use analyzer_core::capabilities::{EncoderParams, EncoderSession};
use analyzer_core::health::ErrorSeverity;
use analyzer_core::{PairKey, ResultRef, StatusKind, WorkerState};
use chrono::Utc;
use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a stream-out run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutReport {
    /// Frames written to an encoder.
    pub frames: u64,
    /// Encoder sessions started.
    pub spawns: u32,
    /// Times a stable session refilled the restart budget.
    pub budget_resets: u32,
    /// Parameters the encoder was started with.
    pub params: Option<EncoderParams>,
    /// Final state.
    pub state: WorkerState,
}

/// Stream-out state machine for one (stream, algorithm) pair.
pub struct StreamOutWorker {
    ctx: PipelineContext,
    pair: PairKey,
    output_url: String,
    key: String,
    module: String,
    lease: OutputLease,
    heartbeat: Heartbeat,
}

impl StreamOutWorker {
    /// Worker encoding `pair`'s results to `output_url`. Attaches to the pair's result
    /// queue immediately.
    pub fn new(ctx: PipelineContext, pair: PairKey, output_url: impl Into<String>) -> Self {
        let key = pair.to_string();
        let module = format!("stream_out_{}_{}", pair.stream_id, pair.algo_id);
        let lease = ctx.queues.attach_output(&pair);
        let heartbeat = Heartbeat::new(
            ctx.health.clone(),
            module.as_str(),
            ctx.config.supervisor.heartbeat_interval,
        );
        Self {
            ctx,
            pair,
            output_url: output_url.into(),
            key,
            module,
            lease,
            heartbeat,
        }
    }

    /// Await `fut`, heartbeating meanwhile. `None` when stopped first.
    async fn wait<F: Future>(&mut self, fut: F, cancel: &CancellationToken) -> Option<F::Output> {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.ctx.config.supervisor.heartbeat_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                out = &mut fut => return Some(out),
                _ = ticker.tick() => self.heartbeat.beat(|| "waiting".into()).await,
            }
        }
    }

    fn set_state(&self, report: &mut StreamOutReport, state: WorkerState, message: Option<String>) {
        report.state = state;
        self.ctx
            .status
            .set_state(StatusKind::Output, &self.key, state, message);
    }

    async fn fail(&self, report: &mut StreamOutReport, message: String) {
        error!(pair = %self.pair, %message, "output failed");
        self.ctx
            .health
            .report_error(&self.module, ErrorSeverity::Critical, message.clone())
            .await;
        self.set_state(report, WorkerState::Error, Some(message));
    }

    /// Run until stopped or the encoder restart budget is exhausted.
    pub async fn run(mut self, cancel: CancellationToken) -> StreamOutReport {
        let config = self.ctx.config.output.clone();
        let mut report = StreamOutReport::default();
        self.set_state(&mut report, WorkerState::Waiting, None);

        let status = self.ctx.status.clone();
        let key = self.key.clone();
        let ready = status.wait_for(
            StatusKind::Algo,
            &key,
            |r| r.state == WorkerState::Ready,
            config.ready_timeout,
            config.ready_poll,
        );
        let Some(ready) = self.wait(ready, &cancel).await else {
            self.set_state(&mut report, WorkerState::Stopped, None);
            return report;
        };
        if !ready {
            let message = format!("inference not ready within {:?}", config.ready_timeout);
            self.fail(&mut report, message).await;
            return report;
        }

        let results = self.lease.results();
        let first = match self.wait(results.pop(config.first_result_timeout), &cancel).await {
            None => {
                self.set_state(&mut report, WorkerState::Stopped, None);
                return report;
            }
            Some(None) => {
                let message = format!("no result within {:?}", config.first_result_timeout);
                self.fail(&mut report, message).await;
                return report;
            }
            Some(Some(first)) => first,
        };

        let shape = first.frame.shape();
        let fps = self
            .ctx
            .status
            .get(StatusKind::Stream, &self.pair.stream_id)
            .and_then(|r| r.fps)
            .unwrap_or(config.default_fps);
        let params = EncoderParams {
            width: shape.width,
            height: shape.height,
            fps,
            output_url: self.output_url.clone(),
            profile: config.profile,
        };
        self.ctx.status.update(StatusKind::Output, &self.key, |r| {
            r.width = Some(shape.width);
            r.height = Some(shape.height);
            r.fps = Some(fps);
        });
        report.params = Some(params.clone());
        self.set_state(&mut report, WorkerState::Running, None);

        let mut session: Option<(Box<dyn EncoderSession>, Instant)> = None;
        // spawns since the budget was last refilled
        let mut attempts = 0u32;
        let mut pending = Some(first);
        loop {
            let result: ResultRef = match pending.take() {
                Some(result) => result,
                None => {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = results.pop(config.pop_timeout) => next,
                    };
                    let (frames, spawns) = (report.frames, report.spawns);
                    self.heartbeat
                        .beat(|| format!("{frames} frames, {spawns} encoder sessions"))
                        .await;
                    match next {
                        Some(result) => result,
                        None => continue,
                    }
                }
            };

            if session.as_mut().is_some_and(|(s, _)| s.has_exited()) {
                warn!(pair = %self.pair, "encoder exited unexpectedly");
                if let Some((mut exited, started)) = session.take() {
                    exited.close(config.close_timeout).await;
                    self.refill_if_stable(&mut attempts, &mut report, started, config.restart_reset_after);
                }
            }

            if session.is_none() {
                if attempts > config.max_encoder_restarts {
                    let message = format!(
                        "encoder restarted {} times, giving up",
                        attempts.saturating_sub(1)
                    );
                    self.fail(&mut report, message).await;
                    return report;
                }
                attempts += 1;
                report.spawns += 1;
                match self.ctx.encoders.spawn(&params).await {
                    Ok(started) => {
                        info!(pair = %self.pair, url = %self.output_url, spawn = report.spawns, "encoder started");
                        session = Some((started, Instant::now()));
                    }
                    Err(e) => {
                        warn!(pair = %self.pair, error = %e, "encoder failed to start");
                        self.bump_errors();
                        continue;
                    }
                }
            }

            let Some((encoder, _)) = session.as_mut() else {
                continue;
            };
            let checkout = match self.ctx.arena.checkout(&result.frame) {
                Ok(checkout) => checkout,
                Err(e) => {
                    warn!(pair = %self.pair, error = %e, "result frame unreadable");
                    self.bump_errors();
                    continue;
                }
            };
            match encoder.write_frame(&checkout.pixels).await {
                Ok(()) => {
                    report.frames += 1;
                    self.ctx.status.update(StatusKind::Output, &self.key, |r| {
                        r.frames += 1;
                        r.last_activity = Some(Utc::now());
                    });
                }
                Err(e) => {
                    warn!(pair = %self.pair, error = %e, "encoder write failed");
                    self.bump_errors();
                    if let Some((mut broken, started)) = session.take() {
                        broken.close(config.close_timeout).await;
                        self.refill_if_stable(&mut attempts, &mut report, started, config.restart_reset_after);
                    }
                }
            }
            drop(checkout);
            result.release();
        }

        if let Some((mut encoder, _)) = session.take() {
            encoder.close(config.close_timeout).await;
        }
        self.set_state(&mut report, WorkerState::Stopped, None);
        info!(pair = %self.pair, frames = report.frames, "output stopped");
        report
    }

    fn refill_if_stable(
        &self,
        attempts: &mut u32,
        report: &mut StreamOutReport,
        started: Instant,
        stable_after: std::time::Duration,
    ) {
        if started.elapsed() >= stable_after && *attempts > 0 {
            *attempts = 0;
            report.budget_resets += 1;
            debug!(pair = %self.pair, ran = ?started.elapsed(), "encoder was stable, restart budget refilled");
        }
    }

    fn bump_errors(&self) {
        self.ctx
            .status
            .update(StatusKind::Output, &self.key, |r| r.errors += 1);
    }
}
