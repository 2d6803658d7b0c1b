//! Inference worker: frame-skip, detection, annotation, alarm check, result hand-off.
//!
//! A result is only built while a stream-out worker reads the pair's result queue.
//! Without one, detections still drive alarms but no annotated copy is drawn unless a
//! media recorder wants it.

use super::Heartbeat;
use crate::context::PipelineContext;
use analyzer_core::capabilities::FrameView;
use analyzer_core::health::ErrorSeverity;
use analyzer_core::{
    AlarmEvent, AnalyzerError, AnalyzerResult, Detection, FrameRef, PairKey, ResultRef,
    StatusKind, WorkerState,
};
use analyzer_models::annotate::draw_detections;
use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BOX_THICKNESS: u32 = 2;

/// What an inference run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceReport {
    /// Frames popped from the frame queue.
    pub received: u64,
    /// Frames run through the model.
    pub processed: u64,
    /// Frames released by frame-skip.
    pub skipped: u64,
    /// Results pushed.
    pub results: u64,
    /// Processed frames with no output attached, so no result was queued.
    pub unconsumed: u64,
    /// Alarms pushed.
    pub alarms: u64,
    /// Frames that failed to process.
    pub errors: u64,
}

struct Processed {
    detections: Vec<Detection>,
    annotated: Option<Vec<u8>>,
    original: Bytes,
}

/// Inference state machine for one (stream, algorithm) pair.
pub struct InferenceWorker {
    ctx: PipelineContext,
    task_id: String,
    pair: PairKey,
    model_id: String,
    alarm_threshold: f32,
    key: String,
    module: String,
}

impl InferenceWorker {
    /// Worker running `model_id` over `pair`'s frames.
    pub fn new(
        ctx: PipelineContext,
        task_id: impl Into<String>,
        pair: PairKey,
        model_id: impl Into<String>,
        alarm_threshold: f32,
    ) -> Self {
        let key = pair.to_string();
        let module = format!("algo_{}_{}", pair.stream_id, pair.algo_id);
        Self {
            ctx,
            task_id: task_id.into(),
            pair,
            model_id: model_id.into(),
            alarm_threshold,
            key,
            module,
        }
    }

    /// Run until stopped.
    ///
    /// A frame already handed to the model is finished before the stop token is
    /// checked again.
    pub async fn run(self, cancel: CancellationToken) -> InferenceReport {
        let config = self.ctx.config.inference.clone();
        let frames = self.ctx.queues.frame_queue(&self.pair);
        let mut report = InferenceReport::default();
        let mut ready = false;
        let mut heartbeat = Heartbeat::new(
            self.ctx.health.clone(),
            self.module.as_str(),
            self.ctx.config.supervisor.heartbeat_interval,
        );

        self.ctx
            .status
            .set_state(StatusKind::Algo, &self.key, WorkerState::Running, None);
        info!(pair = %self.pair, model_id = %self.model_id, "inference started");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.pop(config.pop_timeout) => frame,
            };
            heartbeat
                .beat(|| format!("{} processed, {} skipped", report.processed, report.skipped))
                .await;
            let Some(frame) = frame else {
                continue;
            };

            let take = report.received % (u64::from(config.frame_skip) + 1) == 0;
            report.received += 1;
            if !take {
                report.skipped += 1;
                drop(frame);
                self.ctx
                    .status
                    .update(StatusKind::Algo, &self.key, |r| r.skipped += 1);
                continue;
            }

            let draw = self.ctx.queues.has_output(&self.pair) || self.ctx.recorder.is_some();
            let processed = match self.process(&frame, draw).await {
                Ok(processed) => processed,
                Err(e) => {
                    report.errors += 1;
                    self.ctx
                        .status
                        .update(StatusKind::Algo, &self.key, |r| r.errors += 1);
                    warn!(pair = %self.pair, frame_id = %frame.id(), error = %e, "inference failed");
                    self.ctx
                        .health
                        .report_error(&self.module, ErrorSeverity::Warning, e.to_string())
                        .await;
                    continue;
                }
            };
            report.processed += 1;

            let annotated_bytes = processed.annotated.map(Bytes::from);
            if self.raise_alarm(&frame, &processed.detections, &processed.original, annotated_bytes.as_ref()).await {
                report.alarms += 1;
            }

            // the output may have gone while the model ran
            if self.ctx.queues.has_output(&self.pair) {
                let result = self.build_result(&frame, processed.detections, annotated_bytes);
                drop(frame);
                let queue = self.ctx.queues.result_queue(&self.pair);
                if queue.push(result).await {
                    report.results += 1;
                }
                // a consumer that detached during the push has already drained
                if !self.ctx.queues.has_output(&self.pair) {
                    queue.drain();
                }
            } else {
                report.unconsumed += 1;
                drop(frame);
            }

            self.ctx.status.update(StatusKind::Algo, &self.key, |r| {
                r.processed += 1;
                r.frames += 1;
                r.last_activity = Some(Utc::now());
            });
            if !ready {
                ready = true;
                self.ctx
                    .status
                    .set_state(StatusKind::Algo, &self.key, WorkerState::Ready, None);
                info!(pair = %self.pair, "first frame processed, output may start");
            }
        }

        self.ctx
            .status
            .set_state(StatusKind::Algo, &self.key, WorkerState::Stopped, None);
        info!(pair = %self.pair, processed = report.processed, skipped = report.skipped, "inference stopped");
        report
    }

    /// Detect, postprocess and, when `draw` is set, draw on a private copy of the frame.
    async fn process(&self, frame: &FrameRef, draw: bool) -> AnalyzerResult<Processed> {
        let instance = self.ctx.models.checkout(&self.model_id)?;
        let checkout = self.ctx.arena.checkout(frame)?;
        let original = checkout.pixels.clone();
        let shape = frame.shape();
        let dtype = frame.meta().dtype;

        let pixels = checkout.pixels;
        let (detections, annotated) = tokio::task::spawn_blocking(move || -> AnalyzerResult<(Vec<Detection>, Option<Vec<u8>>)> {
            let view = FrameView {
                pixels: &pixels,
                shape,
                dtype,
            };
            let output = instance.model.infer(&view)?;
            let annotated = instance.postprocessor.process(output.detections)?;
            if !draw {
                return Ok((annotated.detections, None));
            }
            let mut copy = pixels.to_vec();
            let drawn = draw_detections(&mut copy, shape, dtype, &annotated.detections, BOX_THICKNESS);
            Ok((annotated.detections, drawn.then_some(copy)))
        })
        .await
        .map_err(|e| AnalyzerError::Inference(format!("inference task failed: {e}")))??;
        drop(checkout.frame);

        Ok(Processed {
            detections,
            annotated,
            original,
        })
    }

    /// Push an alarm for the strongest detection at or above the threshold, unless the
    /// pair is cooling down.
    async fn raise_alarm(
        &self,
        frame: &FrameRef,
        detections: &[Detection],
        original: &Bytes,
        annotated: Option<&Bytes>,
    ) -> bool {
        let Some(trigger) = detections
            .iter()
            .filter(|d| d.confidence >= self.alarm_threshold)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            return false;
        };
        let cooldown = self.ctx.config.inference.alarm_cooldown;
        if !self.ctx.cooldowns.try_acquire(&self.pair, cooldown) {
            debug!(pair = %self.pair, "alarm suppressed by cooldown");
            return false;
        }

        let mut event = AlarmEvent::new(&self.task_id, &self.pair, frame.id(), trigger, detections.to_vec());
        if let Some(recorder) = &self.ctx.recorder {
            let annotated = annotated.unwrap_or(original).clone();
            match recorder.record(&event, frame.shape(), original.clone(), annotated).await {
                Ok(refs) => event.media_refs = refs,
                Err(e) => warn!(alarm_id = %event.alarm_id, error = %e, "alarm snapshot failed"),
            }
        }

        let alarm_id = event.alarm_id.clone();
        let pushed = self.ctx.queues.alarms().push(event).await;
        self.ctx.status.update(StatusKind::Algo, &self.key, |r| {
            if pushed {
                r.alarms += 1;
            } else {
                r.dropped += 1;
            }
        });
        if pushed {
            info!(pair = %self.pair, %alarm_id, label = %trigger.label, confidence = trigger.confidence, "alarm raised");
        } else {
            warn!(pair = %self.pair, %alarm_id, "alarm queue full, alarm dropped");
        }
        pushed
    }

    /// Wrap the annotated copy in a fresh arena slot, or the original frame when no
    /// copy was drawn or no slot is free.
    fn build_result(&self, frame: &FrameRef, detections: Vec<Detection>, annotated: Option<Bytes>) -> ResultRef {
        if let Some(pixels) = annotated {
            let written = self
                .ctx
                .arena
                .allocate(frame.stream_id())
                .and_then(|slot| self.ctx.arena.write(slot, &pixels, frame.shape(), frame.meta().dtype));
            match written {
                Ok(copy) => {
                    return ResultRef {
                        frame: copy,
                        detections,
                        annotated: true,
                    }
                }
                Err(e) => debug!(pair = %self.pair, error = %e, "no slot for annotated copy"),
            }
        }
        ResultRef {
            frame: frame.clone(),
            detections,
            annotated: false,
        }
    }
}
