//! Values exchanged between workers: detections, results and alarm events.

use analyzer_pool::{FrameId, FrameRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A (stream, algorithm) pair: the unit that owns a result queue, a ready flag and an
/// alarm cooldown window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    /// Stream id.
    pub stream_id: String,
    /// Algorithm id.
    pub algo_id: String,
}

impl PairKey {
    /// Build a pair key.
    pub fn new(stream_id: impl Into<String>, algo_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            algo_id: algo_id.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.algo_id)
    }
}

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

impl BBox {
    /// Build a box from its corners.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// One object reported by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label.
    pub label: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    /// Location in the frame.
    pub bbox: BBox,
    /// Optional BGR drawing colour chosen by the postprocessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[u8; 3]>,
}

impl Detection {
    /// Build a detection without a colour.
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            color: None,
        }
    }
}

/// Raw model output.
#[derive(Debug, Clone, Default)]
pub struct InferenceOutput {
    /// Package-specific raw result, passed through untouched.
    pub raw: serde_json::Value,
    /// Detections extracted by the model.
    pub detections: Vec<Detection>,
}

/// Postprocessor output.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedResult {
    /// Detections to draw and to test against the alarm threshold.
    pub detections: Vec<Detection>,
    /// Package-specific extra data.
    pub extra: serde_json::Value,
}

/// Processed frame travelling from an inference worker to a stream-out worker.
///
/// Owns one reference to its frame; dropping the result releases it.
#[derive(Debug)]
pub struct ResultRef {
    /// Frame to encode. Holds the annotated copy when `annotated` is set.
    pub frame: FrameRef,
    /// Detections after postprocessing.
    pub detections: Vec<Detection>,
    /// Whether `frame` carries drawn annotations.
    pub annotated: bool,
}

impl ResultRef {
    /// Give up the frame reference.
    pub fn release(self) {
        drop(self);
    }
}

/// Alarm severity derived from detection confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    /// Confidence below 0.6.
    Low,
    /// Confidence in `[0.6, 0.8)`.
    Medium,
    /// Confidence of 0.8 or more.
    High,
}

impl AlarmLevel {
    /// Map a confidence score to a level.
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence < 0.6 {
            AlarmLevel::Low
        } else if confidence < 0.8 {
            AlarmLevel::Medium
        } else {
            AlarmLevel::High
        }
    }
}

/// Alarm raised by an inference worker.
///
/// The frame is referenced by id only; the event does not hold an arena reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    /// `alarm_{YYYYmmdd_HHMMSS}_{8 hex}`.
    pub alarm_id: String,
    /// Stream that produced the frame.
    pub stream_id: String,
    /// Task the pair belongs to.
    pub task_id: String,
    /// Algorithm that raised the alarm.
    pub algo_id: String,
    /// Label of the triggering detection.
    pub label: String,
    /// Confidence of the triggering detection.
    pub confidence: f32,
    /// Box of the triggering detection.
    pub bbox: BBox,
    /// Frame the alarm was raised on.
    pub frame_id: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Severity.
    pub level: AlarmLevel,
    /// Every detection on the frame.
    pub detections: Vec<Detection>,
    /// Paths of recorded media for this alarm.
    pub media_refs: Vec<String>,
}

impl AlarmEvent {
    /// Build an event for `trigger`, stamping a fresh id and the current time.
    pub fn new(
        task_id: &str,
        pair: &PairKey,
        frame_id: FrameId,
        trigger: &Detection,
        detections: Vec<Detection>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            alarm_id: alarm_id(created_at),
            stream_id: pair.stream_id.clone(),
            task_id: task_id.to_string(),
            algo_id: pair.algo_id.clone(),
            label: trigger.label.clone(),
            confidence: trigger.confidence,
            bbox: trigger.bbox,
            frame_id: frame_id.get(),
            created_at,
            level: AlarmLevel::from_confidence(trigger.confidence),
            detections,
            media_refs: Vec::new(),
        }
    }

    /// Self-describing record pushed to the notification sink.
    pub fn to_notification(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "alarm",
            "alarm_id": self.alarm_id,
            "stream_id": self.stream_id,
            "task_id": self.task_id,
            "algo_id": self.algo_id,
            "timestamp": self.created_at.to_rfc3339(),
            "level": self.level,
            "label": self.label,
            "confidence": self.confidence,
            "bbox": self.bbox,
            "frame_id": self.frame_id,
            "detections": self.detections,
            "media_refs": self.media_refs,
        })
    }
}

fn alarm_id(at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("alarm_{}_{}", at.format("%Y%m%d_%H%M%S"), &suffix[..8])
}
