//! Mock detection package.
//!
//! Registered under the package id `mock`. The model reports one fixed detection per
//! frame, configured through the algorithm's JSON config:
//!
//! ```json
//! {
//!   "label": "person",
//!   "confidence": 0.9,
//!   "bbox": [10, 10, 40, 40],
//!   "jitter": 0.05,
//!   "infer_delay_ms": 5,
//!   "fail_load": false,
//!   "min_confidence": 0.0
//! }
//! ```
//!
//! Counters shared by every instance the package created let tests observe how often
//! instances were built, used and released.

use analyzer_core::capabilities::{AlgorithmPackage, FrameView, Model, Postprocessor};
use analyzer_core::data::{AnnotatedResult, InferenceOutput};
use analyzer_core::{AnalyzerError, AnalyzerResult, BBox, Detection};
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Package id the mock detector registers under.
pub const MOCK_PACKAGE_ID: &str = "mock";

/// Palette cycled through by the postprocessor (BGR).
const PALETTE: [[u8; 3]; 4] = [[0, 255, 0], [0, 0, 255], [255, 0, 0], [0, 255, 255]];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DetectorConfig {
    label: String,
    confidence: f32,
    bbox: [f32; 4],
    jitter: f32,
    infer_delay_ms: u64,
    fail_load: bool,
    min_confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            label: "object".into(),
            confidence: 0.9,
            bbox: [0.0, 0.0, 16.0, 16.0],
            jitter: 0.0,
            infer_delay_ms: 0,
            fail_load: false,
            min_confidence: 0.0,
        }
    }
}

impl DetectorConfig {
    fn parse(name: &str, config: &serde_json::Value) -> AnalyzerResult<Self> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| AnalyzerError::ModelLoad {
            model_id: name.to_string(),
            message: format!("invalid mock detector config: {e}"),
        })
    }
}

/// Usage counters shared across every instance of the package.
#[derive(Debug, Default)]
pub struct DetectorCounters {
    models_created: AtomicU64,
    inferences: AtomicU64,
    releases: AtomicU64,
}

impl DetectorCounters {
    /// Model instances constructed.
    pub fn models_created(&self) -> u64 {
        self.models_created.load(Ordering::SeqCst)
    }

    /// Frames run through any instance.
    pub fn inferences(&self) -> u64 {
        self.inferences.load(Ordering::SeqCst)
    }

    /// Release hooks invoked on models and postprocessors.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

/// [`AlgorithmPackage`] producing fixed detections.
#[derive(Debug, Default, Clone)]
pub struct MockDetectorPackage {
    counters: Arc<DetectorCounters>,
}

impl MockDetectorPackage {
    /// New package with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counters.
    pub fn counters(&self) -> Arc<DetectorCounters> {
        Arc::clone(&self.counters)
    }
}

impl AlgorithmPackage for MockDetectorPackage {
    fn package_id(&self) -> &str {
        MOCK_PACKAGE_ID
    }

    fn create_model(&self, name: &str, config: &serde_json::Value) -> AnalyzerResult<Box<dyn Model>> {
        let config = DetectorConfig::parse(name, config)?;
        if config.fail_load {
            return Err(AnalyzerError::ModelLoad {
                model_id: name.to_string(),
                message: "mock detector configured to fail".into(),
            });
        }
        self.counters.models_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDetector {
            config,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn create_postprocessor(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> AnalyzerResult<Box<dyn Postprocessor>> {
        let config = DetectorConfig::parse(name, config)?;
        Ok(Box::new(MockPostprocessor {
            min_confidence: config.min_confidence,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockDetector {
    config: DetectorConfig,
    counters: Arc<DetectorCounters>,
}

impl Model for MockDetector {
    fn infer(&self, frame: &FrameView<'_>) -> AnalyzerResult<InferenceOutput> {
        if self.config.infer_delay_ms > 0 {
            // runs on a blocking thread
            std::thread::sleep(Duration::from_millis(self.config.infer_delay_ms));
        }
        self.counters.inferences.fetch_add(1, Ordering::SeqCst);

        let mut confidence = self.config.confidence;
        if self.config.jitter > 0.0 {
            let delta = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
            confidence = (confidence + delta).clamp(0.0, 1.0);
        }

        let [x1, y1, x2, y2] = self.config.bbox;
        let max_x = frame.shape.width.saturating_sub(1) as f32;
        let max_y = frame.shape.height.saturating_sub(1) as f32;
        let bbox = BBox::new(x1.min(max_x), y1.min(max_y), x2.min(max_x), y2.min(max_y));
        let detection = Detection::new(self.config.label.clone(), confidence, bbox);

        Ok(InferenceOutput {
            raw: serde_json::json!({ "frame_bytes": frame.pixels.len() }),
            detections: vec![detection],
        })
    }

    fn release(&self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockPostprocessor {
    min_confidence: f32,
    counters: Arc<DetectorCounters>,
}

impl Postprocessor for MockPostprocessor {
    fn process(&self, detections: Vec<Detection>) -> AnalyzerResult<AnnotatedResult> {
        let detections: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .enumerate()
            .map(|(i, mut d)| {
                d.color = Some(PALETTE[i % PALETTE.len()]);
                d
            })
            .collect();
        Ok(AnnotatedResult {
            extra: serde_json::json!({ "count": detections.len() }),
            detections,
        })
    }

    fn release(&self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}
