//! Capability traits for the external collaborators of the pipeline.
//!
//! Workers never talk to a concrete decoder, model, encoder or notification channel.
//! They receive trait objects through the pipeline context, which keeps the worker
//! state machines testable with the mock implementations and lets deployments swap
//! in real adapters.
//!
//! ```text
//! ┌──────────────────┐  open()   ┌─────────────┐  read_frame()
//! │ SourceConnector  │──────────►│ FrameSource │──────────────► CaptureWorker
//! └──────────────────┘           └─────────────┘
//! ┌──────────────────┐  create_model()/create_postprocessor()
//! │ AlgorithmPackage │──────────────────────────────────────► ModelRegistry
//! └──────────────────┘
//! ┌──────────────────┐  spawn()  ┌────────────────┐ write_frame()
//! │ EncoderLauncher  │──────────►│ EncoderSession │◄──────────── StreamOutWorker
//! └──────────────────┘           └────────────────┘
//! ┌──────────────────┐ connect() ┌────────────────┐ send()
//! │ NotificationSink │──────────►│ SinkConnection │◄──────────── AlarmWorker
//! └──────────────────┘           └────────────────┘
//! ```

use crate::config::StreamDefinition;
use crate::data::{AlarmEvent, AnnotatedResult, Detection, InferenceOutput};
use crate::error::AnalyzerResult;
use analyzer_pool::{FrameShape, PixelDtype};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Capture
// =============================================================================

/// A decoded frame as produced by a capture source.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Interleaved pixel data.
    pub pixels: Bytes,
    /// Geometry of `pixels`.
    pub shape: FrameShape,
    /// Sample type of `pixels`.
    pub dtype: PixelDtype,
}

/// An open capture source.
#[async_trait]
pub trait FrameSource: Send {
    /// Read and decode the next frame. An error counts as one decode failure.
    async fn read_frame(&mut self) -> AnalyzerResult<DecodedFrame>;

    /// Native frame rate, when the source knows it.
    fn fps(&self) -> Option<f64>;

    /// Release the underlying handle.
    async fn close(&mut self) {}
}

/// Opens capture sources for configured streams.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Open the stream's URL.
    async fn open(&self, stream: &StreamDefinition) -> AnalyzerResult<Box<dyn FrameSource>>;
}

// =============================================================================
// Algorithm packages
// =============================================================================

/// Borrowed view of frame pixels handed to a model.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    /// Interleaved pixel data.
    pub pixels: &'a [u8],
    /// Geometry of `pixels`.
    pub shape: FrameShape,
    /// Sample type of `pixels`.
    pub dtype: PixelDtype,
}

/// Detection model instance.
pub trait Model: Send + Sync {
    /// Run detection on one frame.
    fn infer(&self, frame: &FrameView<'_>) -> AnalyzerResult<InferenceOutput>;

    /// Cleanup hook called when the instance is unloaded.
    fn release(&self) {}
}

/// Postprocessor paired with a model instance.
pub trait Postprocessor: Send + Sync {
    /// Filter and decorate detections.
    fn process(&self, detections: Vec<Detection>) -> AnalyzerResult<AnnotatedResult>;

    /// Cleanup hook called when the instance is unloaded.
    fn release(&self) {}
}

/// Factory for models and postprocessors, registered under a package id.
pub trait AlgorithmPackage: Send + Sync {
    /// Key under which the package is registered.
    fn package_id(&self) -> &str;

    /// Construct a model instance.
    fn create_model(&self, name: &str, config: &serde_json::Value)
        -> AnalyzerResult<Box<dyn Model>>;

    /// Construct a postprocessor instance.
    fn create_postprocessor(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> AnalyzerResult<Box<dyn Postprocessor>>;
}

// =============================================================================
// Encoder
// =============================================================================

/// Encoder argument profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncoderProfile {
    /// Software H.264 tuned for latency, RTSP over TCP.
    #[default]
    LowLatency,
    /// NVENC hardware H.264.
    HardwareAccelerated,
}

/// Parameters an encoder is spawned with.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Input frame rate.
    pub fps: f64,
    /// Output target.
    pub output_url: String,
    /// Argument profile.
    pub profile: EncoderProfile,
}

/// A running encoder accepting raw frames in display order.
#[async_trait]
pub trait EncoderSession: Send {
    /// Write one raw frame.
    async fn write_frame(&mut self, pixels: &[u8]) -> AnalyzerResult<()>;

    /// True once the encoder has terminated.
    fn has_exited(&mut self) -> bool;

    /// Close the input and wait up to `timeout` before killing.
    async fn close(&mut self, timeout: Duration);
}

/// Spawns encoder sessions.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    /// Start an encoder.
    async fn spawn(&self, params: &EncoderParams) -> AnalyzerResult<Box<dyn EncoderSession>>;
}

// =============================================================================
// Notification sink
// =============================================================================

/// Connects to the external notification channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Open a connection.
    async fn connect(&self) -> AnalyzerResult<Box<dyn SinkConnection>>;
}

/// An open notification channel.
#[async_trait]
pub trait SinkConnection: Send {
    /// Push one serialized record.
    async fn send(&mut self, record: &serde_json::Value) -> AnalyzerResult<()>;
}

// =============================================================================
// Media
// =============================================================================

/// Persists alarm media and returns references to it.
#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Record the original and annotated frame for `event`.
    async fn record(
        &self,
        event: &AlarmEvent,
        shape: FrameShape,
        original: Bytes,
        annotated: Bytes,
    ) -> AnalyzerResult<Vec<String>>;
}
