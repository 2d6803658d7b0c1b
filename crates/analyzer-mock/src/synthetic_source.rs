//! Synthetic capture source.
//!
//! Produces BGR frames of the stream's configured size without any decoder. Failure
//! injection covers the capture worker's recovery paths: refused connections, read
//! failures at chosen frame numbers, and what happens once a frame limit is reached.

use crate::pattern::{generate_test_pattern, solid_frame};
use analyzer_core::capabilities::{DecodedFrame, FrameSource, SourceConnector};
use analyzer_core::config::StreamDefinition;
use analyzer_core::{AnalyzerError, AnalyzerResult, FrameShape, PixelDtype};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Pixel content of generated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePattern {
    /// Every frame identical, filled with this byte.
    Solid(u8),
    /// Animated test pattern.
    TestPattern,
}

/// Behaviour once `frame_limit` frames have been served on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLimit {
    /// Never return another frame; reads wait forever.
    Idle,
    /// Every further read fails.
    Fail,
}

/// Synthetic source configuration.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Reported native frame rate.
    pub fps: Option<f64>,
    /// Frames served per connection; unlimited when `None`.
    pub frame_limit: Option<u64>,
    /// Frame content.
    pub pattern: FramePattern,
    /// Behaviour after the limit.
    pub after_limit: AfterLimit,
    /// Connection attempts refused before the first success.
    pub refuse_first_connects: u32,
    /// 1-based frame numbers whose reads fail (counted per connection).
    pub failing_reads: HashSet<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            fps: Some(25.0),
            frame_limit: None,
            pattern: FramePattern::TestPattern,
            after_limit: AfterLimit::Idle,
            refuse_first_connects: 0,
            failing_reads: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct SourceCounters {
    connect_attempts: AtomicU32,
    connections: AtomicU32,
    frames_served: AtomicU64,
    closes: AtomicU32,
}

/// [`SourceConnector`] producing synthetic frames.
#[derive(Clone)]
pub struct SyntheticConnector {
    config: Arc<Mutex<SyntheticConfig>>,
    counters: Arc<SourceCounters>,
}

impl SyntheticConnector {
    /// Connector with the given behaviour.
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            counters: Arc::default(),
        }
    }

    /// Connection attempts so far, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.counters.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connections so far.
    pub fn connections(&self) -> u32 {
        self.counters.connections.load(Ordering::SeqCst)
    }

    /// Frames returned across all connections.
    pub fn frames_served(&self) -> u64 {
        self.counters.frames_served.load(Ordering::SeqCst)
    }

    /// Sources closed by their worker.
    pub fn closes(&self) -> u32 {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for SyntheticConnector {
    async fn open(&self, stream: &StreamDefinition) -> AnalyzerResult<Box<dyn FrameSource>> {
        let attempt = self.counters.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config.lock().clone();
        if attempt <= config.refuse_first_connects {
            debug!(stream_id = %stream.id, attempt, "synthetic source refusing connection");
            return Err(AnalyzerError::Source(format!(
                "connection to {} refused (attempt {attempt})",
                stream.url
            )));
        }
        self.counters.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticSource {
            shape: FrameShape::bgr(stream.width, stream.height),
            fps: stream.fps.or(config.fps),
            config,
            served: 0,
            reads: 0,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct SyntheticSource {
    shape: FrameShape,
    fps: Option<f64>,
    config: SyntheticConfig,
    served: u64,
    reads: u64,
    counters: Arc<SourceCounters>,
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn read_frame(&mut self) -> AnalyzerResult<DecodedFrame> {
        if self.config.frame_limit.is_some_and(|limit| self.served >= limit) {
            return match self.config.after_limit {
                AfterLimit::Idle => std::future::pending().await,
                AfterLimit::Fail => Err(AnalyzerError::Source("end of stream".into())),
            };
        }

        self.reads += 1;
        if self.config.failing_reads.contains(&self.reads) {
            return Err(AnalyzerError::Source(format!("decode error at read {}", self.reads)));
        }

        let pixels = match self.config.pattern {
            FramePattern::Solid(value) => solid_frame(self.shape.width, self.shape.height, value),
            FramePattern::TestPattern => {
                generate_test_pattern(self.shape.width, self.shape.height, self.served)
            }
        };
        self.served += 1;
        self.counters.frames_served.fetch_add(1, Ordering::SeqCst);

        Ok(DecodedFrame {
            pixels: Bytes::from(pixels),
            shape: self.shape,
            dtype: PixelDtype::U8,
        })
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    async fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
