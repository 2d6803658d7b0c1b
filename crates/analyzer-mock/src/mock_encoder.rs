//! Recording encoder launcher.
//!
//! Stands in for the encoder subprocess. Every spawn and every frame written is
//! recorded so tests can assert on ordering, frame counts and restart behaviour.

use analyzer_core::capabilities::{EncoderLauncher, EncoderParams, EncoderSession};
use analyzer_core::{AnalyzerError, AnalyzerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One frame accepted by a recording session.
#[derive(Debug, Clone)]
pub struct WrittenFrame {
    /// Session number, starting at 1 for the first spawn.
    pub session: u32,
    /// Frame length in bytes.
    pub len: usize,
    /// First byte of the frame, handy for telling frames apart.
    pub first_byte: Option<u8>,
    /// When the write happened.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct EncoderLog {
    spawns: Vec<(EncoderParams, Instant)>,
    frames: Vec<WrittenFrame>,
    closes: u32,
}

/// [`EncoderLauncher`] that records instead of encoding.
#[derive(Debug, Clone, Default)]
pub struct RecordingEncoderLauncher {
    log: Arc<Mutex<EncoderLog>>,
    sessions: Arc<AtomicU32>,
    fail_spawn: Arc<AtomicU32>,
    exit_after_writes: Option<u32>,
}

impl RecordingEncoderLauncher {
    /// Launcher whose sessions never fail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions exit (and reject further writes) after accepting `writes` frames.
    pub fn with_exit_after_writes(mut self, writes: u32) -> Self {
        self.exit_after_writes = Some(writes);
        self
    }

    /// The next `count` spawns fail.
    pub fn fail_next_spawns(&self, count: u32) {
        self.fail_spawn.store(count, Ordering::SeqCst);
    }

    /// Parameters of every successful spawn, in order.
    pub fn spawns(&self) -> Vec<EncoderParams> {
        self.log.lock().spawns.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Time of the first successful spawn.
    pub fn first_spawn_at(&self) -> Option<Instant> {
        self.log.lock().spawns.first().map(|(_, at)| *at)
    }

    /// Frames written across all sessions.
    pub fn frames(&self) -> Vec<WrittenFrame> {
        self.log.lock().frames.clone()
    }

    /// Number of frames written across all sessions.
    pub fn frame_count(&self) -> usize {
        self.log.lock().frames.len()
    }

    /// Sessions closed by their worker.
    pub fn closes(&self) -> u32 {
        self.log.lock().closes
    }
}

#[async_trait]
impl EncoderLauncher for RecordingEncoderLauncher {
    async fn spawn(&self, params: &EncoderParams) -> AnalyzerResult<Box<dyn EncoderSession>> {
        let failing = self
            .fail_spawn
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AnalyzerError::Encoder("mock encoder failed to start".into()));
        }

        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().spawns.push((params.clone(), Instant::now()));
        Ok(Box::new(RecordingSession {
            session,
            written: 0,
            exit_after: self.exit_after_writes,
            exited: false,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingSession {
    session: u32,
    written: u32,
    exit_after: Option<u32>,
    exited: bool,
    log: Arc<Mutex<EncoderLog>>,
}

#[async_trait]
impl EncoderSession for RecordingSession {
    async fn write_frame(&mut self, pixels: &[u8]) -> AnalyzerResult<()> {
        if self.exited {
            return Err(AnalyzerError::Encoder("broken pipe".into()));
        }
        self.log.lock().frames.push(WrittenFrame {
            session: self.session,
            len: pixels.len(),
            first_byte: pixels.first().copied(),
            at: Instant::now(),
        });
        self.written += 1;
        if self.exit_after.is_some_and(|n| self.written >= n) {
            self.exited = true;
        }
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    async fn close(&mut self, _timeout: Duration) {
        self.exited = true;
        self.log.lock().closes += 1;
    }
}
