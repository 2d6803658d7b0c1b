//! Shared limits and default timings.
//!
//! Configuration defaults are taken from here so that workers, the manager and the
//! config loader agree on the same numbers.

use crate::error::{AnalyzerError, AnalyzerResult};
use analyzer_pool::{FrameShape, PixelDtype};
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Interval between worker heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Silence after which a worker counts as unresponsive.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum gap between two warnings about dropped capture frames.
pub const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Encoder session age after which its restart budget is refilled.
pub const ENCODER_STABLE_AFTER: Duration = Duration::from_secs(60);

/// Interval of the process manager's liveness scan.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Time a worker gets to honour its stop flag before it is aborted.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Time allowed for an aborted worker to unwind.
pub const KILL_WAIT: Duration = Duration::from_secs(1);

/// Hard deadline for the whole shutdown sequence.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Time the encoder gets to exit after its input pipe is closed.
pub const ENCODER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a stream-out worker waits for inference readiness or its first result.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll period for the ready flag.
pub const READY_POLL: Duration = Duration::from_millis(500);

/// Frame rate assumed when the stream status carries none.
pub const DEFAULT_FPS: f64 = 25.0;

// =============================================================================
// Size Limits
// =============================================================================

/// Default per-pair frame queue capacity.
pub const FRAME_QUEUE_CAPACITY: usize = 30;

/// Default per-pair result queue capacity.
pub const RESULT_QUEUE_CAPACITY: usize = 10;

/// Default alarm queue capacity.
pub const ALARM_QUEUE_CAPACITY: usize = 100;

/// Default arena slot count.
pub const ARENA_SLOTS: usize = 64;

/// Default arena slot capacity: one 1080p BGR frame.
pub const ARENA_SLOT_BYTES: usize = 1920 * 1080 * 3;

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 16_384;

/// Validate frame dimensions and return the byte length of a BGR frame.
pub fn validate_frame_size(width: u32, height: u32) -> AnalyzerResult<usize> {
    if width == 0 || height == 0 || width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(AnalyzerError::Configuration(format!(
            "frame dimensions {width}x{height} outside 1..={MAX_FRAME_DIMENSION}"
        )));
    }
    FrameShape::bgr(width, height)
        .byte_len(PixelDtype::U8)
        .ok_or_else(|| AnalyzerError::Configuration("frame size overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_frame_size() {
        assert_eq!(validate_frame_size(64, 64).unwrap(), 64 * 64 * 3);
        assert!(validate_frame_size(0, 10).is_err());
        assert!(validate_frame_size(MAX_FRAME_DIMENSION + 1, 10).is_err());
    }
}
