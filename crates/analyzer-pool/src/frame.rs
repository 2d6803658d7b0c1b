//! Frame metadata carried alongside arena slots.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Monotonic identifier assigned to every frame written into an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl FrameId {
    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame-{}", self.0)
    }
}

/// Sample type of a frame's pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelDtype {
    /// 8-bit unsigned samples (BGR24 video).
    #[default]
    U8,
    /// 16-bit unsigned samples.
    U16,
    /// 32-bit float samples.
    F32,
}

impl PixelDtype {
    /// Size of one sample in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelDtype::U8 => 1,
            PixelDtype::U16 => 2,
            PixelDtype::F32 => 4,
        }
    }
}

/// Frame geometry as (height, width, channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
    /// Rows.
    pub height: u32,
    /// Columns.
    pub width: u32,
    /// Interleaved channels per pixel.
    pub channels: u32,
}

impl FrameShape {
    /// Create a shape from (height, width, channels).
    pub fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Three-channel 8-bit image of the given size.
    pub fn bgr(width: u32, height: u32) -> Self {
        Self::new(height, width, 3)
    }

    /// Number of bytes a frame of this shape occupies, or `None` on overflow.
    pub fn byte_len(&self, dtype: PixelDtype) -> Option<usize> {
        (self.height as usize)
            .checked_mul(self.width as usize)?
            .checked_mul(self.channels as usize)?
            .checked_mul(dtype.bytes_per_sample())
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Immutable description of a frame stored in a slot.
#[derive(Debug, Clone)]
pub struct FrameMeta {
    /// Arena-assigned identifier.
    pub id: FrameId,
    /// Geometry of the stored pixels.
    pub shape: FrameShape,
    /// Sample type.
    pub dtype: PixelDtype,
    /// Stream that produced the frame.
    pub stream_id: Arc<str>,
    /// Capture time.
    pub timestamp: SystemTime,
}
