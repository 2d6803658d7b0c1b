//! Drawing detection boxes onto BGR frames.

use analyzer_core::{Detection, FrameShape, PixelDtype};

/// Colour used when a detection carries none (BGR green).
pub const DEFAULT_COLOR: [u8; 3] = [0, 255, 0];

/// Outline every detection's box in place.
///
/// Only 8-bit three-channel frames are drawn on; anything else is left untouched and
/// `false` is returned. Boxes are clipped to the frame.
pub fn draw_detections(
    pixels: &mut [u8],
    shape: FrameShape,
    dtype: PixelDtype,
    detections: &[Detection],
    thickness: u32,
) -> bool {
    let expected = shape.byte_len(dtype);
    if dtype != PixelDtype::U8 || shape.channels != 3 || expected != Some(pixels.len()) {
        return false;
    }
    if shape.width == 0 || shape.height == 0 {
        return false;
    }

    let max_x = shape.width as i64 - 1;
    let max_y = shape.height as i64 - 1;
    let t = thickness.max(1) as i64;

    for det in detections {
        let color = det.color.unwrap_or(DEFAULT_COLOR);
        let x1 = (det.bbox.x1.round() as i64).clamp(0, max_x);
        let y1 = (det.bbox.y1.round() as i64).clamp(0, max_y);
        let x2 = (det.bbox.x2.round() as i64).clamp(0, max_x);
        let y2 = (det.bbox.y2.round() as i64).clamp(0, max_y);
        if x2 < x1 || y2 < y1 {
            continue;
        }

        let mut put = |x: i64, y: i64| {
            let offset = ((y * shape.width as i64 + x) * 3) as usize;
            pixels[offset..offset + 3].copy_from_slice(&color);
        };

        for k in 0..t {
            let (top, bottom) = ((y1 + k).min(y2), (y2 - k).max(y1));
            for x in x1..=x2 {
                put(x, top);
                put(x, bottom);
            }
            let (left, right) = ((x1 + k).min(x2), (x2 - k).max(x1));
            for y in y1..=y2 {
                put(left, y);
                put(right, y);
            }
        }
    }
    true
}
