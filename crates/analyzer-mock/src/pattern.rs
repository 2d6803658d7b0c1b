//! Test pattern generation for synthetic BGR frames.

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Frame filled with one byte value.
pub fn solid_frame(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; width as usize * height as usize * 3]
}

/// Animated BGR test pattern.
///
/// - horizontal blue gradient and vertical green gradient
/// - a white square that moves one step per frame along the diagonal
/// - low-amplitude red noise that changes every frame
pub fn generate_test_pattern(width: u32, height: u32, frame_num: u64) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u8; w * h * 3];
    if w == 0 || h == 0 {
        return buffer;
    }

    let square = (w.min(h) / 8).max(1);
    let travel = w.min(h).saturating_sub(square).max(1);
    let offset = (frame_num as usize) % travel;
    let frame_seed = frame_num.wrapping_mul(2654435761);

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let in_square =
                (offset..offset + square).contains(&x) && (offset..offset + square).contains(&y);
            if in_square {
                buffer[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
                continue;
            }
            buffer[idx] = (x * 255 / w.max(2).saturating_sub(1)) as u8;
            buffer[idx + 1] = (y * 255 / h.max(2).saturating_sub(1)) as u8;
            buffer[idx + 2] = (prng(frame_seed ^ idx as u64) & 0x1F) as u8;
        }
    }
    buffer
}
