//! Alarm snapshot recorder writing frames as binary PPM images.

use analyzer_core::capabilities::MediaRecorder;
use analyzer_core::{AlarmEvent, AnalyzerResult, FrameShape};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes `{alarm_id}_original.ppm` and `{alarm_id}_annotated.ppm` per alarm.
#[derive(Debug, Clone)]
pub struct RawSnapshotRecorder {
    dir: PathBuf,
}

impl RawSnapshotRecorder {
    /// Recorder writing into `dir`, created on first use.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

/// Encode interleaved BGR pixels as a P6 image. Other layouts are written unchanged.
fn encode_ppm(shape: FrameShape, pixels: &[u8]) -> Vec<u8> {
    let expected = shape.width as usize * shape.height as usize * 3;
    if shape.channels != 3 || pixels.len() != expected {
        return pixels.to_vec();
    }
    let header = format!("P6\n{} {}\n255\n", shape.width, shape.height);
    let mut out = Vec::with_capacity(header.len() + pixels.len());
    out.extend_from_slice(header.as_bytes());
    for bgr in pixels.chunks_exact(3) {
        out.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
    }
    out
}

#[async_trait]
impl MediaRecorder for RawSnapshotRecorder {
    async fn record(
        &self,
        event: &AlarmEvent,
        shape: FrameShape,
        original: Bytes,
        annotated: Bytes,
    ) -> AnalyzerResult<Vec<String>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut refs = Vec::with_capacity(2);
        for (suffix, pixels) in [("original", original), ("annotated", annotated)] {
            let path = self.dir.join(format!("{}_{suffix}.ppm", event.alarm_id));
            tokio::fs::write(&path, encode_ppm(shape, &pixels)).await?;
            refs.push(path.display().to_string());
        }
        debug!(alarm_id = %event.alarm_id, "alarm snapshots written");
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_core::{BBox, Detection, FrameId, PairKey};

    #[test]
    fn test_ppm_swaps_channels() {
        let ppm = encode_ppm(FrameShape::bgr(1, 1), &[1, 2, 3]);
        assert_eq!(&ppm[..11], b"P6\n1 1\n255\n");
        assert_eq!(&ppm[11..], &[3, 2, 1]);
    }

    #[tokio::test]
    async fn test_writes_both_frames() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RawSnapshotRecorder::new(dir.path().join("alarms"));
        let det = Detection::new("person", 0.9, BBox::default());
        let event = AlarmEvent::new("t", &PairKey::new("cam", "a"), FrameId(1), &det, vec![]);

        let pixels = Bytes::from(vec![0u8; 2 * 2 * 3]);
        let refs = recorder
            .record(&event, FrameShape::bgr(2, 2), pixels.clone(), pixels)
            .await
            .unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs[0].ends_with("_original.ppm"));
        assert!(std::path::Path::new(&refs[1]).exists());
    }
}
