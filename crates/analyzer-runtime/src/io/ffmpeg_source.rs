//! ffmpeg decoder subprocess producing raw BGR frames on stdout.

use analyzer_core::capabilities::{DecodedFrame, FrameSource, SourceConnector};
use analyzer_core::config::StreamDefinition;
use analyzer_core::limits::validate_frame_size;
use analyzer_core::{AnalyzerError, AnalyzerResult, FrameShape, PixelDtype};
use async_trait::async_trait;
use bytes::BytesMut;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Decoder argument list (without the binary) for `stream`.
pub fn decoder_args(stream: &StreamDefinition) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .map(String::from)
        .to_vec();
    if stream.url.starts_with("rtsp://") {
        args.extend(
            ["-rtsp_transport", "tcp", "-fflags", "nobuffer", "-flags", "low_delay"]
                .map(String::from),
        );
    }
    args.extend(["-i".to_string(), stream.url.clone()]);
    args.extend(
        [
            "-an".to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", stream.width, stream.height),
            "-pix_fmt".to_string(),
            "bgr24".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-".to_string(),
        ],
    );
    args
}

/// Opens streams by spawning a decoder per connection.
#[derive(Debug, Clone)]
pub struct FfmpegSourceConnector {
    binary: String,
}

impl FfmpegSourceConnector {
    /// Connector running `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl SourceConnector for FfmpegSourceConnector {
    async fn open(&self, stream: &StreamDefinition) -> AnalyzerResult<Box<dyn FrameSource>> {
        let frame_len = validate_frame_size(stream.width, stream.height)?;
        let mut child = Command::new(&self.binary)
            .args(decoder_args(stream))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AnalyzerError::Source(format!("failed to start {}: {e}", self.binary)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AnalyzerError::Source("decoder stdout unavailable".into()))?;

        info!(stream_id = %stream.id, url = %stream.url, "decoder started");
        Ok(Box::new(FfmpegSource {
            child,
            stdout,
            shape: FrameShape::bgr(stream.width, stream.height),
            frame_len,
            fps: stream.fps,
        }))
    }
}

struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    shape: FrameShape,
    frame_len: usize,
    fps: Option<f64>,
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn read_frame(&mut self) -> AnalyzerResult<DecodedFrame> {
        let mut buffer = BytesMut::zeroed(self.frame_len);
        self.stdout
            .read_exact(&mut buffer)
            .await
            .map_err(|e| AnalyzerError::Source(format!("decoder read failed: {e}")))?;
        Ok(DecodedFrame {
            pixels: buffer.freeze(),
            shape: self.shape,
            dtype: PixelDtype::U8,
        })
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to stop decoder");
        }
        debug!("decoder closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtsp_uses_tcp_transport() {
        let stream = StreamDefinition {
            id: "cam".into(),
            url: "rtsp://camera/1".into(),
            width: 320,
            height: 240,
            fps: Some(15.0),
        };
        let args = decoder_args(&stream);
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "rtsp://camera/1");
        assert!(args[..input].contains(&"tcp".to_string()));
        assert!(args.contains(&"scale=320:240".to_string()));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_file_source_has_no_rtsp_flags() {
        let stream = StreamDefinition {
            id: "file".into(),
            url: "/videos/demo.mp4".into(),
            width: 64,
            height: 64,
            fps: None,
        };
        assert!(!decoder_args(&stream).contains(&"-rtsp_transport".to_string()));
    }
}
