//! ffmpeg encoder subprocess fed with raw BGR frames on stdin.

use analyzer_core::capabilities::{EncoderLauncher, EncoderParams, EncoderProfile, EncoderSession};
use analyzer_core::{AnalyzerError, AnalyzerResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Build the encoder argument list (without the binary).
///
/// The input section is identical for every profile; only codec flags differ.
pub fn encoder_args(params: &EncoderParams) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-an",
        "-f",
        "rawvideo",
        "-vcodec",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", params.width, params.height));
    args.push("-r".into());
    args.push(format_fps(params.fps));
    args.extend(["-i", "-"].map(String::from));

    let codec: &[&str] = match params.profile {
        EncoderProfile::LowLatency => &[
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
            "-bufsize",
            "5000k",
            "-maxrate",
            "10000k",
            "-g",
            "15",
            "-x264-params",
            "keyint=15:min-keyint=15:scenecut=0",
        ],
        EncoderProfile::HardwareAccelerated => &[
            "-c:v",
            "h264_nvenc",
            "-preset",
            "p1",
            "-tune",
            "ll",
            "-zerolatency",
            "1",
            "-rc",
            "cbr",
            "-b:v",
            "2M",
            "-maxrate",
            "2.5M",
            "-bufsize",
            "512k",
            "-g",
            "10",
            "-profile:v",
            "baseline",
            "-pix_fmt",
            "yuv420p",
        ],
    };
    args.extend(codec.iter().map(|s| s.to_string()));

    args.extend(["-f", "rtsp", "-rtsp_transport", "tcp"].map(String::from));
    args.push(params.output_url.clone());
    args
}

fn format_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{fps:.3}")
    }
}

/// Launches `ffmpeg` (or a compatible binary) per output.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderLauncher {
    binary: String,
}

impl FfmpegEncoderLauncher {
    /// Launcher running `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegEncoderLauncher {
    async fn spawn(&self, params: &EncoderParams) -> AnalyzerResult<Box<dyn EncoderSession>> {
        let args = encoder_args(params);
        info!(binary = %self.binary, output = %params.output_url, "starting encoder");
        debug!(args = %args.join(" "), "encoder arguments");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AnalyzerError::Encoder(format!("failed to start {}: {e}", self.binary)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AnalyzerError::Encoder("encoder stdin unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let output = params.output_url.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%output, "encoder: {line}");
                }
            });
        }

        Ok(Box::new(FfmpegSession {
            child,
            stdin: Some(stdin),
        }))
    }
}

struct FfmpegSession {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl EncoderSession for FfmpegSession {
    async fn write_frame(&mut self, pixels: &[u8]) -> AnalyzerResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AnalyzerError::Encoder("encoder input closed".into()))?;
        stdin
            .write_all(pixels)
            .await
            .map_err(|e| AnalyzerError::Encoder(format!("write to encoder failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AnalyzerError::Encoder(format!("flush to encoder failed: {e}")))
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                warn!(%status, "encoder exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "cannot poll encoder");
                true
            }
        }
    }

    async fn close(&mut self, timeout: Duration) {
        // closing stdin tells ffmpeg to flush and exit
        drop(self.stdin.take());
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "encoder closed"),
            Ok(Err(e)) => warn!(error = %e, "waiting for encoder failed"),
            Err(_) => {
                warn!(?timeout, "encoder did not exit, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to kill encoder");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(profile: EncoderProfile) -> EncoderParams {
        EncoderParams {
            width: 640,
            height: 480,
            fps: 25.0,
            output_url: "rtsp://media/live/cam-1".into(),
            profile,
        }
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter().position(|a| a == flag).unwrap()
    }

    #[test]
    fn test_low_latency_args() {
        let args = encoder_args(&params(EncoderProfile::LowLatency));
        assert_eq!(args[position(&args, "-s") + 1], "640x480");
        assert_eq!(args[position(&args, "-r") + 1], "25");
        assert_eq!(args[position(&args, "-c:v") + 1], "libx264");
        assert_eq!(args[position(&args, "-tune") + 1], "zerolatency");
        assert_eq!(args[position(&args, "-rtsp_transport") + 1], "tcp");
        assert_eq!(args.last().unwrap(), "rtsp://media/live/cam-1");
        // raw input is declared before the output codec
        assert!(position(&args, "-i") < position(&args, "-c:v"));
    }

    #[test]
    fn test_hardware_profile_changes_codec_only() {
        let low = encoder_args(&params(EncoderProfile::LowLatency));
        let hw = encoder_args(&params(EncoderProfile::HardwareAccelerated));
        assert_eq!(hw[position(&hw, "-c:v") + 1], "h264_nvenc");
        assert_eq!(hw[position(&hw, "-preset") + 1], "p1");
        let input_end = position(&low, "-i") + 2;
        assert_eq!(low[..input_end], hw[..input_end]);
        assert_eq!(low.last(), hw.last());
    }

    #[test]
    fn test_fractional_fps() {
        let mut p = params(EncoderProfile::LowLatency);
        p.fps = 29.97;
        let args = encoder_args(&p);
        assert_eq!(args[position(&args, "-r") + 1], "29.970");
    }
}
