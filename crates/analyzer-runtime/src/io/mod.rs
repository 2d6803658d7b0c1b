//! Adapters for the pipeline's external collaborators.
//!
//! - [`FfmpegSourceConnector`]: decoder subprocess per capture connection
//! - [`FfmpegEncoderLauncher`]: encoder subprocess per output, two argument profiles
//! - [`TcpJsonSink`] / [`LogSink`]: alarm notification channels
//! - [`RawSnapshotRecorder`]: alarm frame snapshots on disk

mod ffmpeg_encoder;
mod ffmpeg_source;
mod snapshot;
mod tcp_sink;

pub use ffmpeg_encoder::{encoder_args, FfmpegEncoderLauncher};
pub use ffmpeg_source::{decoder_args, FfmpegSourceConnector};
pub use snapshot::RawSnapshotRecorder;
pub use tcp_sink::{LogSink, TcpJsonSink};
