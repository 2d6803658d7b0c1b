//! Mock collaborators for the analyzer pipeline.
//!
//! Stand-ins for every external dependency a worker talks to, so pipelines can run in
//! tests and in the daemon's `demo` mode without cameras, models, ffmpeg or a
//! notification server.
//!
//! # Available Mocks
//!
//! - [`SyntheticConnector`] - BGR test-pattern frames with refused connects, failing reads
//!   and end-of-stream behaviour
//! - [`MockDetectorPackage`] - algorithm package (`mock`) reporting a configured detection
//! - [`RecordingEncoderLauncher`] - encoder sessions that record what they were given
//! - [`MemorySink`] - notification sink keeping delivered records in memory
//!
//! # Wiring
//!
//! ```rust,ignore
//! use analyzer_mock::{MemorySink, MockDetectorPackage, RecordingEncoderLauncher, SyntheticConnector};
//! use analyzer_models::PackageTable;
//! use std::sync::Arc;
//!
//! let packages = PackageTable::new();
//! packages.register(Arc::new(MockDetectorPackage::new()));
//! let connector = SyntheticConnector::new(Default::default());
//! let encoder = RecordingEncoderLauncher::new();
//! let sink = MemorySink::new();
//! ```

mod memory_sink;
mod mock_detector;
mod mock_encoder;
pub mod pattern;
mod synthetic_source;

pub use memory_sink::MemorySink;
pub use mock_detector::{DetectorCounters, MockDetectorPackage, MOCK_PACKAGE_ID};
pub use mock_encoder::{RecordingEncoderLauncher, WrittenFrame};
pub use synthetic_source::{AfterLimit, FramePattern, SyntheticConfig, SyntheticConnector};
