//! Core types and traits for the analyzer pipeline.
//!
//! This crate holds everything the worker, model and manager crates agree on:
//!
//! - [`data`]: detections, [`ResultRef`], [`AlarmEvent`]
//! - [`capabilities`]: traits for capture sources, algorithm packages, encoders,
//!   notification sinks and media recorders
//! - [`status`]: the status snapshot board workers publish to
//! - [`health`]: heartbeat and error tracking for the process manager
//! - [`config`] and [`tracing_setup`]: layered configuration and logging
//! - [`error`], [`limits`], [`retry`]: error enum, shared limits, backoff policy
//!
//! The frame arena and queues live in `analyzer-pool` and are re-exported here.

pub mod capabilities;
pub mod config;
pub mod data;
pub mod error;
pub mod health;
pub mod limits;
pub mod retry;
pub mod status;
pub mod tracing_setup;

pub use analyzer_pool::{
    ArenaError, ArenaStats, BoundedQueue, Checkout, FrameArena, FrameId, FrameMeta, FrameRef,
    FrameShape, OverflowPolicy, PixelDtype, QueueStats, SlotHandle,
};
pub use data::{AlarmEvent, AlarmLevel, BBox, Detection, PairKey, ResultRef};
pub use error::{AnalyzerError, AnalyzerResult};
pub use status::{StatusBoard, StatusKind, StatusRecord, WorkerState};
