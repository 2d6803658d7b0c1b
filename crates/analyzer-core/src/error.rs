//! Error types for the analyzer pipeline.
//!
//! `AnalyzerError` is the single error enum shared by every crate in the workspace.
//! Cross-worker contracts return these as values; workers surface them through the
//! status board rather than propagating them out of their task.
//!
//! ## Error Hierarchy
//!
//! - **Configuration**: `Figment` wraps layered loading failures, `Configuration` carries
//!   semantic validation failures found after parsing.
//! - **Resource exhaustion**: `Arena` wraps [`ArenaError`] (full arena, oversized frame).
//!   Callers drop the frame and continue.
//! - **Models**: registration, loading and checkout failures from the model registry.
//! - **External collaborators**: `Source`, `Encoder`, `Sink` and `Inference` report
//!   failures of the capture source, encoder subprocess, notification sink and
//!   algorithm package respectively.
//! - **Orchestration**: unknown ids, duplicate or missing tasks, shutdown in progress.

use analyzer_pool::ArenaError;
use thiserror::Error;

/// Crate-wide result alias.
pub type AnalyzerResult<T> = std::result::Result<T, AnalyzerError>;

/// Primary error type for the analyzer pipeline.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    /// Layered configuration could not be loaded or deserialized.
    #[error("Configuration load error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// File or pipe I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame arena rejected an operation.
    ///
    /// **Recovery Strategy**: drop the frame; the pipeline keeps running.
    #[error("Arena error: {0}")]
    Arena(#[from] ArenaError),

    /// No model registered under this id.
    #[error("Model '{0}' is not registered")]
    ModelNotRegistered(String),

    /// Model exists but is not in the `loaded` state.
    #[error("Model '{model_id}' is not loaded (status: {status})")]
    ModelNotLoaded {
        /// Registry key.
        model_id: String,
        /// Current status label.
        status: String,
    },

    /// An instance could not be constructed by its algorithm package.
    ///
    /// **Recovery Strategy**: the pool is discarded and the model left in `error`.
    #[error("Failed to load model '{model_id}': {message}")]
    ModelLoad {
        /// Registry key.
        model_id: String,
        /// Package-provided reason.
        message: String,
    },

    /// No algorithm package registered under this id.
    #[error("Unknown algorithm package '{0}'")]
    UnknownPackage(String),

    /// Stream id not present in the catalog.
    #[error("Unknown stream '{0}'")]
    UnknownStream(String),

    /// Algorithm id not present in the catalog.
    #[error("Unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    /// A task with this id is already running.
    #[error("Task '{0}' already exists")]
    TaskExists(String),

    /// No task with this id.
    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    /// Another task already runs this (stream, algorithm) pair.
    #[error("Stream '{stream_id}' is already analysed by algorithm '{algo_id}'")]
    PairInUse {
        /// Stream id.
        stream_id: String,
        /// Algorithm id.
        algo_id: String,
    },

    /// Capture source could not be opened or read.
    ///
    /// **Recovery Strategy**: reconnect with exponential backoff.
    #[error("Capture source error: {0}")]
    Source(String),

    /// Encoder subprocess failed to spawn or accept frames.
    ///
    /// **Recovery Strategy**: bounded encoder restart inside the stream-out worker.
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Notification sink connection failed.
    ///
    /// **Recovery Strategy**: reconnect at a fixed interval.
    #[error("Notification sink error: {0}")]
    Sink(String),

    /// Model or postprocessor call failed.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Operation refused because shutdown has begun.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<figment::Error> for AnalyzerError {
    fn from(err: figment::Error) -> Self {
        AnalyzerError::Figment(Box::new(err))
    }
}
