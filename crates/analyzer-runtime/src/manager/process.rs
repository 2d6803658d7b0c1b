//! Process records: what the manager knows about each running worker.

use crate::workers::WorkerHandle;
use analyzer_core::config::StreamDefinition;
use analyzer_core::{PairKey, StatusKind};
use serde::Serialize;
use std::fmt;

/// Identity of a supervised worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessKey {
    /// `stream_{stream_id}`
    Capture(String),
    /// `algo_{stream_id}_{algo_id}`
    Inference(PairKey),
    /// `stream_out_{stream_id}_{algo_id}`
    StreamOut(PairKey),
    /// `alarm_handler`
    Alarm,
}

impl ProcessKey {
    /// Worker kind.
    pub fn kind(&self) -> WorkerKind {
        match self {
            ProcessKey::Capture(_) => WorkerKind::Capture,
            ProcessKey::Inference(_) => WorkerKind::Inference,
            ProcessKey::StreamOut(_) => WorkerKind::StreamOut,
            ProcessKey::Alarm => WorkerKind::Alarm,
        }
    }

    /// Status board entry the worker publishes to, if any.
    pub fn status_entry(&self) -> Option<(StatusKind, String)> {
        match self {
            ProcessKey::Capture(stream_id) => Some((StatusKind::Stream, stream_id.clone())),
            ProcessKey::Inference(pair) => Some((StatusKind::Algo, pair.to_string())),
            ProcessKey::StreamOut(pair) => Some((StatusKind::Output, pair.to_string())),
            ProcessKey::Alarm => None,
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKey::Capture(stream_id) => write!(f, "stream_{stream_id}"),
            ProcessKey::Inference(pair) => write!(f, "algo_{}_{}", pair.stream_id, pair.algo_id),
            ProcessKey::StreamOut(pair) => {
                write!(f, "stream_out_{}_{}", pair.stream_id, pair.algo_id)
            }
            ProcessKey::Alarm => write!(f, "alarm_handler"),
        }
    }
}

/// Kind of worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Capture worker.
    Capture,
    /// Inference worker.
    Inference,
    /// Stream-out worker.
    StreamOut,
    /// Alarm worker.
    Alarm,
}

/// Everything needed to start (or restart) a worker with its original parameters.
#[derive(Debug, Clone)]
pub enum WorkerSpec {
    /// Capture worker for a stream.
    Capture {
        /// Stream to open.
        stream: StreamDefinition,
    },
    /// Inference worker for a pair.
    Inference {
        /// Owning task.
        task_id: String,
        /// Stream and algorithm.
        pair: PairKey,
        /// Registry key of the model pool.
        model_id: String,
        /// Confidence at or above which alarms are raised.
        alarm_threshold: f32,
    },
    /// Stream-out worker for a pair.
    StreamOut {
        /// Stream and algorithm.
        pair: PairKey,
        /// Encoder target.
        output_url: String,
    },
    /// The alarm dispatcher.
    Alarm,
}

impl WorkerSpec {
    /// Key the worker is registered under.
    pub fn key(&self) -> ProcessKey {
        match self {
            WorkerSpec::Capture { stream } => ProcessKey::Capture(stream.id.clone()),
            WorkerSpec::Inference { pair, .. } => ProcessKey::Inference(pair.clone()),
            WorkerSpec::StreamOut { pair, .. } => ProcessKey::StreamOut(pair.clone()),
            WorkerSpec::Alarm => ProcessKey::Alarm,
        }
    }
}

/// Supervision state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Worker task spawned.
    Running,
    /// Worker found dead and not restarted.
    Dead,
    /// Restart budget exhausted.
    Error,
}

/// One supervised worker.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Parameters the worker was created with.
    pub spec: WorkerSpec,
    /// Running task.
    pub handle: WorkerHandle,
    /// Restart when found dead.
    pub auto_restart: bool,
    /// Restarts so far.
    pub restarts: u32,
    /// Supervision state.
    pub state: RecordState,
}

/// How a worker ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period.
    Graceful,
    /// Aborted after the grace period.
    Killed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_ids() {
        let pair = PairKey::new("cam1", "person");
        assert_eq!(ProcessKey::Capture("cam1".into()).to_string(), "stream_cam1");
        assert_eq!(ProcessKey::Inference(pair.clone()).to_string(), "algo_cam1_person");
        assert_eq!(ProcessKey::StreamOut(pair).to_string(), "stream_out_cam1_person");
        assert_eq!(ProcessKey::Alarm.to_string(), "alarm_handler");
    }
}
