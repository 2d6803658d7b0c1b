//! Status snapshot surface.
//!
//! Every worker publishes a small record under `(kind, key)`: capture workers under
//! `(Stream, stream_id)`, inference and stream-out workers under `(Algo, pair)` and
//! `(Output, pair)`. Publishing never waits on readers. Readers either poll
//! [`StatusBoard::get`] / [`StatusBoard::snapshot`] or use
//! [`StatusBoard::wait_for`], which is how a stream-out worker observes the ready
//! flag set by its inference worker.
//!
//! When a snapshot directory is configured, state transitions are also written as one
//! JSON file per record. Writes happen on the blocking pool when called from a runtime,
//! and only the newest pending content of each file is written. File errors are logged
//! and otherwise ignored.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which family a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Capture worker, keyed by stream id.
    Stream,
    /// Inference worker, keyed by (stream, algorithm).
    Algo,
    /// Stream-out worker, keyed by (stream, algorithm).
    Output,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusKind::Stream => "stream",
            StatusKind::Algo => "algo",
            StatusKind::Output => "output",
        };
        write!(f, "{label}")
    }
}

/// Lifecycle state shown for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, not yet doing work.
    #[default]
    Starting,
    /// Opening its source.
    Connecting,
    /// Waiting on an upstream worker.
    Waiting,
    /// Inference has processed its first frame.
    Ready,
    /// Steady state.
    Running,
    /// Dropping its source to reconnect.
    Reconnecting,
    /// Stopped on request.
    Stopped,
    /// Failed terminally; see `message`.
    Error,
}

impl WorkerState {
    /// Lower-case label.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Connecting => "connecting",
            WorkerState::Waiting => "waiting",
            WorkerState::Ready => "ready",
            WorkerState::Running => "running",
            WorkerState::Reconnecting => "reconnecting",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
        }
    }
}

/// One published record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Current state.
    pub state: WorkerState,
    /// Frames captured or written.
    pub frames: u64,
    /// Frames run through a model.
    pub processed: u64,
    /// Frames released by frame-skip.
    pub skipped: u64,
    /// Frames or alarms dropped for lack of resources.
    pub dropped: u64,
    /// Errors observed.
    pub errors: u64,
    /// Alarms raised.
    pub alarms: u64,
    /// Last frame/result handled.
    pub last_activity: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// Human-readable detail, set with error states.
    pub message: Option<String>,
    /// Frame width, once known.
    pub width: Option<u32>,
    /// Frame height, once known.
    pub height: Option<u32>,
    /// Frame rate, once known.
    pub fps: Option<f64>,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            frames: 0,
            processed: 0,
            skipped: 0,
            dropped: 0,
            errors: 0,
            alarms: 0,
            last_activity: None,
            updated_at: Utc::now(),
            message: None,
            width: None,
            height: None,
            fps: None,
        }
    }
}

/// Every record grouped by kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Capture records.
    pub streams: BTreeMap<String, StatusRecord>,
    /// Inference records.
    pub algos: BTreeMap<String, StatusRecord>,
    /// Stream-out records.
    pub outputs: BTreeMap<String, StatusRecord>,
}

type RecordMap = HashMap<(StatusKind, String), StatusRecord>;

/// Pending snapshot files, flushed by at most one writer at a time.
struct SnapshotFiles {
    dir: PathBuf,
    pending: Mutex<HashMap<PathBuf, Vec<u8>>>,
    flushing: AtomicBool,
}

impl SnapshotFiles {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            pending: Mutex::default(),
            flushing: AtomicBool::new(false),
        }
    }

    fn queue(self: &Arc<Self>, file: PathBuf, bytes: Vec<u8>) {
        self.pending.lock().insert(file, bytes);
        if self.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let files = Arc::clone(self);
                handle.spawn_blocking(move || files.flush());
            }
            Err(_) => self.flush(),
        }
    }

    /// Write until nothing is pending. Caller holds the `flushing` flag.
    fn flush(&self) {
        loop {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                self.flushing.store(false, Ordering::Release);
                // a writer may have queued after the take and seen the flag still set
                if self.pending.lock().is_empty() || self.flushing.swap(true, Ordering::AcqRel) {
                    return;
                }
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                warn!(path = %self.dir.display(), error = %e, "failed to create status snapshot directory");
                continue;
            }
            for (file, bytes) in batch {
                if let Err(e) = std::fs::write(&file, bytes) {
                    warn!(path = %file.display(), error = %e, "failed to write status snapshot");
                }
            }
        }
    }
}

/// Shared, lock-guarded table of status records.
#[derive(Clone, Default)]
pub struct StatusBoard {
    records: Arc<RwLock<RecordMap>>,
    snapshots: Option<Arc<SnapshotFiles>>,
}

impl StatusBoard {
    /// In-memory board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Board that also mirrors state transitions into `dir`.
    pub fn with_snapshot_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            records: Arc::default(),
            snapshots: Some(Arc::new(SnapshotFiles::new(dir.into()))),
        }
    }

    /// Set the state of a record, creating it if needed.
    pub fn set_state(&self, kind: StatusKind, key: &str, state: WorkerState, message: Option<String>) {
        let record = {
            let mut records = self.records.write();
            let record = records.entry((kind, key.to_string())).or_default();
            record.state = state;
            record.message = message;
            record.updated_at = Utc::now();
            record.clone()
        };
        debug!(%kind, key, state = state.as_str(), "status transition");
        self.persist(kind, key, &record);
    }

    /// Mutate a record in place, creating it if needed.
    pub fn update<F>(&self, kind: StatusKind, key: &str, f: F)
    where
        F: FnOnce(&mut StatusRecord),
    {
        let mut records = self.records.write();
        let record = records.entry((kind, key.to_string())).or_default();
        f(record);
        record.updated_at = Utc::now();
    }

    /// Copy of one record.
    pub fn get(&self, kind: StatusKind, key: &str) -> Option<StatusRecord> {
        self.records.read().get(&(kind, key.to_string())).cloned()
    }

    /// Current state of one record.
    pub fn state(&self, kind: StatusKind, key: &str) -> Option<WorkerState> {
        self.records
            .read()
            .get(&(kind, key.to_string()))
            .map(|r| r.state)
    }

    /// Drop a record.
    pub fn remove(&self, kind: StatusKind, key: &str) {
        self.records.write().remove(&(kind, key.to_string()));
    }

    /// Copy of every record.
    pub fn snapshot(&self) -> StatusSnapshot {
        let records = self.records.read();
        let mut snapshot = StatusSnapshot::default();
        for ((kind, key), record) in records.iter() {
            let target = match kind {
                StatusKind::Stream => &mut snapshot.streams,
                StatusKind::Algo => &mut snapshot.algos,
                StatusKind::Output => &mut snapshot.outputs,
            };
            target.insert(key.clone(), record.clone());
        }
        snapshot
    }

    /// Poll until `predicate` holds for the record or `timeout` passes.
    ///
    /// Returns whether the predicate was satisfied.
    pub async fn wait_for<P>(
        &self,
        kind: StatusKind,
        key: &str,
        predicate: P,
        timeout: Duration,
        poll: Duration,
    ) -> bool
    where
        P: Fn(&StatusRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get(kind, key).is_some_and(|r| predicate(&r)) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    fn persist(&self, kind: StatusKind, key: &str, record: &StatusRecord) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        let file = snapshots
            .dir
            .join(format!("{kind}_{}.json", key.replace(['/', '\\'], "_")));
        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => snapshots.queue(file, bytes),
            Err(e) => warn!(path = %file.display(), error = %e, "failed to encode status snapshot"),
        }
    }
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBoard")
            .field("records", &self.records.read().len())
            .field("snapshot_dir", &self.snapshots.as_ref().map(|s| &s.dir))
            .finish()
    }
}
