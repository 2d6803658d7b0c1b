//! Worker state machines and the handle the process manager holds for each.
//!
//! Every worker is a tokio task that talks to the others only through the frame arena,
//! the queues and the status board in its [`PipelineContext`](crate::PipelineContext).
//! Stopping is cooperative: each worker owns a child [`CancellationToken`] and checks it
//! at every loop boundary. The manager escalates to [`WorkerHandle::abort`] when a
//! worker ignores the request.

pub mod alarm;
pub mod capture;
pub mod inference;
pub mod stream_out;

pub use alarm::{AlarmReport, AlarmWorker};
pub use capture::{CaptureReport, CaptureWorker};
pub use inference::{InferenceReport, InferenceWorker};
pub use stream_out::{StreamOutReport, StreamOutWorker};

use analyzer_core::health::SystemHealthMonitor;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rate-limits a worker's heartbeats.
///
/// Workers call [`beat`](Heartbeat::beat) on every loop turn, including idle pop
/// timeouts; only one heartbeat per interval reaches the monitor.
pub(crate) struct Heartbeat {
    health: SystemHealthMonitor,
    module: String,
    interval: Duration,
    last: Option<Instant>,
}

impl Heartbeat {
    pub(crate) fn new(health: SystemHealthMonitor, module: impl Into<String>, interval: Duration) -> Self {
        Self {
            health,
            module: module.into(),
            interval,
            last: None,
        }
    }

    /// Send a heartbeat if the interval has passed. `message` is only built when one
    /// is sent.
    pub(crate) async fn beat<F>(&mut self, message: F)
    where
        F: FnOnce() -> String,
    {
        let now = Instant::now();
        if self.last.is_some_and(|last| now.duration_since(last) < self.interval) {
            return;
        }
        self.last = Some(now);
        self.health
            .heartbeat_with_message(self.module.as_str(), Some(message()))
            .await;
    }
}

/// Running worker task.
///
/// Dropping the handle aborts a worker that is still running.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `worker` with a stop token derived from `parent`.
    pub fn spawn<F, Fut>(parent: &CancellationToken, worker: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let join = tokio::spawn(worker(cancel.clone()));
        Self { cancel, join }
    }

    /// Whether the task is still running.
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Ask the worker to stop at its next loop boundary.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait up to `timeout` for the task to finish. Returns whether it did.
    pub async fn join_timeout(&mut self, timeout: Duration) -> bool {
        if self.join.is_finished() {
            return true;
        }
        tokio::time::timeout(timeout, &mut self.join).await.is_ok()
    }

    /// Cancel the task at its next await point.
    pub fn abort(&self) {
        self.join.abort();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}
