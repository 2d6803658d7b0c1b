//! Process manager: composes tasks out of workers and supervises them.
//!
//! A task is one stream analysed by one algorithm, with an optional outbound stream:
//!
//! ```text
//!   capture(stream) ──frames──> inference(stream, algo) ──results──> stream_out(stream, algo)
//!        │                              │
//!        └── shared by every task       └──alarms──> alarm_handler (one per process)
//!            on the same stream
//! ```
//!
//! All bookkeeping (process records, tasks, stream reference counts) sits behind one
//! async mutex. Operations on it are rare compared with frame traffic.
//!
//! Shutdown cancels the root token every worker token derives from, joins all workers
//! against a common grace period, aborts stragglers and gives up entirely once the
//! overall deadline passes. With `hard_exit_on_deadline` a [`Watchdog`] thread also
//! exits the process if the sequence itself hangs.

pub mod catalog;
pub mod memory;
pub mod process;
pub mod watchdog;

pub use catalog::{Catalog, StaticCatalog};
pub use memory::{MemorySampler, MemorySample};
pub use process::{ProcessKey, ProcessRecord, RecordState, StopOutcome, WorkerKind, WorkerSpec};
pub use watchdog::Watchdog;

use crate::context::PipelineContext;
use crate::workers::{AlarmWorker, CaptureWorker, InferenceWorker, StreamOutWorker, WorkerHandle};
use analyzer_core::config::OutputTarget;
use analyzer_core::health::{ErrorSeverity, HealthReport};
use analyzer_core::status::StatusSnapshot;
use analyzer_core::{AnalyzerError, AnalyzerResult, ArenaStats, PairKey, QueueStats, WorkerState};
use analyzer_models::ModelSummary;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Errors listed in [`ManagerStatus::health`].
const STATUS_RECENT_ERRORS: usize = 20;

/// A running task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Task id.
    pub task_id: String,
    /// Stream and algorithm.
    pub pair: PairKey,
    /// Registry key of the model pool the task uses.
    pub model_id: String,
    /// Outbound stream settings.
    pub output: OutputTarget,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Supervision view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    /// Process id, e.g. `stream_cam1`.
    pub id: String,
    /// Worker kind.
    pub kind: WorkerKind,
    /// Task still running.
    pub alive: bool,
    /// Restarts performed by the health loop.
    pub restarts: u32,
    /// Supervision state.
    pub state: RecordState,
}

/// Everything [`ProcessManager::get_status`] reports.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    /// Supervised workers, sorted by id.
    pub processes: Vec<ProcessStatus>,
    /// Running tasks, sorted by id.
    pub tasks: Vec<TaskRecord>,
    /// Reference count per captured stream.
    pub stream_refs: BTreeMap<String, usize>,
    /// Per-worker status records.
    pub workers: StatusSnapshot,
    /// Frame arena counters.
    pub arena: ArenaStats,
    /// Queue counters.
    pub queues: Vec<QueueStats>,
    /// Model pools.
    pub models: Vec<ModelSummary>,
    /// Memory usage.
    pub memory: MemorySample,
    /// Aggregated health with the latest errors.
    pub health: HealthReport,
    /// Shutdown has begun.
    pub shutting_down: bool,
}

/// Outcome of [`ProcessManager::shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Workers that exited within the grace period.
    pub graceful: Vec<String>,
    /// Workers aborted after the grace period.
    pub killed: Vec<String>,
    /// The overall deadline passed before the sequence finished.
    pub deadline_exceeded: bool,
    /// Queued items released while draining.
    pub drained: usize,
    /// Wall time of the whole shutdown.
    pub elapsed: Duration,
}

#[derive(Default)]
struct ManagerState {
    processes: BTreeMap<ProcessKey, ProcessRecord>,
    tasks: BTreeMap<String, TaskRecord>,
    stream_refs: HashMap<String, usize>,
}

/// Top-level supervisor of every worker in the process.
pub struct ProcessManager {
    ctx: PipelineContext,
    catalog: Arc<dyn Catalog>,
    root: CancellationToken,
    state: Mutex<ManagerState>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    memory: parking_lot::Mutex<MemorySampler>,
    shutting_down: AtomicBool,
}

impl ProcessManager {
    /// Manager over `ctx`, resolving ids through `catalog`.
    pub fn new(ctx: PipelineContext, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            ctx,
            catalog,
            root: CancellationToken::new(),
            state: Mutex::new(ManagerState::default()),
            monitor: parking_lot::Mutex::new(None),
            memory: parking_lot::Mutex::new(MemorySampler::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Shared services handed to workers.
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start a task.
    ///
    /// The capture worker of `stream_id` is shared: a second task on the same stream
    /// only bumps the stream's reference count. Only a live capture worker is shared; a
    /// dead or failed one is replaced. The alarm worker is started with the first task
    /// and replaced the same way.
    pub async fn create_task(
        &self,
        task_id: &str,
        stream_id: &str,
        algo_id: &str,
        output: OutputTarget,
    ) -> AnalyzerResult<()> {
        if self.is_shutting_down() {
            return Err(AnalyzerError::ShuttingDown);
        }
        let mut state = self.state.lock().await;

        if state.tasks.contains_key(task_id) {
            return Err(AnalyzerError::TaskExists(task_id.to_string()));
        }
        let stream = self
            .catalog
            .stream(stream_id)
            .ok_or_else(|| AnalyzerError::UnknownStream(stream_id.to_string()))?;
        let algorithm = self
            .catalog
            .algorithm(algo_id)
            .ok_or_else(|| AnalyzerError::UnknownAlgorithm(algo_id.to_string()))?;
        let pair = PairKey::new(stream_id, algo_id);
        if state.tasks.values().any(|t| t.pair == pair) {
            return Err(AnalyzerError::PairInUse {
                stream_id: stream_id.to_string(),
                algo_id: algo_id.to_string(),
            });
        }
        let output_url = match (&output.enabled, &output.url) {
            (true, Some(url)) => Some(url.clone()),
            (true, None) => {
                return Err(AnalyzerError::Configuration(format!(
                    "task '{task_id}' enables output without a url"
                )))
            }
            (false, _) => None,
        };

        let model_id =
            self.ctx
                .models
                .register(&algorithm.package, &algorithm.model, algorithm.config.clone())?;
        self.ctx.models.load(&model_id, algorithm.pool_size)?;

        // Subscribe before capture starts so the first frame is not missed.
        self.ctx.queues.frame_queue(&pair);

        let refs = state.stream_refs.entry(stream_id.to_string()).or_insert(0);
        *refs += 1;
        let refs = *refs;
        if self.ensure_live(&mut state, WorkerSpec::Capture { stream }).await {
            info!(stream_id, refs, "reusing capture worker");
        }

        // Output first, so its result lease exists before inference sees a frame.
        if let Some(output_url) = output_url {
            self.ensure_live(
                &mut state,
                WorkerSpec::StreamOut {
                    pair: pair.clone(),
                    output_url,
                },
            )
            .await;
        }

        let alarm_threshold = algorithm
            .alarm_threshold
            .unwrap_or(self.ctx.config.inference.alarm_threshold);
        self.start(
            &mut state,
            WorkerSpec::Inference {
                task_id: task_id.to_string(),
                pair: pair.clone(),
                model_id: model_id.clone(),
                alarm_threshold,
            },
        );

        self.ensure_live(&mut state, WorkerSpec::Alarm).await;

        state.tasks.insert(
            task_id.to_string(),
            TaskRecord {
                task_id: task_id.to_string(),
                pair,
                model_id,
                output,
                created_at: Utc::now(),
            },
        );
        info!(task_id, stream_id, algo_id, "task created");
        Ok(())
    }

    /// Tear down part or all of a task.
    ///
    /// `stop_output` stops only the outbound stream and keeps the task. `stop_algo`
    /// stops the outbound stream and the inference worker, removes the task and
    /// releases its stream reference; the capture worker stops with the last
    /// reference. A model no other task uses is unloaded. Asking for neither is a
    /// configuration error.
    pub async fn stop_task(
        &self,
        task_id: &str,
        stop_output: bool,
        stop_algo: bool,
    ) -> AnalyzerResult<()> {
        if !stop_output && !stop_algo {
            return Err(AnalyzerError::Configuration(format!(
                "stop_task('{task_id}') needs stop_output or stop_algo"
            )));
        }
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AnalyzerError::TaskNotFound(task_id.to_string()))?;
        let pair = task.pair.clone();

        if let Some(record) = state.processes.remove(&ProcessKey::StreamOut(pair.clone())) {
            self.stop_record(ProcessKey::StreamOut(pair.clone()), record).await;
        }
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.output.enabled = false;
        }
        if !stop_algo {
            info!(task_id, "task output stopped");
            return Ok(());
        }

        if let Some(record) = state.processes.remove(&ProcessKey::Inference(pair.clone())) {
            self.stop_record(ProcessKey::Inference(pair.clone()), record).await;
        }
        state.tasks.remove(task_id);
        let drained = self.ctx.queues.remove_pair(&pair);
        self.ctx.cooldowns.reset(&pair);

        let remaining = match state.stream_refs.get_mut(&pair.stream_id) {
            Some(refs) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            None => 0,
        };
        if remaining == 0 {
            state.stream_refs.remove(&pair.stream_id);
            let capture_key = ProcessKey::Capture(pair.stream_id.clone());
            if let Some(record) = state.processes.remove(&capture_key) {
                self.stop_record(capture_key, record).await;
            }
        }

        if !state.tasks.values().any(|t| t.model_id == task.model_id) {
            self.ctx.models.unload(&task.model_id)?;
        }
        info!(task_id, stream_refs = remaining, drained, "task stopped");
        Ok(())
    }

    /// One liveness scan.
    ///
    /// A dead worker is restarted with its original parameters while it has restarts
    /// left. A worker that reported a terminal error itself, or ran out of restarts, is
    /// marked `Error` and left dead. Returns the ids of restarted workers.
    pub async fn check_health(&self) -> Vec<String> {
        if self.is_shutting_down() {
            return Vec::new();
        }
        let supervisor = &self.ctx.config.supervisor;
        let mut restarted = Vec::new();
        let mut state = self.state.lock().await;
        let dead: Vec<ProcessKey> = state
            .processes
            .iter()
            .filter(|(_, r)| r.state == RecordState::Running && !r.handle.is_alive())
            .map(|(k, _)| k.clone())
            .collect();

        for key in dead {
            let id = key.to_string();
            let reported_error = key
                .status_entry()
                .and_then(|(kind, k)| self.ctx.status.get(kind, &k))
                .filter(|r| r.state == WorkerState::Error);
            let Some(record) = state.processes.get_mut(&key) else {
                continue;
            };

            if let Some(status) = reported_error {
                record.state = RecordState::Error;
                error!(process = %id, message = ?status.message, "worker failed terminally");
                self.ctx
                    .health
                    .report_error(
                        &id,
                        ErrorSeverity::Critical,
                        status.message.unwrap_or_else(|| "worker failed".into()),
                    )
                    .await;
            } else if !record.auto_restart {
                record.state = RecordState::Dead;
                warn!(process = %id, "worker died, auto-restart disabled");
                self.mark_error(&key, "worker exited");
                self.ctx
                    .health
                    .report_error(&id, ErrorSeverity::Error, "worker exited")
                    .await;
            } else if record.restarts >= supervisor.max_restarts {
                record.state = RecordState::Error;
                let message = format!("worker died after {} restarts", record.restarts);
                error!(process = %id, restarts = record.restarts, "restart budget exhausted");
                self.mark_error(&key, &message);
                self.ctx
                    .health
                    .report_error(&id, ErrorSeverity::Critical, message)
                    .await;
            } else {
                record.restarts += 1;
                record.handle = self.spawn_worker(&record.spec);
                warn!(process = %id, restarts = record.restarts, "worker died, restarted");
                self.ctx
                    .health
                    .report_error(
                        &id,
                        ErrorSeverity::Warning,
                        format!("restarted ({} of {})", record.restarts, supervisor.max_restarts),
                    )
                    .await;
                restarted.push(id);
            }
        }
        drop(state);

        let memory = self.memory.lock().sample();
        debug!(
            process_mb = ?memory.process_mb,
            system_percent = memory.percent,
            "health check complete"
        );
        restarted
    }

    /// Run [`check_health`](Self::check_health) every `monitor_interval` until shutdown.
    pub fn start_monitor(self: &Arc<Self>) {
        let interval = self.ctx.config.supervisor.monitor_interval;
        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.root.child_token();
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    let restarted = manager.check_health().await;
                    if !restarted.is_empty() {
                        info!(?restarted, "health check restarted workers");
                    }
                }
                debug!("health monitor stopped");
            }
            .instrument(info_span!("health_monitor")),
        );
        if let Some(previous) = self.monitor.lock().replace(task) {
            previous.abort();
        }
    }

    /// Snapshot of processes, tasks, worker status, arena, queues, models and memory.
    pub async fn get_status(&self) -> ManagerStatus {
        let (processes, tasks, stream_refs) = {
            let state = self.state.lock().await;
            let processes = state
                .processes
                .iter()
                .map(|(key, record)| ProcessStatus {
                    id: key.to_string(),
                    kind: key.kind(),
                    alive: record.handle.is_alive(),
                    restarts: record.restarts,
                    state: record.state,
                })
                .collect();
            let tasks = state.tasks.values().cloned().collect();
            let stream_refs = state
                .stream_refs
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            (processes, tasks, stream_refs)
        };

        ManagerStatus {
            processes,
            tasks,
            stream_refs,
            workers: self.ctx.status.snapshot(),
            arena: self.ctx.arena.stats(),
            queues: self.ctx.queues.stats(),
            models: self.ctx.models.list(),
            memory: self.memory.lock().sample(),
            health: self.ctx.health.report(STATUS_RECENT_ERRORS).await,
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Stop everything.
    ///
    /// Returns within `shutdown_deadline` plus the time needed to drain queues and
    /// unload models. Further task creation fails with
    /// [`AnalyzerError::ShuttingDown`].
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let supervisor = self.ctx.config.supervisor.clone();
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress");
        }
        let watchdog = supervisor
            .hard_exit_on_deadline
            .then(|| Watchdog::arm(supervisor.shutdown_deadline));
        info!(deadline = ?supervisor.shutdown_deadline, "shutting down");

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.root.cancel();

        let mut report = ShutdownReport::default();
        let sequence = async {
            let mut records: Vec<(ProcessKey, ProcessRecord)> = {
                let mut state = self.state.lock().await;
                state.tasks.clear();
                state.stream_refs.clear();
                std::mem::take(&mut state.processes).into_iter().collect()
            };

            let grace = supervisor.stop_grace;
            let joined = join_all(
                records
                    .iter_mut()
                    .map(|(_, record)| record.handle.join_timeout(grace)),
            )
            .await;

            let mut stragglers = Vec::new();
            for ((key, record), finished) in records.into_iter().zip(joined) {
                if finished {
                    report.graceful.push(key.to_string());
                } else {
                    warn!(process = %key, ?grace, "worker ignored stop request, aborting");
                    record.handle.abort();
                    stragglers.push((key, record));
                }
            }

            let kill_wait = supervisor.kill_wait;
            join_all(
                stragglers
                    .iter_mut()
                    .map(|(_, record)| record.handle.join_timeout(kill_wait)),
            )
            .await;
            for (key, _) in &stragglers {
                self.mark_killed(key);
                report.killed.push(key.to_string());
            }
        };

        if tokio::time::timeout(supervisor.shutdown_deadline, sequence)
            .await
            .is_err()
        {
            error!(deadline = ?supervisor.shutdown_deadline, "shutdown deadline exceeded, abandoning remaining workers");
            report.deadline_exceeded = true;
        }

        report.drained = self.ctx.queues.drain_all();
        self.ctx.models.unload_all();
        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }

        report.elapsed = started.elapsed();
        info!(
            graceful = report.graceful.len(),
            killed = report.killed.len(),
            drained = report.drained,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "shutdown complete"
        );
        report
    }

    /// Keep a live worker for `spec`, starting one if there is none or the existing
    /// record is dead or failed. Returns whether a live worker was reused.
    async fn ensure_live(&self, state: &mut ManagerState, spec: WorkerSpec) -> bool {
        let key = spec.key();
        match state.processes.get(&key) {
            Some(record) if record.state == RecordState::Running && record.handle.is_alive() => {
                return true;
            }
            Some(record) => {
                info!(process = %key, state = ?record.state, "replacing dead worker");
            }
            None => {}
        }
        if let Some(stale) = state.processes.remove(&key) {
            self.stop_record(key, stale).await;
        }
        self.start(state, spec);
        false
    }

    fn start(&self, state: &mut ManagerState, spec: WorkerSpec) {
        let key = spec.key();
        let handle = self.spawn_worker(&spec);
        info!(process = %key, "worker started");
        state.processes.insert(
            key,
            ProcessRecord {
                spec,
                handle,
                auto_restart: self.ctx.config.supervisor.auto_restart,
                restarts: 0,
                state: RecordState::Running,
            },
        );
    }

    fn spawn_worker(&self, spec: &WorkerSpec) -> WorkerHandle {
        let ctx = self.ctx.clone();
        match spec.clone() {
            WorkerSpec::Capture { stream } => {
                let span = info_span!("capture", stream_id = %stream.id);
                WorkerHandle::spawn(&self.root, move |cancel| {
                    async move {
                        let report = CaptureWorker::new(ctx, stream).run(cancel).await;
                        debug!(?report, "capture worker exited");
                    }
                    .instrument(span)
                })
            }
            WorkerSpec::Inference {
                task_id,
                pair,
                model_id,
                alarm_threshold,
            } => {
                let span = info_span!("inference", stream_id = %pair.stream_id, algo_id = %pair.algo_id);
                WorkerHandle::spawn(&self.root, move |cancel| {
                    async move {
                        let report = InferenceWorker::new(ctx, task_id, pair, model_id, alarm_threshold)
                            .run(cancel)
                            .await;
                        debug!(?report, "inference worker exited");
                    }
                    .instrument(span)
                })
            }
            WorkerSpec::StreamOut { pair, output_url } => {
                let span = info_span!("stream_out", stream_id = %pair.stream_id, algo_id = %pair.algo_id);
                // built here so the result lease is held from spawn time
                let worker = StreamOutWorker::new(ctx, pair, output_url);
                WorkerHandle::spawn(&self.root, move |cancel| {
                    async move {
                        let report = worker.run(cancel).await;
                        debug!(?report, "stream-out worker exited");
                    }
                    .instrument(span)
                })
            }
            WorkerSpec::Alarm => {
                let span = info_span!("alarm_handler");
                WorkerHandle::spawn(&self.root, move |cancel| {
                    async move {
                        let report = AlarmWorker::new(ctx).run(cancel).await;
                        debug!(?report, "alarm worker exited");
                    }
                    .instrument(span)
                })
            }
        }
    }

    async fn stop_record(&self, key: ProcessKey, mut record: ProcessRecord) -> StopOutcome {
        let supervisor = &self.ctx.config.supervisor;
        record.handle.request_stop();
        let outcome = if record.handle.join_timeout(supervisor.stop_grace).await {
            StopOutcome::Graceful
        } else {
            warn!(process = %key, grace = ?supervisor.stop_grace, "worker ignored stop request, aborting");
            record.handle.abort();
            record.handle.join_timeout(supervisor.kill_wait).await;
            self.mark_killed(&key);
            StopOutcome::Killed
        };
        self.ctx.health.unregister_module(&key.to_string()).await;
        info!(process = %key, ?outcome, "worker stopped");
        outcome
    }

    fn mark_error(&self, key: &ProcessKey, message: &str) {
        if let Some((kind, k)) = key.status_entry() {
            self.ctx
                .status
                .set_state(kind, &k, WorkerState::Error, Some(message.to_string()));
        }
    }

    fn mark_killed(&self, key: &ProcessKey) {
        if let Some((kind, k)) = key.status_entry() {
            self.ctx
                .status
                .set_state(kind, &k, WorkerState::Stopped, Some("killed".into()));
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.root.cancel();
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyzer_core::config::{AlgorithmDefinition, AnalyzerConfig, StreamDefinition};
    use analyzer_mock::{MemorySink, MockDetectorPackage, RecordingEncoderLauncher, SyntheticConfig, SyntheticConnector};
    use analyzer_models::PackageTable;

    fn manager() -> ProcessManager {
        let packages = PackageTable::new();
        packages.register(Arc::new(MockDetectorPackage::new()));
        let ctx = PipelineContext::builder(AnalyzerConfig::default(), packages)
            .with_sources(Arc::new(SyntheticConnector::new(SyntheticConfig::default())))
            .with_encoders(Arc::new(RecordingEncoderLauncher::new()))
            .with_sink(Arc::new(MemorySink::new()))
            .build();
        let catalog = StaticCatalog::new()
            .with_stream(StreamDefinition {
                id: "cam1".into(),
                url: "synthetic://cam1".into(),
                width: 32,
                height: 32,
                fps: Some(10.0),
            })
            .with_algorithm(AlgorithmDefinition {
                id: "person".into(),
                package: "mock".into(),
                model: "detector".into(),
                pool_size: 1,
                alarm_threshold: None,
                config: serde_json::json!({}),
            });
        ProcessManager::new(ctx, Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_create_task_rejects_unknown_ids() {
        let manager = manager();
        let err = manager
            .create_task("t1", "nope", "person", OutputTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::UnknownStream(_)));

        let err = manager
            .create_task("t1", "cam1", "nope", OutputTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::UnknownAlgorithm(_)));
        assert!(manager.get_status().await.processes.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_task_and_pair() {
        let manager = manager();
        manager
            .create_task("t1", "cam1", "person", OutputTarget::default())
            .await
            .unwrap();

        let err = manager
            .create_task("t1", "cam1", "person", OutputTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::TaskExists(_)));

        let err = manager
            .create_task("t2", "cam1", "person", OutputTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::PairInUse { .. }));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_output_requires_url() {
        let manager = manager();
        let output = OutputTarget {
            enabled: true,
            url: None,
        };
        let err = manager
            .create_task("t1", "cam1", "person", output)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_stop_output_keeps_task() {
        let manager = manager();
        let output = OutputTarget {
            enabled: true,
            url: Some("rtsp://localhost/out".into()),
        };
        manager.create_task("t1", "cam1", "person", output).await.unwrap();
        let ids: Vec<_> = manager.get_status().await.processes.into_iter().map(|p| p.id).collect();
        assert!(ids.contains(&"stream_out_cam1_person".to_string()));

        manager.stop_task("t1", true, false).await.unwrap();
        let status = manager.get_status().await;
        let ids: Vec<_> = status.processes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["stream_cam1", "algo_cam1_person", "alarm_handler"]);
        assert_eq!(status.tasks.len(), 1);
        assert!(!status.tasks[0].output.enabled);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_without_flags_refused() {
        let manager = manager();
        manager
            .create_task("t1", "cam1", "person", OutputTarget::default())
            .await
            .unwrap();
        let err = manager.stop_task("t1", false, false).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Configuration(_)));

        let status = manager.get_status().await;
        assert_eq!(status.tasks.len(), 1);
        let ids: Vec<_> = status.processes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["stream_cam1", "algo_cam1_person", "alarm_handler"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_task() {
        let manager = manager();
        let err = manager.stop_task("ghost", true, true).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_after_shutdown_refused() {
        let manager = manager();
        let report = manager.shutdown().await;
        assert!(!report.deadline_exceeded);
        let err = manager
            .create_task("t1", "cam1", "person", OutputTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_health_check_restarts_dead_worker() {
        let manager = manager();
        manager
            .create_task("t1", "cam1", "person", OutputTarget::default())
            .await
            .unwrap();

        {
            let state = manager.state.lock().await;
            state.processes[&ProcessKey::Alarm].handle.abort();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let restarted = manager.check_health().await;
        assert_eq!(restarted, vec!["alarm_handler".to_string()]);
        let status = manager.get_status().await;
        let alarm = status.processes.iter().find(|p| p.id == "alarm_handler").unwrap();
        assert!(alarm.alive);
        assert_eq!(alarm.restarts, 1);

        manager.shutdown().await;
    }
}
