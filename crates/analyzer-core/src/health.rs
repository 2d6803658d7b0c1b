//! Worker health tracking.
//!
//! Workers heartbeat under their process id (`stream_cam1`, `alarm_handler`, ...) and
//! report failures into a bounded history. The process manager adds what it observes
//! from outside: deaths, restarts, exhausted restart budgets. [`SystemHealth`] folds
//! both into one value:
//!
//! | condition                                          | health     |
//! |----------------------------------------------------|------------|
//! | a worker missed its heartbeat window               | `Critical` |
//! | a `Critical` error inside the error window         | `Critical` |
//! | a `Warning` or `Error` inside the error window     | `Degraded` |
//! | otherwise                                          | `Healthy`  |

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// How bad a reported failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Worth noting, no effect on health.
    Info,
    /// Worker restarted or a single item was lost.
    Warning,
    /// Worker stopped working.
    Error,
    /// Worker stopped and will not be restarted.
    Critical,
}

/// One entry of the error history.
#[derive(Debug, Clone, Serialize)]
pub struct HealthError {
    /// Process id of the failing worker.
    pub module_name: String,
    /// Severity.
    pub severity: ErrorSeverity,
    /// What happened.
    pub message: String,
    /// Wall-clock time of the report.
    pub at: DateTime<Utc>,
    #[serde(skip)]
    reported: Instant,
}

#[derive(Debug, Clone)]
struct Heartbeat {
    at: Instant,
    message: Option<String>,
}

/// Heartbeat view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    /// Process id.
    pub name: String,
    /// Time since the last heartbeat.
    #[serde(with = "humantime_serde")]
    pub since_heartbeat: Duration,
    /// Heartbeat inside the timeout.
    pub is_healthy: bool,
    /// Message sent with the last heartbeat.
    pub status_message: Option<String>,
}

/// Aggregated health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// Nothing to report.
    Healthy,
    /// Recent warnings or errors.
    Degraded,
    /// A critical error or an unresponsive worker.
    Critical,
}

/// Health section of the manager status.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Aggregate.
    pub health: SystemHealth,
    /// Workers past their heartbeat timeout.
    pub unresponsive: Vec<String>,
    /// Most recent errors first.
    pub recent_errors: Vec<HealthError>,
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Silence after which a worker counts as unresponsive.
    pub heartbeat_timeout: Duration,
    /// Errors kept in history.
    pub max_error_history: usize,
    /// Errors older than this no longer affect [`SystemHealth`].
    pub error_window: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            max_error_history: 1000,
            error_window: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    heartbeats: HashMap<String, Heartbeat>,
    errors: VecDeque<HealthError>,
}

/// Heartbeat and error tracker shared by workers and the process manager.
#[derive(Clone)]
pub struct SystemHealthMonitor {
    config: Arc<HealthMonitorConfig>,
    state: Arc<RwLock<MonitorState>>,
}

impl Default for SystemHealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorConfig::default())
    }
}

impl SystemHealthMonitor {
    /// Empty monitor.
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::default(),
        }
    }

    /// Record a heartbeat.
    pub async fn heartbeat(&self, module_name: impl Into<String>) {
        self.heartbeat_with_message(module_name, None).await;
    }

    /// Record a heartbeat carrying a short status line.
    pub async fn heartbeat_with_message(
        &self,
        module_name: impl Into<String>,
        status_message: Option<String>,
    ) {
        let beat = Heartbeat {
            at: Instant::now(),
            message: status_message,
        };
        self.state.write().await.heartbeats.insert(module_name.into(), beat);
    }

    /// Append to the error history, evicting the oldest entry when full.
    pub async fn report_error(
        &self,
        module_name: impl Into<String>,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) {
        let error = HealthError {
            module_name: module_name.into(),
            severity,
            message: message.into(),
            at: Utc::now(),
            reported: Instant::now(),
        };
        let mut state = self.state.write().await;
        state.errors.push_back(error);
        while state.errors.len() > self.config.max_error_history {
            state.errors.pop_front();
        }
    }

    /// Aggregate health.
    pub async fn get_system_health(&self) -> SystemHealth {
        let state = self.state.read().await;
        self.fold(&state, Instant::now())
    }

    fn fold(&self, state: &MonitorState, now: Instant) -> SystemHealth {
        let stale = state
            .heartbeats
            .values()
            .any(|beat| now.duration_since(beat.at) > self.config.heartbeat_timeout);
        let worst = state
            .errors
            .iter()
            .filter(|e| now.duration_since(e.reported) <= self.config.error_window)
            .map(|e| e.severity)
            .max();

        match worst {
            _ if stale => SystemHealth::Critical,
            Some(ErrorSeverity::Critical) => SystemHealth::Critical,
            Some(ErrorSeverity::Warning | ErrorSeverity::Error) => SystemHealth::Degraded,
            Some(ErrorSeverity::Info) | None => SystemHealth::Healthy,
        }
    }

    /// Heartbeat view of every tracked worker, sorted by name.
    pub async fn get_module_health(&self) -> Vec<ModuleHealth> {
        let state = self.state.read().await;
        let now = Instant::now();
        let mut modules: Vec<_> = state
            .heartbeats
            .iter()
            .map(|(name, beat)| {
                let since_heartbeat = now.duration_since(beat.at);
                ModuleHealth {
                    name: name.clone(),
                    since_heartbeat,
                    is_healthy: since_heartbeat <= self.config.heartbeat_timeout,
                    status_message: beat.message.clone(),
                }
            })
            .collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    /// Most recent errors first, up to `limit`.
    pub async fn get_error_history(&self, limit: Option<usize>) -> Vec<HealthError> {
        let state = self.state.read().await;
        let newest_first = state.errors.iter().rev().cloned();
        newest_first.take(limit.unwrap_or(usize::MAX)).collect()
    }

    /// Aggregate, unresponsive workers and the last `recent` errors in one read.
    pub async fn report(&self, recent: usize) -> HealthReport {
        let state = self.state.read().await;
        let now = Instant::now();
        let mut unresponsive: Vec<_> = state
            .heartbeats
            .iter()
            .filter(|(_, beat)| now.duration_since(beat.at) > self.config.heartbeat_timeout)
            .map(|(name, _)| name.clone())
            .collect();
        unresponsive.sort();
        HealthReport {
            health: self.fold(&state, now),
            unresponsive,
            recent_errors: state.errors.iter().rev().take(recent).cloned().collect(),
        }
    }

    /// Forget a worker that was stopped on purpose.
    pub async fn unregister_module(&self, module_name: &str) {
        self.state.write().await.heartbeats.remove(module_name);
    }
}
