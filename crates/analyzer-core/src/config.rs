//! Layered configuration using Figment.
//!
//! Configuration is assembled from, in increasing priority:
//! 1. built-in defaults ([`AnalyzerConfig::default`])
//! 2. a TOML file
//! 3. environment variables prefixed with `ANALYZER_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use analyzer_core::config::AnalyzerConfig;
//!
//! // ANALYZER_CAPTURE__MAX_CONSECUTIVE_FAILURES=3 overrides the file value.
//! let config = AnalyzerConfig::load_from("config/analyzer.toml")?;
//! config.validate()?;
//! # Ok::<(), analyzer_core::AnalyzerError>(())
//! ```

use crate::capabilities::EncoderProfile;
use crate::error::{AnalyzerError, AnalyzerResult};
use crate::limits;
use crate::retry::BackoffPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ANALYZER_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Frame arena sizing.
    pub arena: ArenaConfig,
    /// Queue capacities.
    pub queues: QueueConfig,
    /// Capture worker behaviour.
    pub capture: CaptureConfig,
    /// Inference worker behaviour.
    pub inference: InferenceConfig,
    /// Stream-out worker behaviour.
    pub output: OutputConfig,
    /// Alarm worker behaviour.
    pub alarm: AlarmConfig,
    /// Process manager timings.
    pub supervisor: SupervisorConfig,
    /// Status snapshot surface.
    pub status: StatusConfig,
    /// Known streams.
    pub streams: Vec<StreamDefinition>,
    /// Known algorithms.
    pub algorithms: Vec<AlgorithmDefinition>,
    /// Tasks started with the daemon.
    pub tasks: Vec<TaskDefinition>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured.
    #[default]
    Pretty,
    /// Single-line.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Logging format.
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "analyzer".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Frame arena sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Number of slots.
    pub slot_count: usize,
    /// Bytes per slot.
    pub slot_capacity_bytes: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            slot_count: limits::ARENA_SLOTS,
            slot_capacity_bytes: limits::ARENA_SLOT_BYTES,
        }
    }
}

/// Queue capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-pair frame queue capacity.
    pub frame_capacity: usize,
    /// Per-pair result queue capacity.
    ///
    /// Together with `frame_capacity` this must stay below `arena.slot_count`, or
    /// queued references alone could hold every slot.
    pub result_capacity: usize,
    /// Alarm queue capacity.
    pub alarm_capacity: usize,
    /// Longest an inference worker blocks on a full alarm queue.
    #[serde(with = "humantime_serde")]
    pub alarm_push_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frame_capacity: limits::FRAME_QUEUE_CAPACITY,
            result_capacity: limits::RESULT_QUEUE_CAPACITY,
            alarm_capacity: limits::ALARM_QUEUE_CAPACITY,
            alarm_push_timeout: Duration::from_secs(1),
        }
    }
}

/// Capture worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Reconnect backoff.
    pub reconnect: BackoffPolicy,
    /// Consecutive read failures that force a reconnect.
    pub max_consecutive_failures: u32,
    /// Pause after a failed read.
    #[serde(with = "humantime_serde")]
    pub failure_pause: Duration,
    /// Decoder executable used by the ffmpeg capture source.
    pub decoder_binary: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            reconnect: BackoffPolicy::default(),
            max_consecutive_failures: 5,
            failure_pause: Duration::from_millis(100),
            decoder_binary: "ffmpeg".to_string(),
        }
    }
}

/// Inference worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Frames skipped between two processed frames; zero processes every frame.
    pub frame_skip: u32,
    /// Confidence at or above which a detection raises an alarm.
    pub alarm_threshold: f32,
    /// Minimum time between alarms of one (stream, algorithm) pair.
    #[serde(with = "humantime_serde")]
    pub alarm_cooldown: Duration,
    /// Frame queue poll timeout.
    #[serde(with = "humantime_serde")]
    pub pop_timeout: Duration,
    /// Directory for raw alarm snapshots; disabled when unset.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            alarm_threshold: 0.6,
            alarm_cooldown: Duration::from_secs(10),
            pop_timeout: Duration::from_secs(1),
            snapshot_dir: None,
        }
    }
}

/// Stream-out worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Longest wait for the ready flag.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Ready flag poll period.
    #[serde(with = "humantime_serde")]
    pub ready_poll: Duration,
    /// Longest wait for the first result after readiness.
    #[serde(with = "humantime_serde")]
    pub first_result_timeout: Duration,
    /// Result queue poll timeout.
    #[serde(with = "humantime_serde")]
    pub pop_timeout: Duration,
    /// Frame rate used when the stream reports none.
    pub default_fps: f64,
    /// Encoder restarts allowed before the output is marked failed.
    pub max_encoder_restarts: u32,
    /// A session that ran at least this long refills the restart budget when it exits.
    #[serde(with = "humantime_serde")]
    pub restart_reset_after: Duration,
    /// Encoder executable.
    pub encoder_binary: String,
    /// Encoder argument profile.
    pub profile: EncoderProfile,
    /// Time the encoder gets to exit after its input closes.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            ready_timeout: limits::READY_TIMEOUT,
            ready_poll: limits::READY_POLL,
            first_result_timeout: limits::READY_TIMEOUT,
            pop_timeout: Duration::from_secs(1),
            default_fps: limits::DEFAULT_FPS,
            max_encoder_restarts: 3,
            restart_reset_after: limits::ENCODER_STABLE_AFTER,
            encoder_binary: "ffmpeg".to_string(),
            profile: EncoderProfile::LowLatency,
            close_timeout: limits::ENCODER_CLOSE_TIMEOUT,
        }
    }
}

/// Alarm worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// `host:port` of the JSON-lines notification endpoint.
    pub sink_addr: Option<String>,
    /// Fixed reconnect interval.
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Alarm queue poll timeout.
    #[serde(with = "humantime_serde")]
    pub pop_timeout: Duration,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            sink_addr: None,
            reconnect_interval: Duration::from_secs(5),
            pop_timeout: Duration::from_secs(1),
        }
    }
}

/// Process manager timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Liveness scan period.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Per-worker graceful stop window.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Wait after aborting a worker.
    #[serde(with = "humantime_serde")]
    pub kill_wait: Duration,
    /// Hard deadline for the whole shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_deadline: Duration,
    /// Restarts per worker before it is left dead.
    pub max_restarts: u32,
    /// Restart dead workers at all.
    pub auto_restart: bool,
    /// Exit the process when the shutdown deadline passes.
    pub hard_exit_on_deadline: bool,
    /// Period of worker heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is reported unresponsive.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: limits::MONITOR_INTERVAL,
            stop_grace: limits::STOP_GRACE,
            kill_wait: limits::KILL_WAIT,
            shutdown_deadline: limits::SHUTDOWN_DEADLINE,
            max_restarts: 5,
            auto_restart: true,
            hard_exit_on_deadline: false,
            heartbeat_interval: limits::HEARTBEAT_INTERVAL,
            heartbeat_timeout: limits::HEARTBEAT_TIMEOUT,
        }
    }
}

/// Status snapshot surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatusConfig {
    /// Directory receiving one JSON file per record on state changes.
    pub snapshot_dir: Option<PathBuf>,
}

/// A capture stream known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    /// Stream id.
    pub id: String,
    /// Source URL.
    pub url: String,
    /// Decoded frame width.
    pub width: u32,
    /// Decoded frame height.
    pub height: u32,
    /// Source frame rate, when known.
    #[serde(default)]
    pub fps: Option<f64>,
}

/// An algorithm known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmDefinition {
    /// Algorithm id.
    pub id: String,
    /// Registered algorithm package.
    pub package: String,
    /// Model name inside the package.
    pub model: String,
    /// Model instances to keep loaded.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-algorithm alarm threshold override.
    #[serde(default)]
    pub alarm_threshold: Option<f32>,
    /// Package-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Outbound stream settings of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputTarget {
    /// Re-encode annotated frames.
    #[serde(default)]
    pub enabled: bool,
    /// Encoder output URL.
    #[serde(default)]
    pub url: Option<String>,
}

/// A task started with the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task id.
    pub id: String,
    /// Stream to analyse.
    pub stream_id: String,
    /// Algorithm to run.
    pub algo_id: String,
    /// Outbound stream.
    #[serde(default)]
    pub output: OutputTarget,
}

fn default_pool_size() -> usize {
    1
}

impl AnalyzerConfig {
    /// Load defaults, then `path`, then `ANALYZER_*` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AnalyzerResult<Self> {
        Ok(Self::figment(Some(path.as_ref())).extract()?)
    }

    /// Load defaults and environment overrides only.
    pub fn load_env() -> AnalyzerResult<Self> {
        Ok(Self::figment(None).extract()?)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AnalyzerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AnalyzerResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.arena.slot_count == 0 || self.arena.slot_capacity_bytes == 0 {
            return Err(invalid("arena slot_count and slot_capacity_bytes must be > 0"));
        }
        if self.queues.frame_capacity == 0
            || self.queues.result_capacity == 0
            || self.queues.alarm_capacity == 0
        {
            return Err(invalid("queue capacities must be > 0"));
        }
        let pinned = self.queues.frame_capacity + self.queues.result_capacity;
        if pinned >= self.arena.slot_count {
            return Err(invalid(format!(
                "queues.frame_capacity + queues.result_capacity ({pinned}) must be below arena.slot_count ({})",
                self.arena.slot_count
            )));
        }
        if self.supervisor.heartbeat_interval >= self.supervisor.heartbeat_timeout {
            return Err(invalid("supervisor.heartbeat_interval must be shorter than heartbeat_timeout"));
        }
        if self.capture.reconnect.factor < 1.0 {
            return Err(invalid("capture.reconnect.factor must be >= 1"));
        }
        if self.capture.max_consecutive_failures == 0 {
            return Err(invalid("capture.max_consecutive_failures must be > 0"));
        }
        check_threshold("inference.alarm_threshold", self.inference.alarm_threshold)?;
        if self.output.default_fps <= 0.0 {
            return Err(invalid("output.default_fps must be > 0"));
        }

        let mut stream_ids = HashSet::new();
        for stream in &self.streams {
            if !stream_ids.insert(stream.id.as_str()) {
                return Err(invalid(format!("Duplicate stream ID: {}", stream.id)));
            }
            let bytes = limits::validate_frame_size(stream.width, stream.height)?;
            if bytes > self.arena.slot_capacity_bytes {
                return Err(invalid(format!(
                    "stream '{}' frames ({bytes} bytes) exceed arena slot capacity ({} bytes)",
                    stream.id, self.arena.slot_capacity_bytes
                )));
            }
        }

        let mut algo_ids = HashSet::new();
        for algo in &self.algorithms {
            if !algo_ids.insert(algo.id.as_str()) {
                return Err(invalid(format!("Duplicate algorithm ID: {}", algo.id)));
            }
            if algo.pool_size == 0 {
                return Err(invalid(format!("algorithm '{}' pool_size must be > 0", algo.id)));
            }
            if let Some(threshold) = algo.alarm_threshold {
                check_threshold(&format!("algorithm '{}' alarm_threshold", algo.id), threshold)?;
            }
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(invalid(format!("Duplicate task ID: {}", task.id)));
            }
            if !stream_ids.contains(task.stream_id.as_str()) {
                return Err(invalid(format!(
                    "task '{}' references unknown stream '{}'",
                    task.id, task.stream_id
                )));
            }
            if !algo_ids.contains(task.algo_id.as_str()) {
                return Err(invalid(format!(
                    "task '{}' references unknown algorithm '{}'",
                    task.id, task.algo_id
                )));
            }
            if task.output.enabled && task.output.url.is_none() {
                return Err(invalid(format!("task '{}' enables output without a url", task.id)));
            }
        }

        Ok(())
    }
}

fn check_threshold(name: &str, value: f32) -> AnalyzerResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [0, 1], got {value}")))
    }
}

fn invalid(message: impl Into<String>) -> AnalyzerError {
    AnalyzerError::Configuration(message.into())
}
