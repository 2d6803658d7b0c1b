//! Tracing subscriber initialisation.
//!
//! Workers log through `tracing` macros with structured fields and run inside spans
//! named after their kind (`capture`, `inference`, `stream_out`, `alarm_handler`).
//! The configured level applies to the analyzer crates; dependencies log at
//! `dependency_level` unless `RUST_LOG` says otherwise.
//!
//! # Example
//! ```no_run
//! use analyzer_core::{config::AnalyzerConfig, tracing_setup};
//! use tracing::info;
//!
//! let config = AnalyzerConfig::load_env()?;
//! tracing_setup::init_from_config(&config)?;
//! info!(stream_id = "cam-1", "capture started");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::{AnalyzerConfig, LogFormat};
use crate::error::{AnalyzerError, AnalyzerResult};
use tracing::Level;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log targets that follow the configured level.
pub const ANALYZER_TARGETS: &[&str] = &[
    "analyzer_pool",
    "analyzer_core",
    "analyzer_models",
    "analyzer_runtime",
    "analyzer_mock",
    "analyzerd",
];

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level of the analyzer crates.
    pub level: Level,
    /// Level of everything else.
    pub dependency_level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Log worker spans opening and closing.
    pub span_events: bool,
    /// Include source file and line.
    pub file_and_line: bool,
    /// Colours, pretty format only.
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            format: LogFormat::Pretty,
            span_events: false,
            file_and_line: false,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Settings from the `application` section.
    pub fn from_config(config: &AnalyzerConfig) -> AnalyzerResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Set the level of non-analyzer targets.
    pub fn with_dependency_level(mut self, level: Level) -> Self {
        self.dependency_level = level;
        self
    }

    /// Enable or disable colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// `EnvFilter` directives used when `RUST_LOG` is unset,
    /// e.g. `warn,analyzer_pool=info,...`.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_lowercase();
        let mut directives = self.dependency_level.as_str().to_lowercase();
        for target in ANALYZER_TARGETS {
            directives.push_str(&format!(",{target}={level}"));
        }
        directives
    }
}

/// Install the subscriber described by `config.application`.
pub fn init_from_config(config: &AnalyzerConfig) -> AnalyzerResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed is left in place and `Ok(())` returned, so
/// tests and embedders may call this repeatedly.
pub fn init(config: TracingConfig) -> AnalyzerResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    // `pretty()` and friends reset file/line display, so these go after the format.
    macro_rules! common {
        ($layer:expr) => {
            $layer
                .with_span_events(span_events)
                .with_file(config.file_and_line)
                .with_line_number(config.file_and_line)
        };
    }

    let layer = match config.format {
        LogFormat::Pretty => common!(fmt::layer().pretty())
            .with_ansi(config.ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => common!(fmt::layer().compact())
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => common!(fmt::layer().json())
            .with_current_span(true)
            .with_span_list(false)
            .with_filter(filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // another thread got there first
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(AnalyzerError::Configuration(format!(
            "failed to install tracing subscriber: {e}"
        ))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> AnalyzerResult<Level> {
    level.parse::<Level>().map_err(|_| {
        AnalyzerError::Configuration(format!(
            "unknown log level '{level}', expected trace, debug, info, warn or error"
        ))
    })
}
