//! CLI entry point for the analyzer daemon.
//!
//! Provides:
//! - `run`: start the tasks listed in a configuration file and supervise them until
//!   Ctrl-C
//! - `check`: validate a configuration file
//! - `demo`: run a synthetic pipeline (test-pattern source, mock detector, recording
//!   encoder, in-memory alarm sink) and print the resulting status
//!
//! # Usage
//!
//! ```bash
//! analyzerd check --config config/analyzer.toml
//! analyzerd run --config config/analyzer.toml
//! analyzerd demo --seconds 5
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use analyzer_core::config::{AlgorithmDefinition, AnalyzerConfig, OutputTarget, StreamDefinition, TaskDefinition};
use analyzer_core::tracing_setup;
use analyzer_mock::{MemorySink, MockDetectorPackage, RecordingEncoderLauncher, SyntheticConfig, SyntheticConnector};
use analyzer_models::PackageTable;
use analyzer_runtime::{PipelineContext, ProcessManager, StaticCatalog};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "analyzerd")]
#[command(about = "Video analytics pipeline daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured tasks and supervise them until interrupted
    Run {
        /// Configuration file (TOML format)
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Validate a configuration file and exit
    Check {
        /// Configuration file (TOML format)
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Run a synthetic pipeline end to end and print its status
    Demo {
        /// How long to let the pipeline run
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Synthetic frame width
        #[arg(long, default_value = "320")]
        width: u32,

        /// Synthetic frame height
        #[arg(long, default_value = "240")]
        height: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Check { config } => check(&config),
        Commands::Demo {
            seconds,
            width,
            height,
        } => demo(Duration::from_secs(seconds), width, height).await,
    }
}

/// Algorithm packages compiled into the daemon.
fn packages() -> PackageTable {
    let packages = PackageTable::new();
    packages.register(Arc::new(MockDetectorPackage::new()));
    packages
}

fn load(path: &Path) -> Result<AnalyzerConfig> {
    let config = AnalyzerConfig::load_from(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    let packages = packages();
    for algorithm in &config.algorithms {
        if !packages.contains(&algorithm.package) {
            bail!(
                "algorithm '{}' uses unknown package '{}' (available: {})",
                algorithm.id,
                algorithm.package,
                packages.ids().join(", ")
            );
        }
    }
    Ok(config)
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    println!(
        "{}: ok ({} streams, {} algorithms, {} tasks)",
        path.display(),
        config.streams.len(),
        config.algorithms.len(),
        config.tasks.len()
    );
    Ok(())
}

async fn run(path: &Path) -> Result<()> {
    let config = load(path)?;
    tracing_setup::init_from_config(&config)?;

    let catalog = StaticCatalog::from_config(&config);
    let tasks = config.tasks.clone();
    let ctx = PipelineContext::builder(config, packages()).build();
    let manager = Arc::new(ProcessManager::new(ctx, Arc::new(catalog)));
    manager.start_monitor();

    let mut started = 0usize;
    for task in &tasks {
        match manager
            .create_task(&task.id, &task.stream_id, &task.algo_id, task.output.clone())
            .await
        {
            Ok(()) => started += 1,
            Err(e) => error!(task_id = %task.id, error = %e, "task failed to start"),
        }
    }
    info!(started, configured = tasks.len(), "analyzer running, press Ctrl-C to stop");

    signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("interrupt received, shutting down (Ctrl-C again exits immediately)");
    tokio::spawn(async {
        if signal::ctrl_c().await.is_ok() {
            eprintln!("second interrupt, exiting");
            std::process::exit(130);
        }
    });

    let report = manager.shutdown().await;
    if report.deadline_exceeded {
        warn!(elapsed_ms = report.elapsed.as_millis() as u64, "shutdown exceeded its deadline");
    }
    if !report.killed.is_empty() {
        warn!(killed = ?report.killed, "workers had to be killed");
    }
    Ok(())
}

fn demo_config(width: u32, height: u32) -> AnalyzerConfig {
    let mut config = AnalyzerConfig::default();
    config.application.name = "analyzer-demo".into();
    config.streams.push(StreamDefinition {
        id: "demo".into(),
        url: "synthetic://demo".into(),
        width,
        height,
        fps: Some(25.0),
    });
    config.algorithms.push(AlgorithmDefinition {
        id: "person".into(),
        package: "mock".into(),
        model: "detector".into(),
        pool_size: 2,
        alarm_threshold: None,
        config: serde_json::json!({ "label": "person", "bbox": [16.0, 16.0, 96.0, 160.0], "jitter": 0.05 }),
    });
    config.tasks.push(TaskDefinition {
        id: "demo-task".into(),
        stream_id: "demo".into(),
        algo_id: "person".into(),
        output: OutputTarget {
            enabled: true,
            url: Some("rtsp://localhost:8554/demo_person".into()),
        },
    });
    config
}

async fn demo(duration: Duration, width: u32, height: u32) -> Result<()> {
    let config = demo_config(width, height);
    config.validate().context("demo configuration")?;
    tracing_setup::init_from_config(&config)?;

    let encoder = RecordingEncoderLauncher::new();
    let sink = MemorySink::new();
    let catalog = StaticCatalog::from_config(&config);
    let tasks = config.tasks.clone();
    let ctx = PipelineContext::builder(config, packages())
        .with_sources(Arc::new(SyntheticConnector::new(SyntheticConfig::default())))
        .with_encoders(Arc::new(encoder.clone()))
        .with_sink(Arc::new(sink.clone()))
        .build();
    let manager = Arc::new(ProcessManager::new(ctx, Arc::new(catalog)));
    manager.start_monitor();

    for task in &tasks {
        manager
            .create_task(&task.id, &task.stream_id, &task.algo_id, task.output.clone())
            .await
            .with_context(|| format!("starting task {}", task.id))?;
    }
    info!(seconds = duration.as_secs(), "demo pipeline running");
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = signal::ctrl_c() => info!("interrupted"),
    }

    let status = manager.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    let report = manager.shutdown().await;
    println!(
        "encoded {} frames in {} encoder session(s), delivered {} alarm(s), shutdown took {:?}",
        encoder.frame_count(),
        encoder.spawns().len(),
        sink.records().len(),
        report.elapsed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_config_is_valid() {
        let config = demo_config(320, 240);
        config.validate().unwrap();
        assert!(packages().contains(&config.algorithms[0].package));
    }

    #[test]
    fn test_cli_parses_demo_defaults() {
        let cli = Cli::try_parse_from(["analyzerd", "demo"]).unwrap();
        match cli.command {
            Commands::Demo {
                seconds,
                width,
                height,
            } => assert_eq!((seconds, width, height), (5, 320, 240)),
            _ => panic!("expected demo"),
        }
    }
}
