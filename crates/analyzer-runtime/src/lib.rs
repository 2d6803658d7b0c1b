//! Worker runtime and process manager for the analyzer pipeline.
//!
//! - [`context`]: the services every worker is handed at spawn time
//! - [`workers`]: capture, inference, stream-out and alarm state machines
//! - [`io`]: ffmpeg capture and encoder adapters, notification sinks, snapshot recorder
//! - [`manager`]: task composition, health loop and shutdown
//!
//! # Example
//!
//! ```no_run
//! use analyzer_core::config::{AnalyzerConfig, OutputTarget};
//! use analyzer_models::PackageTable;
//! use analyzer_runtime::{PipelineContext, ProcessManager, StaticCatalog};
//! use std::sync::Arc;
//!
//! # async fn run() -> analyzer_core::AnalyzerResult<()> {
//! let config = AnalyzerConfig::load_from("analyzer.toml")?;
//! let catalog = StaticCatalog::from_config(&config);
//! let ctx = PipelineContext::builder(config, PackageTable::new()).build();
//! let manager = Arc::new(ProcessManager::new(ctx, Arc::new(catalog)));
//! manager.start_monitor();
//! manager.create_task("t1", "cam1", "person", OutputTarget::default()).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod io;
pub mod manager;
pub mod workers;

pub use context::{CooldownTracker, OutputLease, PipelineContext, PipelineContextBuilder, QueueHub};
pub use manager::{
    Catalog, ManagerStatus, ProcessKey, ProcessManager, ProcessStatus, ShutdownReport,
    StaticCatalog, TaskRecord,
};
pub use workers::WorkerHandle;
