//! Shared fixtures for the runtime integration tests.
#![allow(dead_code)]

use analyzer_core::capabilities::{EncoderLauncher, NotificationSink, SourceConnector};
use analyzer_core::config::{AlgorithmDefinition, AnalyzerConfig, StreamDefinition};
use analyzer_core::{FrameRef, FrameShape, PixelDtype, StatusKind, StatusRecord};
use analyzer_mock::{MemorySink, MockDetectorPackage, RecordingEncoderLauncher, SyntheticConfig, SyntheticConnector};
use analyzer_models::PackageTable;
use analyzer_runtime::{PipelineContext, ProcessManager, StaticCatalog};
use std::sync::Arc;
use std::time::Duration;

/// Configuration with timeouts short enough for tests.
pub fn fast_config() -> AnalyzerConfig {
    let mut config = AnalyzerConfig::default();
    config.inference.pop_timeout = Duration::from_millis(50);
    config.output.pop_timeout = Duration::from_millis(50);
    config.output.ready_poll = Duration::from_millis(10);
    config.output.ready_timeout = Duration::from_secs(5);
    config.output.first_result_timeout = Duration::from_secs(5);
    config.alarm.pop_timeout = Duration::from_millis(50);
    config.alarm.reconnect_interval = Duration::from_millis(50);
    config.supervisor.stop_grace = Duration::from_secs(1);
    config.supervisor.kill_wait = Duration::from_millis(100);
    config
}

pub fn stream(id: &str, width: u32, height: u32, fps: f64) -> StreamDefinition {
    StreamDefinition {
        id: id.into(),
        url: format!("synthetic://{id}"),
        width,
        height,
        fps: Some(fps),
    }
}

pub fn algorithm(id: &str, config: serde_json::Value) -> AlgorithmDefinition {
    AlgorithmDefinition {
        id: id.into(),
        package: "mock".into(),
        model: format!("{id}-detector"),
        pool_size: 1,
        alarm_threshold: None,
        config,
    }
}

/// Mock collaborators plus the context built over them.
pub struct Harness {
    pub ctx: PipelineContext,
    pub connector: SyntheticConnector,
    pub encoder: RecordingEncoderLauncher,
    pub sink: MemorySink,
    pub detector: MockDetectorPackage,
}

impl Harness {
    pub fn new(config: AnalyzerConfig, source: SyntheticConfig) -> Self {
        let encoder = RecordingEncoderLauncher::new();
        Self::with_encoders(config, source, encoder.clone(), Arc::new(encoder))
    }

    pub fn with_encoders(
        config: AnalyzerConfig,
        source: SyntheticConfig,
        encoder: RecordingEncoderLauncher,
        launcher: Arc<dyn EncoderLauncher>,
    ) -> Self {
        let connector = SyntheticConnector::new(source);
        let sink = MemorySink::new();
        let detector = MockDetectorPackage::new();
        let packages = PackageTable::new();
        packages.register(Arc::new(detector.clone()));
        let ctx = PipelineContext::builder(config, packages)
            .with_sources(Arc::new(connector.clone()) as Arc<dyn SourceConnector>)
            .with_encoders(launcher)
            .with_sink(Arc::new(sink.clone()) as Arc<dyn NotificationSink>)
            .build();
        Self {
            ctx,
            connector,
            encoder,
            sink,
            detector,
        }
    }

    pub fn manager(&self, catalog: StaticCatalog) -> Arc<ProcessManager> {
        Arc::new(ProcessManager::new(self.ctx.clone(), Arc::new(catalog)))
    }

    /// Write a solid frame into the arena.
    pub fn frame(&self, stream_id: &str, width: u32, height: u32, value: u8) -> FrameRef {
        let shape = FrameShape::bgr(width, height);
        let pixels = vec![value; (width * height * 3) as usize];
        let slot = self.ctx.arena.allocate(stream_id).unwrap();
        self.ctx.arena.write(slot, &pixels, shape, PixelDtype::U8).unwrap()
    }

    pub fn record(&self, kind: StatusKind, key: &str) -> Option<StatusRecord> {
        self.ctx.status.get(kind, key)
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
