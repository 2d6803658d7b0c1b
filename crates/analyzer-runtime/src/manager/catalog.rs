//! Read-only lookup of stream and algorithm definitions.

use analyzer_core::config::{AlgorithmDefinition, AnalyzerConfig, StreamDefinition};
use std::collections::HashMap;

/// Answers "does this stream/algorithm exist and how is it configured" at task
/// creation time. Persistence of these records lives elsewhere.
pub trait Catalog: Send + Sync {
    /// Stream definition by id.
    fn stream(&self, stream_id: &str) -> Option<StreamDefinition>;

    /// Algorithm definition by id.
    fn algorithm(&self, algo_id: &str) -> Option<AlgorithmDefinition>;
}

/// In-memory catalog, usually built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    streams: HashMap<String, StreamDefinition>,
    algorithms: HashMap<String, AlgorithmDefinition>,
}

impl StaticCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the configuration's streams and algorithms.
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        let mut catalog = Self::new();
        for stream in &config.streams {
            catalog = catalog.with_stream(stream.clone());
        }
        for algorithm in &config.algorithms {
            catalog = catalog.with_algorithm(algorithm.clone());
        }
        catalog
    }

    /// Add or replace a stream.
    pub fn with_stream(mut self, stream: StreamDefinition) -> Self {
        self.streams.insert(stream.id.clone(), stream);
        self
    }

    /// Add or replace an algorithm.
    pub fn with_algorithm(mut self, algorithm: AlgorithmDefinition) -> Self {
        self.algorithms.insert(algorithm.id.clone(), algorithm);
        self
    }
}

impl Catalog for StaticCatalog {
    fn stream(&self, stream_id: &str) -> Option<StreamDefinition> {
        self.streams.get(stream_id).cloned()
    }

    fn algorithm(&self, algo_id: &str) -> Option<AlgorithmDefinition> {
        self.algorithms.get(algo_id).cloned()
    }
}
