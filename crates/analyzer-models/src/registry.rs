//! Pooled model registry.
//!
//! A model is identified by `{package}_{name}`. Registering records its configuration;
//! loading builds a fixed pool of (model, postprocessor) pairs through the package's
//! factory; checkout hands pairs out round-robin. Each model has its own lock, so
//! loading one model never stalls checkouts of another.

use crate::packages::PackageTable;
use analyzer_core::capabilities::{Model, Postprocessor};
use analyzer_core::{AnalyzerError, AnalyzerResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Load state of a registered model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum ModelStatus {
    /// Registered, no instances.
    Unloaded,
    /// Instance pool ready.
    Loaded,
    /// Last load failed.
    Error(String),
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelStatus::Unloaded => write!(f, "unloaded"),
            ModelStatus::Loaded => write!(f, "loaded"),
            ModelStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// One pooled (model, postprocessor) pair.
#[derive(Clone)]
pub struct ModelInstance {
    /// Position in the pool.
    pub index: usize,
    /// Detection model.
    pub model: Arc<dyn Model>,
    /// Paired postprocessor.
    pub postprocessor: Arc<dyn Postprocessor>,
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance").field("index", &self.index).finish()
    }
}

/// Read-only view of a registered model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    /// Registry key.
    pub model_id: String,
    /// Package id.
    pub package: String,
    /// Model name inside the package.
    pub name: String,
    /// Load state.
    pub status: ModelStatus,
    /// Loaded instances.
    pub pool_size: usize,
    /// Checkouts since the last load.
    pub total_checkouts: u64,
    /// Checkouts per pool position.
    pub instance_checkouts: Vec<u64>,
    /// Time of the last checkout.
    pub last_used: Option<DateTime<Utc>>,
}

struct ModelHandle {
    model_id: String,
    package: String,
    name: String,
    config: serde_json::Value,
    status: ModelStatus,
    instances: Vec<ModelInstance>,
    next: usize,
    instance_checkouts: Vec<u64>,
    last_used: Option<DateTime<Utc>>,
}

impl ModelHandle {
    fn summary(&self) -> ModelSummary {
        ModelSummary {
            model_id: self.model_id.clone(),
            package: self.package.clone(),
            name: self.name.clone(),
            status: self.status.clone(),
            pool_size: self.instances.len(),
            total_checkouts: self.instance_checkouts.iter().sum(),
            instance_checkouts: self.instance_checkouts.clone(),
            last_used: self.last_used,
        }
    }

    fn release_instances(&mut self) {
        for instance in self.instances.drain(..) {
            instance.model.release();
            instance.postprocessor.release();
        }
        self.next = 0;
        self.instance_checkouts.clear();
    }
}

/// Separator between package and model name in a model id.
pub const MODEL_ID_SEPARATOR: char = '/';

/// Registry key for a (package, name) pair.
pub fn model_id(package: &str, name: &str) -> String {
    format!("{package}{MODEL_ID_SEPARATOR}{name}")
}

/// Registered models and their instance pools.
#[derive(Clone)]
pub struct ModelRegistry {
    packages: PackageTable,
    models: Arc<RwLock<HashMap<String, Arc<Mutex<ModelHandle>>>>>,
}

impl ModelRegistry {
    /// Registry resolving packages from `packages`.
    pub fn new(packages: PackageTable) -> Self {
        Self {
            packages,
            models: Arc::default(),
        }
    }

    /// Package table backing this registry.
    pub fn packages(&self) -> &PackageTable {
        &self.packages
    }

    fn handle(&self, model_id: &str) -> AnalyzerResult<Arc<Mutex<ModelHandle>>> {
        self.models
            .read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| AnalyzerError::ModelNotRegistered(model_id.to_string()))
    }

    /// Register a model configuration and return its id.
    ///
    /// Registering an existing (package, name) pair returns the existing id and leaves
    /// the first configuration in place.
    pub fn register(
        &self,
        package: &str,
        name: &str,
        config: serde_json::Value,
    ) -> AnalyzerResult<String> {
        if !self.packages.contains(package) {
            return Err(AnalyzerError::UnknownPackage(package.to_string()));
        }
        if name.is_empty() || name.contains(MODEL_ID_SEPARATOR) || package.contains(MODEL_ID_SEPARATOR) {
            return Err(AnalyzerError::Configuration(format!(
                "model '{name}' of package '{package}': names must be non-empty and free of '{MODEL_ID_SEPARATOR}'"
            )));
        }
        let model_id = model_id(package, name);
        let mut models = self.models.write();
        if models.contains_key(&model_id) {
            return Ok(model_id);
        }
        models.insert(
            model_id.clone(),
            Arc::new(Mutex::new(ModelHandle {
                model_id: model_id.clone(),
                package: package.to_string(),
                name: name.to_string(),
                config,
                status: ModelStatus::Unloaded,
                instances: Vec::new(),
                next: 0,
                instance_checkouts: Vec::new(),
                last_used: None,
            })),
        );
        info!(model_id = %model_id, "model registered");
        Ok(model_id)
    }

    /// Build `num_instances` (model, postprocessor) pairs. No-op when already loaded.
    ///
    /// Any construction failure releases the pairs built so far and leaves the model
    /// in [`ModelStatus::Error`].
    pub fn load(&self, model_id: &str, num_instances: usize) -> AnalyzerResult<()> {
        let handle = self.handle(model_id)?;
        let mut handle = handle.lock();
        if handle.status == ModelStatus::Loaded {
            return Ok(());
        }

        let fail = |handle: &mut ModelHandle, message: String| {
            handle.release_instances();
            handle.status = ModelStatus::Error(message.clone());
            error!(model_id = %handle.model_id, %message, "model load failed");
            AnalyzerError::ModelLoad {
                model_id: handle.model_id.clone(),
                message,
            }
        };

        if num_instances == 0 {
            return Err(fail(&mut *handle, "pool size must be at least 1".into()));
        }
        let Some(package) = self.packages.get(&handle.package) else {
            let message = format!("package '{}' not registered", handle.package);
            return Err(fail(&mut *handle, message));
        };

        let mut instances = Vec::with_capacity(num_instances);
        for index in 0..num_instances {
            let built = package
                .create_model(&handle.name, &handle.config)
                .and_then(|model| {
                    package
                        .create_postprocessor(&handle.name, &handle.config)
                        .map(|postprocessor| (model, postprocessor))
                });
            match built {
                Ok((model, postprocessor)) => instances.push(ModelInstance {
                    index,
                    model: Arc::from(model),
                    postprocessor: Arc::from(postprocessor),
                }),
                Err(e) => {
                    handle.instances = instances;
                    return Err(fail(&mut *handle, format!("instance {index}: {e}")));
                }
            }
        }

        handle.instance_checkouts = vec![0; instances.len()];
        handle.instances = instances;
        handle.next = 0;
        handle.status = ModelStatus::Loaded;
        info!(model_id, pool_size = num_instances, "model loaded");
        Ok(())
    }

    /// Next (model, postprocessor) pair in round-robin order.
    pub fn checkout(&self, model_id: &str) -> AnalyzerResult<ModelInstance> {
        let handle = self.handle(model_id)?;
        let mut handle = handle.lock();
        if handle.status != ModelStatus::Loaded || handle.instances.is_empty() {
            return Err(AnalyzerError::ModelNotLoaded {
                model_id: model_id.to_string(),
                status: handle.status.to_string(),
            });
        }
        let index = handle.next % handle.instances.len();
        handle.next = handle.next.wrapping_add(1);
        handle.instance_checkouts[index] += 1;
        handle.last_used = Some(Utc::now());
        Ok(handle.instances[index].clone())
    }

    /// Release every instance and mark the model unloaded.
    ///
    /// Instances already checked out stay usable by their holders until dropped.
    pub fn unload(&self, model_id: &str) -> AnalyzerResult<()> {
        let handle = self.handle(model_id)?;
        let mut handle = handle.lock();
        if handle.status == ModelStatus::Unloaded {
            return Ok(());
        }
        handle.release_instances();
        handle.status = ModelStatus::Unloaded;
        info!(model_id, "model unloaded");
        Ok(())
    }

    /// Summary of one model.
    pub fn status(&self, model_id: &str) -> Option<ModelSummary> {
        let handle = self.models.read().get(model_id).cloned()?;
        let summary = handle.lock().summary();
        Some(summary)
    }

    /// Summaries of every model, sorted by id.
    pub fn list(&self) -> Vec<ModelSummary> {
        let handles: Vec<_> = self.models.read().values().cloned().collect();
        let mut summaries: Vec<_> = handles.iter().map(|h| h.lock().summary()).collect();
        summaries.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        summaries
    }

    /// Unload every model.
    pub fn unload_all(&self) {
        let ids: Vec<_> = self.models.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id) {
                warn!(model_id = %id, error = %e, "unload failed");
            }
        }
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("packages", &self.packages)
            .field("models", &self.models.read().len())
            .finish()
    }
}
