//! Factory table of algorithm packages.
//!
//! Packages are registered once at startup under their package id. The model registry
//! resolves a package by id whenever it needs to build instances, so the set of
//! available algorithms is fixed by what the binary links and registers.

use analyzer_core::capabilities::AlgorithmPackage;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registered algorithm packages keyed by package id.
#[derive(Clone, Default)]
pub struct PackageTable {
    packages: Arc<RwLock<HashMap<String, Arc<dyn AlgorithmPackage>>>>,
}

impl PackageTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `package` under its own id, replacing any previous entry.
    pub fn register(&self, package: Arc<dyn AlgorithmPackage>) {
        let id = package.package_id().to_string();
        if self.packages.write().insert(id.clone(), package).is_some() {
            warn!(package = %id, "algorithm package replaced");
        } else {
            info!(package = %id, "algorithm package registered");
        }
    }

    /// Look up a package.
    pub fn get(&self, package_id: &str) -> Option<Arc<dyn AlgorithmPackage>> {
        self.packages.read().get(package_id).cloned()
    }

    /// True if a package with this id is registered.
    pub fn contains(&self, package_id: &str) -> bool {
        self.packages.read().contains_key(package_id)
    }

    /// Sorted ids of every registered package.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.packages.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for PackageTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageTable").field("ids", &self.ids()).finish()
    }
}
