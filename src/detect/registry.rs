use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::error::{DetectError, DetectResult};
use crate::model::ModelType;

use super::backend::DetectorBackend;

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends, one per domain model.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes
/// `&mut self`; concurrent requests against the same model serialize here.
pub struct BackendRegistry {
    backends: HashMap<ModelType, SharedBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend for a model, replacing any previous one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, model: ModelType, backend: B) {
        if let Some(previous) = self.backends.insert(model, Arc::new(Mutex::new(backend))) {
            if let Ok(guard) = previous.lock() {
                log::info!("registry: replaced {} backend for {}", guard.name(), model);
            }
        }
    }

    /// Get the backend serving a model.
    pub fn get(&self, model: ModelType) -> DetectResult<SharedBackend> {
        self.backends
            .get(&model)
            .cloned()
            .ok_or_else(|| DetectError::UnknownModel(model.as_str().to_string()))
    }

    pub fn contains(&self, model: ModelType) -> bool {
        self.backends.contains_key(&model)
    }

    /// List registered models with their backend names.
    pub fn list(&self) -> Vec<(ModelType, String)> {
        let mut out: Vec<(ModelType, String)> = self
            .backends
            .iter()
            .map(|(model, backend)| {
                let guard = backend.lock().unwrap_or_else(|p| p.into_inner());
                (*model, guard.name().to_string())
            })
            .collect();
        out.sort_by_key(|(model, _)| *model);
        out
    }

    /// Run every backend's warm-up hook.
    pub fn warm_up_all(&self) -> Result<()> {
        for (model, backend) in &self.backends {
            let mut guard = backend.lock().unwrap_or_else(|p| p.into_inner());
            guard
                .warm_up()
                .map_err(|e| anyhow!("warm-up failed for {} ({}): {}", model, guard.name(), e))?;
        }
        Ok(())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
