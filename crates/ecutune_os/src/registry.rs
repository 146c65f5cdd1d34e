#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ecutune_engines::contract::TuningEngine;
use ecutune_kernel_contracts::capability::EngineId;
use parking_lot::RwLock;
use tracing::info;

use crate::error::OrchestratorError;

/// Read-mostly table of back-ends owned by one orchestrator.
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<BTreeMap<EngineId, Arc<dyn TuningEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any engine already registered under the same id.
    pub fn register(&self, engine: Arc<dyn TuningEngine>) {
        let id = engine.engine_id().clone();
        info!(engine_id = %id, "engine registered");
        self.engines.write().insert(id, engine);
    }

    pub fn get(&self, engine_id: &EngineId) -> Result<Arc<dyn TuningEngine>, OrchestratorError> {
        self.engines
            .read()
            .get(engine_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::EngineNotFound(engine_id.clone()))
    }

    pub fn list(&self) -> Vec<EngineId> {
        self.engines.read().keys().cloned().collect()
    }
}
