//! Registry of concurrent runs.
//!
//! The composition root owns one [`SimulationRegistry`]; each run lives under
//! an opaque [`RunId`] for exactly as long as the caller keeps it there.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use fleetsim_core::{EngineSettings, Result, SimError};

use crate::controller::FleetController;
use crate::link::Connector;

/// Opaque identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controllers keyed by run id.
pub struct SimulationRegistry {
    runs: DashMap<RunId, Arc<FleetController>>,
    connector: Arc<dyn Connector>,
    settings: EngineSettings,
}

impl SimulationRegistry {
    pub fn new(connector: Arc<dyn Connector>, settings: EngineSettings) -> Self {
        Self {
            runs: DashMap::new(),
            connector,
            settings,
        }
    }

    /// Register a fresh, idle controller.
    pub fn create(&self) -> (RunId, Arc<FleetController>) {
        let id = RunId::new();
        let controller = Arc::new(FleetController::new(
            self.connector.clone(),
            self.settings.clone(),
        ));
        self.runs.insert(id, controller.clone());
        info!(run_id = %id, "Run registered");
        (id, controller)
    }

    pub fn get(&self, id: &RunId) -> Option<Arc<FleetController>> {
        self.runs.get(id).map(|entry| entry.value().clone())
    }

    /// Stop a run, keeping it registered.
    pub async fn stop(&self, id: &RunId) -> Result<()> {
        let controller = self.get(id).ok_or(SimError::NotRunning)?;
        controller.stop().await;
        Ok(())
    }

    /// Stop and forget a run.
    pub async fn remove(&self, id: &RunId) -> Option<Arc<FleetController>> {
        let (_, controller) = self.runs.remove(id)?;
        controller.stop().await;
        info!(run_id = %id, "Run removed");
        Some(controller)
    }

    /// Stop every registered run.
    pub async fn stop_all(&self) {
        let controllers: Vec<Arc<FleetController>> =
            self.runs.iter().map(|entry| entry.value().clone()).collect();
        futures::future::join_all(controllers.iter().map(|c| c.stop())).await;
    }

    pub fn list(&self) -> Vec<RunId> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
