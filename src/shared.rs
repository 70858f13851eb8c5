// Shared Simulation - thread-safe handle around a simulation state
// One writer advances the world; readers take snapshots and run predictions

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::KernelResult;
use crate::prediction::{predict, PredictionRequest, Trajectory};
use crate::simulation::{BodySnapshot, SimulationState};

#[derive(Clone)]
pub struct SharedSimulation {
    inner: Arc<RwLock<SimulationState>>,
}

impl SharedSimulation {
    pub fn new(config: EngineConfig) -> KernelResult<Self> {
        Ok(Self::from_state(SimulationState::new(config)?))
    }

    pub fn from_state(state: SimulationState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SimulationState> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SimulationState> {
        self.inner.write()
    }

    pub fn evolve(&self, dt: f64) -> KernelResult<f64> {
        self.inner.write().evolve(dt)
    }

    pub fn time(&self) -> f64 {
        self.inner.read().time()
    }

    pub fn snapshot(&self) -> Vec<BodySnapshot> {
        self.inner.read().snapshot()
    }

    /// Copies the state under the read lock, then integrates with no lock held
    pub fn predict(&self, request: &PredictionRequest) -> KernelResult<Vec<Trajectory>> {
        let copy = self.inner.read().speculative_clone();
        predict(&copy, request)
    }
}
