// Prediction - speculative look-ahead
// Advances a throwaway copy of the world and samples future positions

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KernelError, KernelResult};
use crate::registry::BodyHandle;
use crate::simulation::SimulationState;
use crate::vector::Vector3;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub duration: f64,
    pub samples: usize,
    /// Bodies to sample; `None` means every body flagged TRACK_TRAJECTORY
    pub handles: Option<Vec<BodyHandle>>,
}

impl PredictionRequest {
    pub fn new(duration: f64, samples: usize) -> Self {
        Self {
            duration,
            samples,
            handles: None,
        }
    }

    pub fn for_bodies(mut self, handles: Vec<BodyHandle>) -> Self {
        self.handles = Some(handles);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrajectoryPoint {
    pub time: f64,
    pub position: Vector3,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub handle: BodyHandle,
    pub points: Vec<TrajectoryPoint>,
}

/// Sample future positions without touching `state`.
///
/// The first point of each trajectory is the current position; `samples`
/// more follow at equal intervals over `duration`. A body that disappears or
/// goes inactive in the copy simply stops gaining points.
pub fn predict(state: &SimulationState, request: &PredictionRequest) -> KernelResult<Vec<Trajectory>> {
    if !(request.duration.is_finite() && request.duration > 0.0) || request.samples == 0 {
        return Err(KernelError::InvalidConfig(
            "prediction needs a positive duration and at least one sample".to_string(),
        ));
    }
    let handles = match &request.handles {
        Some(h) => h.clone(),
        None => state.tracked(),
    };

    let mut copy = state.speculative_clone();
    let mut trajectories = Vec::with_capacity(handles.len());
    for &handle in &handles {
        let position = copy.position(handle)?;
        trajectories.push(Trajectory {
            handle,
            points: vec![TrajectoryPoint {
                time: copy.massive_time(),
                position,
            }],
        });
    }

    let interval = request.duration / request.samples as f64;
    for _ in 0..request.samples {
        if let Err(e) = copy.evolve(interval) {
            warn!("Prediction stopped early at t = {}: {}", copy.massive_time(), e);
            break;
        }
        let time = copy.massive_time();
        for trajectory in trajectories.iter_mut() {
            if !copy.is_active(trajectory.handle) {
                continue;
            }
            if let Ok(position) = copy.position(trajectory.handle) {
                trajectory.points.push(TrajectoryPoint { time, position });
            }
        }
    }
    Ok(trajectories)
}
