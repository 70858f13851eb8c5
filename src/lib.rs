// Gravity Rails - mixed-mode gravitational simulation kernel
// Direct N-body integration, Kepler rails, massless tracers and scheduled maneuvers

pub mod config;
pub mod elements;
pub mod error;
pub mod integrator;
pub mod kepler;
pub mod maneuver;
pub mod prediction;
pub mod rails;
pub mod registry;
pub mod shared;
pub mod simulation;
pub mod tracers;
pub mod vector;

pub use config::{EngineConfig, IntegratorKind};
pub use elements::{OrbitClass, OrbitalElements};
pub use error::{KernelError, KernelResult};
pub use integrator::Integrator;
pub use kepler::{KeplerSolver, OrbitEpoch};
pub use maneuver::{Maneuver, ManeuverCallback};
pub use prediction::{predict, PredictionRequest, Trajectory, TrajectoryPoint};
pub use registry::{BodyFlags, BodyHandle};
pub use shared::SharedSimulation;
pub use simulation::{BodyDesc, BodyKind, BodySnapshot, SimulationState};
pub use vector::{Quaternion, Vector3};
