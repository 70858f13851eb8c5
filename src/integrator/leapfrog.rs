// Leapfrog - fixed-step kick-drift-kick integrator
// Energy behaviour depends on never changing the sub-step at runtime

use super::{accumulate_accelerations, is_integrated, IntegratorArrays};
use crate::config::EngineConfig;
use crate::registry::{BodyFlags, BodyRegistry};

#[derive(Debug, Clone)]
pub struct Leapfrog {
    /// Fixed internal sub-step
    pub dt: f64,
    pub softening: f64,
    pub arrays: IntegratorArrays,
}

impl Leapfrog {
    pub fn new(config: &EngineConfig, capacity: usize) -> Self {
        Self {
            dt: config.engine_dt,
            softening: config.softening,
            arrays: IntegratorArrays::with_capacity(capacity),
        }
    }

    /// Take one kick-drift-kick step of `min(requested, self.dt)`.
    ///
    /// Callers wanting "faster" evolution call this more often. A shorter step
    /// is only taken when the caller has to land on an exact instant (a
    /// scheduled maneuver).
    ///
    /// Fixed-motion bodies are drifted on their last known velocity so the
    /// second kick sees them roughly where they will be; the orchestrator
    /// overwrites them with their analytic state right after the step.
    pub fn step(&mut self, requested: f64, registry: &mut BodyRegistry) -> f64 {
        let h = requested.min(self.dt);
        if !(h > 0.0) {
            return 0.0;
        }
        let n = registry.len();
        let half_h = 0.5 * h;

        // a_n from x_n
        accumulate_accelerations(
            registry.positions(),
            registry.masses(),
            registry.flags(),
            self.softening,
            &mut self.arrays.acceleration,
        );

        // Kick: v_n+1/2 = v_n + (h/2) a_n
        for i in 0..n {
            if is_integrated(registry.flag_bits(i)) {
                self.arrays.velocity[i] =
                    self.arrays.velocity[i].add_scaled(&self.arrays.acceleration[i], half_h);
            }
        }

        // Drift: x_n+1 = x_n + h v_n+1/2
        for i in 0..n {
            let flags = registry.flag_bits(i);
            if flags.contains(BodyFlags::INACTIVE) {
                continue;
            }
            let p = registry.position(i).add_scaled(&self.arrays.velocity[i], h);
            registry.set_position(i, p);
        }

        // a_n+1 from x_n+1
        accumulate_accelerations(
            registry.positions(),
            registry.masses(),
            registry.flags(),
            self.softening,
            &mut self.arrays.acceleration,
        );

        // Kick: v_n+1 = v_n+1/2 + (h/2) a_n+1
        for i in 0..n {
            if is_integrated(registry.flag_bits(i)) {
                self.arrays.velocity[i] =
                    self.arrays.velocity[i].add_scaled(&self.arrays.acceleration[i], half_h);
            }
        }

        h
    }
}
