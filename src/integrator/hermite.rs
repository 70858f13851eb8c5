// Hermite - adaptive 4th-order predictor-corrector
// Shared time step from the Aarseth criterion over all integrated bodies

use tracing::warn;

use super::{accumulate_accelerations_and_jerks, is_integrated, IntegratorArrays};
use crate::config::EngineConfig;
use crate::registry::{BodyFlags, BodyRegistry};
use crate::vector::Vector3;

/// Safety factor for the very first step, which has no snap estimate yet
const ETA_START: f64 = 0.01;

/// Guard against a pathological encounter stalling a single call forever
const MAX_SUBSTEPS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct Hermite {
    pub eta: f64,
    pub max_dt: f64,
    pub min_dt: f64,
    pub softening: f64,
    pub arrays: IntegratorArrays,
    next_dt: Option<f64>,
    /// Number of internal steps taken by the last call
    pub last_substeps: usize,
}

impl Hermite {
    pub fn new(config: &EngineConfig, capacity: usize) -> Self {
        Self {
            eta: config.hermite_eta,
            max_dt: config.hermite_max_dt,
            min_dt: config.hermite_min_dt,
            softening: config.softening,
            arrays: IntegratorArrays::with_capacity(capacity),
            next_dt: None,
            last_substeps: 0,
        }
    }

    /// Forget the step-size history; the next call restarts from the
    /// acceleration/jerk ratio
    pub fn invalidate(&mut self) {
        self.next_dt = None;
    }

    fn evaluate(&mut self, registry: &BodyRegistry) {
        let n = registry.len();
        let (acc, jerk) = (&mut self.arrays.acceleration, &mut self.arrays.jerk);
        accumulate_accelerations_and_jerks(
            registry.positions(),
            &self.arrays.velocity[..n],
            registry.masses(),
            registry.flags(),
            self.softening,
            acc,
            jerk,
        );
    }

    fn clamp_dt(&self, dt: f64) -> f64 {
        if dt.is_finite() {
            dt.clamp(self.min_dt, self.max_dt)
        } else {
            self.max_dt
        }
    }

    /// Starting step: eta_s * min |a| / |j|
    fn initial_dt(&self, registry: &BodyRegistry) -> f64 {
        let mut dt = f64::INFINITY;
        for i in 0..registry.len() {
            if !is_integrated(registry.flag_bits(i)) {
                continue;
            }
            let a = self.arrays.acceleration[i].magnitude();
            let j = self.arrays.jerk[i].magnitude();
            if j > 0.0 {
                dt = dt.min(ETA_START * a / j);
            }
        }
        self.clamp_dt(dt)
    }

    /// Advance by exactly `requested` using as many adaptive sub-steps as the
    /// local error estimate calls for. Returns the time actually advanced,
    /// which falls short only if the sub-step guard trips.
    pub fn step(&mut self, requested: f64, registry: &mut BodyRegistry) -> f64 {
        if !(requested > 0.0) {
            return 0.0;
        }
        let n = registry.len();

        // Fixed bodies were moved externally since the last call
        self.evaluate(registry);
        let mut dt = match self.next_dt {
            Some(dt) => dt,
            None => self.initial_dt(registry),
        };

        let mut x0 = vec![Vector3::zero(); n];
        let mut v0 = vec![Vector3::zero(); n];
        let mut a0 = vec![Vector3::zero(); n];
        let mut j0 = vec![Vector3::zero(); n];

        let mut advanced = 0.0;
        let mut substeps = 0;
        while advanced < requested {
            let remaining = requested - advanced;
            let last = dt >= remaining;
            let h = if last { remaining } else { dt };

            x0.copy_from_slice(registry.positions());
            v0.copy_from_slice(&self.arrays.velocity[..n]);
            a0.copy_from_slice(&self.arrays.acceleration[..n]);
            j0.copy_from_slice(&self.arrays.jerk[..n]);

            // Predict every body, fixed ones included (they coast until overwritten)
            let h2 = h * h;
            let h3 = h2 * h;
            for i in 0..n {
                if registry.flag_bits(i).contains(BodyFlags::INACTIVE) {
                    continue;
                }
                let xp = x0[i]
                    .add_scaled(&v0[i], h)
                    .add_scaled(&a0[i], h2 / 2.0)
                    .add_scaled(&j0[i], h3 / 6.0);
                registry.set_position(i, xp);
                if is_integrated(registry.flag_bits(i)) {
                    self.arrays.velocity[i] =
                        v0[i].add_scaled(&a0[i], h).add_scaled(&j0[i], h2 / 2.0);
                }
            }

            self.evaluate(registry);

            // Correct and estimate the next step
            let mut new_dt = f64::INFINITY;
            for i in 0..n {
                if !is_integrated(registry.flag_bits(i)) {
                    continue;
                }
                let a1 = self.arrays.acceleration[i];
                let j1 = self.arrays.jerk[i];
                let da = a0[i].sub(&a1);

                let v1 = v0[i]
                    .add_scaled(&a0[i].add(&a1), h / 2.0)
                    .add_scaled(&j0[i].sub(&j1), h2 / 12.0);
                let x1 = x0[i]
                    .add_scaled(&v0[i].add(&v1), h / 2.0)
                    .add_scaled(&da, h2 / 12.0);
                self.arrays.velocity[i] = v1;
                registry.set_position(i, x1);

                // Snap and crackle from the interpolating polynomial
                let snap0 = da
                    .scale(-6.0)
                    .add_scaled(&j0[i].scale(4.0).add(&j1.scale(2.0)), -h)
                    .scale(1.0 / h2);
                let crackle = da
                    .scale(12.0)
                    .add_scaled(&j0[i].add(&j1), 6.0 * h)
                    .scale(1.0 / h3);
                let snap1 = snap0.add_scaled(&crackle, h);

                let a_mag = a1.magnitude();
                let j_mag = j1.magnitude();
                let s_mag = snap1.magnitude();
                let c_mag = crackle.magnitude();
                let denom = j_mag * c_mag + s_mag * s_mag;
                if denom > 0.0 {
                    new_dt = new_dt.min((self.eta * (a_mag * s_mag + j_mag * j_mag) / denom).sqrt());
                }
            }

            // A truncated final step is too short for a trustworthy estimate
            if !last || h >= 0.5 * dt {
                dt = self.clamp_dt(new_dt.min(2.0 * dt));
            }
            advanced = if last { requested } else { advanced + h };
            substeps += 1;
            if substeps >= MAX_SUBSTEPS {
                warn!(
                    "Hermite sub-step guard reached after {} steps ({} of {} advanced)",
                    substeps, advanced, requested
                );
                break;
            }
        }

        // Corrected positions, so acceleration() matches the state handed back
        self.evaluate(registry);
        self.next_dt = Some(dt);
        self.last_substeps = substeps;
        advanced
    }
}
