// Kepler Propagator - universal-variable two-body propagation
// One formulation for every conic; only the Stumpff functions branch on sign

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{KernelError, KernelResult};
use crate::vector::Vector3;

/// |alpha| below this is treated as parabolic when seeding
const PARABOLIC_ALPHA: f64 = 1e-12;

/// Allowed deviation of f*gdot - fdot*g from one before a warning
const LAGRANGE_IDENTITY_TOL: f64 = 1e-6;

// =============================================================================
// STUMPFF FUNCTIONS
// =============================================================================

/// Below this |z| the Stumpff functions come from their power series; the
/// closed forms of c3 lose about eps / |z| to cancellation
const STUMPFF_SERIES: f64 = 0.1;

/// c2(z) and c3(z), with a series expansion near zero
pub fn stumpff(z: f64) -> (f64, f64) {
    if z > STUMPFF_SERIES {
        let s = z.sqrt();
        let half = (0.5 * s).sin();
        (2.0 * half * half / z, (s - s.sin()) / (z * s))
    } else if z < -STUMPFF_SERIES {
        let s = (-z).sqrt();
        let half = (0.5 * s).sinh();
        (-2.0 * half * half / z, (s.sinh() - s) / (-z * s))
    } else {
        // c2 = sum (-z)^k / (2k+2)!, c3 = sum (-z)^k / (2k+3)!
        let mut c2 = 0.0;
        let mut c3 = 0.0;
        let mut term2 = 0.5;
        let mut term3 = 1.0 / 6.0;
        for k in 0..8 {
            c2 += term2;
            c3 += term3;
            let n = 2.0 * k as f64;
            term2 *= -z / ((n + 3.0) * (n + 4.0));
            term3 *= -z / ((n + 4.0) * (n + 5.0));
        }
        (c2, c3)
    }
}

// =============================================================================
// SOLVER
// =============================================================================

/// Newton iteration limits for the universal Kepler equation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeplerSolver {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for KeplerSolver {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_iterations: 100,
        }
    }
}

impl KeplerSolver {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            tolerance: config.kepler_tolerance,
            max_iterations: config.kepler_max_iterations,
        }
    }

    /// Propagate a relative state `(r0, v0)` by `dt` around a center with
    /// gravitational parameter `mu`. Negative `dt` propagates backwards.
    pub fn propagate(
        &self,
        r0: &Vector3,
        v0: &Vector3,
        mu: f64,
        dt: f64,
    ) -> KernelResult<(Vector3, Vector3)> {
        if !(mu > 0.0) {
            return Err(KernelError::InvalidConfig(format!(
                "gravitational parameter must be positive (got {mu})"
            )));
        }
        if !dt.is_finite() {
            return Err(KernelError::InvalidState(format!("cannot propagate by {dt}")));
        }

        let r0_mag = r0.magnitude();
        if r0_mag == 0.0 {
            return Err(KernelError::DegenerateOrbit(
                "zero separation from center".to_string(),
            ));
        }
        // Steps lost in the rounding of the orbit's own time scale are no motion
        let min_dt = f64::EPSILON * (r0_mag * r0_mag * r0_mag / mu).sqrt();
        if dt.abs() <= min_dt {
            return Ok((*r0, *v0));
        }
        let sqrt_mu = mu.sqrt();
        let rv = r0.dot(v0);
        let alpha = 2.0 / r0_mag - v0.magnitude_squared() / mu;

        // Whole periods are dropped so the seed stays in range
        let dt = if alpha > PARABOLIC_ALPHA {
            let period = 2.0 * std::f64::consts::PI / (sqrt_mu * alpha.powf(1.5));
            if dt.abs() > period {
                dt % period
            } else {
                dt
            }
        } else {
            dt
        };
        if dt.abs() <= min_dt {
            return Ok((*r0, *v0));
        }

        let mut x = seed(r0, v0, r0_mag, rv, alpha, mu, dt);
        let mut converged = false;
        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            let x2 = x * x;
            let z = x2 * alpha;
            let (c2, c3) = stumpff(z);

            let f_x = x2 * x * c3 + rv / sqrt_mu * x2 * c2 + r0_mag * x * (1.0 - z * c3);
            let r = x2 * c2 + rv / sqrt_mu * x * (1.0 - z * c3) + r0_mag * (1.0 - z * c2);

            let dx = (sqrt_mu * dt - f_x) / r;
            x += dx;
            if !x.is_finite() {
                break;
            }
            if dx.abs() < self.tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(KernelError::KeplerNonConvergence { iterations });
        }

        // Lagrange coefficients
        let x2 = x * x;
        let z = x2 * alpha;
        let (c2, c3) = stumpff(z);
        let r = x2 * c2 + rv / sqrt_mu * x * (1.0 - z * c3) + r0_mag * (1.0 - z * c2);

        let f = 1.0 - x2 / r0_mag * c2;
        let g = dt - x2 * x / sqrt_mu * c3;
        let g_dot = 1.0 - x2 / r * c2;
        let f_dot = sqrt_mu / (r * r0_mag) * x * (z * c3 - 1.0);

        let identity = f * g_dot - f_dot * g;
        if (identity - 1.0).abs() > LAGRANGE_IDENTITY_TOL {
            warn!(
                "Kepler propagation: Lagrange identity off by {:.3e} (dt = {})",
                identity - 1.0,
                dt
            );
        }

        let position = r0.scale(f).add_scaled(v0, g);
        let velocity = r0.scale(f_dot).add_scaled(v0, g_dot);
        if !position.is_finite() || !velocity.is_finite() {
            return Err(KernelError::KeplerNonConvergence { iterations });
        }
        Ok((position, velocity))
    }
}

/// Starting guess for the universal variable, by conic type
fn seed(r0: &Vector3, v0: &Vector3, r0_mag: f64, rv: f64, alpha: f64, mu: f64, dt: f64) -> f64 {
    let sqrt_mu = mu.sqrt();
    if alpha > PARABOLIC_ALPHA {
        sqrt_mu * dt * alpha
    } else if alpha < -PARABOLIC_ALPHA {
        let a = 1.0 / alpha;
        let sign = dt.signum();
        let arg = (-2.0 * mu * alpha * dt) / (rv + sign * (-mu * a).sqrt() * (1.0 - r0_mag * alpha));
        let x = sign * (-a).sqrt() * arg.ln();
        if x.is_finite() {
            x
        } else {
            sqrt_mu * dt / r0_mag
        }
    } else {
        // Barker's equation through the semi-latus rectum
        let p = r0.cross(v0).magnitude_squared() / mu;
        if p > 0.0 {
            let s = 0.5 * (1.0 / (3.0 * (mu / (p * p * p)).sqrt() * dt)).atan();
            let w = s.tan().cbrt().atan();
            p.sqrt() * 2.0 / (2.0 * w).tan()
        } else {
            sqrt_mu * dt / r0_mag
        }
    }
}

// =============================================================================
// EPOCH
// =============================================================================

/// Relative state of a body about its center at a reference time.
///
/// Never mutated once built; an impulse or a change of center produces a new
/// epoch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct OrbitEpoch {
    pub r0: Vector3,
    pub v0: Vector3,
    pub t0: f64,
    pub mu: f64,
}

impl OrbitEpoch {
    pub fn new(r0: Vector3, v0: Vector3, t0: f64, mu: f64) -> KernelResult<Self> {
        if !(mu.is_finite() && mu > 0.0) {
            return Err(KernelError::InvalidConfig(format!(
                "gravitational parameter must be positive (got {mu})"
            )));
        }
        if !r0.is_finite() || !v0.is_finite() || !t0.is_finite() {
            return Err(KernelError::InvalidState("non-finite orbit epoch".to_string()));
        }
        Ok(Self { r0, v0, t0, mu })
    }

    /// Reciprocal semi-major axis; positive for ellipses
    pub fn alpha(&self) -> f64 {
        2.0 / self.r0.magnitude() - self.v0.magnitude_squared() / self.mu
    }

    pub fn period(&self) -> Option<f64> {
        let alpha = self.alpha();
        if alpha > PARABOLIC_ALPHA {
            Some(2.0 * std::f64::consts::PI / (self.mu.sqrt() * alpha.powf(1.5)))
        } else {
            None
        }
    }

    pub fn angular_momentum(&self) -> Vector3 {
        self.r0.cross(&self.v0)
    }

    pub fn specific_energy(&self) -> f64 {
        0.5 * self.v0.magnitude_squared() - self.mu / self.r0.magnitude()
    }

    /// Relative position and velocity at absolute time `t`
    pub fn state_at(&self, t: f64, solver: &KeplerSolver) -> KernelResult<(Vector3, Vector3)> {
        solver.propagate(&self.r0, &self.v0, self.mu, t - self.t0)
    }

    /// New epoch at `t` with `delta_v` added to the propagated velocity
    pub fn rebased(&self, t: f64, delta_v: &Vector3, solver: &KeplerSolver) -> KernelResult<Self> {
        let (r, v) = self.state_at(t, solver)?;
        OrbitEpoch::new(r, v.add(delta_v), t, self.mu)
    }
}
