// Regularized Triple - Aarseth-Zare three-body regularization
// Two KS-transformed separation vectors share a reference body; fictitious
// time s with dt/ds = R1 R2 removes both collision singularities

use tracing::debug;

use super::{accumulate_accelerations, IntegratorArrays};
use crate::config::EngineConfig;
use crate::error::{KernelError, KernelResult};
use crate::registry::{BodyFlags, BodyRegistry};
use crate::vector::Vector3;

/// Body count the solver is built for
pub const BODIES: usize = 3;

/// Local error tolerance of the step-doubling RK4 in fictitious time
const TOLERANCE: f64 = 1e-11;

const MAX_ATTEMPTS: usize = 200_000;

/// Steps this short are accepted regardless of the error estimate
const MIN_DS: f64 = 1e-15;

type Ks = [f64; 4];

// =============================================================================
// KS TRANSFORMATION
// =============================================================================

/// L(u) v
fn ks_mul(u: &Ks, v: &Ks) -> Ks {
    [
        u[0] * v[0] - u[1] * v[1] - u[2] * v[2] + u[3] * v[3],
        u[1] * v[0] + u[0] * v[1] - u[3] * v[2] - u[2] * v[3],
        u[2] * v[0] + u[3] * v[1] + u[0] * v[2] + u[1] * v[3],
        u[3] * v[0] - u[2] * v[1] + u[1] * v[2] - u[0] * v[3],
    ]
}

/// L(u)^T w
fn ks_mul_transposed(u: &Ks, w: &Ks) -> Ks {
    [
        u[0] * w[0] + u[1] * w[1] + u[2] * w[2] + u[3] * w[3],
        -u[1] * w[0] + u[0] * w[1] + u[3] * w[2] - u[2] * w[3],
        -u[2] * w[0] - u[3] * w[1] + u[0] * w[2] + u[1] * w[3],
        u[3] * w[0] - u[2] * w[1] + u[1] * w[2] - u[0] * w[3],
    ]
}

fn norm2(u: &Ks) -> f64 {
    u.iter().map(|c| c * c).sum()
}

fn pad(v: &Vector3) -> Ks {
    [v.x, v.y, v.z, 0.0]
}

fn spatial(w: &Ks) -> Vector3 {
    Vector3::new(w[0], w[1], w[2])
}

/// Drop the bilinear (fourth) component
fn physical(mut w: Ks) -> Ks {
    w[3] = 0.0;
    w
}

fn ks_from_position(q: &Vector3) -> Ks {
    let r = q.magnitude();
    if q.x >= 0.0 {
        let u1 = (0.5 * (r + q.x)).sqrt();
        if u1 == 0.0 {
            return [0.0; 4];
        }
        [u1, q.y / (2.0 * u1), q.z / (2.0 * u1), 0.0]
    } else {
        let u2 = (0.5 * (r - q.x)).sqrt();
        [q.y / (2.0 * u2), u2, 0.0, q.z / (2.0 * u2)]
    }
}

fn ks_position(u: &Ks) -> Vector3 {
    spatial(&ks_mul(u, u))
}

// =============================================================================
// REGULARIZED STATE
// =============================================================================

/// Q1, Q2, P1, P2 and physical time, packed for the RK stages
#[derive(Debug, Clone, Copy)]
struct TripleState {
    y: [f64; 17],
}

impl TripleState {
    fn q1(&self) -> Ks {
        [self.y[0], self.y[1], self.y[2], self.y[3]]
    }
    fn q2(&self) -> Ks {
        [self.y[4], self.y[5], self.y[6], self.y[7]]
    }
    fn p1(&self) -> Ks {
        [self.y[8], self.y[9], self.y[10], self.y[11]]
    }
    fn p2(&self) -> Ks {
        [self.y[12], self.y[13], self.y[14], self.y[15]]
    }
    fn time(&self) -> f64 {
        self.y[16]
    }

    fn pack(q1: &Ks, q2: &Ks, p1: &Ks, p2: &Ks, t: f64) -> Self {
        let mut y = [0.0; 17];
        y[0..4].copy_from_slice(q1);
        y[4..8].copy_from_slice(q2);
        y[8..12].copy_from_slice(p1);
        y[12..16].copy_from_slice(p2);
        y[16] = t;
        Self { y }
    }

    fn axpy(&self, k: &[f64; 17], h: f64) -> Self {
        let mut y = self.y;
        for (yi, ki) in y.iter_mut().zip(k.iter()) {
            *yi += h * ki;
        }
        Self { y }
    }

    fn time_rate(&self) -> f64 {
        norm2(&self.q1()) * norm2(&self.q2())
    }
}

/// Masses in solver order: the two regularized bodies, then the reference
#[derive(Debug, Clone, Copy)]
struct TripleMasses {
    m1: f64,
    m2: f64,
    m3: f64,
    mu13: f64,
    mu23: f64,
}

impl TripleMasses {
    fn new(m1: f64, m2: f64, m3: f64) -> Self {
        Self {
            m1,
            m2,
            m3,
            mu13: m1 * m3 / (m1 + m3),
            mu23: m2 * m3 / (m2 + m3),
        }
    }
}

/// d/ds of the packed state for the regularized Hamiltonian
/// Gamma = R1 R2 (H - E)
fn derivatives(state: &TripleState, m: &TripleMasses, energy: f64) -> [f64; 17] {
    let (q1, q2, p1, p2) = (state.q1(), state.q2(), state.p1(), state.p2());
    let r1 = norm2(&q1);
    let r2 = norm2(&q2);
    let d = ks_position(&q1).sub(&ks_position(&q2));
    let r12 = d.magnitude();
    let inv_r12 = 1.0 / r12;
    let inv_r12_3 = inv_r12 * inv_r12 * inv_r12;

    let w1 = physical(ks_mul(&q1, &p1));
    let w2 = physical(ks_mul(&q2, &p2));
    let p1_sq = norm2(&p1);
    let p2_sq = norm2(&p2);
    let cross = 1.0 / (4.0 * m.m3);

    let lq1_w2 = ks_mul_transposed(&q1, &w2);
    let lq2_w1 = ks_mul_transposed(&q2, &w1);
    let lp1_w2 = ks_mul_transposed(&p1, &w2);
    let lp2_w1 = ks_mul_transposed(&p2, &w1);
    let lq1_d = ks_mul_transposed(&q1, &pad(&d));
    let lq2_d = ks_mul_transposed(&q2, &pad(&d));

    let coupling = 2.0 * m.m1 * m.m2 * r1 * r2 * inv_r12_3;
    let s1 = 2.0 * (m.m2 * m.m3 + energy * r2 + m.m1 * m.m2 * r2 * inv_r12);
    let s2 = 2.0 * (m.m1 * m.m3 + energy * r1 + m.m1 * m.m2 * r1 * inv_r12);

    let mut out = [0.0; 17];
    for k in 0..4 {
        // dQ/ds = dGamma/dP
        out[k] = r2 / (4.0 * m.mu13) * p1[k] + cross * lq1_w2[k];
        out[4 + k] = r1 / (4.0 * m.mu23) * p2[k] + cross * lq2_w1[k];

        // dP/ds = -dGamma/dQ
        let g1 = q1[k] * p2_sq / (4.0 * m.mu23) + cross * lp1_w2[k] - s1 * q1[k]
            + coupling * lq1_d[k];
        let g2 = q2[k] * p1_sq / (4.0 * m.mu13) + cross * lp2_w1[k] - s2 * q2[k]
            - coupling * lq2_d[k];
        out[8 + k] = -g1;
        out[12 + k] = -g2;
    }
    out[16] = r1 * r2;
    out
}

fn rk4(state: &TripleState, m: &TripleMasses, energy: f64, ds: f64) -> TripleState {
    let k1 = derivatives(state, m, energy);
    let k2 = derivatives(&state.axpy(&k1, 0.5 * ds), m, energy);
    let k3 = derivatives(&state.axpy(&k2, 0.5 * ds), m, energy);
    let k4 = derivatives(&state.axpy(&k3, ds), m, energy);
    let mut y = state.y;
    for i in 0..17 {
        y[i] += ds / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
    }
    TripleState { y }
}

// =============================================================================
// SOLVER
// =============================================================================

#[derive(Debug, Clone)]
pub struct RegularizedTriple {
    /// Upper bound on physical time covered by one regularized step
    pub max_dt: f64,
    pub arrays: IntegratorArrays,
    /// Fictitious-time step carried between calls
    ds: Option<f64>,
}

impl RegularizedTriple {
    pub fn new(config: &EngineConfig, capacity: usize) -> KernelResult<Self> {
        if capacity > BODIES {
            return Err(KernelError::TripleBodyCount(capacity));
        }
        Ok(Self {
            max_dt: config.engine_dt,
            arrays: IntegratorArrays::with_capacity(BODIES),
            ds: None,
        })
    }

    /// The solver is sized for exactly three bodies and never grows
    pub fn grow_arrays(&mut self, new_capacity: usize) -> KernelResult<()> {
        if new_capacity > BODIES {
            return Err(KernelError::TripleBodyCount(new_capacity));
        }
        Ok(())
    }

    pub fn step(&mut self, requested: f64, registry: &mut BodyRegistry) -> KernelResult<f64> {
        let n = registry.len();
        if n != BODIES {
            return Err(KernelError::TripleBodyCount(n));
        }
        if (0..n).any(|i| {
            let f = registry.flag_bits(i);
            f.contains(BodyFlags::FIXED_MOTION) || f.contains(BodyFlags::INACTIVE)
        }) {
            return Err(KernelError::InvalidState(
                "regularized triple requires three active, integrated bodies".to_string(),
            ));
        }
        if !(requested > 0.0) {
            return Ok(0.0);
        }

        let mass = [registry.mass(0), registry.mass(1), registry.mass(2)];
        let total = mass[0] + mass[1] + mass[2];
        let pos = [registry.position(0), registry.position(1), registry.position(2)];
        let vel = [
            self.arrays.velocity[0],
            self.arrays.velocity[1],
            self.arrays.velocity[2],
        ];

        // Centre-of-mass frame
        let mut com = Vector3::zero();
        let mut com_v = Vector3::zero();
        for k in 0..BODIES {
            com = com.add_scaled(&pos[k], mass[k] / total);
            com_v = com_v.add_scaled(&vel[k], mass[k] / total);
        }
        let x: Vec<Vector3> = pos.iter().map(|p| p.sub(&com)).collect();
        let v: Vec<Vector3> = vel.iter().map(|u| u.sub(&com_v)).collect();

        // Reference body: the one not in the widest pair
        let d01 = x[0].distance(&x[1]);
        let d02 = x[0].distance(&x[2]);
        let d12 = x[1].distance(&x[2]);
        let (a, b, c) = if d01 >= d02 && d01 >= d12 {
            (0, 1, 2)
        } else if d02 >= d12 {
            (0, 2, 1)
        } else {
            (1, 2, 0)
        };

        let masses = TripleMasses::new(mass[a], mass[b], mass[c]);
        let mut energy = 0.0;
        for k in 0..BODIES {
            energy += 0.5 * mass[k] * v[k].magnitude_squared();
        }
        energy -= mass[0] * mass[1] / d01 + mass[0] * mass[2] / d02 + mass[1] * mass[2] / d12;

        let q1 = ks_from_position(&x[a].sub(&x[c]));
        let q2 = ks_from_position(&x[b].sub(&x[c]));
        let p1 = ks_mul_transposed(&q1, &pad(&v[a].scale(mass[a]))).map(|e| 2.0 * e);
        let p2 = ks_mul_transposed(&q2, &pad(&v[b].scale(mass[b]))).map(|e| 2.0 * e);
        let mut state = TripleState::pack(&q1, &q2, &p1, &p2, 0.0);

        // Error scales fixed for the whole call
        let q_scale = (norm2(&q1) + norm2(&q2)).sqrt();
        let p_scale = norm2(&p1).sqrt()
            + norm2(&p2).sqrt()
            + 2.0 * masses.mu13.min(masses.mu23) * total.sqrt();

        let mut ds = match self.ds {
            Some(ds) => ds,
            None => 0.1 * self.max_dt.min(requested) / state.time_rate().max(f64::MIN_POSITIVE),
        };

        let mut attempts = 0;
        while state.time() < requested && attempts < MAX_ATTEMPTS {
            attempts += 1;
            let rate = state.time_rate().max(f64::MIN_POSITIVE);
            let remaining = requested - state.time();
            if remaining <= requested * 1e-13 {
                break;
            }
            let limit = remaining.min(self.max_dt) / rate;
            let h = ds.min(limit);

            // Step doubling: one full step against two half steps
            let full = rk4(&state, &masses, energy, h);
            let half = rk4(&state, &masses, energy, 0.5 * h);
            let fine = rk4(&half, &masses, energy, 0.5 * h);

            let mut err: f64 = 0.0;
            for i in 0..16 {
                let scale = if i < 8 { q_scale } else { p_scale };
                err = err.max((fine.y[i] - full.y[i]).abs() / scale);
            }

            let factor = if err > 0.0 {
                (0.9 * (TOLERANCE / err).powf(0.2)).clamp(0.2, 4.0)
            } else {
                4.0
            };

            if err <= TOLERANCE || h < MIN_DS {
                // Richardson extrapolation of the accepted step
                let mut y = fine.y;
                for i in 0..17 {
                    y[i] += (fine.y[i] - full.y[i]) / 15.0;
                }
                state = TripleState { y };
                if h == ds {
                    ds = h * factor;
                }
            } else {
                ds = h * factor;
            }
        }
        self.ds = Some(ds);
        debug!(
            "triple step: reference body {}, {} attempts, advanced {}",
            c,
            attempts,
            state.time()
        );

        // Back to Cartesian, centre-of-mass frame
        let (q1, q2) = (state.q1(), state.q2());
        let (r1, r2) = (norm2(&q1), norm2(&q2));
        let rel1 = ks_position(&q1);
        let rel2 = ks_position(&q2);
        let mom1 = spatial(&ks_mul(&q1, &state.p1())).scale(0.5 / r1);
        let mom2 = spatial(&ks_mul(&q2, &state.p2())).scale(0.5 / r2);

        let advanced = state.time();
        let ref_pos = rel1
            .scale(masses.m1)
            .add(&rel2.scale(masses.m2))
            .scale(-1.0 / total);
        let ref_vel = mom1.add(&mom2).scale(-1.0 / masses.m3);

        let com_now = com.add_scaled(&com_v, advanced);
        let new_pos = [
            (a, rel1.add(&ref_pos)),
            (b, rel2.add(&ref_pos)),
            (c, ref_pos),
        ];
        let new_vel = [
            (a, mom1.scale(1.0 / masses.m1)),
            (b, mom2.scale(1.0 / masses.m2)),
            (c, ref_vel),
        ];
        for (k, p) in new_pos {
            registry.set_position(k, com_now.add(&p));
        }
        for (k, u) in new_vel {
            self.arrays.velocity[k] = com_v.add(&u);
        }
        accumulate_accelerations(
            registry.positions(),
            registry.masses(),
            registry.flags(),
            0.0,
            &mut self.arrays.acceleration,
        );

        Ok(advanced)
    }
}
