// Integrators - numerical stepping of the massive population
// Enum dispatch over a fixed-step leapfrog, an adaptive Hermite scheme and a
// KS-regularized three-body solver, plus the shared direct-summation gravity

pub mod hermite;
pub mod leapfrog;
pub mod triple;

use crate::config::{EngineConfig, IntegratorKind};
use crate::error::KernelResult;
use crate::registry::{BodyFlags, BodyHandle, BodyRegistry};
use crate::vector::Vector3;

pub use hermite::Hermite;
pub use leapfrog::Leapfrog;
pub use triple::RegularizedTriple;

// =============================================================================
// PER-BODY BUFFERS (kept index-aligned with the registry)
// =============================================================================

/// Velocity and force history owned by an integrator.
///
/// Sized to the registry capacity and shuffled in lockstep with it, so slot
/// `i` here always describes the body at registry index `i`.
#[derive(Debug, Clone)]
pub struct IntegratorArrays {
    pub velocity: Vec<Vector3>,
    pub acceleration: Vec<Vector3>,
    pub jerk: Vec<Vector3>,
    pub tags: Vec<Option<BodyHandle>>,
}

impl IntegratorArrays {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            velocity: vec![Vector3::zero(); capacity],
            acceleration: vec![Vector3::zero(); capacity],
            jerk: vec![Vector3::zero(); capacity],
            tags: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.velocity.len()
    }

    pub fn resize(&mut self, new_capacity: usize) {
        self.velocity.resize(new_capacity, Vector3::zero());
        self.acceleration.resize(new_capacity, Vector3::zero());
        self.jerk.resize(new_capacity, Vector3::zero());
        self.tags.resize(new_capacity, None);
    }

    pub fn insert_at(&mut self, index: usize, velocity: Vector3, tag: BodyHandle) {
        self.velocity[index] = velocity;
        self.acceleration[index] = Vector3::zero();
        self.jerk[index] = Vector3::zero();
        self.tags[index] = Some(tag);
    }

    /// Shift every later slot down by one and clear the tail
    pub fn remove_at(&mut self, index: usize) {
        if index >= self.capacity() {
            return;
        }
        self.velocity.remove(index);
        self.velocity.push(Vector3::zero());
        self.acceleration.remove(index);
        self.acceleration.push(Vector3::zero());
        self.jerk.remove(index);
        self.jerk.push(Vector3::zero());
        self.tags.remove(index);
        self.tags.push(None);
    }
}

// =============================================================================
// INTEGRATOR STRATEGY
// =============================================================================

#[derive(Debug, Clone)]
pub enum Integrator {
    Leapfrog(Leapfrog),
    Hermite(Hermite),
    Triple(RegularizedTriple),
}

impl Integrator {
    /// Build the integrator selected in `config`, with buffers for `capacity` bodies
    pub fn new(config: &EngineConfig, capacity: usize) -> KernelResult<Self> {
        Ok(match config.integrator {
            IntegratorKind::Leapfrog => Integrator::Leapfrog(Leapfrog::new(config, capacity)),
            IntegratorKind::Hermite => Integrator::Hermite(Hermite::new(config, capacity)),
            IntegratorKind::Triple => Integrator::Triple(RegularizedTriple::new(config, capacity)?),
        })
    }

    pub fn kind(&self) -> IntegratorKind {
        match self {
            Integrator::Leapfrog(_) => IntegratorKind::Leapfrog,
            Integrator::Hermite(_) => IntegratorKind::Hermite,
            Integrator::Triple(_) => IntegratorKind::Triple,
        }
    }

    fn arrays(&self) -> &IntegratorArrays {
        match self {
            Integrator::Leapfrog(l) => &l.arrays,
            Integrator::Hermite(h) => &h.arrays,
            Integrator::Triple(t) => &t.arrays,
        }
    }

    fn arrays_mut(&mut self) -> &mut IntegratorArrays {
        match self {
            Integrator::Leapfrog(l) => &mut l.arrays,
            Integrator::Hermite(h) => &mut h.arrays,
            Integrator::Triple(t) => &mut t.arrays,
        }
    }

    /// Advance the massive population. Returns the time actually advanced,
    /// which callers must accumulate instead of assuming `dt` was honored.
    pub fn step(&mut self, dt: f64, registry: &mut BodyRegistry) -> KernelResult<f64> {
        match self {
            Integrator::Leapfrog(l) => Ok(l.step(dt, registry)),
            Integrator::Hermite(h) => Ok(h.step(dt, registry)),
            Integrator::Triple(t) => t.step(dt, registry),
        }
    }

    pub fn capacity(&self) -> usize {
        self.arrays().capacity()
    }

    /// Grow private buffers to `new_capacity`. Fails without side effects if the
    /// variant cannot hold that many bodies.
    pub fn grow_arrays(&mut self, new_capacity: usize) -> KernelResult<()> {
        match self {
            Integrator::Triple(t) => t.grow_arrays(new_capacity),
            _ => {
                let arrays = self.arrays_mut();
                if new_capacity > arrays.capacity() {
                    arrays.resize(new_capacity);
                }
                Ok(())
            }
        }
    }

    pub fn add_body(&mut self, index: usize, velocity: Vector3, tag: BodyHandle) {
        self.arrays_mut().insert_at(index, velocity, tag);
        self.invalidate();
    }

    pub fn remove_body_at(&mut self, index: usize) {
        self.arrays_mut().remove_at(index);
        self.invalidate();
    }

    pub fn velocity(&self, index: usize) -> Vector3 {
        self.arrays()
            .velocity
            .get(index)
            .copied()
            .unwrap_or_else(Vector3::zero)
    }

    pub fn set_velocity(&mut self, index: usize, velocity: Vector3) {
        if let Some(v) = self.arrays_mut().velocity.get_mut(index) {
            *v = velocity;
        }
        self.invalidate();
    }

    /// Overwrite the velocity of a rails-driven body. Step history is kept
    /// because the body never feeds the integrator's error estimate.
    pub fn sync_velocity(&mut self, index: usize, velocity: Vector3) {
        if let Some(v) = self.arrays_mut().velocity.get_mut(index) {
            *v = velocity;
        }
    }

    /// Acceleration from the most recent force evaluation
    pub fn acceleration(&self, index: usize) -> Vector3 {
        self.arrays()
            .acceleration
            .get(index)
            .copied()
            .unwrap_or_else(Vector3::zero)
    }

    pub fn id_at(&self, index: usize) -> Option<BodyHandle> {
        self.arrays().tags.get(index).copied().flatten()
    }

    pub fn velocities(&self, n: usize) -> &[Vector3] {
        let v = &self.arrays().velocity;
        &v[..n.min(v.len())]
    }

    /// Total mechanical energy of the active massive bodies
    pub fn total_energy(&self, registry: &BodyRegistry) -> f64 {
        let softening = match self {
            Integrator::Leapfrog(l) => l.softening,
            Integrator::Hermite(h) => h.softening,
            Integrator::Triple(_) => 0.0,
        };
        system_energy(
            registry.positions(),
            self.velocities(registry.len()),
            registry.masses(),
            registry.flags(),
            softening,
        )
    }

    /// Force caches are stale after any structural or velocity change
    fn invalidate(&mut self) {
        if let Integrator::Hermite(h) = self {
            h.invalidate();
        }
    }
}

// =============================================================================
// DIRECT-SUMMATION GRAVITY (G = 1)
// =============================================================================

/// Accumulate accelerations for every active body.
/// `out[i]` is overwritten; inactive bodies neither feel nor exert force.
pub fn accumulate_accelerations(
    positions: &[Vector3],
    masses: &[f64],
    flags: &[BodyFlags],
    softening: f64,
    out: &mut [Vector3],
) {
    let n = positions.len();
    for a in out.iter_mut().take(n) {
        *a = Vector3::zero();
    }

    for i in 0..n {
        if flags[i].contains(BodyFlags::INACTIVE) {
            continue;
        }
        for j in (i + 1)..n {
            if flags[j].contains(BodyFlags::INACTIVE) {
                continue;
            }
            // r points from i to j
            let r = positions[j].sub(&positions[i]);
            let d2 = r.magnitude_squared() + softening;
            let inv_r = d2.sqrt().recip();
            let inv_r3 = inv_r * inv_r * inv_r;

            out[i] = out[i].add_scaled(&r, masses[j] * inv_r3);
            out[j] = out[j].add_scaled(&r, -masses[i] * inv_r3);
        }
    }
}

/// Accelerations and their time derivatives (jerks) for Hermite schemes
pub fn accumulate_accelerations_and_jerks(
    positions: &[Vector3],
    velocities: &[Vector3],
    masses: &[f64],
    flags: &[BodyFlags],
    softening: f64,
    acc: &mut [Vector3],
    jerk: &mut [Vector3],
) {
    let n = positions.len();
    for i in 0..n {
        acc[i] = Vector3::zero();
        jerk[i] = Vector3::zero();
    }

    for i in 0..n {
        if flags[i].contains(BodyFlags::INACTIVE) {
            continue;
        }
        for j in (i + 1)..n {
            if flags[j].contains(BodyFlags::INACTIVE) {
                continue;
            }
            let r = positions[j].sub(&positions[i]);
            let v = velocities[j].sub(&velocities[i]);
            let r2 = r.magnitude_squared() + softening;
            let inv_r2 = r2.recip();
            let inv_r3 = inv_r2 * inv_r2.sqrt();
            let rv = 3.0 * r.dot(&v) * inv_r2;

            // jerk of a pair: (v - 3 (r.v) r / r^2) / r^3
            let j_pair = v.add_scaled(&r, -rv).scale(inv_r3);

            acc[i] = acc[i].add_scaled(&r, masses[j] * inv_r3);
            acc[j] = acc[j].add_scaled(&r, -masses[i] * inv_r3);
            jerk[i] = jerk[i].add_scaled(&j_pair, masses[j]);
            jerk[j] = jerk[j].add_scaled(&j_pair, -masses[i]);
        }
    }
}

/// Acceleration felt at `point` by a massless tracer
pub fn field_at(
    point: &Vector3,
    positions: &[Vector3],
    masses: &[f64],
    flags: &[BodyFlags],
    softening: f64,
) -> Vector3 {
    let mut a = Vector3::zero();
    for (i, p) in positions.iter().enumerate() {
        if flags[i].contains(BodyFlags::INACTIVE) {
            continue;
        }
        let r = p.sub(point);
        let d2 = r.magnitude_squared() + softening;
        let inv_r = d2.sqrt().recip();
        a = a.add_scaled(&r, masses[i] * inv_r * inv_r * inv_r);
    }
    a
}

/// Kinetic plus pairwise potential energy of the active bodies
pub fn system_energy(
    positions: &[Vector3],
    velocities: &[Vector3],
    masses: &[f64],
    flags: &[BodyFlags],
    softening: f64,
) -> f64 {
    let n = positions.len().min(velocities.len());
    let mut kinetic = 0.0;
    let mut potential = 0.0;

    for i in 0..n {
        if flags[i].contains(BodyFlags::INACTIVE) {
            continue;
        }
        kinetic += 0.5 * masses[i] * velocities[i].magnitude_squared();
        for j in (i + 1)..n {
            if flags[j].contains(BodyFlags::INACTIVE) {
                continue;
            }
            let d2 = positions[i].sub(&positions[j]).magnitude_squared() + softening;
            if d2 > 0.0 {
                potential -= masses[i] * masses[j] / d2.sqrt();
            }
        }
    }

    kinetic + potential
}

/// True for bodies the integrator is responsible for moving
pub(crate) fn is_integrated(flags: BodyFlags) -> bool {
    !flags.contains(BodyFlags::INACTIVE) && !flags.contains(BodyFlags::FIXED_MOTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(dist: f64, m1: f64, m2: f64) -> (Vec<Vector3>, Vec<f64>, Vec<BodyFlags>) {
        (
            vec![
                Vector3::new(-dist / 2.0, 0.0, 0.0),
                Vector3::new(dist / 2.0, 0.0, 0.0),
            ],
            vec![m1, m2],
            vec![BodyFlags::NONE; 2],
        )
    }

    #[test]
    fn test_gravity_newton_third_law() {
        let (pos, mass, flags) = pair(1.0, 2.0, 3.0);
        let mut acc = vec![Vector3::zero(); 2];
        accumulate_accelerations(&pos, &mass, &flags, 0.0, &mut acc);

        let net = acc[0].scale(mass[0]).add(&acc[1].scale(mass[1]));
        assert!(net.magnitude() < 1e-12, "Net momentum not zero: {:?}", net);
    }

    #[test]
    fn test_gravity_inverse_square_law() {
        let (p1, m, f) = pair(1.0, 1.0, 1.0);
        let (p2, _, _) = pair(2.0, 1.0, 1.0);
        let mut a1 = vec![Vector3::zero(); 2];
        let mut a2 = vec![Vector3::zero(); 2];
        accumulate_accelerations(&p1, &m, &f, 0.0, &mut a1);
        accumulate_accelerations(&p2, &m, &f, 0.0, &mut a2);

        let ratio = a1[0].magnitude() / a2[0].magnitude();
        assert!((ratio - 4.0).abs() < 1e-9, "Expected 4x, got {}", ratio);
    }

    #[test]
    fn test_inactive_body_exerts_no_force() {
        let (pos, mass, mut flags) = pair(1.0, 1.0, 1.0);
        flags[1].insert(BodyFlags::INACTIVE);
        let mut acc = vec![Vector3::new(9.0, 9.0, 9.0); 2];
        accumulate_accelerations(&pos, &mass, &flags, 0.0, &mut acc);
        assert_eq!(acc[0], Vector3::zero());
        assert_eq!(acc[1], Vector3::zero());
    }

    #[test]
    fn test_jerk_matches_finite_difference() {
        let pos = vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.2, 0.0)];
        let vel = vec![Vector3::new(0.0, 0.1, 0.0), Vector3::new(-0.3, 0.9, 0.1)];
        let mass = vec![1.0, 0.5];
        let flags = vec![BodyFlags::NONE; 2];
        let mut acc = vec![Vector3::zero(); 2];
        let mut jerk = vec![Vector3::zero(); 2];
        accumulate_accelerations_and_jerks(&pos, &vel, &mass, &flags, 0.0, &mut acc, &mut jerk);

        let h = 1e-6;
        let moved: Vec<Vector3> = pos.iter().zip(&vel).map(|(p, v)| p.add_scaled(v, h)).collect();
        let mut acc_h = vec![Vector3::zero(); 2];
        accumulate_accelerations(&moved, &mass, &flags, 0.0, &mut acc_h);
        let fd = acc_h[0].sub(&acc[0]).scale(1.0 / h);
        assert!(fd.sub(&jerk[0]).magnitude() < 1e-4);
    }

    #[test]
    fn test_field_matches_pairwise_acceleration() {
        let (pos, mass, flags) = pair(2.0, 1.0, 1.0);
        let a = field_at(&Vector3::zero(), &pos, &mass, &flags, 0.0);
        // symmetric pull cancels at the midpoint
        assert!(a.magnitude() < 1e-12);
    }

    #[test]
    fn test_system_energy_two_body() {
        let (pos, mass, flags) = pair(1.0, 1.0, 1.0);
        let vel = vec![Vector3::new(0.0, 1.0, 0.0), Vector3::zero()];
        let e = system_energy(&pos, &vel, &mass, &flags, 0.0);
        assert!((e - (0.5 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_acceleration_reported_by_every_variant() {
        let bodies = [
            (1.0, Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, -0.05, 0.0)),
            (0.1, Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)),
            (0.01, Vector3::new(-2.0, 0.5, 0.1), Vector3::new(0.1, -0.7, 0.0)),
        ];
        for kind in [IntegratorKind::Leapfrog, IntegratorKind::Hermite, IntegratorKind::Triple] {
            let config = EngineConfig::default().with_integrator(kind);
            let mut registry = BodyRegistry::new(3, 1);
            let mut integrator = Integrator::new(&config, registry.capacity()).unwrap();
            for (k, (m, p, v)) in bodies.iter().enumerate() {
                registry
                    .add(BodyHandle(k as u64), *m, *p, *v, BodyFlags::NONE, &mut integrator)
                    .unwrap();
            }
            for _ in 0..3 {
                integrator.step(0.01, &mut registry).unwrap();
            }

            let mut expected = vec![Vector3::zero(); 3];
            accumulate_accelerations(
                registry.positions(),
                registry.masses(),
                registry.flags(),
                0.0,
                &mut expected,
            );
            for (i, a) in expected.iter().enumerate() {
                let got = integrator.acceleration(i);
                assert!(a.magnitude() > 0.0);
                assert!(
                    got.distance(a) < 1e-12 * a.magnitude(),
                    "{:?} body {}: {:?} vs {:?}",
                    kind,
                    i,
                    got,
                    a
                );
            }
        }
    }
}
