// Tracers - massless bodies and particle clouds
// Stepped by leapfrog through the massive field; they never pull on anything

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::integrator::field_at;
use crate::registry::{BodyFlags, BodyHandle, BodyRegistry};
use crate::vector::Vector3;

/// Gravity of the massive population over one massive sub-step.
///
/// Massive bodies are taken to move in a straight line from the snapshot at
/// `t_start` to the registry's positions at `t_end`, so a tracer kick is
/// evaluated where the bodies were at that moment.
pub struct Field<'a> {
    start: &'a [Vector3],
    end: &'a [Vector3],
    masses: &'a [f64],
    flags: &'a [BodyFlags],
    softening: f64,
    t_start: f64,
    t_end: f64,
}

impl<'a> Field<'a> {
    /// Field of the registry as it stands, constant in time
    pub fn new(registry: &'a BodyRegistry, softening: f64) -> Self {
        Self {
            start: registry.positions(),
            end: registry.positions(),
            masses: registry.masses(),
            flags: registry.flags(),
            softening,
            t_start: 0.0,
            t_end: 0.0,
        }
    }

    /// Field sweeping from `start` (positions at `t_start`) to the registry at `t_end`
    pub fn spanning(
        start: &'a [Vector3],
        t_start: f64,
        registry: &'a BodyRegistry,
        t_end: f64,
        softening: f64,
    ) -> Self {
        let end = registry.positions();
        // A snapshot from another layout has nothing to pair with
        let start = if start.len() == end.len() { start } else { end };
        Self {
            start,
            end,
            masses: registry.masses(),
            flags: registry.flags(),
            softening,
            t_start,
            t_end,
        }
    }

    /// Massive positions at `t`. Tracers lagging the sub-step by up to its own
    /// length are extrapolated along the same line.
    pub fn positions_at(&self, t: f64) -> Vec<Vector3> {
        let span = self.t_end - self.t_start;
        if !(span > 0.0) {
            return self.end.to_vec();
        }
        let w = ((t - self.t_start) / span).clamp(-1.0, 2.0);
        self.start
            .iter()
            .zip(self.end)
            .map(|(a, b)| a.add_scaled(&b.sub(a), w))
            .collect()
    }

    pub fn at(&self, t: f64) -> Frame<'_> {
        Frame {
            positions: self.positions_at(t),
            masses: self.masses,
            flags: self.flags,
            softening: self.softening,
        }
    }
}

/// The massive field at a single instant
pub struct Frame<'f> {
    positions: Vec<Vector3>,
    masses: &'f [f64],
    flags: &'f [BodyFlags],
    softening: f64,
}

impl Frame<'_> {
    pub fn acceleration(&self, point: &Vector3) -> Vector3 {
        field_at(point, &self.positions, self.masses, self.flags, self.softening)
    }
}

/// One kick-drift-kick step for a single tracer, kicked by the field at each end
fn leapfrog(position: &mut Vector3, velocity: &mut Vector3, h: f64, from: &Frame, to: &Frame) {
    let a0 = from.acceleration(position);
    let half = velocity.add_scaled(&a0, 0.5 * h);
    *position = position.add_scaled(&half, h);
    let a1 = to.acceleration(position);
    *velocity = half.add_scaled(&a1, 0.5 * h);
}

/// Something advanced in lockstep sub-steps against the massive field
pub trait Population {
    /// Step every active member from `t` to `t + h`; returns how many went non-finite
    fn step(&mut self, t: f64, h: f64, field: &Field) -> usize;
    fn is_empty(&self) -> bool;
}

/// Advance `population` from `clock` toward `target` in sub-steps of `dt`.
///
/// Stops at the last whole sub-step that does not pass `target`, unless
/// `exact` is set, in which case a final partial step lands on it.
pub fn advance<P: Population>(
    population: &mut P,
    clock: &mut f64,
    target: f64,
    dt: f64,
    exact: bool,
    field: &Field,
) -> usize {
    if population.is_empty() {
        *clock = clock.max(target);
        return 0;
    }
    let mut lost = 0;
    while *clock + dt <= target {
        lost += population.step(*clock, dt, field);
        *clock += dt;
    }
    if exact && *clock < target {
        lost += population.step(*clock, target - *clock, field);
        *clock = target;
    }
    lost
}

// =============================================================================
// MASSLESS BODIES
// =============================================================================

/// Numerically integrated massless bodies, addressed by handle
#[derive(Debug, Clone, Default)]
pub struct TracerSet {
    handles: Vec<BodyHandle>,
    position: Vec<Vector3>,
    velocity: Vec<Vector3>,
    active: Vec<bool>,
    index: HashMap<BodyHandle, usize>,
    /// Handles deactivated since the last `take_lost`
    lost: Vec<BodyHandle>,
}

impl TracerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn handles(&self) -> &[BodyHandle] {
        &self.handles
    }

    pub fn add(&mut self, handle: BodyHandle, position: Vector3, velocity: Vector3) {
        self.index.insert(handle, self.handles.len());
        self.handles.push(handle);
        self.position.push(position);
        self.velocity.push(velocity);
        self.active.push(true);
        debug!("Massless body {} added ({} tracers)", handle, self.handles.len());
    }

    pub fn remove(&mut self, handle: BodyHandle) -> Option<(Vector3, Vector3)> {
        let i = self.index.remove(&handle)?;
        self.handles.remove(i);
        let p = self.position.remove(i);
        let v = self.velocity.remove(i);
        self.active.remove(i);
        for (k, h) in self.handles.iter().enumerate().skip(i) {
            self.index.insert(*h, k);
        }
        Some((p, v))
    }

    pub fn state(&self, handle: BodyHandle) -> Option<(Vector3, Vector3)> {
        self.index
            .get(&handle)
            .map(|&i| (self.position[i], self.velocity[i]))
    }

    pub fn is_active(&self, handle: BodyHandle) -> bool {
        self.index.get(&handle).map_or(false, |&i| self.active[i])
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    pub fn apply_impulse(&mut self, handle: BodyHandle, delta_v: &Vector3) -> bool {
        match self.index.get(&handle) {
            Some(&i) => {
                self.velocity[i] = self.velocity[i].add(delta_v);
                true
            }
            None => false,
        }
    }

    pub fn take_lost(&mut self) -> Vec<BodyHandle> {
        std::mem::take(&mut self.lost)
    }
}

impl Population for TracerSet {
    fn step(&mut self, t: f64, h: f64, field: &Field) -> usize {
        let from = field.at(t);
        let to = field.at(t + h);
        let mut lost = 0;
        for i in 0..self.handles.len() {
            if !self.active[i] {
                continue;
            }
            leapfrog(&mut self.position[i], &mut self.velocity[i], h, &from, &to);
            if !self.position[i].is_finite() || !self.velocity[i].is_finite() {
                warn!("Massless body {} went non-finite; deactivated", self.handles[i]);
                self.active[i] = false;
                self.lost.push(self.handles[i]);
                lost += 1;
            }
        }
        lost
    }

    fn is_empty(&self) -> bool {
        self.active.iter().all(|a| !a)
    }
}

// =============================================================================
// PARTICLE CLOUDS
// =============================================================================

#[derive(Debug, Clone)]
pub struct ParticleGroup {
    pub id: u64,
    pub positions: Vec<Vector3>,
    pub velocities: Vec<Vector3>,
    active: Vec<bool>,
}

impl ParticleGroup {
    pub fn new(id: u64, positions: Vec<Vector3>, velocities: Vec<Vector3>) -> Self {
        let n = positions.len().min(velocities.len());
        let mut positions = positions;
        let mut velocities = velocities;
        positions.truncate(n);
        velocities.truncate(n);
        Self {
            id,
            positions,
            velocities,
            active: vec![true; n],
        }
    }

    /// Flat ring of circular orbits about `center` in the xy plane,
    /// radii uniform in `[inner, outer)`
    pub fn ring(
        id: u64,
        center: (Vector3, Vector3),
        mu: f64,
        inner: f64,
        outer: f64,
        count: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut positions = Vec::with_capacity(count);
        let mut velocities = Vec::with_capacity(count);
        for _ in 0..count {
            let r = if outer > inner { rng.gen_range(inner..outer) } else { inner };
            let phase = rng.gen_range(0.0..std::f64::consts::TAU);
            let speed = (mu / r).sqrt();
            let (s, c) = phase.sin_cos();
            positions.push(center.0.add(&Vector3::new(r * c, r * s, 0.0)));
            velocities.push(center.1.add(&Vector3::new(-speed * s, speed * c, 0.0)));
        }
        Self::new(id, positions, velocities)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    pub fn is_active(&self, i: usize) -> bool {
        self.active.get(i).copied().unwrap_or(false)
    }
}

impl ParticleGroup {
    fn kick_drift_kick(&mut self, h: f64, from: &Frame, to: &Frame) -> usize {
        let mut lost = 0;
        for i in 0..self.positions.len() {
            if !self.active[i] {
                continue;
            }
            leapfrog(&mut self.positions[i], &mut self.velocities[i], h, from, to);
            if !self.positions[i].is_finite() || !self.velocities[i].is_finite() {
                self.active[i] = false;
                lost += 1;
            }
        }
        if lost > 0 {
            warn!("Particle group {}: {} particles deactivated", self.id, lost);
        }
        lost
    }
}

impl Population for ParticleGroup {
    fn step(&mut self, t: f64, h: f64, field: &Field) -> usize {
        self.kick_drift_kick(h, &field.at(t), &field.at(t + h))
    }

    fn is_empty(&self) -> bool {
        self.active.iter().all(|a| !a)
    }
}

/// All particle groups share one clock
#[derive(Debug, Clone, Default)]
pub struct ParticleClouds {
    pub groups: Vec<ParticleGroup>,
}

impl Population for ParticleClouds {
    fn step(&mut self, t: f64, h: f64, field: &Field) -> usize {
        let from = field.at(t);
        let to = field.at(t + h);
        self.groups
            .iter_mut()
            .map(|g| g.kick_drift_kick(h, &from, &to))
            .sum()
    }

    fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::integrator::Integrator;

    fn sun_at(position: Vector3) -> BodyRegistry {
        let mut registry = BodyRegistry::new(1, 1);
        let mut integrator = Integrator::new(&EngineConfig::default(), 1).unwrap();
        registry
            .add(BodyHandle(0), 1.0, position, Vector3::zero(), BodyFlags::NONE, &mut integrator)
            .unwrap();
        registry
    }

    fn sun() -> BodyRegistry {
        sun_at(Vector3::zero())
    }

    #[test]
    fn test_tracer_circular_orbit() {
        let registry = sun();
        let field = Field::new(&registry, 0.0);
        let mut tracers = TracerSet::new();
        tracers.add(BodyHandle(5), Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0));

        let mut clock = 0.0;
        let target = 2.0 * std::f64::consts::PI;
        advance(&mut tracers, &mut clock, target, 0.001, true, &field);
        assert_eq!(clock, target);
        let (p, _) = tracers.state(BodyHandle(5)).unwrap();
        assert!((p.magnitude() - 1.0).abs() < 1e-5);
        assert!(p.distance(&Vector3::new(1.0, 0.0, 0.0)) < 1e-3);
    }

    #[test]
    fn test_advance_never_passes_target() {
        let registry = sun();
        let field = Field::new(&registry, 0.0);
        let mut tracers = TracerSet::new();
        tracers.add(BodyHandle(5), Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0));

        let mut clock = 0.0;
        advance(&mut tracers, &mut clock, 0.025, 0.01, false, &field);
        assert_eq!(clock, 0.02);
        advance(&mut tracers, &mut clock, 0.025, 0.01, true, &field);
        assert_eq!(clock, 0.025);
    }

    #[test]
    fn test_tracer_at_mass_is_deactivated() {
        let registry = sun();
        let field = Field::new(&registry, 0.0);
        let mut tracers = TracerSet::new();
        tracers.add(BodyHandle(5), Vector3::zero(), Vector3::zero());
        tracers.add(BodyHandle(6), Vector3::new(2.0, 0.0, 0.0), Vector3::zero());
        let lost = tracers.step(0.0, 0.01, &field);
        assert_eq!(lost, 1);
        assert!(!tracers.is_active(BodyHandle(5)));
        assert!(tracers.is_active(BodyHandle(6)));
        assert_eq!(tracers.take_lost(), vec![BodyHandle(5)]);
    }

    #[test]
    fn test_field_moves_between_snapshots() {
        let registry = sun_at(Vector3::new(1.0, 0.0, 0.0));
        let start = [Vector3::zero()];
        let field = Field::spanning(&start, 2.0, &registry, 3.0, 0.0);
        assert_eq!(field.positions_at(2.0), vec![Vector3::zero()]);
        assert_eq!(field.positions_at(2.25), vec![Vector3::new(0.25, 0.0, 0.0)]);
        assert_eq!(field.positions_at(3.0), vec![Vector3::new(1.0, 0.0, 0.0)]);

        // Pull at mid-step points at the midway position
        let a = field.at(2.5).acceleration(&Vector3::new(0.5, 2.0, 0.0));
        assert_eq!(a, Vector3::new(0.0, -0.25, 0.0));

        // Mismatched snapshot and a constant field both use the registry
        let field = Field::spanning(&[], 2.0, &registry, 3.0, 0.0);
        assert_eq!(field.positions_at(2.0), vec![Vector3::new(1.0, 0.0, 0.0)]);
        let field = Field::new(&registry, 0.0);
        assert_eq!(field.positions_at(-7.0), vec![Vector3::new(1.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_tracer_follows_translating_sun() {
        // Sun drifts at unit speed along x; the tracer shares that drift on top of a circular orbit
        let drift = Vector3::new(1.0, 0.0, 0.0);
        let mut tracers = TracerSet::new();
        tracers.add(BodyHandle(5), Vector3::new(1.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 0.0));

        let dt = 0.01;
        let mut clock = 0.0;
        let mut sun_position = Vector3::zero();
        let mut worst: f64 = 0.0;
        for _ in 0..628 {
            let start = [sun_position];
            let next = sun_position.add_scaled(&drift, dt);
            let registry = sun_at(next);
            let field = Field::spanning(&start, clock, &registry, clock + dt, 0.0);
            let target = clock + dt;
            advance(&mut tracers, &mut clock, target, dt, true, &field);
            sun_position = next;
            let (p, _) = tracers.state(BodyHandle(5)).unwrap();
            worst = worst.max((p.distance(&sun_position) - 1.0).abs());
        }
        assert!(worst < 1e-3, "radius wandered by {}", worst);
    }

    #[test]
    fn test_remove_reindexes() {
        let mut tracers = TracerSet::new();
        for k in 0..4 {
            tracers.add(BodyHandle(k), Vector3::new(k as f64, 0.0, 0.0), Vector3::zero());
        }
        assert!(tracers.remove(BodyHandle(1)).is_some());
        assert_eq!(tracers.state(BodyHandle(3)).unwrap().0.x, 3.0);
        assert!(tracers.remove(BodyHandle(1)).is_none());
        assert_eq!(tracers.len(), 3);
    }

    #[test]
    fn test_ring_is_reproducible_and_circular() {
        let center = (Vector3::new(1.0, 2.0, 0.0), Vector3::new(0.1, 0.0, 0.0));
        let a = ParticleGroup::ring(1, center, 1.0, 2.0, 3.0, 50, 11);
        let b = ParticleGroup::ring(1, center, 1.0, 2.0, 3.0, 50, 11);
        assert_eq!(a.positions, b.positions);
        for (p, v) in a.positions.iter().zip(&a.velocities) {
            let r = p.sub(&center.0);
            let u = v.sub(&center.1);
            assert!(r.magnitude() >= 2.0 && r.magnitude() < 3.0);
            assert!(r.dot(&u).abs() < 1e-12);
            assert!((u.magnitude_squared() * r.magnitude() - 1.0).abs() < 1e-12);
        }
    }
}
