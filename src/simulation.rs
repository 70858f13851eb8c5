// Simulation State - evolution orchestrator
// Decides between the analytic rails shortcut and the numerical sub-step loop,
// keeps the population clocks in step and applies maneuvers on time

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{EngineConfig, IntegratorKind};
use crate::error::{KernelError, KernelResult};
use crate::integrator::{triple, Integrator};
use crate::kepler::KeplerSolver;
use crate::maneuver::{Maneuver, ManeuverCallback, ManeuverQueue};
use crate::rails::{CenterLookup, FixedBody, RailsSet};
use crate::registry::{BodyFlags, BodyHandle, BodyRegistry};
use crate::tracers::{advance, Field, ParticleClouds, ParticleGroup, Population, TracerSet};
use crate::vector::Vector3;

/// Clock comparisons tolerate this fraction of a sub-step
const CLOCK_SLACK: f64 = 1e-9;

// =============================================================================
// BODY DESCRIPTION
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Massive,
    Massless,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct BodyEntry {
    kind: BodyKind,
    flags: BodyFlags,
}

/// Everything `add_body` needs to place a body
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BodyDesc {
    pub mass: f64,
    pub position: Vector3,
    pub velocity: Vector3,
    pub flags: BodyFlags,
    /// Center of the rails conic; only read with `FIXED_MOTION`
    pub center: Option<BodyHandle>,
}

impl BodyDesc {
    pub fn new(mass: f64, position: Vector3, velocity: Vector3) -> Self {
        Self {
            mass,
            position,
            velocity,
            flags: BodyFlags::NONE,
            center: None,
        }
    }

    /// Kepler conic about `center`, from the given world state
    pub fn on_rails_around(mut self, center: BodyHandle) -> Self {
        self.flags.insert(BodyFlags::FIXED_MOTION);
        self.center = Some(center);
        self
    }

    /// Pinned in place
    pub fn stationary(mut self) -> Self {
        self.flags.insert(BodyFlags::FIXED_MOTION);
        self.center = None;
        self
    }

    pub fn tracked(mut self) -> Self {
        self.flags.insert(BodyFlags::TRACK_TRAJECTORY);
        self
    }
}

/// Read-only view of one body for rendering collaborators
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BodySnapshot {
    pub handle: BodyHandle,
    pub kind: BodyKind,
    pub mass: f64,
    pub position: Vector3,
    pub velocity: Vector3,
    pub on_rails: bool,
    pub active: bool,
}

/// Non-rails bodies as seen by the rails layer
struct WorldView<'a> {
    registry: &'a BodyRegistry,
    integrator: &'a Integrator,
    tracers: &'a TracerSet,
}

impl CenterLookup for WorldView<'_> {
    fn state_of(&self, handle: BodyHandle) -> Option<(Vector3, Vector3)> {
        match self.registry.index_of(handle) {
            Some(i) => Some((self.registry.position(i), self.integrator.velocity(i))),
            None => self.tracers.state(handle),
        }
    }

    fn mass_of(&self, handle: BodyHandle) -> Option<f64> {
        match self.registry.index_of(handle) {
            Some(i) => Some(self.registry.mass(i)),
            None => self.tracers.contains(handle).then_some(0.0),
        }
    }
}

// =============================================================================
// SIMULATION STATE
// =============================================================================

/// The whole world: registry, integrator, rails, tracers and maneuvers.
///
/// Cloning gives a fully independent copy (maneuver callbacks excepted, they
/// never travel with a clone).
#[derive(Debug, Clone)]
pub struct SimulationState {
    config: EngineConfig,
    registry: BodyRegistry,
    integrator: Integrator,
    rails: RailsSet,
    tracers: TracerSet,
    particles: ParticleClouds,
    maneuvers: ManeuverQueue,
    bodies: BTreeMap<BodyHandle, BodyEntry>,
    next_handle: u64,
    next_group: u64,
    pending_release: Vec<BodyHandle>,
    time: f64,
    massive_clock: f64,
    massless_clock: f64,
    particle_clock: f64,
    in_evolve: bool,
    started: bool,
    speculative: bool,
    initial_energy: Option<f64>,
}

impl SimulationState {
    pub fn new(config: EngineConfig) -> KernelResult<Self> {
        config.validate()?;
        let capacity = match config.integrator {
            IntegratorKind::Triple => triple::BODIES,
            _ => config.initial_capacity,
        };
        let integrator = Integrator::new(&config, capacity)?;
        Ok(Self {
            registry: BodyRegistry::new(capacity, config.grow_by),
            integrator,
            rails: RailsSet::new(KeplerSolver::from_config(&config)),
            tracers: TracerSet::new(),
            particles: ParticleClouds::default(),
            maneuvers: ManeuverQueue::new(),
            bodies: BTreeMap::new(),
            next_handle: 1,
            next_group: 1,
            pending_release: Vec::new(),
            time: 0.0,
            massive_clock: 0.0,
            massless_clock: 0.0,
            particle_clock: 0.0,
            in_evolve: false,
            started: false,
            speculative: false,
            initial_energy: None,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &BodyRegistry {
        &self.registry
    }

    pub fn integrator(&self) -> &Integrator {
        &self.integrator
    }

    pub fn rails(&self) -> &RailsSet {
        &self.rails
    }

    /// Time reached by the requests so far
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Time the massive population has actually been advanced to; may lead
    /// `time()` by less than one sub-step
    pub fn massive_time(&self) -> f64 {
        self.massive_clock
    }

    pub fn massless_time(&self) -> f64 {
        self.massless_clock
    }

    pub fn particle_time(&self) -> f64 {
        self.particle_clock
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    pub fn pending_maneuvers(&self) -> usize {
        self.maneuvers.len()
    }

    /// Nothing needs a numerical step: every massive body is on rails or
    /// inactive, and no tracer or particle is being integrated
    pub fn is_on_rails(&self) -> bool {
        self.registry.all_fixed() && self.tracers.active_count() == 0 && self.particles.is_empty()
    }

    fn entry(&self, handle: BodyHandle) -> KernelResult<BodyEntry> {
        match self.bodies.get(&handle) {
            Some(e) if e.kind != BodyKind::Removed => Ok(*e),
            _ => Err(KernelError::UnknownBody(handle)),
        }
    }

    pub fn kind(&self, handle: BodyHandle) -> Option<BodyKind> {
        self.bodies.get(&handle).map(|e| e.kind)
    }

    /// Live handles in creation order
    pub fn handles(&self) -> Vec<BodyHandle> {
        self.bodies
            .iter()
            .filter(|(_, e)| e.kind != BodyKind::Removed)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn body_count(&self) -> usize {
        self.bodies.values().filter(|e| e.kind != BodyKind::Removed).count()
    }

    fn world(&self) -> WorldView<'_> {
        WorldView {
            registry: &self.registry,
            integrator: &self.integrator,
            tracers: &self.tracers,
        }
    }

    // =========================================================================
    // BODIES
    // =========================================================================

    /// Add a body and return its handle.
    ///
    /// Massive bodies go to the registry and integrator, zero-mass bodies to
    /// the tracer set; `FIXED_MOTION` puts either kind on rails.
    pub fn add_body(&mut self, desc: BodyDesc) -> KernelResult<BodyHandle> {
        if !(desc.mass.is_finite() && desc.mass >= 0.0) {
            return Err(KernelError::InvalidConfig(format!(
                "mass must be non-negative and finite (got {})",
                desc.mass
            )));
        }
        if !desc.position.is_finite() || !desc.velocity.is_finite() {
            return Err(KernelError::InvalidState("non-finite initial state".to_string()));
        }

        let handle = BodyHandle(self.next_handle);
        let massive = desc.mass > 0.0;
        let kind = if massive { BodyKind::Massive } else { BodyKind::Massless };

        if desc.flags.contains(BodyFlags::FIXED_MOTION) {
            let fixed = match desc.center {
                Some(center) => {
                    self.entry(center)?;
                    let center_state = self
                        .rails
                        .state(center)
                        .or_else(|| self.world().state_of(center))
                        .ok_or(KernelError::UnknownBody(center))?;
                    let center_mass = self
                        .rails
                        .get(center)
                        .map(|b| b.mass)
                        .or_else(|| self.world().mass_of(center))
                        .ok_or(KernelError::UnknownBody(center))?;
                    FixedBody::kepler(
                        handle,
                        desc.mass,
                        desc.position,
                        desc.velocity,
                        center,
                        center_state,
                        center_mass,
                        self.massive_clock,
                        massive,
                    )?
                }
                None => FixedBody::stationary(handle, desc.mass, desc.position, massive),
            };
            if massive {
                self.registry.add(
                    handle,
                    desc.mass,
                    fixed.position(),
                    fixed.velocity(),
                    desc.flags,
                    &mut self.integrator,
                )?;
            }
            self.rails.add(fixed);
        } else if massive {
            self.registry.add(
                handle,
                desc.mass,
                desc.position,
                desc.velocity,
                desc.flags,
                &mut self.integrator,
            )?;
        } else {
            self.tracers.add(handle, desc.position, desc.velocity);
        }

        self.next_handle += 1;
        self.bodies.insert(handle, BodyEntry { kind, flags: desc.flags });
        debug!(
            "Added {:?} body {} (on rails: {})",
            kind,
            handle,
            desc.flags.contains(BodyFlags::FIXED_MOTION)
        );
        Ok(handle)
    }

    /// Remove a body. Bodies on rails around it are released first.
    pub fn remove_body(&mut self, handle: BodyHandle) -> KernelResult<()> {
        self.entry(handle)?;
        for orbiter in self.rails.orbiting(handle) {
            self.release_now(orbiter)?;
        }
        self.rails.remove(handle);
        if let Some(i) = self.registry.index_of(handle) {
            self.registry.remove(i, &mut self.integrator)?;
        }
        self.tracers.remove(handle);
        let cancelled = self.maneuvers.cancel_for(handle);
        self.pending_release.retain(|h| *h != handle);
        if let Some(e) = self.bodies.get_mut(&handle) {
            e.kind = BodyKind::Removed;
        }
        debug!(
            "Removed body {} ({} maneuvers cancelled, on rails now: {})",
            handle,
            cancelled,
            self.is_on_rails()
        );
        Ok(())
    }

    pub fn position(&self, handle: BodyHandle) -> KernelResult<Vector3> {
        self.state(handle).map(|s| s.0)
    }

    pub fn velocity(&self, handle: BodyHandle) -> KernelResult<Vector3> {
        self.state(handle).map(|s| s.1)
    }

    pub fn state(&self, handle: BodyHandle) -> KernelResult<(Vector3, Vector3)> {
        self.entry(handle)?;
        self.rails
            .state(handle)
            .or_else(|| self.world().state_of(handle))
            .ok_or(KernelError::UnknownBody(handle))
    }

    pub fn mass(&self, handle: BodyHandle) -> KernelResult<f64> {
        self.entry(handle)?;
        Ok(self
            .registry
            .index_of(handle)
            .map(|i| self.registry.mass(i))
            .or_else(|| self.rails.get(handle).map(|b| b.mass))
            .unwrap_or(0.0))
    }

    pub fn is_active(&self, handle: BodyHandle) -> bool {
        if let Some(i) = self.registry.index_of(handle) {
            return !self.registry.flag_bits(i).contains(BodyFlags::INACTIVE);
        }
        if let Some(b) = self.rails.get(handle) {
            return b.active;
        }
        self.tracers.is_active(handle)
    }

    /// Instantaneous velocity change, applied now
    pub fn apply_impulse(&mut self, handle: BodyHandle, delta_v: Vector3) -> KernelResult<()> {
        self.entry(handle)?;
        if !delta_v.is_finite() {
            return Err(KernelError::InvalidState("non-finite impulse".to_string()));
        }
        if self.rails.contains(handle) {
            self.rails.apply_impulse(handle, self.massive_clock, &delta_v)?;
            self.sync_rails();
        } else if let Some(i) = self.registry.index_of(handle) {
            let v = self.integrator.velocity(i).add(&delta_v);
            self.integrator.set_velocity(i, v);
        } else if !self.tracers.apply_impulse(handle, &delta_v) {
            return Err(KernelError::UnknownBody(handle));
        }
        Ok(())
    }

    /// Queue an impulse for `time`. The callback fires once, after the
    /// impulse is applied, and never on a speculative copy.
    pub fn schedule_maneuver(
        &mut self,
        handle: BodyHandle,
        time: f64,
        delta_v: Vector3,
        callback: Option<ManeuverCallback>,
    ) -> KernelResult<()> {
        self.entry(handle)?;
        if !time.is_finite() || !delta_v.is_finite() {
            return Err(KernelError::InvalidState("non-finite maneuver".to_string()));
        }
        let mut maneuver = Maneuver::new(time, handle, delta_v);
        maneuver.callback = callback;
        self.maneuvers.schedule(maneuver);
        Ok(())
    }

    /// Hand a rails body over to numerical integration. Deferred to the end
    /// of the current sub-step while evolving.
    pub fn release_from_rails(&mut self, handle: BodyHandle) -> KernelResult<()> {
        self.entry(handle)?;
        if !self.rails.contains(handle) {
            warn!("Release of body {} ignored: it is not on rails", handle);
            return Err(KernelError::NotOnRails);
        }
        if self.in_evolve {
            if !self.pending_release.contains(&handle) {
                self.pending_release.push(handle);
            }
            Ok(())
        } else {
            self.release_now(handle)
        }
    }

    fn release_now(&mut self, handle: BodyHandle) -> KernelResult<()> {
        let body = self.rails.remove(handle).ok_or(KernelError::NotOnRails)?;
        let (position, velocity) = (body.position(), body.velocity());
        if body.massive {
            let i = self
                .registry
                .index_of(handle)
                .ok_or(KernelError::UnknownBody(handle))?;
            self.registry.clear_flag(i, BodyFlags::FIXED_MOTION);
            self.registry.set_position(i, position);
            self.integrator.set_velocity(i, velocity);
        } else {
            self.tracers.add(handle, position, velocity);
        }
        if let Some(e) = self.bodies.get_mut(&handle) {
            e.flags.remove(BodyFlags::FIXED_MOTION);
        }
        debug!("Body {} released from rails at t = {}", handle, self.massive_clock);
        Ok(())
    }

    fn apply_pending_releases(&mut self) {
        for handle in std::mem::take(&mut self.pending_release) {
            if let Err(e) = self.release_now(handle) {
                warn!("Deferred release of {} failed: {}", handle, e);
            }
        }
    }

    /// Switch a rails body to a new center at `time`
    pub fn schedule_recenter(
        &mut self,
        handle: BodyHandle,
        time: f64,
        new_center: BodyHandle,
    ) -> KernelResult<()> {
        self.entry(handle)?;
        self.entry(new_center)?;
        self.rails.schedule_recenter(handle, time, new_center)
    }

    /// Replace the integrator. Only allowed before the first `evolve`;
    /// velocities carry over index by index.
    pub fn set_integrator(&mut self, kind: IntegratorKind) -> KernelResult<()> {
        if self.started {
            return Err(KernelError::IntegratorLocked);
        }
        let config = self.config.clone().with_integrator(kind);
        let capacity = match kind {
            IntegratorKind::Triple => triple::BODIES,
            _ => self.registry.capacity().max(config.initial_capacity),
        };
        let mut integrator = Integrator::new(&config, capacity)?;
        let mut registry = BodyRegistry::new(capacity, config.grow_by);
        for i in 0..self.registry.len() {
            let handle = self
                .registry
                .id_at(i)
                .ok_or_else(|| KernelError::InvalidState(format!("empty registry slot {i}")))?;
            registry.add(
                handle,
                self.registry.mass(i),
                self.registry.position(i),
                self.integrator.velocity(i),
                self.registry.flag_bits(i),
                &mut integrator,
            )?;
        }
        self.config = config;
        self.registry = registry;
        self.integrator = integrator;
        debug!("Integrator set to {:?}", kind);
        Ok(())
    }

    // =========================================================================
    // PARTICLES
    // =========================================================================

    pub fn add_particle_group(&mut self, positions: Vec<Vector3>, velocities: Vec<Vector3>) -> u64 {
        let id = self.next_group;
        self.next_group += 1;
        self.particles.groups.push(ParticleGroup::new(id, positions, velocities));
        id
    }

    /// Ring of circular orbits about `center` in the xy plane
    pub fn add_particle_ring(
        &mut self,
        center: BodyHandle,
        inner: f64,
        outer: f64,
        count: usize,
        seed: u64,
    ) -> KernelResult<u64> {
        let state = self.state(center)?;
        let mu = self.mass(center)?;
        if !(mu > 0.0) || !(inner > 0.0) || outer < inner {
            return Err(KernelError::InvalidConfig(
                "particle ring needs a massive center and 0 < inner <= outer".to_string(),
            ));
        }
        let id = self.next_group;
        self.next_group += 1;
        self.particles
            .groups
            .push(ParticleGroup::ring(id, state, mu, inner, outer, count, seed));
        Ok(id)
    }

    pub fn remove_particle_group(&mut self, id: u64) -> bool {
        let before = self.particles.groups.len();
        self.particles.groups.retain(|g| g.id != id);
        before != self.particles.groups.len()
    }

    pub fn particle_group(&self, id: u64) -> Option<&ParticleGroup> {
        self.particles.groups.iter().find(|g| g.id == id)
    }

    // =========================================================================
    // EVOLUTION
    // =========================================================================

    /// Jump straight to `t`. Only valid while every body is on rails.
    pub fn set_time(&mut self, t: f64) -> KernelResult<()> {
        if !self.is_on_rails() {
            warn!("set_time({}) rejected: bodies are being integrated", t);
            return Err(KernelError::NotOnRails);
        }
        if !t.is_finite() {
            return Err(KernelError::InvalidState(format!("non-finite time {t}")));
        }
        self.time = t;
        self.set_clocks(t);
        self.update_rails();
        Ok(())
    }

    /// Advance by `dt` and return the time the massive population actually
    /// advanced. Any overshoot of the last sub-step is carried into the next
    /// call rather than undone.
    pub fn evolve(&mut self, dt: f64) -> KernelResult<f64> {
        if !(dt.is_finite() && dt >= 0.0) {
            return Err(KernelError::InvalidState(format!("cannot evolve by {dt}")));
        }
        if !self.started {
            self.started = true;
            self.initial_energy = Some(self.total_energy());
        }
        let target = self.time + dt;
        let start = self.massive_clock;

        if self.is_on_rails() {
            self.evolve_on_rails(target);
        } else {
            self.in_evolve = true;
            let result = self.evolve_off_rails(target);
            self.in_evolve = false;
            self.apply_pending_releases();
            result?;
        }

        self.time = target;
        trace!(
            "evolve({}) -> massive {:.6} massless {:.6} particles {:.6}",
            dt,
            self.massive_clock,
            self.massless_clock,
            self.particle_clock
        );
        Ok(self.massive_clock - start)
    }

    fn set_clocks(&mut self, t: f64) {
        self.massive_clock = t;
        self.massless_clock = t;
        self.particle_clock = t;
    }

    fn evolve_on_rails(&mut self, target: f64) {
        while let Some(t) = self.maneuvers.next_time() {
            if t > target {
                break;
            }
            self.set_clocks(t.max(self.massive_clock));
            self.update_rails();
            self.apply_due_maneuvers();
        }
        self.set_clocks(target.max(self.massive_clock));
        self.update_rails();
    }

    fn evolve_off_rails(&mut self, target: f64) -> KernelResult<()> {
        let engine_dt = self.config.engine_dt;
        let slack = CLOCK_SLACK * engine_dt;

        // Anything scheduled in the past goes first
        self.apply_due_maneuvers();

        while self.massive_clock < target - slack {
            let mut h = engine_dt;
            let mut landing = None;
            if let Some(m) = self.maneuvers.next_time() {
                if m > self.massive_clock && m - self.massive_clock <= h + slack {
                    h = m - self.massive_clock;
                    landing = Some(m);
                }
            }

            let start_positions = self.registry.positions().to_vec();
            let start_time = self.massive_clock;
            let advanced = self.integrator.step(h, &mut self.registry)?;
            if !(advanced > 0.0) {
                return Err(KernelError::InvalidState(
                    "integrator made no progress".to_string(),
                ));
            }
            self.massive_clock = match landing {
                Some(m) if advanced >= h - slack => m,
                _ => self.massive_clock + advanced,
            };

            self.deactivate_non_finite();
            self.update_rails();

            let exact = self
                .maneuvers
                .maneuvers_before(self.massive_clock)
                .iter()
                .any(|m| self.tracers.contains(m.target));
            self.advance_tracers(exact, &start_positions, start_time);

            self.apply_due_maneuvers();
            self.apply_pending_releases();
        }
        Ok(())
    }

    /// Bring tracers and particles up to the massive clock through the field
    /// the massive bodies swept since `start_time`
    fn advance_tracers(&mut self, exact_massless: bool, start_positions: &[Vector3], start_time: f64) {
        let field = Field::spanning(
            start_positions,
            start_time,
            &self.registry,
            self.massive_clock,
            self.config.softening,
        );
        advance(
            &mut self.tracers,
            &mut self.massless_clock,
            self.massive_clock,
            self.config.massless_dt,
            exact_massless,
            &field,
        );
        advance(
            &mut self.particles,
            &mut self.particle_clock,
            self.massive_clock,
            self.config.particle_dt,
            false,
            &field,
        );
        for handle in self.tracers.take_lost() {
            self.queue_orbiters(handle);
        }
    }

    fn apply_due_maneuvers(&mut self) {
        for mut m in self.maneuvers.pop_due(self.massive_clock) {
            match self.apply_impulse(m.target, m.delta_v) {
                Ok(()) => {
                    debug!("Maneuver on {} applied at t = {}", m.target, self.massive_clock);
                    if !self.speculative {
                        m.notify();
                    }
                }
                Err(e) => warn!("Maneuver on {} at t = {} dropped: {}", m.target, m.time, e),
            }
        }
    }

    /// Rails bodies orbiting a lost center leave the rails at the end of the sub-step
    fn queue_orbiters(&mut self, center: BodyHandle) {
        for orbiter in self.rails.orbiting(center) {
            if !self.pending_release.contains(&orbiter) {
                self.pending_release.push(orbiter);
            }
        }
    }

    fn deactivate(&mut self, handle: BodyHandle) {
        warn!("Body {} has a non-finite state; deactivated", handle);
        self.rails.set_active(handle, false);
        if let Some(i) = self.registry.index_of(handle) {
            self.registry.set_flag(i, BodyFlags::INACTIVE);
        }
        self.queue_orbiters(handle);
    }

    fn deactivate_non_finite(&mut self) {
        let lost: Vec<BodyHandle> = (0..self.registry.len())
            .filter(|&i| !self.registry.flag_bits(i).contains(BodyFlags::INACTIVE))
            .filter(|&i| {
                !self.registry.position(i).is_finite() || !self.integrator.velocity(i).is_finite()
            })
            .filter_map(|i| self.registry.id_at(i))
            .collect();
        for handle in lost {
            self.deactivate(handle);
        }
    }

    fn update_rails(&mut self) {
        if self.rails.is_empty() {
            return;
        }
        let world = WorldView {
            registry: &self.registry,
            integrator: &self.integrator,
            tracers: &self.tracers,
        };
        let lost = self.rails.update(self.massive_clock, &world);
        for handle in lost {
            self.deactivate(handle);
        }
        self.sync_rails();
    }

    /// Copy rails states of massive bodies into the registry and integrator
    fn sync_rails(&mut self) {
        for body in self.rails.iter().filter(|b| b.massive && b.active) {
            if let Some(i) = self.registry.index_of(body.handle) {
                self.registry.set_position(i, body.position());
                self.integrator.sync_velocity(i, body.velocity());
            }
        }
    }

    // =========================================================================
    // DIAGNOSTICS & VIEWS
    // =========================================================================

    /// Mechanical energy of the active massive bodies
    pub fn total_energy(&self) -> f64 {
        self.integrator.total_energy(&self.registry)
    }

    /// Relative energy change since the first `evolve`
    pub fn energy_drift(&self) -> f64 {
        match self.initial_energy {
            Some(e0) if e0 != 0.0 => (self.total_energy() - e0) / e0.abs(),
            _ => 0.0,
        }
    }

    pub fn angular_momentum(&self) -> Vector3 {
        let mut l = Vector3::zero();
        for i in 0..self.registry.len() {
            if self.registry.flag_bits(i).contains(BodyFlags::INACTIVE) {
                continue;
            }
            let p = self.integrator.velocity(i).scale(self.registry.mass(i));
            l = l.add(&self.registry.position(i).cross(&p));
        }
        l
    }

    pub fn snapshot(&self) -> Vec<BodySnapshot> {
        self.bodies
            .iter()
            .filter(|(_, e)| e.kind != BodyKind::Removed)
            .filter_map(|(&handle, e)| {
                let (position, velocity) = self.state(handle).ok()?;
                Some(BodySnapshot {
                    handle,
                    kind: e.kind,
                    mass: self.mass(handle).unwrap_or(0.0),
                    position,
                    velocity,
                    on_rails: self.rails.contains(handle),
                    active: self.is_active(handle),
                })
            })
            .collect()
    }

    /// Handles flagged for trajectory tracking
    pub fn tracked(&self) -> Vec<BodyHandle> {
        self.bodies
            .iter()
            .filter(|(_, e)| e.kind != BodyKind::Removed && e.flags.contains(BodyFlags::TRACK_TRAJECTORY))
            .map(|(h, _)| *h)
            .collect()
    }

    /// Independent copy for look-ahead: callbacks are dropped and never fire
    pub fn speculative_clone(&self) -> Self {
        let mut copy = self.clone();
        copy.speculative = true;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sim() -> SimulationState {
        SimulationState::new(EngineConfig::default()).unwrap()
    }

    fn sun_and_planet(sim: &mut SimulationState) -> (BodyHandle, BodyHandle) {
        let sun = sim
            .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero()))
            .unwrap();
        let planet = sim
            .add_body(BodyDesc::new(1e-6, Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)))
            .unwrap();
        (sun, planet)
    }

    #[test]
    fn test_massless_body_goes_to_tracers() {
        let mut s = sim();
        sun_and_planet(&mut s);
        let tracer = s
            .add_body(BodyDesc::new(0.0, Vector3::new(2.0, 0.0, 0.0), Vector3::new(0.0, 0.7, 0.0)))
            .unwrap();
        assert_eq!(s.kind(tracer), Some(BodyKind::Massless));
        assert_eq!(s.registry().len(), 2);
        s.evolve(0.5).unwrap();
        assert!(s.massless_time() <= s.massive_time());
        assert!(s.position(tracer).unwrap().y > 0.0);
    }

    #[test]
    fn test_negative_mass_rejected() {
        let mut s = sim();
        let err = s
            .add_body(BodyDesc::new(-1.0, Vector3::zero(), Vector3::zero()))
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
        assert_eq!(s.body_count(), 0);
    }

    #[test]
    fn test_set_time_only_on_rails() {
        let mut s = sim();
        let sun = s
            .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero()).stationary())
            .unwrap();
        let planet = s
            .add_body(
                BodyDesc::new(1e-6, Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0))
                    .on_rails_around(sun),
            )
            .unwrap();
        assert!(s.is_on_rails());
        s.set_time(std::f64::consts::PI).unwrap();
        assert!(s.position(planet).unwrap().x < -0.99);

        s.release_from_rails(planet).unwrap();
        assert!(!s.is_on_rails());
        let before = s.position(planet).unwrap();
        assert!(matches!(s.set_time(0.0), Err(KernelError::NotOnRails)));
        assert_eq!(s.position(planet).unwrap(), before);
    }

    #[test]
    fn test_release_of_free_body_rejected() {
        let mut s = sim();
        let (_, planet) = sun_and_planet(&mut s);
        assert!(matches!(s.release_from_rails(planet), Err(KernelError::NotOnRails)));
    }

    #[test]
    fn test_integrator_locked_after_evolve() {
        let mut s = sim();
        let (_, planet) = sun_and_planet(&mut s);
        s.set_integrator(IntegratorKind::Hermite).unwrap();
        assert_eq!(s.integrator().kind(), IntegratorKind::Hermite);
        assert_eq!(s.velocity(planet).unwrap(), Vector3::new(0.0, 1.0, 0.0));

        s.evolve(0.1).unwrap();
        assert!(matches!(
            s.set_integrator(IntegratorKind::Leapfrog),
            Err(KernelError::IntegratorLocked)
        ));
    }

    #[test]
    fn test_triple_rejects_fourth_body() {
        let mut s = sim();
        for k in 0..4 {
            s.add_body(BodyDesc::new(1.0, Vector3::new(k as f64, 0.0, 0.0), Vector3::zero()))
                .unwrap();
        }
        let err = s.set_integrator(IntegratorKind::Triple).unwrap_err();
        assert!(matches!(err, KernelError::TripleBodyCount(_)));
        // untouched on failure
        assert_eq!(s.integrator().kind(), IntegratorKind::Leapfrog);
        assert_eq!(s.registry().len(), 4);

        let mut t = SimulationState::new(EngineConfig::default().with_integrator(IntegratorKind::Triple)).unwrap();
        for k in 0..3 {
            t.add_body(BodyDesc::new(1.0, Vector3::new(k as f64, 0.0, 0.0), Vector3::zero()))
                .unwrap();
        }
        assert!(t
            .add_body(BodyDesc::new(1.0, Vector3::new(9.0, 0.0, 0.0), Vector3::zero()))
            .is_err());
        assert_eq!(t.registry().len(), 3);
        assert_eq!(t.registry().capacity(), t.integrator().capacity());
    }

    #[test]
    fn test_removing_center_releases_orbiters() {
        let mut s = sim();
        let sun = s
            .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero()).stationary())
            .unwrap();
        let planet = s
            .add_body(
                BodyDesc::new(1e-3, Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0))
                    .on_rails_around(sun),
            )
            .unwrap();
        let moon = s
            .add_body(
                BodyDesc::new(0.0, Vector3::new(1.01, 0.0, 0.0), Vector3::new(0.0, 1.3, 0.0))
                    .on_rails_around(planet),
            )
            .unwrap();
        s.evolve(0.3).unwrap();
        let planet_state = s.state(planet).unwrap();

        s.remove_body(sun).unwrap();
        assert_eq!(s.kind(sun), Some(BodyKind::Removed));
        assert!(s.position(sun).is_err());
        // planet is now integrated, moon still follows it on rails
        assert!(!s.rails().contains(planet));
        assert!(s.rails().contains(moon));
        assert_eq!(s.state(planet).unwrap(), planet_state);
        assert!(!s.is_on_rails());
        assert_eq!(s.rails().get(moon).unwrap().depth, 0);
    }

    #[test]
    fn test_non_finite_body_deactivated() {
        let mut s = sim();
        let a = s.add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero())).unwrap();
        let b = s.add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero())).unwrap();
        let tracer = s
            .add_body(BodyDesc::new(0.0, Vector3::new(50.0, 0.0, 0.0), Vector3::zero()))
            .unwrap();
        s.evolve(0.05).unwrap();
        assert!(!s.is_active(a));
        assert!(!s.is_active(b));
        assert!(s.position(tracer).unwrap().is_finite());
        // keeps running
        s.evolve(0.05).unwrap();
    }

    #[test]
    fn test_overshoot_is_carried() {
        let mut s = SimulationState::new(EngineConfig::default().with_engine_dt(0.25)).unwrap();
        let body = s
            .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::new(1.0, 0.0, 0.0)))
            .unwrap();
        let advanced = s.evolve(0.6).unwrap();
        assert_eq!(advanced, 0.75);
        assert_eq!(s.time(), 0.6);
        // already ahead of the next target: nothing to do
        assert_eq!(s.evolve(0.1).unwrap(), 0.0);
        assert_eq!(s.position(body).unwrap().x, 0.75);
        assert_eq!(s.evolve(0.1).unwrap(), 0.25);
    }

    #[test]
    fn test_maneuver_on_massless_body_lands_exactly() {
        let mut s = SimulationState::new(EngineConfig::default().with_engine_dt(0.25)).unwrap();
        s.add_body(BodyDesc::new(1.0, Vector3::new(1e6, 0.0, 0.0), Vector3::zero()))
            .unwrap();
        let tracer = s
            .add_body(BodyDesc::new(0.0, Vector3::zero(), Vector3::new(1.0, 0.0, 0.0)))
            .unwrap();
        s.schedule_maneuver(tracer, 0.3, Vector3::new(0.0, 1.0, 0.0), None)
            .unwrap();
        s.evolve(0.3).unwrap();
        assert_eq!(s.massless_time(), 0.3);
        let v = s.velocity(tracer).unwrap();
        assert!((v.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_speculative_clone_is_independent() {
        let mut s = sim();
        let (_, planet) = sun_and_planet(&mut s);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        s.schedule_maneuver(
            planet,
            0.05,
            Vector3::new(0.0, 0.1, 0.0),
            Some(Box::new(move |_: &Maneuver| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let mut copy = s.speculative_clone();
        assert!(copy.is_speculative());
        copy.evolve(1.0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(s.time(), 0.0);
        assert_eq!(s.position(planet).unwrap(), Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(s.pending_maneuvers(), 1);

        s.evolve(0.1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(s.pending_maneuvers(), 0);
    }

    #[test]
    fn test_impulse_on_stationary_rails_body_rejected() {
        let mut s = sim();
        let sun = s
            .add_body(BodyDesc::new(1.0, Vector3::zero(), Vector3::zero()).stationary())
            .unwrap();
        assert!(matches!(
            s.apply_impulse(sun, Vector3::new(1.0, 0.0, 0.0)),
            Err(KernelError::InvalidState(_))
        ));
        assert_eq!(s.velocity(sun).unwrap(), Vector3::zero());
    }

    #[test]
    fn test_particle_ring_advances() {
        let mut s = sim();
        let (sun, _) = sun_and_planet(&mut s);
        let id = s.add_particle_ring(sun, 2.0, 3.0, 20, 3).unwrap();
        let start = s.particle_group(id).unwrap().positions.clone();
        s.evolve(0.5).unwrap();
        let group = s.particle_group(id).unwrap();
        assert_eq!(group.active_count(), 20);
        assert!(group.positions.iter().zip(&start).all(|(a, b)| a != b));
        assert!(s.particle_time() <= s.massive_time());
        assert!(s.remove_particle_group(id));
    }

    #[test]
    fn test_snapshot_lists_live_bodies() {
        let mut s = sim();
        let (sun, planet) = sun_and_planet(&mut s);
        s.remove_body(sun).unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].handle, planet);
        assert_eq!(snap[0].kind, BodyKind::Massive);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("Massive"));
    }
}
