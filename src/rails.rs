// Rails - analytically driven bodies
// Kepler conics about a center (or a fixed point), evaluated in depth order

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};
use crate::kepler::{KeplerSolver, OrbitEpoch};
use crate::registry::BodyHandle;
use crate::vector::Vector3;

/// World-space state of bodies that are not on rails
pub trait CenterLookup {
    fn state_of(&self, handle: BodyHandle) -> Option<(Vector3, Vector3)>;
    fn mass_of(&self, handle: BodyHandle) -> Option<f64>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum RailsMotion {
    /// Pinned at a world position
    Stationary { position: Vector3 },
    /// Conic relative to `center`, propagated from `epoch`
    Kepler { center: BodyHandle, epoch: OrbitEpoch },
}

impl RailsMotion {
    pub fn center(&self) -> Option<BodyHandle> {
        match self {
            RailsMotion::Stationary { .. } => None,
            RailsMotion::Kepler { center, .. } => Some(*center),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Recenter {
    pub time: f64,
    pub new_center: BodyHandle,
}

// =============================================================================
// FIXED BODY
// =============================================================================

#[derive(Debug, Clone)]
pub struct FixedBody {
    pub handle: BodyHandle,
    pub mass: f64,
    pub motion: RailsMotion,
    /// Number of on-rails ancestors
    pub depth: usize,
    /// Also occupies a slot in the massive registry
    pub massive: bool,
    pub active: bool,
    position: Vector3,
    velocity: Vector3,
    /// Last relative state the propagator produced, reused on failure
    last_relative: (Vector3, Vector3),
    recenters: Vec<Recenter>,
}

impl FixedBody {
    pub fn stationary(handle: BodyHandle, mass: f64, position: Vector3, massive: bool) -> Self {
        Self {
            handle,
            mass,
            motion: RailsMotion::Stationary { position },
            depth: 0,
            massive,
            active: true,
            position,
            velocity: Vector3::zero(),
            last_relative: (Vector3::zero(), Vector3::zero()),
            recenters: Vec::new(),
        }
    }

    /// Conic around `center`, from world-space states of both at time `t`
    #[allow(clippy::too_many_arguments)]
    pub fn kepler(
        handle: BodyHandle,
        mass: f64,
        position: Vector3,
        velocity: Vector3,
        center: BodyHandle,
        center_state: (Vector3, Vector3),
        center_mass: f64,
        t: f64,
        massive: bool,
    ) -> KernelResult<Self> {
        let r0 = position.sub(&center_state.0);
        let v0 = velocity.sub(&center_state.1);
        let epoch = OrbitEpoch::new(r0, v0, t, mass + center_mass)?;
        Ok(Self {
            handle,
            mass,
            motion: RailsMotion::Kepler { center, epoch },
            depth: 0,
            massive,
            active: true,
            position,
            velocity,
            last_relative: (r0, v0),
            recenters: Vec::new(),
        })
    }

    pub fn position(&self) -> Vector3 {
        self.position
    }

    pub fn velocity(&self) -> Vector3 {
        self.velocity
    }

    pub fn center(&self) -> Option<BodyHandle> {
        self.motion.center()
    }

    pub fn pending_recenters(&self) -> &[Recenter] {
        &self.recenters
    }

    fn due_recenter(&mut self, t: f64) -> Option<Recenter> {
        if self.recenters.first().map_or(false, |r| r.time <= t) {
            Some(self.recenters.remove(0))
        } else {
            None
        }
    }
}

// =============================================================================
// RAILS SET
// =============================================================================

/// Every on-rails body, kept sorted by depth so centers are evaluated before
/// the bodies orbiting them.
#[derive(Debug, Clone)]
pub struct RailsSet {
    bodies: Vec<FixedBody>,
    pub solver: KeplerSolver,
}

impl RailsSet {
    pub fn new(solver: KeplerSolver) -> Self {
        Self {
            bodies: Vec::new(),
            solver,
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixedBody> {
        self.bodies.iter()
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.bodies.iter().any(|b| b.handle == handle)
    }

    pub fn get(&self, handle: BodyHandle) -> Option<&FixedBody> {
        self.bodies.iter().find(|b| b.handle == handle)
    }

    fn get_mut(&mut self, handle: BodyHandle) -> Option<&mut FixedBody> {
        self.bodies.iter_mut().find(|b| b.handle == handle)
    }

    pub fn state(&self, handle: BodyHandle) -> Option<(Vector3, Vector3)> {
        self.get(handle).map(|b| (b.position, b.velocity))
    }

    pub fn add(&mut self, body: FixedBody) {
        debug!("Body {} placed on rails", body.handle);
        self.bodies.push(body);
        self.reorder();
    }

    pub fn remove(&mut self, handle: BodyHandle) -> Option<FixedBody> {
        let i = self.bodies.iter().position(|b| b.handle == handle)?;
        let body = self.bodies.remove(i);
        self.reorder();
        Some(body)
    }

    /// Bodies whose conic is centered on `center`
    pub fn orbiting(&self, center: BodyHandle) -> Vec<BodyHandle> {
        self.bodies
            .iter()
            .filter(|b| b.center() == Some(center))
            .map(|b| b.handle)
            .collect()
    }

    pub fn set_active(&mut self, handle: BodyHandle, active: bool) {
        if let Some(b) = self.get_mut(handle) {
            b.active = active;
        }
    }

    /// Recompute depths and stably re-sort
    pub fn reorder(&mut self) {
        let n = self.bodies.len();
        for b in self.bodies.iter_mut() {
            b.depth = 0;
        }
        // Longest chain is n-1 links; anything still changing after that is a cycle
        for pass in 0..=n {
            let mut changed = false;
            for i in 0..n {
                let depth = match self.bodies[i].center() {
                    Some(c) => match self.bodies.iter().find(|b| b.handle == c) {
                        Some(center) => center.depth + 1,
                        None => 0,
                    },
                    None => 0,
                };
                if depth != self.bodies[i].depth && depth <= n {
                    self.bodies[i].depth = depth;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            if pass == n {
                warn!("Cycle in rails centers; evaluation order is arbitrary");
            }
        }
        self.bodies.sort_by_key(|b| b.depth);
    }

    /// Schedule a change of center at `time` (sphere-of-influence hand-off)
    pub fn schedule_recenter(
        &mut self,
        handle: BodyHandle,
        time: f64,
        new_center: BodyHandle,
    ) -> KernelResult<()> {
        if handle == new_center {
            return Err(KernelError::InvalidState(format!(
                "body {handle} cannot orbit itself"
            )));
        }
        let body = self.get_mut(handle).ok_or(KernelError::NotOnRails)?;
        if matches!(body.motion, RailsMotion::Stationary { .. }) {
            return Err(KernelError::InvalidState(format!(
                "stationary body {handle} has no center to change"
            )));
        }
        let at = body.recenters.partition_point(|r| r.time <= time);
        body.recenters.insert(at, Recenter { time, new_center });
        Ok(())
    }

    /// Velocity change at time `t`: a Kepler body gets a new epoch
    pub fn apply_impulse(&mut self, handle: BodyHandle, t: f64, delta_v: &Vector3) -> KernelResult<()> {
        let solver = self.solver;
        let body = self.get_mut(handle).ok_or(KernelError::NotOnRails)?;
        match body.motion {
            RailsMotion::Stationary { .. } => {
                warn!("Impulse on stationary body {} ignored", handle);
                Err(KernelError::InvalidState(format!(
                    "body {handle} is stationary; release it from rails first"
                )))
            }
            RailsMotion::Kepler { center, epoch } => {
                let epoch = epoch.rebased(t, delta_v, &solver)?;
                body.velocity = body.velocity.add(delta_v);
                body.last_relative = (epoch.r0, epoch.v0);
                body.motion = RailsMotion::Kepler { center, epoch };
                Ok(())
            }
        }
    }

    /// Evaluate every body at time `t`.
    ///
    /// Centers on rails are read from this set (already evaluated thanks to
    /// the depth order); other centers come from `world`. Returns handles whose
    /// state came out non-finite.
    pub fn update(&mut self, t: f64, world: &dyn CenterLookup) -> Vec<BodyHandle> {
        let mut non_finite = Vec::new();
        let mut due: Vec<(usize, Recenter)> = Vec::new();
        let solver = self.solver;

        for i in 0..self.bodies.len() {
            if !self.bodies[i].active {
                continue;
            }
            let (center, epoch) = match self.bodies[i].motion {
                RailsMotion::Stationary { position } => {
                    self.bodies[i].position = position;
                    self.bodies[i].velocity = Vector3::zero();
                    continue;
                }
                RailsMotion::Kepler { center, epoch } => (center, epoch),
            };
            let center_state = match self.state(center).or_else(|| world.state_of(center)) {
                Some(s) => s,
                None => {
                    warn!("Center {} of rails body {} is gone", center, self.bodies[i].handle);
                    continue;
                }
            };
            if !center_state.0.is_finite() || !center_state.1.is_finite() {
                continue;
            }

            let body = &mut self.bodies[i];
            let relative = match epoch.state_at(t, &solver) {
                Ok(rel) => {
                    body.last_relative = rel;
                    rel
                }
                Err(e) => {
                    warn!("Rails body {}: {}; keeping last state", body.handle, e);
                    body.last_relative
                }
            };
            body.position = center_state.0.add(&relative.0);
            body.velocity = center_state.1.add(&relative.1);
            if !body.position.is_finite() || !body.velocity.is_finite() {
                non_finite.push(body.handle);
            }
            if let Some(r) = body.due_recenter(t) {
                due.push((i, r));
            }
        }

        // Second phase: centers are all current, so hand-offs see a consistent world
        if !due.is_empty() {
            for (i, recenter) in due {
                self.apply_recenter(i, t, recenter, world);
            }
            self.reorder();
        }
        non_finite
    }

    fn apply_recenter(&mut self, i: usize, t: f64, recenter: Recenter, world: &dyn CenterLookup) {
        let target = recenter.new_center;
        let center_state = self.state(target).or_else(|| world.state_of(target));
        let center_mass = self
            .get(target)
            .map(|b| b.mass)
            .or_else(|| world.mass_of(target));
        let body = &mut self.bodies[i];
        let (Some(state), Some(mass)) = (center_state, center_mass) else {
            warn!("Re-center of {} onto missing body {} skipped", body.handle, target);
            return;
        };
        let r0 = body.position.sub(&state.0);
        let v0 = body.velocity.sub(&state.1);
        match OrbitEpoch::new(r0, v0, t, body.mass + mass) {
            Ok(epoch) => {
                debug!("Rails body {} re-centered on {} at t = {}", body.handle, target, t);
                body.last_relative = (r0, v0);
                body.motion = RailsMotion::Kepler { center: target, epoch };
            }
            Err(e) => warn!("Re-center of {} failed: {}", body.handle, e),
        }
    }
}
