// Body Registry - massive bodies in parallel arrays
// Index-aligned with the active integrator's private buffers

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KernelError, KernelResult};
use crate::integrator::Integrator;
use crate::vector::Vector3;

// =============================================================================
// HANDLES & FLAGS
// =============================================================================

/// Stable identity of a body; never reused within one simulation
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(pub u64);

impl fmt::Display for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BodyFlags(u8);

impl BodyFlags {
    pub const NONE: BodyFlags = BodyFlags(0);
    /// Excluded from force evaluation and integration
    pub const INACTIVE: BodyFlags = BodyFlags(1);
    /// Moved analytically by the rails layer, not by the integrator
    pub const FIXED_MOTION: BodyFlags = BodyFlags(2);
    pub const TRACK_TRAJECTORY: BodyFlags = BodyFlags(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: BodyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BodyFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BodyFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for BodyFlags {
    type Output = BodyFlags;

    fn bitor(self, rhs: BodyFlags) -> BodyFlags {
        BodyFlags(self.0 | rhs.0)
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Massive bodies stored as parallel arrays.
///
/// `capacity()` slots are allocated; the first `len()` are occupied and
/// packed. Removing a body shifts every later body down by one, in the
/// registry and in the integrator together, so a handle's index can change.
/// Use [`BodyRegistry::index_of`] rather than caching indices.
#[derive(Debug, Clone)]
pub struct BodyRegistry {
    mass: Vec<f64>,
    position: Vec<Vector3>,
    flags: Vec<BodyFlags>,
    ids: Vec<Option<BodyHandle>>,
    len: usize,
    grow_by: usize,
    index: HashMap<BodyHandle, usize>,
}

impl BodyRegistry {
    pub fn new(capacity: usize, grow_by: usize) -> Self {
        Self {
            mass: vec![0.0; capacity],
            position: vec![Vector3::zero(); capacity],
            flags: vec![BodyFlags::NONE; capacity],
            ids: vec![None; capacity],
            len: 0,
            grow_by: grow_by.max(1),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.mass.len()
    }

    /// Append a body, growing both the registry and `integrator` when full.
    /// Returns the index the body landed on.
    pub fn add(
        &mut self,
        handle: BodyHandle,
        mass: f64,
        position: Vector3,
        velocity: Vector3,
        flags: BodyFlags,
        integrator: &mut Integrator,
    ) -> KernelResult<usize> {
        if mass == 0.0 {
            return Err(KernelError::ZeroMass);
        }
        if !(mass.is_finite() && mass > 0.0) {
            return Err(KernelError::InvalidConfig(format!(
                "mass must be positive and finite (got {mass})"
            )));
        }
        if !position.is_finite() || !velocity.is_finite() {
            return Err(KernelError::InvalidState(format!(
                "non-finite initial state for body {handle}"
            )));
        }
        if self.index.contains_key(&handle) {
            return Err(KernelError::InvalidState(format!(
                "body {handle} is already registered"
            )));
        }
        if self.len == self.capacity() {
            self.grow(self.grow_by, integrator)?;
        }

        let i = self.len;
        self.mass[i] = mass;
        self.position[i] = position;
        self.flags[i] = flags;
        self.ids[i] = Some(handle);
        integrator.add_body(i, velocity, handle);
        self.index.insert(handle, i);
        self.len += 1;
        Ok(i)
    }

    /// Remove the body at `index`, shifting later bodies down in lockstep with
    /// the integrator. Returns the removed handle.
    pub fn remove(&mut self, index: usize, integrator: &mut Integrator) -> KernelResult<BodyHandle> {
        if index >= self.len {
            return Err(KernelError::InvalidState(format!(
                "index {index} out of range ({} bodies)",
                self.len
            )));
        }
        let handle = self.ids[index].ok_or_else(|| {
            KernelError::InvalidState(format!("slot {index} holds no body"))
        })?;

        self.mass.remove(index);
        self.mass.push(0.0);
        self.position.remove(index);
        self.position.push(Vector3::zero());
        self.flags.remove(index);
        self.flags.push(BodyFlags::NONE);
        self.ids.remove(index);
        self.ids.push(None);
        integrator.remove_body_at(index);
        self.len -= 1;

        self.index.remove(&handle);
        for (i, id) in self.ids.iter().enumerate().take(self.len).skip(index) {
            if let Some(h) = id {
                self.index.insert(*h, i);
            }
        }
        Ok(handle)
    }

    /// Grow capacity by `by` slots. The integrator is grown first so a refusal
    /// leaves both untouched.
    pub fn grow(&mut self, by: usize, integrator: &mut Integrator) -> KernelResult<()> {
        let new_capacity = self.capacity() + by;
        integrator.grow_arrays(new_capacity)?;
        self.mass.resize(new_capacity, 0.0);
        self.position.resize(new_capacity, Vector3::zero());
        self.flags.resize(new_capacity, BodyFlags::NONE);
        self.ids.resize(new_capacity, None);
        debug!("Body registry grown to {} slots", new_capacity);
        Ok(())
    }

    pub fn index_of(&self, handle: BodyHandle) -> Option<usize> {
        self.index.get(&handle).copied()
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn id_at(&self, index: usize) -> Option<BodyHandle> {
        self.ids.get(index).copied().flatten()
    }

    pub fn handles(&self) -> impl Iterator<Item = BodyHandle> + '_ {
        self.ids[..self.len].iter().filter_map(|h| *h)
    }

    pub fn mass(&self, index: usize) -> f64 {
        self.mass[index]
    }

    pub fn position(&self, index: usize) -> Vector3 {
        self.position[index]
    }

    pub fn set_position(&mut self, index: usize, position: Vector3) {
        self.position[index] = position;
    }

    /// Occupied positions
    pub fn positions(&self) -> &[Vector3] {
        &self.position[..self.len]
    }

    pub fn masses(&self) -> &[f64] {
        &self.mass[..self.len]
    }

    pub fn flags(&self) -> &[BodyFlags] {
        &self.flags[..self.len]
    }

    pub fn flag_bits(&self, index: usize) -> BodyFlags {
        self.flags[index]
    }

    pub fn set_flag(&mut self, index: usize, flag: BodyFlags) {
        self.flags[index].insert(flag);
    }

    pub fn clear_flag(&mut self, index: usize, flag: BodyFlags) {
        self.flags[index].remove(flag);
    }

    pub fn fixed_count(&self) -> usize {
        self.flags()
            .iter()
            .filter(|f| f.contains(BodyFlags::FIXED_MOTION))
            .count()
    }

    /// True when every body is either on rails or switched off
    pub fn all_fixed(&self) -> bool {
        self.flags()
            .iter()
            .all(|f| f.contains(BodyFlags::FIXED_MOTION) || f.contains(BodyFlags::INACTIVE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn empty(capacity: usize, grow_by: usize) -> (BodyRegistry, Integrator) {
        let registry = BodyRegistry::new(capacity, grow_by);
        let integrator = Integrator::new(&EngineConfig::default(), capacity).unwrap();
        (registry, integrator)
    }

    fn add_simple(reg: &mut BodyRegistry, integ: &mut Integrator, id: u64) -> KernelResult<usize> {
        reg.add(
            BodyHandle(id),
            1.0 + id as f64,
            Vector3::new(id as f64, 0.0, 0.0),
            Vector3::new(0.0, id as f64, 0.0),
            BodyFlags::NONE,
            integ,
        )
    }

    fn assert_aligned(reg: &BodyRegistry, integ: &Integrator) {
        assert_eq!(reg.capacity(), integ.capacity());
        for i in 0..reg.len() {
            let handle = reg.id_at(i).unwrap();
            assert_eq!(integ.id_at(i), Some(handle));
            assert_eq!(reg.index_of(handle), Some(i));
            // every field of a body moves together
            assert_eq!(reg.mass(i), 1.0 + handle.0 as f64);
            assert_eq!(reg.position(i).x, handle.0 as f64);
            assert_eq!(integ.velocity(i).y, handle.0 as f64);
        }
        for i in reg.len()..reg.capacity() {
            assert_eq!(reg.id_at(i), None);
            assert_eq!(integ.id_at(i), None);
        }
    }

    #[test]
    fn test_zero_mass_rejected() {
        let (mut reg, mut integ) = empty(2, 2);
        let err = reg
            .add(BodyHandle(1), 0.0, Vector3::zero(), Vector3::zero(), BodyFlags::NONE, &mut integ)
            .unwrap_err();
        assert!(matches!(err, KernelError::ZeroMass));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let (mut reg, mut integ) = empty(2, 2);
        add_simple(&mut reg, &mut integ, 7).unwrap();
        assert!(add_simple(&mut reg, &mut integ, 7).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_growth_by_increment() {
        let (mut reg, mut integ) = empty(2, 3);
        for id in 0..3 {
            add_simple(&mut reg, &mut integ, id).unwrap();
        }
        assert_eq!(reg.capacity(), 5);
        assert_eq!(integ.capacity(), 5);
        assert_aligned(&reg, &integ);
    }

    #[test]
    fn test_remove_shifts_down() {
        let (mut reg, mut integ) = empty(4, 4);
        for id in 0..4 {
            add_simple(&mut reg, &mut integ, id).unwrap();
        }
        let removed = reg.remove(1, &mut integ).unwrap();
        assert_eq!(removed, BodyHandle(1));
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.index_of(BodyHandle(2)), Some(1));
        assert_eq!(reg.index_of(BodyHandle(3)), Some(2));
        assert_eq!(reg.index_of(BodyHandle(1)), None);
        assert_aligned(&reg, &integ);
    }

    #[test]
    fn test_remove_out_of_range() {
        let (mut reg, mut integ) = empty(2, 2);
        add_simple(&mut reg, &mut integ, 0).unwrap();
        assert!(reg.remove(1, &mut integ).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_random_add_remove_keeps_alignment() {
        let mut rng = StdRng::seed_from_u64(42);
        let (mut reg, mut integ) = empty(1, 2);
        let mut next_id = 0;
        for _ in 0..500 {
            if reg.is_empty() || rng.gen_bool(0.6) {
                add_simple(&mut reg, &mut integ, next_id).unwrap();
                next_id += 1;
            } else {
                let i = rng.gen_range(0..reg.len());
                reg.remove(i, &mut integ).unwrap();
            }
            assert_aligned(&reg, &integ);
        }
    }

    #[test]
    fn test_flags() {
        let mut f = BodyFlags::FIXED_MOTION | BodyFlags::TRACK_TRAJECTORY;
        assert!(f.contains(BodyFlags::FIXED_MOTION));
        assert!(!f.contains(BodyFlags::INACTIVE));
        f.remove(BodyFlags::FIXED_MOTION);
        assert_eq!(f, BodyFlags::TRACK_TRAJECTORY);
        assert!(f.contains(BodyFlags::NONE));
    }
}
