// Maneuvers - scheduled impulsive velocity changes
// Kept sorted by time; equal times fire in scheduling order

use std::fmt;

use crate::registry::BodyHandle;
use crate::vector::Vector3;

/// One-shot notification fired after a maneuver is applied
pub type ManeuverCallback = Box<dyn FnOnce(&Maneuver) + Send + Sync>;

pub struct Maneuver {
    pub time: f64,
    pub target: BodyHandle,
    pub delta_v: Vector3,
    pub callback: Option<ManeuverCallback>,
}

impl Maneuver {
    pub fn new(time: f64, target: BodyHandle, delta_v: Vector3) -> Self {
        Self {
            time,
            target,
            delta_v,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ManeuverCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Fire the notification, consuming it
    pub fn notify(&mut self) {
        if let Some(cb) = self.callback.take() {
            cb(self);
        }
    }
}

impl fmt::Debug for Maneuver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Maneuver")
            .field("time", &self.time)
            .field("target", &self.target)
            .field("delta_v", &self.delta_v)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Callbacks are not carried into copies
impl Clone for Maneuver {
    fn clone(&self) -> Self {
        Self::new(self.time, self.target, self.delta_v)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManeuverQueue {
    entries: Vec<Maneuver>,
}

impl ManeuverQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn schedule(&mut self, maneuver: Maneuver) {
        let at = self.entries.partition_point(|m| m.time <= maneuver.time);
        self.entries.insert(at, maneuver);
    }

    /// Time of the earliest pending maneuver
    pub fn next_time(&self) -> Option<f64> {
        self.entries.first().map(|m| m.time)
    }

    /// Pending maneuvers due at or before `t`, earliest first, without removing them
    pub fn maneuvers_before(&self, t: f64) -> &[Maneuver] {
        let n = self.entries.partition_point(|m| m.time <= t);
        &self.entries[..n]
    }

    /// Remove and return everything due at or before `t`
    pub fn pop_due(&mut self, t: f64) -> Vec<Maneuver> {
        let n = self.entries.partition_point(|m| m.time <= t);
        self.entries.drain(..n).collect()
    }

    /// Drop every maneuver targeting `handle`
    pub fn cancel_for(&mut self, handle: BodyHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|m| m.target != handle);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Maneuver> {
        self.entries.iter()
    }
}
