//! Engine configuration.
//!
//! A thin `serde` representation of the knobs the kernel exposes. Every field
//! has a default, so a partial document is enough:
//!
//! ```json
//! {
//!   "integrator": "hermite",
//!   "engine_dt": 0.005,
//!   "massless_dt": 0.01
//! }
//! ```
//!
//! All quantities are in the kernel's dimensionless units (G = 1).

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Which integrator steps the massive population
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegratorKind {
    #[serde(rename = "leapfrog")] // fixed-step kick-drift-kick, symplectic
    #[default]
    Leapfrog,

    #[serde(rename = "hermite")] // adaptive 4th-order predictor-corrector
    Hermite,

    #[serde(rename = "triple")] // KS-regularized, exactly three bodies
    Triple,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub integrator: IntegratorKind,
    pub engine_dt: f64,    // massive-body fixed sub-step
    pub massless_dt: f64,  // lightweight body sub-step
    pub particle_dt: f64,  // particle cloud sub-step
    pub initial_capacity: usize,
    pub grow_by: usize,    // registry growth increment
    pub softening: f64,    // eps^2 added to every pair separation
    pub hermite_eta: f64,  // Aarseth accuracy parameter
    pub hermite_max_dt: f64,
    pub hermite_min_dt: f64,
    pub kepler_tolerance: f64,
    pub kepler_max_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let engine_dt = 0.01;
        Self {
            integrator: IntegratorKind::Leapfrog,
            engine_dt,
            massless_dt: 0.01,
            particle_dt: 0.01,
            initial_capacity: 16,
            grow_by: 16,
            softening: 0.0,
            hermite_eta: 0.02,
            hermite_max_dt: engine_dt * 4.0,
            hermite_min_dt: 1e-9,
            kepler_tolerance: 1e-5,
            kepler_max_iterations: 100,
        }
    }
}

impl EngineConfig {
    pub fn with_integrator(mut self, integrator: IntegratorKind) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_engine_dt(mut self, dt: f64) -> Self {
        self.engine_dt = dt;
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> KernelResult<Self> {
        let cfg: EngineConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> KernelResult<()> {
        let steps = [
            ("engine_dt", self.engine_dt),
            ("massless_dt", self.massless_dt),
            ("particle_dt", self.particle_dt),
            ("hermite_max_dt", self.hermite_max_dt),
            ("hermite_min_dt", self.hermite_min_dt),
            ("hermite_eta", self.hermite_eta),
            ("kepler_tolerance", self.kepler_tolerance),
        ];
        for (name, value) in steps {
            if !(value.is_finite() && value > 0.0) {
                return Err(KernelError::InvalidConfig(format!(
                    "{name} must be positive and finite (got {value})"
                )));
            }
        }
        if self.hermite_min_dt > self.hermite_max_dt {
            return Err(KernelError::InvalidConfig(
                "hermite_min_dt exceeds hermite_max_dt".to_string(),
            ));
        }
        if self.initial_capacity == 0 || self.grow_by == 0 {
            return Err(KernelError::InvalidConfig(
                "initial_capacity and grow_by must be non-zero".to_string(),
            ));
        }
        if !(self.softening.is_finite() && self.softening >= 0.0) {
            return Err(KernelError::InvalidConfig(format!(
                "softening must be non-negative (got {})",
                self.softening
            )));
        }
        if self.kepler_max_iterations == 0 {
            return Err(KernelError::InvalidConfig(
                "kepler_max_iterations must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = EngineConfig::from_json(r#"{ "integrator": "hermite", "engine_dt": 0.005 }"#)
            .unwrap();
        assert_eq!(cfg.integrator, IntegratorKind::Hermite);
        assert_eq!(cfg.engine_dt, 0.005);
        assert_eq!(cfg.grow_by, EngineConfig::default().grow_by);
    }

    #[test]
    fn test_zero_step_rejected() {
        let err = EngineConfig::from_json(r#"{ "engine_dt": 0.0 }"#).unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_integrator_is_json_error() {
        let err = EngineConfig::from_json(r#"{ "integrator": "rk4" }"#).unwrap_err();
        assert!(matches!(err, KernelError::Json(_)));
    }
}
