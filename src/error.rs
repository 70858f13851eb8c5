//! Error types for the simulation kernel

use thiserror::Error;

use crate::registry::BodyHandle;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors surfaced by the kernel.
///
/// Configuration and contract violations are returned to the caller. Numeric
/// trouble inside `evolve` (non-finite state, Kepler non-convergence) is logged
/// and degraded instead, so it only shows up here when a helper is called
/// directly.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("body mass must be non-zero for the massive registry")]
    ZeroMass,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("integrator cannot be changed once evolution has started")]
    IntegratorLocked,

    #[error("regularized three-body solver requires exactly three bodies (got {0})")]
    TripleBodyCount(usize),

    #[error("unknown body {0}")]
    UnknownBody(BodyHandle),

    #[error("operation requires every body to be on rails")]
    NotOnRails,

    #[error("invalid operation: {0}")]
    InvalidState(String),

    #[error("Kepler solver did not converge after {iterations} iterations")]
    KeplerNonConvergence { iterations: usize },

    #[error("degenerate orbit: {0}")]
    DegenerateOrbit(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
