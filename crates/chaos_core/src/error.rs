use thiserror::Error;

/// Failure kinds raised by the tangent-space engine.
///
/// Public functions return `anyhow::Result`; these values travel inside it and
/// can be recovered with `err.downcast_ref::<ChaosError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChaosError {
    /// A state, deviation block or Jacobian does not match the system dimension.
    #[error("Dimension mismatch: expected {expected}, got {got}.")]
    DimensionMismatch { expected: usize, got: usize },

    /// A configuration value was rejected before any integration started.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The ODE solver could not continue; the joint state is no longer usable.
    #[error("Solver failure at t = {time}: {reason}")]
    SolverFailure { time: f64, reason: String },
}

impl ChaosError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ChaosError::InvalidParameter(message.into())
    }

    pub(crate) fn solver(time: f64, reason: impl Into<String>) -> Self {
        ChaosError::SolverFailure {
            time,
            reason: reason.into(),
        }
    }
}
