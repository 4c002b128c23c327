//! The `chaos_core` crate estimates Lyapunov exponents and alignment indices of
//! discrete maps and continuous flows by integrating the system together with
//! its tangent dynamics.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `VectorField` (maps and ODE right-hand sides), `Steppable` (solvers).
//! - **System**: `DynamicalSystem`, an immutable descriptor pairing a field with a Jacobian strategy and a time mode.
//! - **Integrators**: base, parallel and tangent integrators sharing one stepping engine.
//! - **Estimators**: QR-based Lyapunov spectrum, Benettin's maximum exponent, GALI.
//! - **Autodiff**: Dual numbers used for forward-mode Jacobians.
pub mod autodiff;
pub mod error;
pub mod gali;
pub mod integrator;
pub mod jacobian;
pub mod lyapunov;
pub mod ode;
pub mod orthonormal;
pub mod solvers;
pub mod system;
pub mod tangent;
pub mod traits;

#[cfg(test)]
mod test_systems;

pub use error::ChaosError;
pub use gali::{gali, GaliSettings, GaliTrace};
pub use integrator::{trajectory, BaseIntegrator, ParallelIntegrator, Trajectory, TrajectorySettings};
pub use lyapunov::{
    kaplan_yorke, lyapunov_spectrum, max_lyapunov, max_lyapunov_convergence, max_lyapunov_ensemble,
    max_lyapunov_with, LyapunovConvergence, MaxLyapunovSettings, SpectrumSettings,
};
pub use system::{DynamicalSystem, FnField, TimeMode};
pub use tangent::{Deviations, TangentIntegrator};
