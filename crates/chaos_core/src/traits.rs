use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// Numeric type a vector field can be evaluated in: `f64`, or
/// [`crate::autodiff::Dual`] when differentiating.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Right-hand side of a flow, or update rule of a map. Parameters live on the
/// implementor.
///
/// A single `impl<T: Scalar>` covers both `f64` evaluation and the dual-number
/// evaluation used by forward-mode Jacobians.
pub trait VectorField<T: Scalar> {
    fn dimension(&self) -> usize;

    /// Writes `dx/dt` (flows) or `x_{n+1}` (maps) into `out`. For maps `t` is
    /// the iteration count.
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A fixed-step method advancing a state in place.
pub trait Steppable<T: Scalar> {
    /// Advances `state` from `t` to `t + dt` and updates `t`.
    fn step(&mut self, system: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T);
}
