//! Strategies for obtaining the Jacobian of a vector field.
//!
//! All providers write a row-major `D×D` matrix into `out`.

use crate::autodiff::{forward_jacobian, Dual};
use crate::traits::VectorField;

pub trait JacobianProvider<F> {
    fn jacobian(&self, field: &F, t: f64, x: &[f64], out: &mut [f64]);
}

/// Forward-mode automatic differentiation through [`Dual`] numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardDiff;

impl<F> JacobianProvider<F> for ForwardDiff
where
    F: VectorField<f64> + VectorField<Dual>,
{
    fn jacobian(&self, field: &F, t: f64, x: &[f64], out: &mut [f64]) {
        forward_jacobian(field, t, x, out);
    }
}

/// Central differences, for fields that can only be evaluated over `f64`.
/// The perturbation of coordinate `j` is `step * max(1, |x_j|)`.
#[derive(Debug, Clone, Copy)]
pub struct FiniteDifference {
    pub step: f64,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        // Roughly the cube root of machine epsilon, optimal for central differences.
        Self { step: 6.0e-6 }
    }
}

impl<F: VectorField<f64>> JacobianProvider<F> for FiniteDifference {
    fn jacobian(&self, field: &F, t: f64, x: &[f64], out: &mut [f64]) {
        let n = x.len();
        let mut shifted = x.to_vec();
        let mut forward = vec![0.0; n];
        let mut backward = vec![0.0; n];

        for j in 0..n {
            let h = self.step * x[j].abs().max(1.0);
            shifted[j] = x[j] + h;
            field.apply(t, &shifted, &mut forward);
            shifted[j] = x[j] - h;
            field.apply(t, &shifted, &mut backward);
            shifted[j] = x[j];

            for i in 0..n {
                out[i * n + j] = (forward[i] - backward[i]) / (2.0 * h);
            }
        }
    }
}

/// A Jacobian supplied in closed form by the caller.
pub struct Analytic<G>(pub G);

impl<F, G> JacobianProvider<F> for Analytic<G>
where
    G: Fn(f64, &[f64], &mut [f64]),
{
    fn jacobian(&self, _field: &F, t: f64, x: &[f64], out: &mut [f64]) {
        (self.0)(t, x, out)
    }
}

#[cfg(test)]
mod tests {
    use super::{Analytic, FiniteDifference, ForwardDiff, JacobianProvider};
    use crate::test_systems::{lorenz_jacobian, Lorenz};
    use approx::assert_abs_diff_eq;

    #[test]
    fn providers_agree_on_lorenz() {
        let lorenz = Lorenz::default();
        let x = [1.3, -0.4, 21.0];
        let mut exact = vec![0.0; 9];
        Analytic(lorenz_jacobian(lorenz)).jacobian(&lorenz, 0.0, &x, &mut exact);

        let mut dual = vec![0.0; 9];
        ForwardDiff.jacobian(&lorenz, 0.0, &x, &mut dual);
        let mut fd = vec![0.0; 9];
        FiniteDifference::default().jacobian(&lorenz, 0.0, &x, &mut fd);

        for i in 0..9 {
            assert_abs_diff_eq!(dual[i], exact[i], epsilon = 1e-12);
            assert_abs_diff_eq!(fd[i], exact[i], epsilon = 1e-6);
        }
    }
}
