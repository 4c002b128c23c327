//! Joint evolution of a trajectory and a block of deviation vectors.
//!
//! The joint state is one flat vector `[x | W]`: the `D` state coordinates
//! followed by the `D×k` deviation block in row-major order.
//!
//! - flows: `dx/dt = f(x)`, `dW/dt = J(x) W`
//! - maps: `x' = f(x)`, `W' = J(x') W`, with the Jacobian taken at the new state.

use crate::error::ChaosError;
use crate::integrator::Engine;
use crate::jacobian::JacobianProvider;
use crate::orthonormal::{normalize_block, orthonormalize_block, qr_growth, write_row_major};
use crate::system::DynamicalSystem;
use crate::traits::VectorField;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Source of the initial deviation vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Deviations {
    /// The first `k` standard basis vectors.
    Identity,
    /// The first `k` columns of a Haar-random orthogonal matrix. Without a
    /// seed the thread RNG is used.
    Random { seed: Option<u64> },
    /// Caller-supplied vectors, one per entry. They need not be orthonormal.
    Given(Vec<Vec<f64>>),
}

impl Deviations {
    /// Takes the columns of `matrix` as deviation vectors.
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        Deviations::Given(
            matrix
                .column_iter()
                .map(|c| c.iter().copied().collect())
                .collect(),
        )
    }

    /// Number of vectors fixed by this source, if any.
    pub fn count(&self) -> Option<usize> {
        match self {
            Deviations::Given(vectors) => Some(vectors.len()),
            _ => None,
        }
    }

    /// Materializes `k` deviation vectors of length `dim` as columns of a matrix.
    pub fn build(&self, dim: usize, k: usize) -> Result<DMatrix<f64>> {
        check_count(dim, k)?;
        match self {
            Deviations::Identity => Ok(DMatrix::identity(dim, k)),
            Deviations::Random { seed: Some(seed) } => {
                Ok(random_orthonormal(dim, k, &mut StdRng::seed_from_u64(*seed)))
            }
            Deviations::Random { seed: None } => {
                Ok(random_orthonormal(dim, k, &mut rand::thread_rng()))
            }
            Deviations::Given(vectors) => {
                if vectors.len() != k {
                    bail!(ChaosError::DimensionMismatch {
                        expected: k,
                        got: vectors.len(),
                    });
                }
                let mut matrix = DMatrix::zeros(dim, k);
                for (j, v) in vectors.iter().enumerate() {
                    if v.len() != dim {
                        bail!(ChaosError::DimensionMismatch {
                            expected: dim,
                            got: v.len(),
                        });
                    }
                    matrix.set_column(j, &DVector::from_column_slice(v));
                }
                Ok(matrix)
            }
        }
    }
}

fn check_count(dim: usize, k: usize) -> Result<()> {
    if k == 0 || k > dim {
        bail!(ChaosError::invalid(format!(
            "Number of deviation vectors must be in 1..={dim}, got {k}."
        )));
    }
    Ok(())
}

/// First `k` columns of a Haar-distributed `dim×dim` orthogonal matrix,
/// obtained from the QR decomposition of a Gaussian matrix with the
/// non-negative diagonal convention.
pub fn random_orthonormal<R: Rng + ?Sized>(dim: usize, k: usize, rng: &mut R) -> DMatrix<f64> {
    let gaussian = DMatrix::from_fn(dim, dim, |_, _| rng.sample::<f64, _>(StandardNormal));
    let (q, _) = qr_growth(&gaussian);
    q.columns(0, k).into_owned()
}

struct TangentField<'a, F, J> {
    system: &'a DynamicalSystem<F, J>,
    dim: usize,
    k: usize,
    discrete: bool,
    jacobian: RefCell<Vec<f64>>,
}

impl<F, J> VectorField<f64> for TangentField<'_, F, J>
where
    F: VectorField<f64>,
    J: JacobianProvider<F>,
{
    fn dimension(&self) -> usize {
        self.dim * (self.k + 1)
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let (n, k) = (self.dim, self.k);
        let (state, deviations) = x.split_at(n);
        let (next, out_deviations) = out.split_at_mut(n);

        self.system.evaluate(t, state, next);

        let mut jac = self.jacobian.borrow_mut();
        if self.discrete {
            // Deviations of step n are pushed forward with J(x_{n+1}).
            self.system.jacobian(t + 1.0, next, &mut jac);
        } else {
            self.system.jacobian(t, state, &mut jac);
        }

        for i in 0..n {
            for c in 0..k {
                let mut sum = 0.0;
                for m in 0..n {
                    sum += jac[i * n + m] * deviations[m * k + c];
                }
                out_deviations[i * k + c] = sum;
            }
        }
    }
}

/// Integrator for the state together with `k` deviation vectors.
pub struct TangentIntegrator<'a, F, J> {
    field: TangentField<'a, F, J>,
    engine: Engine,
}

impl<'a, F, J> TangentIntegrator<'a, F, J>
where
    F: VectorField<f64>,
    J: JacobianProvider<F>,
{
    /// Builds the joint integrator. `u0` and `t0` default to the system's
    /// initial condition; `k` must lie in `1..=D`.
    pub fn new(
        system: &'a DynamicalSystem<F, J>,
        k: usize,
        deviations: &Deviations,
        u0: Option<&[f64]>,
        t0: Option<f64>,
    ) -> Result<Self> {
        let dim = system.dimension();
        let w = deviations.build(dim, k)?;
        let u0 = u0.unwrap_or(system.state());
        system.check_state(u0)?;
        let t0 = t0.unwrap_or(system.initial_time());

        let field = TangentField {
            system,
            dim,
            k,
            discrete: system.is_discrete(),
            jacobian: RefCell::new(vec![0.0; dim * dim]),
        };
        let joint = join(u0, &w);
        Ok(Self {
            engine: Engine::new(system.time_mode(), t0, &joint)?,
            field,
        })
    }

    pub fn dimension(&self) -> usize {
        self.field.dim
    }

    /// Number of deviation vectors.
    pub fn k(&self) -> usize {
        self.field.k
    }

    pub fn step(&mut self) -> Result<()> {
        self.engine.step(&self.field)
    }

    pub fn step_for(&mut self, dt: f64) -> Result<()> {
        self.engine.step_for(&self.field, dt)
    }

    /// Restarts from `u` at `t0` with a fresh deviation block, keeping all
    /// buffers.
    pub fn reinit(&mut self, u: &[f64], t0: f64, deviations: &DMatrix<f64>) -> Result<()> {
        self.field.system.check_state(u)?;
        self.check_block(deviations)?;
        let joint = join(u, deviations);
        self.engine.reinit(&joint, t0)
    }

    pub fn time(&self) -> f64 {
        self.engine.time()
    }

    pub fn state(&self) -> &[f64] {
        &self.engine.state()[..self.field.dim]
    }

    /// The current deviation vectors as the columns of a `D×k` matrix.
    pub fn deviations(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.field.dim, self.field.k, self.block())
    }

    pub fn set_deviations(&mut self, deviations: &DMatrix<f64>) -> Result<()> {
        self.check_block(deviations)?;
        let dim = self.field.dim;
        write_row_major(&mut self.engine.state_mut()[dim..], deviations);
        Ok(())
    }

    /// QR-orthonormalizes the deviation vectors in place and returns the
    /// diagonal of `R` (non-negative).
    pub fn orthonormalize(&mut self) -> DVector<f64> {
        let (dim, k) = (self.field.dim, self.field.k);
        orthonormalize_block(&mut self.engine.state_mut()[dim..], dim, k)
    }

    /// Rescales each deviation vector to unit length independently and
    /// returns the norms before rescaling.
    pub fn normalize_deviations(&mut self) -> Vec<f64> {
        let (dim, k) = (self.field.dim, self.field.k);
        normalize_block(&mut self.engine.state_mut()[dim..], dim, k)
    }

    fn block(&self) -> &[f64] {
        &self.engine.state()[self.field.dim..]
    }

    fn check_block(&self, deviations: &DMatrix<f64>) -> Result<()> {
        if deviations.nrows() != self.field.dim {
            bail!(ChaosError::DimensionMismatch {
                expected: self.field.dim,
                got: deviations.nrows(),
            });
        }
        if deviations.ncols() != self.field.k {
            bail!(ChaosError::DimensionMismatch {
                expected: self.field.k,
                got: deviations.ncols(),
            });
        }
        Ok(())
    }
}

fn join(u: &[f64], w: &DMatrix<f64>) -> Vec<f64> {
    let mut joint = vec![0.0; u.len() + w.len()];
    joint[..u.len()].copy_from_slice(u);
    write_row_major(&mut joint[u.len()..], w);
    joint
}

#[cfg(test)]
mod tests {
    use super::{random_orthonormal, Deviations, TangentIntegrator};
    use crate::error::ChaosError;
    use crate::jacobian::{Analytic, JacobianProvider};
    use crate::system::{DynamicalSystem, FnField};
    use crate::traits::VectorField;
    use crate::test_systems::{lorenz_system, Henon, Oscillator};
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn square_map() -> DynamicalSystem<
        FnField<impl Fn(f64, &[f64], &mut [f64])>,
        Analytic<impl Fn(f64, &[f64], &mut [f64])>,
    > {
        let field = FnField::new(1, |_t, x: &[f64], out: &mut [f64]| out[0] = x[0] * x[0]);
        DynamicalSystem::discrete(field, vec![3.0])
            .unwrap()
            .with_jacobian(|_t, x: &[f64], out: &mut [f64]| out[0] = 2.0 * x[0])
            .unwrap()
    }

    #[test]
    fn discrete_deviation_uses_jacobian_at_new_state() {
        let ds = square_map();
        let mut tangent = TangentIntegrator::new(&ds, 1, &Deviations::Identity, None, None).unwrap();
        tangent.step().unwrap();
        assert_eq!(tangent.state(), &[9.0]);
        // J(x_1) = 2 * 9, not J(x_0) = 2 * 3.
        assert_eq!(tangent.deviations()[(0, 0)], 18.0);
        tangent.step().unwrap();
        assert_eq!(tangent.state(), &[81.0]);
        assert_eq!(tangent.deviations()[(0, 0)], 18.0 * 162.0);
    }

    #[test]
    fn continuous_deviations_follow_linear_flow() {
        // For a linear system the deviation block evolves like the state.
        let ds = DynamicalSystem::continuous(Oscillator, vec![1.0, 0.0]).unwrap();
        let mut tangent = TangentIntegrator::new(&ds, 2, &Deviations::Identity, None, None).unwrap();
        tangent.step_for(1.0).unwrap();
        let w = tangent.deviations();
        let (c, s) = (1.0f64.cos(), 1.0f64.sin());
        assert_abs_diff_eq!(w[(0, 0)], c, epsilon = 1e-5);
        assert_abs_diff_eq!(w[(1, 0)], -s, epsilon = 1e-5);
        assert_abs_diff_eq!(w[(0, 1)], s, epsilon = 1e-5);
        assert_abs_diff_eq!(w[(1, 1)], c, epsilon = 1e-5);
        assert_abs_diff_eq!(tangent.state()[0], c, epsilon = 1e-5);
    }

    #[test]
    fn rejects_bad_deviation_counts_and_shapes() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        for k in [0, 3] {
            let err = TangentIntegrator::new(&ds, k, &Deviations::Identity, None, None)
                .err()
                .unwrap();
            assert!(matches!(
                err.downcast_ref::<ChaosError>(),
                Some(ChaosError::InvalidParameter(_))
            ));
        }
        let given = Deviations::Given(vec![vec![1.0, 0.0, 0.0]]);
        let err = TangentIntegrator::new(&ds, 1, &given, None, None).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ChaosError>(),
            Some(&ChaosError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn random_deviations_are_orthonormal_and_seeded() {
        let a = random_orthonormal(5, 3, &mut StdRng::seed_from_u64(7));
        let gram = a.transpose() * &a;
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(gram[(i, j)], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-12);
            }
        }
        let seeded = Deviations::Random { seed: Some(11) };
        assert_eq!(seeded.build(4, 2).unwrap(), seeded.build(4, 2).unwrap());
    }

    fn run<F: VectorField<f64>, J: JacobianProvider<F>>(
        tangent: &mut TangentIntegrator<'_, F, J>,
    ) -> Vec<(Vec<f64>, DMatrix<f64>)> {
        let mut states = Vec::new();
        for _ in 0..20 {
            tangent.step_for(0.1).unwrap();
            tangent.orthonormalize();
            states.push((tangent.state().to_vec(), tangent.deviations()));
        }
        states
    }

    #[test]
    fn reinit_is_idempotent_and_deterministic() {
        let ds = lorenz_system(vec![1.0, 1.0, 1.0]);
        let w0 = Deviations::Random { seed: Some(3) }.build(3, 3).unwrap();
        let u0 = [1.0, 1.0, 1.0];
        let mut tangent =
            TangentIntegrator::new(&ds, 3, &Deviations::from_matrix(&w0), None, None).unwrap();

        let first = run(&mut tangent);
        tangent.reinit(&u0, 0.0, &w0).unwrap();
        tangent.reinit(&u0, 0.0, &w0).unwrap();
        let second = run(&mut tangent);
        assert_eq!(first, second);

        let wrong: DMatrix<f64> = DMatrix::identity(3, 2);
        assert!(tangent.reinit(&u0, 0.0, &wrong).is_err());
    }

    #[test]
    fn orthonormalize_returns_growth_and_resets_block() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.1, 0.1]).unwrap();
        let mut tangent = TangentIntegrator::new(&ds, 2, &Deviations::Identity, None, None).unwrap();
        tangent.step_for(5.0).unwrap();
        let before = tangent.deviations();
        let r = tangent.orthonormalize();
        // |det W| is preserved by the growth factors; Hénon contracts areas by b^n.
        assert_abs_diff_eq!(r.iter().product::<f64>(), before.determinant().abs(), epsilon = 1e-12);
        assert_abs_diff_eq!(r.iter().product::<f64>(), 0.3f64.powi(5), epsilon = 1e-12);
        let q = tangent.deviations();
        assert_abs_diff_eq!((q.transpose() * &q - DMatrix::identity(2, 2)).norm(), 0.0, epsilon = 1e-12);
    }
}
