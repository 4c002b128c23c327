use crate::error::ChaosError;
use crate::jacobian::{Analytic, FiniteDifference, ForwardDiff, JacobianProvider};
use crate::ode::SolverSettings;
use crate::traits::VectorField;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TimeMode {
    /// Iterated map; time counts iterations.
    Discrete,
    /// Flow integrated by [`crate::ode::OdeSolver`] with these settings.
    Continuous(SolverSettings),
}

/// Adapts a plain closure `f(t, x, out)` into a [`VectorField`].
pub struct FnField<G> {
    dimension: usize,
    f: G,
}

impl<G> FnField<G>
where
    G: Fn(f64, &[f64], &mut [f64]),
{
    pub fn new(dimension: usize, f: G) -> Self {
        Self { dimension, f }
    }
}

impl<G> VectorField<f64> for FnField<G>
where
    G: Fn(f64, &[f64], &mut [f64]),
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        (self.f)(t, x, out)
    }
}

/// Immutable description of a dynamical system: initial condition, vector
/// field, Jacobian strategy and time mode.
///
/// Nothing here is mutated by the estimators. Integrators copy the initial
/// state in and evolve their own buffers.
pub struct DynamicalSystem<F, J = ForwardDiff> {
    field: F,
    jacobian: J,
    state: Vec<f64>,
    t0: f64,
    time_mode: TimeMode,
}

impl<F: VectorField<f64>> DynamicalSystem<F, ForwardDiff> {
    /// A map `x_{n+1} = f(x_n, n)` with a forward-mode Jacobian.
    pub fn discrete(field: F, u0: Vec<f64>) -> Result<Self> {
        Self::build(field, u0, TimeMode::Discrete)
    }

    /// A flow `dx/dt = f(x, t)` with a forward-mode Jacobian and the default
    /// solver configuration (adaptive Tsit5).
    pub fn continuous(field: F, u0: Vec<f64>) -> Result<Self> {
        Self::build(field, u0, TimeMode::Continuous(SolverSettings::default()))
    }

    fn build(field: F, u0: Vec<f64>, time_mode: TimeMode) -> Result<Self> {
        let dim = field.dimension();
        if dim == 0 {
            bail!(ChaosError::invalid("System has zero dimension."));
        }
        if u0.len() != dim {
            bail!(ChaosError::DimensionMismatch {
                expected: dim,
                got: u0.len(),
            });
        }
        if let TimeMode::Continuous(settings) = &time_mode {
            settings.validate()?;
        }

        let mut trial = vec![0.0; dim];
        field.apply(0.0, &u0, &mut trial);
        if u0.iter().all(|v| v.is_finite()) && trial.iter().any(|v| !v.is_finite()) {
            bail!(ChaosError::invalid(
                "Vector field is not finite at the initial state."
            ));
        }

        Ok(Self {
            field,
            jacobian: ForwardDiff,
            state: u0,
            t0: 0.0,
            time_mode,
        })
    }
}

impl<F: VectorField<f64>, J> DynamicalSystem<F, J> {
    /// Replaces the Jacobian strategy with a closed-form `jac(t, x, out)`
    /// writing a row-major `D×D` matrix.
    pub fn with_jacobian<G>(self, jac: G) -> Result<DynamicalSystem<F, Analytic<G>>>
    where
        G: Fn(f64, &[f64], &mut [f64]),
    {
        let dim = self.dimension();
        let mut trial = vec![0.0; dim * dim];
        jac(self.t0, &self.state, &mut trial);
        if self.state.iter().all(|v| v.is_finite()) && trial.iter().any(|v| !v.is_finite()) {
            bail!(ChaosError::invalid(
                "Jacobian is not finite at the initial state."
            ));
        }
        Ok(self.replace_jacobian(Analytic(jac)))
    }

    pub fn with_finite_differences(self) -> DynamicalSystem<F, FiniteDifference> {
        self.replace_jacobian(FiniteDifference::default())
    }

    fn replace_jacobian<K>(self, jacobian: K) -> DynamicalSystem<F, K> {
        DynamicalSystem {
            field: self.field,
            jacobian,
            state: self.state,
            t0: self.t0,
            time_mode: self.time_mode,
        }
    }

    pub fn with_solver(mut self, settings: SolverSettings) -> Result<Self> {
        match self.time_mode {
            TimeMode::Discrete => bail!(ChaosError::invalid(
                "Solver settings only apply to continuous systems."
            )),
            TimeMode::Continuous(_) => {
                settings.validate()?;
                self.time_mode = TimeMode::Continuous(settings);
                Ok(self)
            }
        }
    }

    pub fn with_time(mut self, t0: f64) -> Self {
        self.t0 = t0;
        self
    }

    pub fn dimension(&self) -> usize {
        self.state.len()
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn initial_time(&self) -> f64 {
        self.t0
    }

    pub fn time_mode(&self) -> &TimeMode {
        &self.time_mode
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self.time_mode, TimeMode::Discrete)
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    /// Parameters live on the field; adjust them between estimator calls.
    pub fn field_mut(&mut self) -> &mut F {
        &mut self.field
    }

    pub fn jacobian_provider(&self) -> &J {
        &self.jacobian
    }

    /// Evaluates the vector field (or map) at `x`.
    pub fn evaluate(&self, t: f64, x: &[f64], out: &mut [f64]) {
        self.field.apply(t, x, out)
    }

    /// Checks that `u` is a valid state for this system.
    pub fn check_state(&self, u: &[f64]) -> Result<()> {
        if u.len() != self.dimension() {
            bail!(ChaosError::DimensionMismatch {
                expected: self.dimension(),
                got: u.len(),
            });
        }
        Ok(())
    }
}

impl<F: VectorField<f64>, J: JacobianProvider<F>> DynamicalSystem<F, J> {
    /// Row-major `D×D` Jacobian at `x`.
    pub fn jacobian(&self, t: f64, x: &[f64], out: &mut [f64]) {
        self.jacobian.jacobian(&self.field, t, x, out)
    }
}
