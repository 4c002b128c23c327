use crate::error::ChaosError;
use crate::integrator::{check_step, check_transient, warm_up, BaseIntegrator, ParallelIntegrator};
use crate::jacobian::JacobianProvider;
use crate::system::{DynamicalSystem, TimeMode};
use crate::tangent::{Deviations, TangentIntegrator};
use crate::traits::VectorField;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Parameters of the QR-based spectrum estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumSettings {
    /// Number of exponents to compute; `None` means the full spectrum.
    pub k: Option<usize>,
    /// Time between orthonormalizations (whole iterations for maps).
    pub dt: f64,
    pub transient: f64,
    pub deviations: Deviations,
}

impl Default for SpectrumSettings {
    fn default() -> Self {
        Self {
            k: None,
            dt: 1.0,
            transient: 0.0,
            deviations: Deviations::Identity,
        }
    }
}

impl SpectrumSettings {
    /// Checks the settings against `system` and returns the number of exponents.
    pub fn validate<F, J>(&self, system: &DynamicalSystem<F, J>) -> Result<usize>
    where
        F: VectorField<f64>,
    {
        let dim = system.dimension();
        let k = self.k.or(self.deviations.count()).unwrap_or(dim);
        if k == 0 || k > dim {
            bail!(ChaosError::invalid(format!(
                "Number of exponents must be in 1..={dim}, got {k}."
            )));
        }
        check_step(system.is_discrete(), self.dt)?;
        check_transient(system.is_discrete(), self.transient)?;
        Ok(k)
    }
}

/// Lyapunov spectrum by repeated QR orthonormalization of the tangent block.
///
/// After the transient, the tangent integrator is advanced `n` times by `dt`;
/// after each advance the logs of the diagonal of `R` are accumulated. The
/// result is divided by the elapsed time `n·dt` and is not re-sorted.
pub fn lyapunov_spectrum<F, J>(
    system: &DynamicalSystem<F, J>,
    n: usize,
    settings: &SpectrumSettings,
) -> Result<Vec<f64>>
where
    F: VectorField<f64>,
    J: JacobianProvider<F>,
{
    let k = settings.validate(system)?;
    if n == 0 {
        bail!(ChaosError::invalid(
            "Lyapunov computation requires at least one integration step."
        ));
    }
    tracing::debug!(n, k, dt = settings.dt, "computing Lyapunov spectrum");

    let (u0, t0) = warm_up(system, system.state(), settings.transient)
        .context("Transient before the spectrum computation failed.")?;
    let mut tangent = TangentIntegrator::new(system, k, &settings.deviations, Some(&u0), Some(t0))?;
    // Caller-supplied vectors need not be orthonormal.
    tangent.orthonormalize();

    let mut sums = vec![0.0; k];
    for _ in 0..n {
        tangent.step_for(settings.dt)?;
        let growth = tangent.orthonormalize();
        for (sum, r) in sums.iter_mut().zip(growth.iter()) {
            *sum += r.ln();
        }
    }

    let elapsed = n as f64 * settings.dt;
    for sum in sums.iter_mut() {
        *sum /= elapsed;
    }
    tracing::debug!(exponents = ?sums, "Lyapunov spectrum done");
    Ok(sums)
}

/// Parameters of Benettin's two-trajectory method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaxLyapunovSettings {
    /// Initial and post-rescale separation.
    pub d0: f64,
    /// Separation above which the test trajectory is pulled back to `d0`.
    pub threshold: f64,
    /// Separation below which the test trajectory is pushed back to `d0`.
    pub lower_threshold: f64,
    /// Interval between separation checks (whole iterations for maps).
    pub dt: f64,
    pub transient: f64,
    /// Ensemble members whose state norm exceeds this are dropped.
    pub inftol: f64,
}

impl Default for MaxLyapunovSettings {
    fn default() -> Self {
        Self {
            d0: 1e-9,
            threshold: 1e-6,
            lower_threshold: 1e-12,
            dt: 1.0,
            transient: 0.0,
            inftol: f64::INFINITY,
        }
    }
}

impl MaxLyapunovSettings {
    pub fn validate(&self, is_discrete: bool) -> Result<()> {
        if !(self.d0 > 0.0) || !self.d0.is_finite() {
            bail!(ChaosError::invalid("d0 must be positive and finite."));
        }
        if self.threshold <= self.d0 {
            bail!(ChaosError::invalid(format!(
                "threshold ({}) must be larger than d0 ({}).",
                self.threshold, self.d0
            )));
        }
        if !(self.lower_threshold >= 0.0) || self.lower_threshold >= self.d0 {
            bail!(ChaosError::invalid(format!(
                "lower_threshold ({}) must be non-negative and smaller than d0 ({}).",
                self.lower_threshold, self.d0
            )));
        }
        if !(self.inftol > 0.0) {
            bail!(ChaosError::invalid("inftol must be positive."));
        }
        check_step(is_discrete, self.dt)?;
        check_transient(is_discrete, self.transient)
    }
}

/// Running estimate of the maximum exponent recorded at every rescaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyapunovConvergence {
    pub exponent: f64,
    pub estimates: Vec<f64>,
    /// Elapsed time (since the end of the transient) of each estimate.
    pub times: Vec<f64>,
}

/// Places the test trajectory at distance `d0` by offsetting every
/// coordinate by `d0/√D`.
pub fn default_inittest(state: &[f64], d0: f64) -> Vec<f64> {
    let offset = d0 / (state.len() as f64).sqrt();
    state.iter().map(|x| x + offset).collect()
}

/// Maximum Lyapunov exponent over total time `total` by Benettin's method.
pub fn max_lyapunov<F: VectorField<f64>, J>(
    system: &DynamicalSystem<F, J>,
    total: f64,
    settings: &MaxLyapunovSettings,
) -> Result<f64> {
    max_lyapunov_with(system, total, settings, default_inittest)
}

/// Like [`max_lyapunov`], with a caller-chosen placement of the test
/// trajectory, e.g. to keep it on an energy shell.
pub fn max_lyapunov_with<F, J, I>(
    system: &DynamicalSystem<F, J>,
    total: f64,
    settings: &MaxLyapunovSettings,
    inittest: I,
) -> Result<f64>
where
    F: VectorField<f64>,
    I: Fn(&[f64], f64) -> Vec<f64>,
{
    let mut pair = Benettin::new(system, total, settings)?;
    let (u0, t0) = warm_up(system, system.state(), settings.transient)?;
    let outcome = pair.run(&u0, t0, &inittest, None, false)?;
    Ok(outcome.unwrap_or(f64::NAN))
}

/// [`max_lyapunov`] together with the running estimate recorded at every
/// rescaling event.
pub fn max_lyapunov_convergence<F: VectorField<f64>, J>(
    system: &DynamicalSystem<F, J>,
    total: f64,
    settings: &MaxLyapunovSettings,
) -> Result<LyapunovConvergence> {
    let mut pair = Benettin::new(system, total, settings)?;
    let (u0, t0) = warm_up(system, system.state(), settings.transient)?;
    let mut trace = LyapunovConvergence {
        exponent: f64::NAN,
        estimates: Vec::new(),
        times: Vec::new(),
    };
    if let Some(exponent) = pair.run(&u0, t0, &default_inittest, Some(&mut trace), false)? {
        trace.exponent = exponent;
    }
    Ok(trace)
}

/// Maximum exponent for each of several initial conditions, reusing one pair
/// of trajectories. A member whose state norm exceeds `inftol`, or whose flow
/// the solver cannot follow, yields `None`; the rest of the batch continues.
pub fn max_lyapunov_ensemble<F: VectorField<f64>, J>(
    system: &DynamicalSystem<F, J>,
    initial_conditions: &[Vec<f64>],
    total: f64,
    settings: &MaxLyapunovSettings,
) -> Result<Vec<Option<f64>>> {
    for u in initial_conditions {
        system.check_state(u)?;
    }
    let mut pair = Benettin::new(system, total, settings)?;
    let mut warm = BaseIntegrator::new(system, None, None)?;
    let t0 = system.initial_time();

    let mut exponents = Vec::with_capacity(initial_conditions.len());
    for (index, u) in initial_conditions.iter().enumerate() {
        warm.reinit(u, t0)?;
        let warmed = if settings.transient > 0.0 {
            escape_on_failure(warm.step_for(settings.transient))?
        } else {
            Some(())
        };
        let result = match warmed {
            Some(()) if !escaped(warm.state(), settings.inftol) => {
                let start = warm.state().to_vec();
                escape_on_failure(pair.run(&start, warm.time(), &default_inittest, None, true))?
                    .flatten()
            }
            _ => None,
        };
        if result.is_none() {
            tracing::debug!(index, "initial condition escaped");
        }
        exponents.push(result);
    }
    Ok(exponents)
}

/// Turns a solver failure into `None`; other errors still propagate.
fn escape_on_failure<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err)
            if matches!(
                err.downcast_ref::<ChaosError>(),
                Some(ChaosError::SolverFailure { .. })
            ) =>
        {
            tracing::debug!(%err, "solver failure treated as escape");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn escaped(u: &[f64], inftol: f64) -> bool {
    let norm = u.iter().map(|x| x * x).sum::<f64>().sqrt();
    !norm.is_finite() || norm > inftol
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Whether an adaptive solver's tolerances are too loose to resolve a
/// separation of `d0`. Maps and fixed-step flows never are.
fn tolerances_too_coarse(mode: &TimeMode, d0: f64) -> bool {
    match mode {
        TimeMode::Continuous(solver) => {
            let limit = d0 / 10.0;
            solver.adaptive && (solver.abstol > limit || solver.reltol > limit)
        }
        TimeMode::Discrete => false,
    }
}

/// Reference and test trajectory evolved together.
struct Benettin<'a, F, J> {
    pair: ParallelIntegrator<'a, F, J>,
    settings: MaxLyapunovSettings,
    chunks: usize,
    test: Vec<f64>,
}

impl<'a, F: VectorField<f64>, J> Benettin<'a, F, J> {
    fn new(
        system: &'a DynamicalSystem<F, J>,
        total: f64,
        settings: &MaxLyapunovSettings,
    ) -> Result<Self> {
        settings.validate(system.is_discrete())?;
        if !(total > 0.0) || !total.is_finite() {
            bail!(ChaosError::invalid("Total time T must be positive."));
        }
        let chunks = (total / settings.dt + 1e-9).floor() as usize;
        if chunks == 0 {
            bail!(ChaosError::invalid(format!(
                "Total time T = {total} is shorter than dt = {}.",
                settings.dt
            )));
        }

        if tolerances_too_coarse(system.time_mode(), settings.d0) {
            tracing::warn!(
                d0 = settings.d0,
                "solver tolerances are coarser than d0/10; the separation is not resolved"
            );
        }

        let u = system.state().to_vec();
        let pair = ParallelIntegrator::new(system, &[u.clone(), u.clone()], None)?;
        Ok(Self {
            pair,
            settings: *settings,
            chunks,
            test: u,
        })
    }

    /// Returns `None` only when `check_escape` is set and the reference
    /// trajectory escaped.
    fn run<I>(
        &mut self,
        u0: &[f64],
        t0: f64,
        inittest: &I,
        mut trace: Option<&mut LyapunovConvergence>,
        check_escape: bool,
    ) -> Result<Option<f64>>
    where
        I: Fn(&[f64], f64) -> Vec<f64>,
    {
        let MaxLyapunovSettings {
            d0,
            threshold,
            lower_threshold,
            dt,
            ..
        } = self.settings;
        tracing::debug!(d0, threshold, dt, chunks = self.chunks, "computing maximum Lyapunov exponent");

        let test = inittest(u0, d0);
        self.pair.reinit(&[u0.to_vec(), test], t0)?;

        let mut sum = 0.0;
        let mut elapsed = 0.0;
        for chunk in 1..=self.chunks {
            self.pair.step_for(dt)?;
            elapsed = chunk as f64 * dt;
            if check_escape && escaped(self.pair.state(0), self.settings.inftol) {
                return Ok(None);
            }

            let dist = distance(self.pair.state(0), self.pair.state(1));
            if dist <= threshold && dist >= lower_threshold {
                continue;
            }
            if dist == 0.0 {
                // Trajectories merged; no direction left to rescale along.
                let fresh = inittest(self.pair.state(0), d0);
                self.pair.set_state(1, &fresh)?;
                continue;
            }

            let a = dist / d0;
            sum += a.ln();
            tracing::trace!(elapsed, factor = a, "rescaling test trajectory");
            if let Some(trace) = trace.as_deref_mut() {
                trace.estimates.push(sum / elapsed);
                trace.times.push(elapsed);
            }
            let given = self.pair.state(0);
            for ((t, g), x) in self.test.iter_mut().zip(given).zip(self.pair.state(1)) {
                *t = g + (x - g) / a;
            }
            self.pair.set_state(1, &self.test)?;
        }

        let exponent = sum / elapsed;
        tracing::debug!(exponent, "maximum Lyapunov exponent done");
        Ok(Some(exponent))
    }
}

/// Kaplan–Yorke (Lyapunov) dimension of a spectrum.
pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    let mut sorted = exponents.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut partial = 0.0;
    for (j, &lambda) in sorted.iter().enumerate() {
        if partial + lambda < 0.0 {
            if lambda.abs() <= f64::EPSILON {
                return j as f64;
            }
            return j as f64 + partial / lambda.abs();
        }
        partial += lambda;
    }
    sorted.len() as f64
}
