//! Generalized alignment index.
//!
//! `GALI_k` is the product of the singular values of the `D×k` block of unit
//! deviation vectors, i.e. the `k`-volume they span. Chaotic orbits drive it
//! to zero exponentially; regular orbits keep it constant or let it decay as
//! a power law.

use crate::error::ChaosError;
use crate::integrator::{check_step, check_transient, warm_up};
use crate::jacobian::JacobianProvider;
use crate::orthonormal::singular_value_product;
use crate::system::DynamicalSystem;
use crate::tangent::{Deviations, TangentIntegrator};
use crate::traits::VectorField;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaliSettings {
    /// Sampling interval (whole iterations for maps).
    pub dt: f64,
    /// The computation stops once the index drops below this value.
    pub threshold: f64,
    pub transient: f64,
    pub deviations: Deviations,
}

impl Default for GaliSettings {
    fn default() -> Self {
        Self {
            dt: 1.0,
            threshold: 1e-12,
            transient: 0.0,
            deviations: Deviations::Random { seed: None },
        }
    }
}

impl GaliSettings {
    pub fn validate(&self, is_discrete: bool) -> Result<()> {
        if !(self.threshold >= 0.0) {
            bail!(ChaosError::invalid("GALI threshold must be non-negative."));
        }
        check_step(is_discrete, self.dt)?;
        check_transient(is_discrete, self.transient)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaliTrace {
    pub values: Vec<f64>,
    pub times: Vec<f64>,
}

/// `GALI_k` sampled every `dt` from the end of the transient up to `t_max`
/// later, or until it falls below `settings.threshold`.
///
/// The trace starts with the value of the initial deviation block.
pub fn gali<F, J>(
    system: &DynamicalSystem<F, J>,
    k: usize,
    t_max: f64,
    settings: &GaliSettings,
) -> Result<GaliTrace>
where
    F: VectorField<f64>,
    J: JacobianProvider<F>,
{
    let dim = system.dimension();
    if k < 2 || k > dim {
        bail!(ChaosError::invalid(format!(
            "GALI order must be in 2..={dim}, got {k}."
        )));
    }
    settings.validate(system.is_discrete())?;
    if !(t_max >= 0.0) || !t_max.is_finite() {
        bail!(ChaosError::invalid("t_max must be non-negative."));
    }
    tracing::debug!(k, t_max, dt = settings.dt, "computing GALI");

    let (u0, t0) = warm_up(system, system.state(), settings.transient)?;
    let mut tangent = TangentIntegrator::new(system, k, &settings.deviations, Some(&u0), Some(t0))?;
    tangent.normalize_deviations();

    let samples = (t_max / settings.dt + 1e-9).floor() as usize;
    let mut values = Vec::with_capacity(samples + 1);
    let mut times = Vec::with_capacity(samples + 1);
    values.push(singular_value_product(&tangent.deviations()));
    times.push(t0);

    for _ in 0..samples {
        if values.last().is_some_and(|&g| g < settings.threshold) {
            break;
        }
        tangent.step_for(settings.dt)?;
        tangent.normalize_deviations();
        values.push(singular_value_product(&tangent.deviations()));
        times.push(tangent.time());
    }

    tracing::debug!(
        samples = values.len(),
        last = values.last().copied().unwrap_or(f64::NAN),
        "GALI done"
    );
    Ok(GaliTrace { values, times })
}

#[cfg(test)]
mod tests {
    use super::{gali, GaliSettings};
    use crate::error::ChaosError;
    use crate::lyapunov::{lyapunov_spectrum, SpectrumSettings};
    use crate::ode::SolverSettings;
    use crate::system::DynamicalSystem;
    use crate::tangent::Deviations;
    use crate::test_systems::{cat_map, pendulum_system, Henon};
    use approx::assert_relative_eq;

    /// Least-squares slope of `y` against `x`.
    fn slope(x: &[f64], y: &[f64]) -> f64 {
        let n = x.len() as f64;
        let mx = x.iter().sum::<f64>() / n;
        let my = y.iter().sum::<f64>() / n;
        let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
        let sxx: f64 = x.iter().map(|a| (a - mx) * (a - mx)).sum();
        sxy / sxx
    }

    #[test]
    fn chaotic_map_decays_at_spectrum_gap() {
        let ds = cat_map();
        let settings = GaliSettings {
            deviations: Deviations::Random { seed: Some(5) },
            ..GaliSettings::default()
        };
        let trace = gali(&ds, 2, 100.0, &settings).unwrap();
        assert!(*trace.values.last().unwrap() < settings.threshold);
        assert!(trace.times.len() < 101);

        let spectrum = lyapunov_spectrum(&ds, 1000, &SpectrumSettings::default()).unwrap();
        let gap = spectrum[0] - spectrum[1];

        let (t, log_g): (Vec<f64>, Vec<f64>) = trace
            .times
            .iter()
            .zip(&trace.values)
            .filter(|&(&t, _)| t >= 3.0)
            .map(|(&t, &g)| (t, g.ln()))
            .unzip();
        assert_relative_eq!(-slope(&t, &log_g), gap, max_relative = 0.1);
    }

    #[test]
    fn regular_orbit_decays_as_power_law() {
        let tight = SolverSettings {
            abstol: 1e-10,
            reltol: 1e-10,
            ..SolverSettings::default()
        };
        let ds = pendulum_system(vec![1.0, 0.0]).with_solver(tight).unwrap();
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let settings = GaliSettings {
            deviations: Deviations::Given(vec![vec![s, s], vec![s, -s]]),
            ..GaliSettings::default()
        };
        let trace = gali(&ds, 2, 1000.0, &settings).unwrap();
        assert_eq!(trace.values.len(), 1001);
        assert_relative_eq!(trace.values[0], 1.0, max_relative = 1e-12);

        let (log_t, log_g): (Vec<f64>, Vec<f64>) = trace
            .times
            .iter()
            .zip(&trace.values)
            .filter(|&(&t, _)| t >= 100.0)
            .map(|(&t, &g)| (t.ln(), g.ln()))
            .unzip();
        let p = slope(&log_t, &log_g);
        assert!((p + 2.0).abs() < 0.3, "fitted exponent {p}");
    }

    #[test]
    fn trace_starts_at_the_initial_block() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        let settings = GaliSettings {
            deviations: Deviations::Identity,
            transient: 10.0,
            ..GaliSettings::default()
        };
        let trace = gali(&ds, 2, 5.0, &settings).unwrap();
        assert_eq!(trace.times, vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);
        assert_relative_eq!(trace.values[0], 1.0, max_relative = 1e-12);
        assert!(trace.values.iter().all(|&g| (0.0..=1.0 + 1e-12).contains(&g)));
    }

    #[test]
    fn order_must_be_between_two_and_dimension() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        for k in [0, 1, 3] {
            let err = gali(&ds, k, 10.0, &GaliSettings::default()).err().unwrap();
            assert!(matches!(
                err.downcast_ref::<ChaosError>(),
                Some(ChaosError::InvalidParameter(_))
            ));
        }
    }
}
