//! Integrators that evolve copies of a system's state.
//!
//! Every integrator wraps an [`Engine`]: direct iteration for maps, an
//! [`OdeSolver`] for flows. Construction allocates; `reinit` does not.

use crate::error::ChaosError;
use crate::ode::OdeSolver;
use crate::solvers::DiscreteMap;
use crate::system::{DynamicalSystem, TimeMode};
use crate::traits::{Steppable, VectorField};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub(crate) enum Engine {
    Discrete {
        stepper: DiscreteMap<f64>,
        t: f64,
        u: Vec<f64>,
    },
    Continuous(OdeSolver),
}

impl Engine {
    pub(crate) fn new(mode: &TimeMode, t0: f64, u0: &[f64]) -> Result<Self> {
        Ok(match mode {
            TimeMode::Discrete => Engine::Discrete {
                stepper: DiscreteMap::new(u0.len()),
                t: t0,
                u: u0.to_vec(),
            },
            TimeMode::Continuous(settings) => Engine::Continuous(OdeSolver::new(*settings, t0, u0)?),
        })
    }

    pub(crate) fn step<G: VectorField<f64>>(&mut self, field: &G) -> Result<()> {
        match self {
            Engine::Discrete { stepper, t, u } => {
                stepper.step(field, t, u, 1.0);
                Ok(())
            }
            Engine::Continuous(solver) => solver.step(field),
        }
    }

    pub(crate) fn step_for<G: VectorField<f64>>(&mut self, field: &G, dt: f64) -> Result<()> {
        match self {
            Engine::Discrete { stepper, t, u } => {
                for _ in 0..iterations(dt, "dt")? {
                    stepper.step(field, t, u, 1.0);
                }
                Ok(())
            }
            Engine::Continuous(solver) => {
                if !(dt > 0.0) || !dt.is_finite() {
                    bail!(ChaosError::invalid(format!(
                        "Time step must be positive and finite, got {dt}."
                    )));
                }
                let target = solver.time() + dt;
                solver.step_until(field, target)
            }
        }
    }

    pub(crate) fn reinit(&mut self, u0: &[f64], t0: f64) -> Result<()> {
        match self {
            Engine::Discrete { t, u, .. } => {
                if u0.len() != u.len() {
                    bail!(ChaosError::DimensionMismatch {
                        expected: u.len(),
                        got: u0.len(),
                    });
                }
                u.copy_from_slice(u0);
                *t = t0;
                Ok(())
            }
            Engine::Continuous(solver) => solver.reinit(u0, t0),
        }
    }

    pub(crate) fn interpolate<G: VectorField<f64>>(
        &self,
        field: &G,
        t: f64,
        out: &mut [f64],
    ) -> Result<()> {
        match self {
            Engine::Discrete { t: now, u, .. } => {
                if t != *now {
                    bail!(ChaosError::invalid(
                        "Discrete systems have no states between iterations."
                    ));
                }
                out.copy_from_slice(u);
                Ok(())
            }
            Engine::Continuous(solver) => solver.interpolate(field, t, out),
        }
    }

    pub(crate) fn time(&self) -> f64 {
        match self {
            Engine::Discrete { t, .. } => *t,
            Engine::Continuous(solver) => solver.time(),
        }
    }

    pub(crate) fn state(&self) -> &[f64] {
        match self {
            Engine::Discrete { u, .. } => u.as_slice(),
            Engine::Continuous(solver) => solver.state(),
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut [f64] {
        match self {
            Engine::Discrete { u, .. } => u.as_mut_slice(),
            Engine::Continuous(solver) => solver.state_mut(),
        }
    }
}

/// Converts a duration on a map into an iteration count.
pub(crate) fn iterations(value: f64, name: &str) -> Result<usize> {
    if !(value >= 0.0) || !value.is_finite() || value.fract() != 0.0 {
        bail!(ChaosError::invalid(format!(
            "{name} must be a non-negative whole number of iterations for discrete systems, got {value}."
        )));
    }
    Ok(value as usize)
}

/// Checks a time step for either time mode.
pub(crate) fn check_step(is_discrete: bool, dt: f64) -> Result<()> {
    if is_discrete {
        if iterations(dt, "dt")? == 0 {
            bail!(ChaosError::invalid("dt must be at least one iteration."));
        }
    } else if !(dt > 0.0) || !dt.is_finite() {
        bail!(ChaosError::invalid("Step size dt must be positive."));
    }
    Ok(())
}

/// Checks a transient duration for either time mode.
pub(crate) fn check_transient(is_discrete: bool, transient: f64) -> Result<()> {
    if is_discrete {
        iterations(transient, "transient")?;
    } else if !(transient >= 0.0) || !transient.is_finite() {
        bail!(ChaosError::invalid("transient must be non-negative."));
    }
    Ok(())
}

/// Evolves a single state of a system.
pub struct BaseIntegrator<'a, F, J> {
    system: &'a DynamicalSystem<F, J>,
    engine: Engine,
}

impl<'a, F: VectorField<f64>, J> BaseIntegrator<'a, F, J> {
    /// Starts from `u0` (default: the system's state) at `t0` (default: the
    /// system's initial time).
    pub fn new(system: &'a DynamicalSystem<F, J>, u0: Option<&[f64]>, t0: Option<f64>) -> Result<Self> {
        let u0 = u0.unwrap_or(system.state());
        system.check_state(u0)?;
        let t0 = t0.unwrap_or(system.initial_time());
        Ok(Self {
            system,
            engine: Engine::new(system.time_mode(), t0, u0)?,
        })
    }

    /// One iteration (maps) or one internal solver step (flows).
    pub fn step(&mut self) -> Result<()> {
        self.engine.step(self.system.field())
    }

    /// Advances by exactly `dt` (a whole number of iterations for maps).
    pub fn step_for(&mut self, dt: f64) -> Result<()> {
        self.engine.step_for(self.system.field(), dt)
    }

    pub fn reinit(&mut self, u: &[f64], t0: f64) -> Result<()> {
        self.engine.reinit(u, t0)
    }

    /// Dense output inside the last internal step of a flow.
    pub fn interpolate(&self, t: f64, out: &mut [f64]) -> Result<()> {
        self.engine.interpolate(self.system.field(), t, out)
    }

    pub fn state(&self) -> &[f64] {
        self.engine.state()
    }

    pub fn time(&self) -> f64 {
        self.engine.time()
    }
}

/// Runs the system forward for `transient` and returns the reached state and time.
pub(crate) fn warm_up<F: VectorField<f64>, J>(
    system: &DynamicalSystem<F, J>,
    u0: &[f64],
    transient: f64,
) -> Result<(Vec<f64>, f64)> {
    let mut integrator = BaseIntegrator::new(system, Some(u0), None)?;
    if transient > 0.0 {
        integrator.step_for(transient)?;
    }
    Ok((integrator.state().to_vec(), integrator.time()))
}

/// `count` copies of a field acting on consecutive blocks of one flat state.
struct ParallelField<'a, F> {
    field: &'a F,
    dim: usize,
    count: usize,
}

impl<F: VectorField<f64>> VectorField<f64> for ParallelField<'_, F> {
    fn dimension(&self) -> usize {
        self.dim * self.count
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        for (xs, os) in x.chunks_exact(self.dim).zip(out.chunks_exact_mut(self.dim)) {
            self.field.apply(t, xs, os);
        }
    }
}

/// Evolves several states of one system in lockstep, sharing a single solver
/// (and therefore a single step-size sequence).
pub struct ParallelIntegrator<'a, F, J> {
    system: &'a DynamicalSystem<F, J>,
    field: ParallelField<'a, F>,
    engine: Engine,
}

impl<'a, F: VectorField<f64>, J> ParallelIntegrator<'a, F, J> {
    pub fn new(system: &'a DynamicalSystem<F, J>, states: &[Vec<f64>], t0: Option<f64>) -> Result<Self> {
        if states.is_empty() {
            bail!(ChaosError::invalid("At least one state is required."));
        }
        let joint = Self::join(system, states)?;
        let t0 = t0.unwrap_or(system.initial_time());
        Ok(Self {
            system,
            field: ParallelField {
                field: system.field(),
                dim: system.dimension(),
                count: states.len(),
            },
            engine: Engine::new(system.time_mode(), t0, &joint)?,
        })
    }

    fn join(system: &DynamicalSystem<F, J>, states: &[Vec<f64>]) -> Result<Vec<f64>> {
        let mut joint = Vec::with_capacity(states.len() * system.dimension());
        for state in states {
            system.check_state(state)?;
            joint.extend_from_slice(state);
        }
        Ok(joint)
    }

    pub fn len(&self) -> usize {
        self.field.count
    }

    pub fn is_empty(&self) -> bool {
        self.field.count == 0
    }

    pub fn step(&mut self) -> Result<()> {
        self.engine.step(&self.field)
    }

    pub fn step_for(&mut self, dt: f64) -> Result<()> {
        self.engine.step_for(&self.field, dt)
    }

    pub fn reinit(&mut self, states: &[Vec<f64>], t0: f64) -> Result<()> {
        if states.len() != self.field.count {
            bail!(ChaosError::DimensionMismatch {
                expected: self.field.count,
                got: states.len(),
            });
        }
        let joint = Self::join(self.system, states)?;
        self.engine.reinit(&joint, t0)
    }

    /// Current state of member `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn state(&self, index: usize) -> &[f64] {
        assert!(
            index < self.field.count,
            "State index {index} out of range for {} states.",
            self.field.count
        );
        let dim = self.field.dim;
        &self.engine.state()[index * dim..(index + 1) * dim]
    }

    /// Overwrites one member in place; the others are untouched.
    pub fn set_state(&mut self, index: usize, u: &[f64]) -> Result<()> {
        let dim = self.field.dim;
        if index >= self.field.count {
            bail!(ChaosError::invalid(format!(
                "State index {index} out of range for {} states.",
                self.field.count
            )));
        }
        self.system.check_state(u)?;
        self.engine.state_mut()[index * dim..(index + 1) * dim].copy_from_slice(u);
        Ok(())
    }

    pub fn time(&self) -> f64 {
        self.engine.time()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrajectorySettings {
    /// Sampling interval (whole iterations for maps).
    pub dt: f64,
    /// Evolution discarded before sampling starts.
    pub transient: f64,
}

impl Default for TrajectorySettings {
    fn default() -> Self {
        Self {
            dt: 1.0,
            transient: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
}

/// Samples the orbit of the system's initial state every `dt` for `total`
/// time after the transient. Flows are sampled through dense output, so the
/// solver keeps its own step sequence.
pub fn trajectory<F: VectorField<f64>, J>(
    system: &DynamicalSystem<F, J>,
    total: f64,
    settings: &TrajectorySettings,
) -> Result<Trajectory> {
    let discrete = system.is_discrete();
    check_step(discrete, settings.dt)?;
    check_transient(discrete, settings.transient)?;
    if !(total >= 0.0) || !total.is_finite() {
        bail!(ChaosError::invalid("Total time must be non-negative."));
    }

    let (u0, t0) = warm_up(system, system.state(), settings.transient)?;
    let samples = (total / settings.dt + 1e-9).floor() as usize;
    let mut integrator = BaseIntegrator::new(system, Some(&u0), Some(t0))?;
    let mut times = Vec::with_capacity(samples + 1);
    let mut states = Vec::with_capacity(samples + 1);
    times.push(t0);
    states.push(u0);

    let dim = system.dimension();
    for i in 1..=samples {
        let target = t0 + i as f64 * settings.dt;
        if discrete {
            integrator.step_for(settings.dt)?;
            times.push(integrator.time());
            states.push(integrator.state().to_vec());
            continue;
        }
        while integrator.time() < target {
            integrator.step()?;
        }
        let mut sample = vec![0.0; dim];
        integrator.interpolate(target, &mut sample)?;
        times.push(target);
        states.push(sample);
    }

    tracing::debug!(samples = times.len(), "sampled trajectory");
    Ok(Trajectory { times, states })
}

#[cfg(test)]
mod tests {
    use super::{trajectory, BaseIntegrator, ParallelIntegrator, TrajectorySettings};
    use crate::error::ChaosError;
    use crate::system::DynamicalSystem;
    use crate::test_systems::{Henon, Oscillator};
    use approx::assert_abs_diff_eq;

    #[test]
    fn discrete_integrator_iterates_map() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        let mut integ = BaseIntegrator::new(&ds, None, None).unwrap();
        integ.step().unwrap();
        assert_eq!(integ.state(), &[1.0, 0.0]);
        integ.step_for(2.0).unwrap();
        // (1, 0) -> (-0.4, 0.3) -> (1.076, -0.12)
        assert_abs_diff_eq!(integ.state()[0], 1.0 - 1.4 * 0.16 + 0.3, epsilon = 1e-14);
        assert_abs_diff_eq!(integ.state()[1], -0.12, epsilon = 1e-14);
        assert_eq!(integ.time(), 3.0);

        let err = integ.step_for(1.5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChaosError>(),
            Some(ChaosError::InvalidParameter(_))
        ));
    }

    #[test]
    fn continuous_integrator_step_for_is_exact_in_time() {
        let ds = DynamicalSystem::continuous(Oscillator, vec![1.0, 0.0]).unwrap();
        let mut integ = BaseIntegrator::new(&ds, None, None).unwrap();
        integ.step_for(0.75).unwrap();
        integ.step_for(0.75).unwrap();
        assert_abs_diff_eq!(integ.time(), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(integ.state()[0], 1.5f64.cos(), epsilon = 1e-5);
    }

    #[test]
    fn reinit_twice_then_step_is_deterministic() {
        let ds = DynamicalSystem::continuous(Oscillator, vec![1.0, 0.0]).unwrap();
        let mut integ = BaseIntegrator::new(&ds, None, None).unwrap();
        integ.step_for(4.0).unwrap();
        let reference = integ.state().to_vec();
        integ.reinit(&[1.0, 0.0], 0.0).unwrap();
        integ.reinit(&[1.0, 0.0], 0.0).unwrap();
        integ.step_for(4.0).unwrap();
        assert_eq!(integ.state(), reference.as_slice());
    }

    #[test]
    fn parallel_integrator_matches_independent_runs_for_maps() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        let states = vec![vec![0.1, 0.1], vec![-0.2, 0.05]];
        let mut parallel = ParallelIntegrator::new(&ds, &states, None).unwrap();
        parallel.step_for(10.0).unwrap();

        for (i, s) in states.iter().enumerate() {
            let mut single = BaseIntegrator::new(&ds, Some(s), None).unwrap();
            single.step_for(10.0).unwrap();
            assert_eq!(parallel.state(i), single.state());
        }

        parallel.set_state(1, &[0.0, 0.0]).unwrap();
        assert_eq!(parallel.state(1), &[0.0, 0.0]);
        assert!(parallel.set_state(2, &[0.0, 0.0]).is_err());
        assert!(parallel.set_state(0, &[0.0]).is_err());
    }

    #[test]
    #[should_panic(expected = "State index 2 out of range for 2 states.")]
    fn parallel_state_index_past_the_end_panics() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        let pair = ParallelIntegrator::new(&ds, &[vec![0.0, 0.0], vec![0.1, 0.1]], None).unwrap();
        let _ = pair.state(2);
    }

    #[test]
    fn trajectory_samples_flow_on_a_uniform_grid() {
        let ds = DynamicalSystem::continuous(Oscillator, vec![1.0, 0.0]).unwrap();
        let settings = TrajectorySettings {
            dt: 0.05,
            transient: 0.5,
        };
        let traj = trajectory(&ds, 2.0, &settings).unwrap();
        assert_eq!(traj.times.len(), 41);
        for (t, state) in traj.times.iter().zip(&traj.states) {
            assert_abs_diff_eq!(state[0], t.cos(), epsilon = 1e-4);
            assert_abs_diff_eq!(state[1], -t.sin(), epsilon = 1e-4);
        }
        assert_abs_diff_eq!(traj.times[40], 2.5, epsilon = 1e-9);
    }

    #[test]
    fn trajectory_of_map_counts_iterations() {
        let ds = DynamicalSystem::discrete(Henon::default(), vec![0.0, 0.0]).unwrap();
        let settings = TrajectorySettings {
            dt: 2.0,
            transient: 0.0,
        };
        let traj = trajectory(&ds, 10.0, &settings).unwrap();
        assert_eq!(traj.times, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }
}
