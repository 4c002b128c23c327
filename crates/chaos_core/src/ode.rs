//! Step-size control, dense output and reinitialization on top of the
//! Runge-Kutta steppers in [`crate::solvers`].

use crate::error::ChaosError;
use crate::solvers::{Tsit5, RK4};
use crate::traits::{Steppable, VectorField};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Rk4,
    Tsit5,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverSettings {
    pub algorithm: Algorithm,
    /// Error-controlled stepping (Tsit5 only). When false every internal
    /// step has length `dt`.
    pub adaptive: bool,
    /// Fixed step, or the initial step of the adaptive controller.
    pub dt: f64,
    pub abstol: f64,
    pub reltol: f64,
    pub dtmin: f64,
    /// Consecutive rejected trial steps tolerated before giving up.
    pub max_rejections: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Tsit5,
            adaptive: true,
            dt: 0.01,
            abstol: 1e-6,
            reltol: 1e-6,
            dtmin: 1e-12,
            max_rejections: 64,
        }
    }
}

impl SolverSettings {
    pub fn fixed(algorithm: Algorithm, dt: f64) -> Self {
        Self {
            algorithm,
            adaptive: false,
            dt,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            bail!(ChaosError::invalid("Solver step size dt must be positive."));
        }
        if self.adaptive {
            if self.algorithm != Algorithm::Tsit5 {
                bail!(ChaosError::invalid(
                    "Adaptive stepping requires an embedded method (Tsit5)."
                ));
            }
            if !(self.abstol > 0.0) || !(self.reltol >= 0.0) {
                bail!(ChaosError::invalid(
                    "abstol must be positive and reltol non-negative."
                ));
            }
            if !(self.dtmin > 0.0) || self.dtmin > self.dt {
                bail!(ChaosError::invalid("dtmin must be positive and below dt."));
            }
            if self.max_rejections == 0 {
                bail!(ChaosError::invalid("max_rejections must be at least 1."));
            }
        }
        Ok(())
    }
}

enum Method {
    Rk4(RK4<f64>),
    Tsit5(Tsit5<f64>),
}

/// Continuous-time integrator over a flat state vector.
///
/// Owns all scratch buffers; `reinit` reuses them.
pub struct OdeSolver {
    settings: SolverSettings,
    method: Method,
    t: f64,
    u: Vec<f64>,
    // Proposed length of the next internal step.
    dt: f64,
    t_prev: f64,
    u_prev: Vec<f64>,
    // False until a step has been taken since the last reinit/modification.
    dense_valid: bool,
    proposal: Vec<f64>,
    error: Vec<f64>,
}

impl OdeSolver {
    pub fn new(settings: SolverSettings, t0: f64, u0: &[f64]) -> Result<Self> {
        settings.validate()?;
        let dim = u0.len();
        let method = match settings.algorithm {
            Algorithm::Rk4 => Method::Rk4(RK4::new(dim)),
            Algorithm::Tsit5 => Method::Tsit5(Tsit5::new(dim)),
        };
        Ok(Self {
            settings,
            method,
            t: t0,
            u: u0.to_vec(),
            dt: settings.dt,
            t_prev: t0,
            u_prev: u0.to_vec(),
            dense_valid: false,
            proposal: vec![0.0; dim],
            error: vec![0.0; dim],
        })
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn state(&self) -> &[f64] {
        &self.u
    }

    /// Mutable access to the state. Invalidates dense output for the last step.
    pub fn state_mut(&mut self) -> &mut [f64] {
        self.dense_valid = false;
        &mut self.u
    }

    pub fn reinit(&mut self, u: &[f64], t0: f64) -> Result<()> {
        if u.len() != self.u.len() {
            bail!(ChaosError::DimensionMismatch {
                expected: self.u.len(),
                got: u.len(),
            });
        }
        self.u.copy_from_slice(u);
        self.t = t0;
        self.t_prev = t0;
        self.dt = self.settings.dt;
        self.dense_valid = false;
        Ok(())
    }

    /// Takes exactly one internal step.
    pub fn step<F: VectorField<f64>>(&mut self, field: &F) -> Result<()> {
        self.advance(field, f64::INFINITY)
    }

    /// Steps until `t_target`, shortening the final internal step so the
    /// integrator lands on it exactly.
    pub fn step_until<F: VectorField<f64>>(&mut self, field: &F, t_target: f64) -> Result<()> {
        let eps = 1e-12 * t_target.abs().max(1.0);
        while t_target - self.t > eps {
            self.advance(field, t_target - self.t)?;
        }
        self.t = self.t.max(t_target);
        Ok(())
    }

    fn advance<F: VectorField<f64>>(&mut self, field: &F, max_step: f64) -> Result<()> {
        let clipped = self.dt > max_step;
        let h = self.dt.min(max_step);
        let accepted = match &mut self.method {
            Method::Rk4(stepper) => {
                self.u_prev.copy_from_slice(&self.u);
                let mut t = self.t;
                stepper.step(field, &mut t, &mut self.u, h);
                h
            }
            Method::Tsit5(stepper) if !self.settings.adaptive => {
                stepper.attempt(field, self.t, &self.u, h, &mut self.proposal, &mut self.error);
                self.u_prev.copy_from_slice(&self.u);
                self.u.copy_from_slice(&self.proposal);
                h
            }
            Method::Tsit5(stepper) => {
                let settings = &self.settings;
                let mut h = h;
                let mut rejections = 0usize;
                loop {
                    // A final step clipped to the target may be shorter than
                    // dtmin; only controller-shrunk steps are held to it.
                    if h < settings.dtmin && (!clipped || rejections > 0) {
                        bail!(ChaosError::solver(
                            self.t,
                            format!("step size {h:e} fell below dtmin {:e}", settings.dtmin),
                        ));
                    }
                    stepper.attempt(field, self.t, &self.u, h, &mut self.proposal, &mut self.error);
                    let err = error_norm(
                        &self.u,
                        &self.proposal,
                        &self.error,
                        settings.abstol,
                        settings.reltol,
                    );
                    if err <= 1.0 {
                        // A step shortened only to hit a target keeps the
                        // controller's longer proposal.
                        if !clipped || rejections > 0 {
                            self.dt = h * step_factor(err);
                        }
                        break;
                    }
                    rejections += 1;
                    if rejections > settings.max_rejections {
                        bail!(ChaosError::solver(
                            self.t,
                            format!("{rejections} consecutive step rejections"),
                        ));
                    }
                    tracing::trace!(t = self.t, h, err, "rejected step");
                    h *= step_factor(err).max(0.2);
                }
                self.u_prev.copy_from_slice(&self.u);
                self.u.copy_from_slice(&self.proposal);
                h
            }
        };

        self.t_prev = self.t;
        self.t += accepted;
        self.dense_valid = true;

        if self.u.iter().any(|v| !v.is_finite()) {
            bail!(ChaosError::solver(self.t, "state became non-finite"));
        }
        Ok(())
    }

    /// Cubic Hermite interpolation inside the last accepted step.
    pub fn interpolate<F: VectorField<f64>>(
        &self,
        field: &F,
        t: f64,
        out: &mut [f64],
    ) -> Result<()> {
        if t == self.t {
            out.copy_from_slice(&self.u);
            return Ok(());
        }
        if !self.dense_valid {
            bail!(ChaosError::invalid(
                "No step available for interpolation since the last reinitialization."
            ));
        }
        let h = self.t - self.t_prev;
        if t < self.t_prev || t > self.t || h <= 0.0 {
            bail!(ChaosError::invalid(format!(
                "Interpolation time {t} outside last step [{}, {}].",
                self.t_prev, self.t
            )));
        }

        let n = self.u.len();
        let mut f0 = vec![0.0; n];
        let mut f1 = vec![0.0; n];
        field.apply(self.t_prev, &self.u_prev, &mut f0);
        field.apply(self.t, &self.u, &mut f1);

        let s = (t - self.t_prev) / h;
        let h00 = (1.0 + 2.0 * s) * (1.0 - s) * (1.0 - s);
        let h10 = s * (1.0 - s) * (1.0 - s);
        let h01 = s * s * (3.0 - 2.0 * s);
        let h11 = s * s * (s - 1.0);
        for i in 0..n {
            out[i] = h00 * self.u_prev[i]
                + h10 * h * f0[i]
                + h01 * self.u[i]
                + h11 * h * f1[i];
        }
        Ok(())
    }
}

fn error_norm(u: &[f64], proposal: &[f64], error: &[f64], abstol: f64, reltol: f64) -> f64 {
    let sum: f64 = u
        .iter()
        .zip(proposal)
        .zip(error)
        .map(|((a, b), e)| {
            let scale = abstol + reltol * a.abs().max(b.abs());
            (e / scale).powi(2)
        })
        .sum();
    let norm = (sum / u.len().max(1) as f64).sqrt();
    if norm.is_nan() {
        f64::INFINITY
    } else {
        norm
    }
}

fn step_factor(err: f64) -> f64 {
    if err == 0.0 {
        return 5.0;
    }
    (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
}
