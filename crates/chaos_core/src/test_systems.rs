//! Reference systems shared by the unit tests.

use crate::jacobian::Analytic;
use crate::system::{DynamicalSystem, FnField};
use crate::traits::{Scalar, VectorField};

fn c<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct Lorenz {
    pub sigma: f64,
    pub rho: f64,
    pub beta: f64,
}

impl Default for Lorenz {
    fn default() -> Self {
        Self {
            sigma: 10.0,
            rho: 28.0,
            beta: 8.0 / 3.0,
        }
    }
}

impl<T: Scalar> VectorField<T> for Lorenz {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let (sigma, rho, beta) = (c::<T>(self.sigma), c::<T>(self.rho), c::<T>(self.beta));
        out[0] = sigma * (x[1] - x[0]);
        out[1] = x[0] * (rho - x[2]) - x[1];
        out[2] = x[0] * x[1] - beta * x[2];
    }
}

pub fn lorenz_jacobian(l: Lorenz) -> impl Fn(f64, &[f64], &mut [f64]) {
    move |_t: f64, x: &[f64], out: &mut [f64]| {
        out.copy_from_slice(&[
            -l.sigma,
            l.sigma,
            0.0,
            l.rho - x[2],
            -1.0,
            -x[0],
            x[1],
            x[0],
            -l.beta,
        ]);
    }
}

pub fn lorenz_system(
    u0: Vec<f64>,
) -> DynamicalSystem<Lorenz, Analytic<impl Fn(f64, &[f64], &mut [f64])>> {
    let lorenz = Lorenz::default();
    DynamicalSystem::continuous(lorenz, u0)
        .unwrap()
        .with_jacobian(lorenz_jacobian(lorenz))
        .unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct Rossler {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl<T: Scalar> VectorField<T> for Rossler {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = -x[1] - x[2];
        out[1] = x[0] + c::<T>(self.a) * x[1];
        out[2] = c::<T>(self.b) + x[2] * (x[0] - c::<T>(self.c));
    }
}

pub fn rossler_system(u0: Vec<f64>) -> DynamicalSystem<Rossler> {
    let rossler = Rossler {
        a: 0.2,
        b: 0.2,
        c: 5.7,
    };
    DynamicalSystem::continuous(rossler, u0).unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct Henon {
    pub a: f64,
    pub b: f64,
}

impl Default for Henon {
    fn default() -> Self {
        Self { a: 1.4, b: 0.3 }
    }
}

impl<T: Scalar> VectorField<T> for Henon {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = T::one() - c::<T>(self.a) * x[0] * x[0] + x[1];
        out[1] = c::<T>(self.b) * x[0];
    }
}

/// x' = y, y' = -x.
#[derive(Debug, Clone, Copy)]
pub struct Oscillator;

impl<T: Scalar> VectorField<T> for Oscillator {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = x[1];
        out[1] = -x[0];
    }
}

/// Simple pendulum, q' = p, p' = -sin q.
#[derive(Debug, Clone, Copy)]
pub struct Pendulum;

impl<T: Scalar> VectorField<T> for Pendulum {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = x[1];
        out[1] = -x[0].sin();
    }
}

pub fn pendulum_system(u0: Vec<f64>) -> DynamicalSystem<Pendulum> {
    DynamicalSystem::continuous(Pendulum, u0).unwrap()
}

pub fn logistic_map(
    r: f64,
    x0: f64,
) -> DynamicalSystem<FnField<impl Fn(f64, &[f64], &mut [f64])>, Analytic<impl Fn(f64, &[f64], &mut [f64])>>
{
    let field = FnField::new(1, move |_t: f64, x: &[f64], out: &mut [f64]| {
        out[0] = r * x[0] * (1.0 - x[0]);
    });
    DynamicalSystem::discrete(field, vec![x0])
        .unwrap()
        .with_jacobian(move |_t: f64, x: &[f64], out: &mut [f64]| {
            out[0] = r * (1.0 - 2.0 * x[0]);
        })
        .unwrap()
}

/// Arnold's cat map on the unit torus; constant Jacobian [[2, 1], [1, 1]].
pub fn cat_map(
) -> DynamicalSystem<FnField<impl Fn(f64, &[f64], &mut [f64])>, Analytic<impl Fn(f64, &[f64], &mut [f64])>>
{
    let field = FnField::new(2, |_t: f64, x: &[f64], out: &mut [f64]| {
        out[0] = (2.0 * x[0] + x[1]).rem_euclid(1.0);
        out[1] = (x[0] + x[1]).rem_euclid(1.0);
    });
    DynamicalSystem::discrete(field, vec![0.1234, 0.5678])
        .unwrap()
        .with_jacobian(|_t: f64, _x: &[f64], out: &mut [f64]| {
            out.copy_from_slice(&[2.0, 1.0, 1.0, 1.0]);
        })
        .unwrap()
}
