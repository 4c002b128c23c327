use crate::traits::{Scalar, Steppable, VectorField};

fn constant<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T) {
        let half: T = constant(0.5);
        let sixth: T = constant(1.0 / 6.0);
        let two: T = constant(2.0);
        let t0 = *t;

        system.apply(t0, state, &mut self.k1);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

// Tsitouras 5(4) tableau. B holds the 5th order weights (identical to the last
// row of A, so k7 is the FSAL derivative); E holds b - b_hat.
const TSIT5_C: [f64; 6] = [0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0];
const TSIT5_A: [[f64; 6]; 6] = [
    [0.161, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0, 0.0],
    [2.897153057105493, -6.359448489975075, 4.3622954328695815, 0.0, 0.0, 0.0],
    [
        5.325864828439257,
        -11.748883564062828,
        7.4955393428898365,
        -0.09249506636175525,
        0.0,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.028269050394068383,
        0.0,
    ],
    [
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436081,
        2.324710524099774,
    ],
];
const TSIT5_E: [f64; 7] = [
    -0.00178001105222577714,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    0.015151515151515152,
];

/// Tsitouras 5/4 Solver
pub struct Tsit5<T: Scalar> {
    k: [Vec<T>; 7],
    tmp: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![T::zero(); dim]),
            tmp: vec![T::zero(); dim],
        }
    }

    /// Evaluates one trial step without touching `state`.
    /// proposal: 5th order solution at t + dt
    /// error: difference between the embedded 5th and 4th order solutions
    pub fn attempt(
        &mut self,
        system: &impl VectorField<T>,
        t: T,
        state: &[T],
        dt: T,
        proposal: &mut [T],
        error: &mut [T],
    ) {
        system.apply(t, state, &mut self.k[0]);

        for stage in 1..7 {
            let row = &TSIT5_A[stage - 1];
            for i in 0..state.len() {
                let mut acc = T::zero();
                for (j, &a) in row.iter().enumerate().take(stage) {
                    acc = acc + constant::<T>(a) * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            let stage_time = t + constant::<T>(TSIT5_C[stage - 1]) * dt;
            system.apply(stage_time, &self.tmp, &mut self.k[stage]);
            if stage == 6 {
                proposal.copy_from_slice(&self.tmp);
            }
        }

        for i in 0..state.len() {
            let mut acc = T::zero();
            for (j, &e) in TSIT5_E.iter().enumerate() {
                acc = acc + constant::<T>(e) * self.k[j][i];
            }
            error[i] = dt * acc;
        }
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T) {
        let mut proposal = vec![T::zero(); state.len()];
        let mut error = vec![T::zero(); state.len()];
        self.attempt(system, *t, state, dt, &mut proposal, &mut error);
        state.copy_from_slice(&proposal);
        *t = *t + dt;
    }
}

/// Discrete Map Stepper
/// Just evaluates x_{n+1} = f(x_n).
/// dt is treated as 1 iteration regardless of value, but we track t as t + dt.
pub struct DiscreteMap<T: Scalar> {
    tmp: Vec<T>,
}

impl<T: Scalar> DiscreteMap<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for DiscreteMap<T> {
    fn step(&mut self, system: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T) {
        system.apply(*t, state, &mut self.tmp);
        state.copy_from_slice(&self.tmp);
        *t = *t + dt;
    }
}
