//! Right-hand sides used by the exercises: rabbits and foxes, and a pendulum.

use crate::traits::{DynamicalSystem, Scalar};
use serde::{Deserialize, Serialize};

/// Lotka-Volterra predator-prey model with state (rabbits, foxes):
///
/// dr/dt = alpha·r − beta·r·f
/// df/dt = −gamma·f + delta·r·f
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LotkaVolterra {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
}

impl Default for LotkaVolterra {
    fn default() -> Self {
        Self {
            alpha: 0.08,
            beta: 0.0004,
            gamma: 0.09,
            delta: 0.0005,
        }
    }
}

impl LotkaVolterra {
    /// Non-trivial equilibrium (gamma/delta, alpha/beta) where both
    /// populations are stationary.
    pub fn coexistence_point(&self) -> [f64; 2] {
        [self.gamma / self.delta, self.alpha / self.beta]
    }

    /// First integral δr − γ ln r + βf − α ln f, constant along positive
    /// trajectories.
    pub fn invariant(&self, state: &[f64]) -> f64 {
        let (r, f) = (state[0], state[1]);
        self.delta * r - self.gamma * r.ln() + self.beta * f - self.alpha * f.ln()
    }
}

impl<T: Scalar> DynamicalSystem<T> for LotkaVolterra {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let alpha = T::from_f64(self.alpha).unwrap();
        let beta = T::from_f64(self.beta).unwrap();
        let gamma = T::from_f64(self.gamma).unwrap();
        let delta = T::from_f64(self.delta).unwrap();
        let (r, f) = (x[0], x[1]);
        out[0] = alpha * r - beta * r * f;
        out[1] = -gamma * f + delta * r * f;
    }
}

/// Undamped pendulum with state (theta, v): dθ/dt = v, dv/dt = −(g/L)·sin θ.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pendulum {
    pub g_over_l: f64,
}

impl Default for Pendulum {
    fn default() -> Self {
        Self { g_over_l: 10.0 }
    }
}

impl Pendulum {
    /// Energy per unit m·L², v²/2 − (g/L)·cos θ.
    pub fn energy(&self, state: &[f64]) -> f64 {
        0.5 * state[1] * state[1] - self.g_over_l * state[0].cos()
    }
}

impl<T: Scalar> DynamicalSystem<T> for Pendulum {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let g_over_l = T::from_f64(self.g_over_l).unwrap();
        out[0] = x[1];
        out[1] = -g_over_l * x[0].sin();
    }
}

fn evaluate<S: DynamicalSystem<f64>>(system: &S, state: [f64; 2], t: f64) -> [f64; 2] {
    let mut out = [0.0; 2];
    system.apply(t, &state, &mut out);
    out
}

/// Predator-prey derivative (dr/dt, df/dt) with the default coefficients.
pub fn drfdt(state: [f64; 2], t: f64) -> [f64; 2] {
    evaluate(&LotkaVolterra::default(), state, t)
}

/// Pendulum derivative (dθ/dt, dv/dt) with g/L = 10.
pub fn dthetavdt(state: [f64; 2], t: f64) -> [f64; 2] {
    evaluate(&Pendulum::default(), state, t)
}
