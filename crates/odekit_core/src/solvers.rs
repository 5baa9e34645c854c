use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Tsitouras 5(4) coefficients (Tsitouras 2011), shared by the fixed-step and
/// adaptive steppers.
mod tsit5 {
    pub const C: [f64; 6] = [0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0];

    pub const A: [[f64; 6]; 6] = [
        [0.161, 0.0, 0.0, 0.0, 0.0, 0.0],
        [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0, 0.0],
        [2.897153057105494, -6.359448489975075, 4.362295432869581, 0.0, 0.0, 0.0],
        [
            5.325864828439257,
            -11.74888356406283,
            7.495539342889836,
            -0.09249506636175525,
            0.0,
            0.0,
        ],
        [
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.02826905039406838,
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

    /// 5th order weights; identical to the last row of `A` (FSAL).
    pub const B: [f64; 6] = A[5];

    /// Difference between the 5th and embedded 4th order weights.
    pub const E: [f64; 7] = [
        -0.001780011052225777,
        -0.0008164344596567469,
        0.007880878010261995,
        -0.1447110071732629,
        0.5823571654525552,
        -0.45808210592918697,
        0.015151515151515152,
    ];

    /// Continuous extension: coefficients of theta, theta^2, theta^3, theta^4
    /// for each stage weight b_i(theta).
    pub const DENSE: [[f64; 4]; 7] = [
        [1.0, -2.76370619727483, 2.91325546182191, -1.05308849772902],
        [0.0, 0.1317, -0.2234, 0.1017],
        [0.0, 3.93029623689475, -5.9410338721315, 2.49062728565125],
        [0.0, -12.4110771669337, 30.3381886302823, -16.5481028892449],
        [0.0, 37.509313416511, -88.1789048947664, 47.3795219628193],
        [0.0, -27.8965262891973, 65.0918946747937, -34.8706578614966],
        [0.0, 1.5, -4.0, 2.5],
    ];
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
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = T::from_f64(0.5).unwrap();
        let sixth = T::from_f64(1.0 / 6.0).unwrap();
        let two = T::from_f64(2.0).unwrap();
        let t0 = *t;

        system.apply(t0, state, &mut self.k1);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * half * self.k1[i];
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * half * self.k2[i];
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

    fn stages(&self) -> usize {
        4
    }
}

/// Fixed-step Tsitouras 5th order solver.
pub struct Tsit5<T: Scalar> {
    k: [Vec<T>; 6],
    tmp: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k: std::array::from_fn(|_| vec![z; dim]),
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;
        let n = state.len();

        system.apply(t0, state, &mut self.k[0]);

        // Stages 2..6; the 7th stage only feeds the error estimate.
        for stage in 1..6 {
            let row = &tsit5::A[stage - 1];
            for i in 0..n {
                let mut acc = T::zero();
                for (j, &a) in row.iter().enumerate().take(stage) {
                    acc = acc + T::from_f64(a).unwrap() * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            let c = T::from_f64(tsit5::C[stage - 1]).unwrap();
            system.apply(t0 + c * dt, &self.tmp, &mut self.k[stage]);
        }

        for i in 0..n {
            let mut acc = T::zero();
            for (j, &b) in tsit5::B.iter().enumerate() {
                acc = acc + T::from_f64(b).unwrap() * self.k[j][i];
            }
            state[i] = state[i] + dt * acc;
        }

        *t = t0 + dt;
    }

    fn stages(&self) -> usize {
        6
    }
}

/// Adaptive Tsitouras 5(4) stepper with embedded error estimate, FSAL stage
/// reuse and a 4th order continuous extension for dense output.
///
/// Usage per step: [`prime`](Self::prime) once at the initial point, then
/// [`attempt`](Self::attempt) until [`error_norm`](Self::error_norm) is at most
/// one, query [`interpolate`](Self::interpolate) for points inside the step,
/// and finally [`accept`](Self::accept).
pub struct AdaptiveTsit5 {
    k: [Vec<f64>; 7],
    stage: Vec<f64>,
    y_new: Vec<f64>,
    error: Vec<f64>,
    evaluations: usize,
}

impl AdaptiveTsit5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            stage: vec![0.0; dim],
            y_new: vec![0.0; dim],
            error: vec![0.0; dim],
            evaluations: 0,
        }
    }

    /// Evaluates f(t, y) into the first stage.
    pub fn prime(&mut self, system: &impl DynamicalSystem<f64>, t: f64, y: &[f64]) {
        system.apply(t, y, &mut self.k[0]);
        self.evaluations += 1;
    }

    /// Derivative at the start of the current step.
    pub fn derivative(&self) -> &[f64] {
        &self.k[0]
    }

    /// Candidate state at the end of the last attempted step.
    pub fn proposed(&self) -> &[f64] {
        &self.y_new
    }

    /// Number of right-hand side evaluations so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Computes the stages of a trial step of size `h` from (t, y). The first
    /// stage must already hold f(t, y).
    pub fn attempt(&mut self, system: &impl DynamicalSystem<f64>, t: f64, y: &[f64], h: f64) {
        let n = y.len();
        for stage in 1..7 {
            let row = &tsit5::A[stage - 1];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, &a) in row.iter().enumerate().take(stage) {
                    acc += a * self.k[j][i];
                }
                self.stage[i] = y[i] + h * acc;
            }
            if stage == 6 {
                self.y_new.copy_from_slice(&self.stage);
            }
            system.apply(t + tsit5::C[stage - 1] * h, &self.stage, &mut self.k[stage]);
            self.evaluations += 1;
        }

        for i in 0..n {
            let mut acc = 0.0;
            for (j, &e) in tsit5::E.iter().enumerate() {
                acc += e * self.k[j][i];
            }
            self.error[i] = h * acc;
        }
    }

    /// Scaled RMS norm of the local error estimate of the last attempt.
    pub fn error_norm(&self, y: &[f64], rtol: f64, atol: f64) -> f64 {
        let n = y.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = (0..n)
            .map(|i| {
                let scale = atol + rtol * y[i].abs().max(self.y_new[i].abs());
                let ratio = self.error[i] / scale;
                ratio * ratio
            })
            .sum();
        (sum / n as f64).sqrt()
    }

    /// Evaluates the continuous extension of the last attempted step at
    /// t + theta * h, where `y` is the state at the start of that step.
    pub fn interpolate(&self, y: &[f64], h: f64, theta: f64, out: &mut [f64]) {
        let powers = [theta, theta * theta, theta * theta * theta, theta * theta * theta * theta];
        let weights: [f64; 7] = std::array::from_fn(|j| {
            tsit5::DENSE[j]
                .iter()
                .zip(powers.iter())
                .map(|(c, p)| c * p)
                .sum()
        });
        for i in 0..y.len() {
            let mut acc = 0.0;
            for (j, w) in weights.iter().enumerate() {
                acc += w * self.k[j][i];
            }
            out[i] = y[i] + h * acc;
        }
    }

    /// Commits the last attempted step into `y`; the final stage becomes the
    /// first stage of the next step.
    pub fn accept(&mut self, y: &mut [f64]) {
        y.copy_from_slice(&self.y_new);
        self.k.swap(0, 6);
    }
}

#[cfg(test)]
mod tests {
    use super::{tsit5, AdaptiveTsit5, Tsit5, RK4};
    use crate::traits::{FnSystem, Steppable};

    fn decay() -> FnSystem<impl Fn(f64, &[f64], &mut [f64])> {
        FnSystem::new(1, |_t, x: &[f64], out: &mut [f64]| out[0] = -x[0])
    }

    #[test]
    fn tableau_rows_sum_to_nodes() {
        for (row, c) in tsit5::A.iter().zip(tsit5::C.iter()) {
            let sum: f64 = row.iter().sum();
            assert!((sum - c).abs() < 1e-12, "row sum {sum} != {c}");
        }
        let weights: f64 = tsit5::B.iter().sum();
        assert!((weights - 1.0).abs() < 1e-12);
        let error_weights: f64 = tsit5::E.iter().sum();
        assert!(error_weights.abs() < 1e-10);
    }

    #[test]
    fn dense_weights_match_step_weights_at_end() {
        for (j, coeffs) in tsit5::DENSE.iter().enumerate() {
            let at_one: f64 = coeffs.iter().sum();
            let expected = if j < 6 { tsit5::B[j] } else { 0.0 };
            assert!((at_one - expected).abs() < 1e-10, "stage {j}: {at_one} vs {expected}");
        }
    }

    #[test]
    fn rk4_single_step_is_fourth_order_accurate() {
        let system = decay();
        let mut solver = RK4::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        solver.step(&system, &mut t, &mut state, 0.1);
        assert_eq!(t, 0.1);
        assert!((state[0] - (-0.1f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn fixed_tsit5_matches_exponential_decay() {
        let system = decay();
        let mut solver = Tsit5::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..10 {
            solver.step(&system, &mut t, &mut state, 0.1);
        }
        assert!((t - 1.0).abs() < 1e-12);
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-7);
    }

    #[test]
    fn adaptive_step_interpolation_hits_both_ends() {
        let system = decay();
        let mut stepper = AdaptiveTsit5::new(1);
        let y = [1.0];
        stepper.prime(&system, 0.0, &y);
        stepper.attempt(&system, 0.0, &y, 0.2);

        let mut out = [0.0];
        stepper.interpolate(&y, 0.2, 0.0, &mut out);
        assert_eq!(out[0], 1.0);
        stepper.interpolate(&y, 0.2, 1.0, &mut out);
        assert!((out[0] - stepper.proposed()[0]).abs() < 1e-12);
        stepper.interpolate(&y, 0.2, 0.5, &mut out);
        assert!((out[0] - (-0.1f64).exp()).abs() < 1e-5);

        assert!(stepper.error_norm(&y, 1e-3, 1e-6) < 1.0);
        assert_eq!(stepper.evaluations(), 7);
    }

    #[test]
    fn accept_reuses_last_stage() {
        let system = decay();
        let mut stepper = AdaptiveTsit5::new(1);
        let mut y = [1.0];
        stepper.prime(&system, 0.0, &y);
        stepper.attempt(&system, 0.0, &y, 0.1);
        stepper.accept(&mut y);
        assert!((stepper.derivative()[0] + y[0]).abs() < 1e-15);
    }
}
