//! Initial value problems: integrate dy/dt = f(y, t) from a known state and
//! report the solution at a sequence of query times.

use crate::solvers::AdaptiveTsit5;
use crate::traits::{DynamicalSystem, Steppable};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub rtol: f64,
    pub atol: f64,
    /// Total number of attempted steps before giving up.
    pub max_steps: usize,
    /// Initial step magnitude. Chosen automatically when `None`.
    pub first_step: Option<f64>,
    /// Upper bound on the step magnitude.
    pub max_step: Option<f64>,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            rtol: 1.49012e-8,
            atol: 1.49012e-8,
            max_steps: 100_000,
            first_step: None,
            max_step: None,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 10.0,
        }
    }
}

impl IntegratorSettings {
    fn validate(&self) -> Result<()> {
        if !(self.rtol > 0.0) {
            bail!("rtol must be positive.");
        }
        if !(self.atol > 0.0) {
            bail!("atol must be positive.");
        }
        if self.max_steps == 0 {
            bail!("max_steps must be greater than zero.");
        }
        if let Some(h) = self.first_step {
            if !(h > 0.0) || !h.is_finite() {
                bail!("first_step must be positive and finite.");
            }
        }
        if let Some(h) = self.max_step {
            if !(h > 0.0) {
                bail!("max_step must be positive.");
            }
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            bail!("safety must lie in (0, 1].");
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0) {
            bail!("min_factor must lie in (0, 1).");
        }
        if !(self.max_factor > 1.0) {
            bail!("max_factor must be greater than one.");
        }
        Ok(())
    }
}

/// Counters collected while integrating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub evaluations: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

/// States at each requested time, stored row-major (`times.len() × dimension`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub dimension: usize,
    pub times: Vec<f64>,
    pub states: Vec<f64>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// State at the `index`-th query time.
    pub fn state(&self, index: usize) -> &[f64] {
        let start = index * self.dimension;
        &self.states[start..start + self.dimension]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.states.chunks_exact(self.dimension)
    }

    /// One state component over all query times.
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.rows().map(|row| row[index]).collect()
    }

    pub fn last(&self) -> Option<&[f64]> {
        if self.is_empty() {
            None
        } else {
            Some(self.state(self.len() - 1))
        }
    }
}

/// Integrates `system` from `initial_state` at `times[0]` and returns the
/// state at every entry of `times`.
///
/// `times` must be monotone: non-decreasing integrates forward, non-increasing
/// integrates backward. Entries equal to `times[0]` receive an exact copy of
/// the initial state. Steps are chosen by the error controller and the
/// solution between steps comes from the method's continuous extension.
pub fn integrate<S>(
    system: &S,
    initial_state: &[f64],
    times: &[f64],
    settings: IntegratorSettings,
) -> Result<Trajectory>
where
    S: DynamicalSystem<f64>,
{
    settings.validate()?;
    let dim = validate_problem(system, initial_state, times)?;
    let direction = span_direction(times)?;

    let t0 = times[0];
    let t_end = times[times.len() - 1];
    let mut states = Vec::with_capacity(times.len() * dim);
    let mut stats = IntegrationStats::default();

    // Query times at the initial point never touch the solver.
    let mut next = 0usize;
    while next < times.len() && times[next] == t0 {
        states.extend_from_slice(initial_state);
        next += 1;
    }
    if next == times.len() {
        return Ok(Trajectory {
            dimension: dim,
            times: times.to_vec(),
            states,
            stats,
        });
    }

    let mut stepper = AdaptiveTsit5::new(dim);
    let mut t = t0;
    let mut y = initial_state.to_vec();
    stepper.prime(system, t, &y);
    ensure_finite(stepper.derivative(), t)?;

    let span = (t_end - t0).abs();
    let max_step = settings.max_step.unwrap_or(f64::INFINITY).min(span);
    let mut probe_evaluations = 0usize;
    let mut h_abs = match settings.first_step {
        Some(h) => h.min(max_step),
        None => {
            probe_evaluations += 1;
            initial_step(system, &stepper, t, &y, direction, max_step, &settings)
        }
    };

    let mut dense = vec![0.0; dim];
    let mut attempts = 0usize;

    while next < times.len() {
        if attempts >= settings.max_steps {
            bail!(
                "Integration did not reach t = {} within {} steps (stopped at t = {}).",
                t_end,
                settings.max_steps,
                t
            );
        }
        attempts += 1;

        let min_step = 16.0 * f64::EPSILON * t.abs().max(f64::MIN_POSITIVE);
        if h_abs < min_step {
            bail!("Step size underflow at t = {} (h = {:e}).", t, h_abs);
        }

        let remaining = (t_end - t).abs();
        let mut h_step = h_abs.min(remaining);
        // Avoid leaving a sliver too small to integrate before the final time.
        if remaining - h_step < min_step {
            h_step = remaining;
        }
        let h = direction * h_step;
        let t_new = if h_step == remaining { t_end } else { t + h };

        stepper.attempt(system, t, &y, h);
        let error = stepper.error_norm(&y, settings.rtol, settings.atol);

        if !error.is_finite() || error > 1.0 {
            stats.rejected_steps += 1;
            let factor = if error.is_finite() {
                (settings.safety * error.powf(-0.2)).max(settings.min_factor)
            } else {
                settings.min_factor
            };
            h_abs = h_step * factor.min(1.0);
            trace!(t, h = h_step, error, "step rejected");
            continue;
        }

        stats.accepted_steps += 1;
        while next < times.len() && direction * (times[next] - t_new) <= 0.0 {
            if times[next] == t_new {
                states.extend_from_slice(stepper.proposed());
            } else {
                let theta = (times[next] - t) / h;
                stepper.interpolate(&y, h, theta, &mut dense);
                states.extend_from_slice(&dense);
            }
            next += 1;
        }

        stepper.accept(&mut y);
        t = t_new;

        let factor = if error == 0.0 {
            settings.max_factor
        } else {
            (settings.safety * error.powf(-0.2)).clamp(settings.min_factor, settings.max_factor)
        };
        h_abs = (h_step * factor).min(max_step);
    }

    stats.evaluations = stepper.evaluations() + probe_evaluations;
    debug!(
        t0,
        t_end,
        accepted = stats.accepted_steps,
        rejected = stats.rejected_steps,
        evaluations = stats.evaluations,
        "integration finished"
    );

    Ok(Trajectory {
        dimension: dim,
        times: times.to_vec(),
        states,
        stats,
    })
}

/// Integrates with a fixed-step stepper, shortening the last step before each
/// query time so every query is hit exactly. Fails once `max_steps` steps have
/// been taken in total.
pub fn integrate_fixed<S, P>(
    system: &S,
    stepper: &mut P,
    initial_state: &[f64],
    times: &[f64],
    dt: f64,
    max_steps: usize,
) -> Result<Trajectory>
where
    S: DynamicalSystem<f64>,
    P: Steppable<f64>,
{
    let dim = validate_problem(system, initial_state, times)?;
    let direction = span_direction(times)?;
    if !(dt > 0.0) || !dt.is_finite() {
        bail!("Step size dt must be positive.");
    }
    if max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }

    let mut states = Vec::with_capacity(times.len() * dim);
    let mut stats = IntegrationStats::default();
    let mut t = times[0];
    let mut y = initial_state.to_vec();
    states.extend_from_slice(&y);

    for &target in &times[1..] {
        while direction * (target - t) > 0.0 {
            let remaining = (target - t).abs();
            let h = if remaining <= dt * (1.0 + 1e-12) {
                target - t
            } else {
                direction * dt
            };
            if stats.accepted_steps >= max_steps {
                bail!(
                    "Integration did not reach t = {} within {} steps (stopped at t = {}).",
                    target,
                    max_steps,
                    t
                );
            }
            let t_before = t;
            stepper.step(system, &mut t, &mut y, h);
            stats.accepted_steps += 1;
            stats.evaluations += stepper.stages();
            if t == t_before {
                bail!("Step size underflow at t = {} (h = {:e}).", t, h.abs());
            }
            if (target - t).abs() <= 4.0 * f64::EPSILON * target.abs().max(1.0) {
                t = target;
            }
        }
        ensure_finite(&y, t).with_context(|| format!("Fixed-step integration with dt = {dt}"))?;
        states.extend_from_slice(&y);
    }

    Ok(Trajectory {
        dimension: dim,
        times: times.to_vec(),
        states,
        stats,
    })
}

fn validate_problem<S>(system: &S, initial_state: &[f64], times: &[f64]) -> Result<usize>
where
    S: DynamicalSystem<f64>,
{
    let dim = system.dimension();
    if dim == 0 {
        bail!("System has zero dimension.");
    }
    if initial_state.len() != dim {
        bail!(
            "Initial state dimension mismatch. Expected {}, got {}.",
            dim,
            initial_state.len()
        );
    }
    if initial_state.iter().any(|v| !v.is_finite()) {
        bail!("Initial state contains non-finite values.");
    }
    if times.is_empty() {
        bail!("Time sequence must contain at least one entry.");
    }
    if times.iter().any(|t| !t.is_finite()) {
        bail!("Time sequence contains non-finite values.");
    }
    Ok(dim)
}

/// +1 for forward integration, -1 for backward. Zero-length spans count as
/// forward.
fn span_direction(times: &[f64]) -> Result<f64> {
    let t0 = times[0];
    let direction = if times[times.len() - 1] < t0 { -1.0 } else { 1.0 };
    for pair in times.windows(2) {
        if direction * (pair[1] - pair[0]) < 0.0 {
            bail!(
                "Time sequence must be monotone; found {} followed by {}.",
                pair[0],
                pair[1]
            );
        }
    }
    Ok(direction)
}

fn ensure_finite(values: &[f64], t: f64) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        bail!("Non-finite values encountered at t = {}.", t);
    }
    Ok(())
}

/// Starting step estimate from the scale of the state and its first two
/// derivatives (Hairer, Nørsett & Wanner, II.4).
fn initial_step<S>(
    system: &S,
    stepper: &AdaptiveTsit5,
    t: f64,
    y: &[f64],
    direction: f64,
    max_step: f64,
    settings: &IntegratorSettings,
) -> f64
where
    S: DynamicalSystem<f64>,
{
    let f0 = stepper.derivative().to_vec();
    let scale: Vec<f64> = y
        .iter()
        .map(|v| settings.atol + settings.rtol * v.abs())
        .collect();
    let d0 = rms_scaled(y, &scale);
    let d1 = rms_scaled(&f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(max_step);

    let y1: Vec<f64> = y
        .iter()
        .zip(&f0)
        .map(|(yi, fi)| yi + direction * h0 * fi)
        .collect();
    let mut f1 = vec![0.0; y.len()];
    system.apply(t + direction * h0, &y1, &mut f1);
    let diff: Vec<f64> = f1.iter().zip(&f0).map(|(a, b)| a - b).collect();
    let d2 = rms_scaled(&diff, &scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(0.2)
    };

    let h = (100.0 * h0).min(h1).min(max_step);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        h0
    }
}

fn rms_scaled(values: &[f64], scale: &[f64]) -> f64 {
    let sum: f64 = values
        .iter()
        .zip(scale)
        .map(|(v, s)| (v / s) * (v / s))
        .sum();
    (sum / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::{integrate, integrate_fixed, IntegratorSettings};
    use crate::solvers::{Tsit5, RK4};
    use crate::traits::FnSystem;
    use approx::assert_relative_eq;

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn decay(rate: f64) -> FnSystem<impl Fn(f64, &[f64], &mut [f64])> {
        FnSystem::new(1, move |_t, x: &[f64], out: &mut [f64]| out[0] = -rate * x[0])
    }

    fn oscillator() -> FnSystem<impl Fn(f64, &[f64], &mut [f64])> {
        FnSystem::new(2, |_t, x: &[f64], out: &mut [f64]| {
            out[0] = x[1];
            out[1] = -x[0];
        })
    }

    #[test]
    fn exponential_decay_matches_closed_form() {
        let times: Vec<f64> = (0..=20).map(|i| i as f64 * 0.25).collect();
        let traj = integrate(&decay(0.7), &[2.0], &times, IntegratorSettings::default())
            .expect("integration should succeed");
        assert_eq!(traj.len(), times.len());
        for (t, row) in traj.times.iter().zip(traj.rows()) {
            assert_relative_eq!(row[0], 2.0 * (-0.7 * t).exp(), max_relative = 1e-6);
        }
    }

    #[test]
    fn harmonic_oscillator_dense_output_tracks_sine() {
        let times: Vec<f64> = (0..=200).map(|i| i as f64 * 0.05).collect();
        let traj = integrate(&oscillator(), &[0.0, 1.0], &times, IntegratorSettings::default())
            .expect("integration should succeed");
        for (i, &t) in times.iter().enumerate() {
            let row = traj.state(i);
            assert!((row[0] - t.sin()).abs() < 1e-6, "x({t}) = {}", row[0]);
            assert!((row[1] - t.cos()).abs() < 1e-6, "v({t}) = {}", row[1]);
        }
    }

    #[test]
    fn time_dependent_right_hand_side() {
        let system = FnSystem::new(1, |t: f64, _x: &[f64], out: &mut [f64]| out[0] = t.cos());
        let traj = integrate(&system, &[0.0], &[0.0, 1.0, 2.0], IntegratorSettings::default())
            .expect("integration should succeed");
        assert!((traj.state(1)[0] - 1.0f64.sin()).abs() < 1e-7);
        assert!((traj.state(2)[0] - 2.0f64.sin()).abs() < 1e-7);
    }

    #[test]
    fn zero_length_span_returns_initial_state() {
        let system = decay(1.0);
        let traj = integrate(&system, &[3.5], &[0.0, 0.0], IntegratorSettings::default())
            .expect("integration should succeed");
        assert_eq!(traj.states, vec![3.5, 3.5]);
        assert_eq!(traj.stats.evaluations, 0);
    }

    #[test]
    fn first_row_is_exact_initial_state() {
        let times: Vec<f64> = (0..10).map(|i| 1.0 + i as f64 * 0.1).collect();
        let initial = [0.1 + 0.2, 1.0 / 3.0];
        let traj = integrate(&oscillator(), &initial, &times, IntegratorSettings::default())
            .expect("integration should succeed");
        assert_eq!(traj.state(0), &initial);
    }

    #[test]
    fn repeated_query_times_share_a_state() {
        let traj = integrate(
            &decay(1.0),
            &[1.0],
            &[0.0, 0.5, 0.5, 1.0],
            IntegratorSettings::default(),
        )
        .expect("integration should succeed");
        assert_eq!(traj.state(1), traj.state(2));
    }

    #[test]
    fn backward_integration_recovers_earlier_state() {
        let settings = IntegratorSettings::default();
        let forward = integrate(&oscillator(), &[1.0, 0.0], &[0.0, 3.0], settings)
            .expect("forward integration should succeed");
        let end = forward.last().expect("non-empty").to_vec();
        let backward = integrate(&oscillator(), &end, &[3.0, 1.5, 0.0], settings)
            .expect("backward integration should succeed");
        let start = backward.last().expect("non-empty");
        assert!((start[0] - 1.0).abs() < 1e-6);
        assert!(start[1].abs() < 1e-6);
        assert!((backward.state(1)[0] - 1.5f64.cos()).abs() < 1e-6);
    }

    #[test]
    fn looser_tolerances_take_fewer_steps() {
        let times = [0.0, 20.0];
        let tight = integrate(&oscillator(), &[1.0, 0.0], &times, IntegratorSettings::default())
            .expect("integration should succeed");
        let loose = integrate(
            &oscillator(),
            &[1.0, 0.0],
            &times,
            IntegratorSettings {
                rtol: 1e-4,
                atol: 1e-6,
                ..IntegratorSettings::default()
            },
        )
        .expect("integration should succeed");
        assert!(loose.stats.accepted_steps < tight.stats.accepted_steps);
    }

    #[test]
    fn rejects_invalid_inputs() {
        let settings = IntegratorSettings::default();
        assert_err_contains(
            integrate(&decay(1.0), &[1.0, 2.0], &[0.0, 1.0], settings),
            "dimension mismatch",
        );
        assert_err_contains(integrate(&decay(1.0), &[1.0], &[], settings), "at least one entry");
        assert_err_contains(
            integrate(&decay(1.0), &[1.0], &[0.0, 2.0, 1.0], settings),
            "monotone",
        );
        assert_err_contains(
            integrate(&decay(1.0), &[f64::NAN], &[0.0, 1.0], settings),
            "non-finite",
        );
        assert_err_contains(
            integrate(
                &decay(1.0),
                &[1.0],
                &[0.0, 1.0],
                IntegratorSettings {
                    rtol: 0.0,
                    ..settings
                },
            ),
            "rtol",
        );
    }

    #[test]
    fn step_budget_is_enforced() {
        let settings = IntegratorSettings {
            max_steps: 3,
            ..IntegratorSettings::default()
        };
        assert_err_contains(
            integrate(&oscillator(), &[1.0, 0.0], &[0.0, 100.0], settings),
            "within 3 steps",
        );
    }

    #[test]
    fn blow_up_is_reported() {
        let system = FnSystem::new(1, |_t, x: &[f64], out: &mut [f64]| out[0] = x[0] * x[0]);
        let result = integrate(&system, &[1.0], &[0.0, 2.0], IntegratorSettings::default());
        assert!(result.is_err());
    }

    #[test]
    fn fixed_step_rk4_lands_on_query_times() {
        let system = decay(1.0);
        let mut stepper = RK4::new(1);
        let times = [0.0, 0.35, 1.0];
        let traj = integrate_fixed(&system, &mut stepper, &[1.0], &times, 0.1, 1_000)
            .expect("integration should succeed");
        assert!((traj.state(1)[0] - (-0.35f64).exp()).abs() < 1e-5);
        assert!((traj.state(2)[0] - (-1.0f64).exp()).abs() < 1e-5);
        assert_err_contains(
            integrate_fixed(&system, &mut stepper, &[1.0], &times, 0.0, 1_000),
            "dt must be positive",
        );
    }

    #[test]
    fn fixed_step_counts_evaluations_per_stage() {
        let system = decay(1.0);
        let times = [0.0, 0.5];

        let traj = integrate_fixed(&system, &mut RK4::new(1), &[1.0], &times, 0.1, 1_000)
            .expect("integration should succeed");
        assert_eq!(traj.stats.accepted_steps, 5);
        assert_eq!(traj.stats.evaluations, 20);

        let traj = integrate_fixed(&system, &mut Tsit5::new(1), &[1.0], &times, 0.1, 1_000)
            .expect("integration should succeed");
        assert_eq!(traj.stats.evaluations, 6 * traj.stats.accepted_steps);
    }

    #[test]
    fn fixed_step_below_time_resolution_fails() {
        let system = decay(1.0);
        let mut stepper = RK4::new(1);
        assert_err_contains(
            integrate_fixed(&system, &mut stepper, &[1.0], &[1e15, 1e15 + 1.0], 0.01, 1_000),
            "Step size underflow",
        );
    }

    #[test]
    fn fixed_step_respects_step_budget() {
        let system = decay(1.0);
        let mut stepper = RK4::new(1);
        assert_err_contains(
            integrate_fixed(&system, &mut stepper, &[1.0], &[0.0, 10.0], 1e-3, 100),
            "within 100 steps",
        );
        assert_err_contains(
            integrate_fixed(&system, &mut stepper, &[1.0], &[0.0, 1.0], 0.1, 0),
            "max_steps must be greater than zero",
        );
    }
}
