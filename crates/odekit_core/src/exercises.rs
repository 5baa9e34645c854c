//! The notebook's worked examples: rabbits and foxes, the time of fewest
//! rabbits, and the pendulum exercise.

use crate::ivp::{integrate, IntegratorSettings, Trajectory};
use crate::minimize::{minimize_scalar, Method, NelderMeadSettings, ScalarMinimum};
use crate::models::{LotkaVolterra, Pendulum};
use crate::plot::Figure;
use anyhow::{bail, Context, Result};

/// Initial (rabbits, foxes) used throughout the predator-prey exercise.
pub const INITIAL_POPULATION: [f64; 2] = [300.0, 100.0];

/// `n` evenly spaced points from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut points: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            points[n - 1] = end;
            points
        }
    }
}

pub fn predator_prey_trajectory(initial: [f64; 2], times: &[f64]) -> Result<Trajectory> {
    integrate(
        &LotkaVolterra::default(),
        &initial,
        times,
        IntegratorSettings::default(),
    )
    .context("Predator-prey integration failed")
}

/// Rabbits and foxes from (300, 100) over 100 points of [0, 100].
pub fn predator_prey_scenario() -> Result<Trajectory> {
    predator_prey_trajectory(INITIAL_POPULATION, &linspace(0.0, 100.0, 100))
}

/// Rabbit population at time `t`, integrating only from 0 to `t`.
pub fn rabbits_at(t: f64) -> Result<f64> {
    let trajectory = predator_prey_trajectory(INITIAL_POPULATION, &[0.0, t])?;
    match trajectory.last() {
        Some(state) => Ok(state[0]),
        None => bail!("Empty trajectory for t = {}", t),
    }
}

/// Searches for the time near `guess` at which the rabbit population is
/// smallest.
pub fn rabbit_minimum(guess: f64) -> Result<ScalarMinimum> {
    let settings = NelderMeadSettings {
        xatol: 1e-5,
        fatol: 1e-5,
        ..NelderMeadSettings::default()
    };
    minimize_scalar(rabbits_at, guess, Method::NelderMead(settings))
}

pub fn pendulum_trajectory(initial: [f64; 2], times: &[f64]) -> Result<Trajectory> {
    integrate(&Pendulum::default(), &initial, times, IntegratorSettings::default())
        .context("Pendulum integration failed")
}

/// (theta, v) at `t_end` when released from `initial` at t = 0.
pub fn pendulum_final_state(initial: [f64; 2], t_end: f64) -> Result<[f64; 2]> {
    let trajectory = pendulum_trajectory(initial, &[0.0, t_end])?;
    match trajectory.last() {
        Some(state) => Ok([state[0], state[1]]),
        None => bail!("Empty trajectory for t = {}", t_end),
    }
}

pub fn population_figure(trajectory: &Trajectory) -> Result<Figure> {
    let mut figure = Figure::new("Rabbits and foxes")
        .x_label("t")
        .y_label("population");
    figure
        .add_named_curve(trajectory.times.clone(), trajectory.component(0), "rabbits")?
        .add_named_curve(trajectory.times.clone(), trajectory.component(1), "foxes")?;
    Ok(figure)
}

pub fn pendulum_figure(trajectory: &Trajectory) -> Result<Figure> {
    let mut figure = Figure::new("Pendulum").x_label("t").y_label("state");
    figure
        .add_named_curve(trajectory.times.clone(), trajectory.component(0), "theta")?
        .add_named_curve(trajectory.times.clone(), trajectory.component(1), "v")?;
    Ok(figure)
}
