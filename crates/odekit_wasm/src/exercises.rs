//! Notebook exercise entry points. Results cross the boundary as plain JS
//! objects.

use odekit_core::exercises::{
    linspace, pendulum_figure, pendulum_final_state as final_state, pendulum_trajectory,
    population_figure, predator_prey_trajectory, rabbit_minimum,
};
use serde::Serialize;
use wasm_bindgen::prelude::*;

fn to_js_value<T: Serialize>(value: &T, what: &str) -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(value)
        .map_err(|err| JsValue::from_str(&format!("Failed to serialize {what}: {err}")))
}

fn report(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

/// Time near `guess` at which the rabbit population is smallest, as a
/// `ScalarMinimum` object.
#[wasm_bindgen]
pub fn minimize_rabbits(guess: f64) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();
    let minimum = rabbit_minimum(guess).map_err(report)?;
    to_js_value(&minimum, "minimum")
}

/// `[theta, v]` at `t_end` for a pendulum released from `(theta, v)`.
#[wasm_bindgen]
pub fn pendulum_final_state(theta: f64, v: f64, t_end: f64) -> Result<Vec<f64>, JsValue> {
    console_error_panic_hook::set_once();
    final_state([theta, v], t_end)
        .map(|state| state.to_vec())
        .map_err(report)
}

/// Rabbit and fox curves from `(rabbits, foxes)` over `points` samples of
/// `[0, t_end]`, as a `Figure` object.
#[wasm_bindgen]
pub fn predator_prey_figure(
    rabbits: f64,
    foxes: f64,
    t_end: f64,
    points: usize,
) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();
    let trajectory =
        predator_prey_trajectory([rabbits, foxes], &linspace(0.0, t_end, points)).map_err(report)?;
    let figure = population_figure(&trajectory).map_err(report)?;
    to_js_value(&figure, "figure")
}

/// Angle and angular velocity curves for a pendulum released from
/// `(theta, v)`, as a `Figure` object.
#[wasm_bindgen]
pub fn pendulum_swing_figure(
    theta: f64,
    v: f64,
    t_end: f64,
    points: usize,
) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();
    let trajectory =
        pendulum_trajectory([theta, v], &linspace(0.0, t_end, points)).map_err(report)?;
    let figure = pendulum_figure(&trajectory).map_err(report)?;
    to_js_value(&figure, "figure")
}
