//! Browser bindings for odekit: interactive systems built from equation
//! strings or bundled models, plus the notebook exercises.

mod exercises;
mod system;

pub use exercises::{
    minimize_rabbits, pendulum_final_state, pendulum_swing_figure, predator_prey_figure,
};
pub use system::WasmSystem;
