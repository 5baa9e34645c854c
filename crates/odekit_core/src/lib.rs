//! The `odekit_core` crate integrates ordinary differential equations, finds
//! local minima, and plots the results for a predator-prey model and a
//! pendulum.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `DynamicalSystem` (ODE right-hand sides), `Steppable` (fixed-step solvers).
//! - **Solvers**: RK4 and Tsit5 fixed-step steppers, plus the adaptive Tsit5 stepper behind `ivp::integrate`.
//! - **Minimize**: Nelder–Mead and finite-difference BFGS with a diagnostic result record.
//! - **Expression**: right-hand sides written as text and compiled to bytecode.
//! - **Exercises**: the rabbits-and-foxes and pendulum walkthroughs.

pub mod exercises;
pub mod expression;
pub mod ivp;
pub mod minimize;
pub mod models;
pub mod plot;
pub mod solvers;
pub mod traits;
