//! Runs the rabbits-and-foxes and pendulum walkthroughs end to end and writes
//! the figures as HTML pages into `notebook-output/`.
//!
//! Set `RUST_LOG=odekit_core=debug` to see integrator and minimizer progress.

use anyhow::{Context, Result};
use odekit_core::exercises::{
    linspace, pendulum_figure, pendulum_final_state, pendulum_trajectory, population_figure,
    predator_prey_scenario, rabbit_minimum,
};
use odekit_core::models::dthetavdt;
use std::f64::consts::{FRAC_PI_2, PI};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let out_dir = Path::new("notebook-output");
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let populations = predator_prey_scenario()?;
    info!(stats = ?populations.stats, "predator-prey trajectory computed");
    population_figure(&populations)?.write_html(out_dir.join("rabbits-and-foxes.html"))?;

    let minimum = rabbit_minimum(40.0)?;
    println!(
        "fewest rabbits at t = {:.4}: {:.4} (success: {}, {} evaluations)",
        minimum.x, minimum.fun, minimum.success, minimum.evaluations
    );

    for state in [[FRAC_PI_2, 0.0], [PI / 12.0, 0.0], [0.0, 1.0]] {
        println!("dthetavdt({:?}) = {:?}", state, dthetavdt(state, 0.0));
    }

    let swing = pendulum_trajectory([PI / 12.0, 0.0], &linspace(0.0, 10.0, 200))?;
    pendulum_figure(&swing)?.write_html(out_dir.join("pendulum.html"))?;

    let [theta, v] = pendulum_final_state([PI / 12.0, 0.0], 10.0)?;
    println!("pendulum at t = 10: theta = {theta:.6}, v = {v:.6}");

    Ok(())
}
