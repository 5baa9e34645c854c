//! Interactive system wrapper: fixed-step stepping for animation and adaptive
//! integration for plotting.

use odekit_core::expression::ExpressionSystem;
use odekit_core::ivp::{integrate, IntegratorSettings, Trajectory};
use odekit_core::models::{LotkaVolterra, Pendulum};
use odekit_core::solvers::{Tsit5, RK4};
use odekit_core::traits::{DynamicalSystem, Steppable};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmSystem {
    pub(crate) rhs: Rhs,
    state: Vec<f64>,
    t: f64,
    pub(crate) solver: SolverType,
}

pub(crate) enum Rhs {
    Expression(ExpressionSystem<f64>),
    PredatorPrey(LotkaVolterra),
    Pendulum(Pendulum),
}

impl DynamicalSystem<f64> for Rhs {
    fn dimension(&self) -> usize {
        match self {
            Rhs::Expression(system) => system.dimension(),
            Rhs::PredatorPrey(model) => DynamicalSystem::<f64>::dimension(model),
            Rhs::Pendulum(model) => DynamicalSystem::<f64>::dimension(model),
        }
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        match self {
            Rhs::Expression(system) => system.apply(t, x, out),
            Rhs::PredatorPrey(model) => model.apply(t, x, out),
            Rhs::Pendulum(model) => model.apply(t, x, out),
        }
    }
}

pub(crate) enum SolverType {
    RK4(RK4<f64>),
    Tsit5(Tsit5<f64>),
}

pub(crate) fn build_expression(
    equations: &[String],
    params: Vec<f64>,
    param_names: &[String],
    var_names: &[String],
) -> Result<Rhs, String> {
    if params.len() != param_names.len() {
        return Err(format!(
            "Expected {} parameter values, got {}",
            param_names.len(),
            params.len()
        ));
    }
    let vars: Vec<&str> = var_names.iter().map(String::as_str).collect();
    let named: Vec<(&str, f64)> = param_names
        .iter()
        .map(String::as_str)
        .zip(params)
        .collect();
    ExpressionSystem::build(equations, &vars, &named)
        .map(Rhs::Expression)
        .map_err(|err| err.to_string())
}

pub(crate) fn build_model(name: &str) -> Result<Rhs, String> {
    match name {
        "predator_prey" | "lotka_volterra" => Ok(Rhs::PredatorPrey(LotkaVolterra::default())),
        "pendulum" => Ok(Rhs::Pendulum(Pendulum::default())),
        _ => Err(format!("Unknown model '{name}'")),
    }
}

pub(crate) fn build_solver(name: &str, dim: usize) -> Result<SolverType, String> {
    match name {
        "rk4" => Ok(SolverType::RK4(RK4::new(dim))),
        "tsit5" => Ok(SolverType::Tsit5(Tsit5::new(dim))),
        _ => Err(format!("Unknown solver '{name}'")),
    }
}

impl WasmSystem {
    pub(crate) fn from_parts(rhs: Rhs, solver_name: &str) -> Result<Self, String> {
        let dim = rhs.dimension();
        let solver = build_solver(solver_name, dim)?;
        Ok(Self {
            rhs,
            state: vec![0.0; dim],
            t: 0.0,
            solver,
        })
    }

    /// Integrates from the current (t, state) through `times`, which must
    /// start at the current time.
    pub(crate) fn solve(
        &self,
        times: &[f64],
        settings: IntegratorSettings,
    ) -> anyhow::Result<Trajectory> {
        if let Some(&first) = times.first() {
            if first != self.t {
                anyhow::bail!(
                    "Time sequence starts at {} but the system is at t = {}",
                    first,
                    self.t
                );
            }
        }
        integrate(&self.rhs, &self.state, times, settings)
    }
}

fn to_js(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

#[wasm_bindgen]
impl WasmSystem {
    #[wasm_bindgen(constructor)]
    pub fn new(
        equations: Vec<String>,
        params: Vec<f64>,
        param_names: Vec<String>,
        var_names: Vec<String>,
        solver_name: &str,
    ) -> Result<WasmSystem, JsValue> {
        console_error_panic_hook::set_once();

        let rhs = build_expression(&equations, params, &param_names, &var_names).map_err(to_js)?;
        Self::from_parts(rhs, solver_name).map_err(to_js)
    }

    /// Builds one of the bundled models: `predator_prey` or `pendulum`.
    pub fn model(name: &str, solver_name: &str) -> Result<WasmSystem, JsValue> {
        console_error_panic_hook::set_once();

        let rhs = build_model(name).map_err(to_js)?;
        Self::from_parts(rhs, solver_name).map_err(to_js)
    }

    pub fn dimension(&self) -> usize {
        self.rhs.dimension()
    }

    pub fn set_state(&mut self, state: &[f64]) -> Result<(), JsValue> {
        if state.len() != self.state.len() {
            return Err(to_js(format!(
                "State has dimension {} but the system has dimension {}",
                state.len(),
                self.state.len()
            )));
        }
        self.state.copy_from_slice(state);
        Ok(())
    }

    pub fn get_state(&self) -> Vec<f64> {
        self.state.clone()
    }

    pub fn set_t(&mut self, t: f64) {
        self.t = t;
    }

    pub fn get_t(&self) -> f64 {
        self.t
    }

    /// Replaces the parameter values of an equation-defined system.
    pub fn set_params(&mut self, params: Vec<f64>) -> Result<(), JsValue> {
        match &mut self.rhs {
            Rhs::Expression(system) => system.set_params(params).map_err(to_js),
            _ => Err(to_js("Bundled models have fixed parameters")),
        }
    }

    /// Derivative at the current (t, state).
    pub fn derivative(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.state.len()];
        self.rhs.apply(self.t, &self.state, &mut out);
        out
    }

    pub fn step(&mut self, dt: f64) {
        match &mut self.solver {
            SolverType::RK4(s) => s.step(&self.rhs, &mut self.t, &mut self.state, dt),
            SolverType::Tsit5(s) => s.step(&self.rhs, &mut self.t, &mut self.state, dt),
        }
    }

    /// Adaptive integration from the current state. `options` may be
    /// `undefined` or a partial `IntegratorSettings` object.
    pub fn integrate(&self, times: Vec<f64>, options: JsValue) -> Result<JsValue, JsValue> {
        let settings = if options.is_undefined() || options.is_null() {
            IntegratorSettings::default()
        } else {
            serde_wasm_bindgen::from_value(options)
                .map_err(|err| to_js(format!("Invalid integrator options: {err}")))?
        };
        let trajectory = self.solve(&times, settings).map_err(|err| to_js(format!("{err:#}")))?;
        serde_wasm_bindgen::to_value(&trajectory)
            .map_err(|err| to_js(format!("Failed to serialize trajectory: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expression_system(equations: &[&str], vars: &[&str], params: &[(&str, f64)]) -> WasmSystem {
        let equations: Vec<String> = equations.iter().map(|s| s.to_string()).collect();
        let var_names: Vec<String> = vars.iter().map(|s| s.to_string()).collect();
        let param_names: Vec<String> = params.iter().map(|(n, _)| n.to_string()).collect();
        let values = params.iter().map(|&(_, v)| v).collect();
        let rhs = build_expression(&equations, values, &param_names, &var_names)
            .expect("system should build");
        WasmSystem::from_parts(rhs, "rk4").expect("solver should build")
    }

    #[test]
    fn build_expression_rejects_invalid_equation() {
        let result = build_expression(
            &["1 +".to_string()],
            Vec::new(),
            &[],
            &["x".to_string()],
        );
        assert!(result.is_err(), "expected parse error for invalid equation");
    }

    #[test]
    fn build_expression_rejects_parameter_count_mismatch() {
        let result = build_expression(
            &["a * x".to_string()],
            vec![1.0, 2.0],
            &["a".to_string()],
            &["x".to_string()],
        );
        let err = result.err().expect("mismatch should fail");
        assert!(err.contains("Expected 1 parameter values, got 2"), "{err}");
    }

    #[test]
    fn build_expression_rejects_runaway_nesting() {
        let result = build_expression(
            &[format!("{}x", "-".repeat(100_000))],
            Vec::new(),
            &[],
            &["x".to_string()],
        );
        let err = result.err().expect("deep nesting should fail");
        assert!(err.contains("nests deeper than 256 levels"), "{err}");
    }

    #[test]
    fn unknown_solver_and_model_are_rejected() {
        assert!(build_solver("euler", 2).is_err());
        assert!(build_model("lorenz").is_err());
    }

    #[test]
    fn step_advances_state_and_time() {
        let mut system = expression_system(&["1"], &["x"], &[]);
        system.state = vec![0.0];
        system.set_t(0.0);
        system.step(0.5);

        assert!((system.get_t() - 0.5).abs() < 1e-12);
        assert!((system.get_state()[0] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn derivative_uses_parameters_and_state() {
        let mut system = expression_system(&["a * x", "-y"], &["x", "y"], &[("a", 2.0)]);
        system.state = vec![3.0, 4.0];
        assert_eq!(system.derivative(), vec![6.0, -4.0]);
    }

    #[test]
    fn bundled_pendulum_matches_expression_pendulum() {
        let mut model = WasmSystem::from_parts(build_model("pendulum").expect("model"), "tsit5")
            .expect("solver");
        let mut written = expression_system(
            &["v", "-g_over_l * sin(theta)"],
            &["theta", "v"],
            &[("g_over_l", 10.0)],
        );
        written.solver = build_solver("tsit5", 2).expect("solver");

        model.state = vec![0.3, 0.0];
        written.state = vec![0.3, 0.0];
        for _ in 0..20 {
            model.step(0.01);
            written.step(0.01);
        }
        for (a, b) in model.get_state().iter().zip(written.get_state()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn solve_starts_from_current_state() {
        let mut system =
            WasmSystem::from_parts(build_model("predator_prey").expect("model"), "rk4")
                .expect("solver");
        system.state = vec![300.0, 100.0];
        let trajectory = system
            .solve(&[0.0, 1.0, 2.0], IntegratorSettings::default())
            .expect("integrates");
        assert_eq!(trajectory.len(), 3);
        assert_eq!(trajectory.state(0), &[300.0, 100.0]);
    }

    #[test]
    fn solve_rejects_times_not_starting_at_current_time() {
        let mut system = expression_system(&["-x"], &["x"], &[]);
        system.state = vec![1.0];
        system.set_t(2.0);
        let err = system
            .solve(&[0.0, 1.0], IntegratorSettings::default())
            .expect_err("misaligned start");
        assert!(err.to_string().contains("system is at t = 2"));
    }
}
