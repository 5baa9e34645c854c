//! Local minimization of scalar objectives.
//!
//! Two methods are available: Nelder–Mead (derivative free) and BFGS with a
//! forward-difference gradient. Both report non-convergence through
//! [`MinimizeResult::success`] rather than an error; `Err` is reserved for
//! invalid input and failing objectives.

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NelderMeadSettings {
    /// Simplex spread in x at which the search stops.
    pub xatol: f64,
    /// Spread of objective values at which the search stops.
    pub fatol: f64,
    /// Defaults to 200 per dimension when `None`.
    pub max_iterations: Option<usize>,
    /// Defaults to 200 per dimension when `None`.
    pub max_evaluations: Option<usize>,
    /// Relative perturbation used to build the initial simplex.
    pub initial_spread: f64,
    /// Absolute perturbation for zero components of the initial guess.
    pub zero_spread: f64,
}

impl Default for NelderMeadSettings {
    fn default() -> Self {
        Self {
            xatol: 1e-4,
            fatol: 1e-4,
            max_iterations: None,
            max_evaluations: None,
            initial_spread: 0.05,
            zero_spread: 0.00025,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BfgsSettings {
    /// Stop once the max-norm of the gradient falls below this.
    pub gtol: f64,
    /// Forward-difference step for the gradient.
    pub eps: f64,
    /// Defaults to 200 per dimension when `None`.
    pub max_iterations: Option<usize>,
    /// Sufficient-decrease constant of the Armijo condition.
    pub armijo: f64,
    /// Backtracking contraction factor.
    pub backtrack: f64,
    pub max_line_search: usize,
}

impl Default for BfgsSettings {
    fn default() -> Self {
        Self {
            gtol: 1e-5,
            eps: 1.4901161193847656e-8,
            max_iterations: None,
            armijo: 1e-4,
            backtrack: 0.5,
            max_line_search: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Method {
    NelderMead(NelderMeadSettings),
    Bfgs(BfgsSettings),
}

impl Default for Method {
    fn default() -> Self {
        Method::Bfgs(BfgsSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinimizeStatus {
    Converged,
    MaxIterations,
    MaxEvaluations,
    /// The line search could not decrease the objective any further.
    PrecisionLoss,
    /// The objective or gradient became NaN or infinite.
    NonFinite,
}

impl MinimizeStatus {
    pub fn is_success(self) -> bool {
        matches!(self, MinimizeStatus::Converged)
    }
}

impl fmt::Display for MinimizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MinimizeStatus::Converged => "Optimization terminated successfully.",
            MinimizeStatus::MaxIterations => "Maximum number of iterations has been exceeded.",
            MinimizeStatus::MaxEvaluations => {
                "Maximum number of function evaluations has been exceeded."
            }
            MinimizeStatus::PrecisionLoss => {
                "Desired error not necessarily achieved due to precision loss."
            }
            MinimizeStatus::NonFinite => "NaN result encountered.",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimizeResult {
    pub x: Vec<f64>,
    pub fun: f64,
    pub success: bool,
    pub status: MinimizeStatus,
    pub message: String,
    pub iterations: usize,
    pub evaluations: usize,
    /// Last gradient estimate (BFGS only).
    pub jac: Option<Vec<f64>>,
}

impl MinimizeResult {
    fn new(
        x: Vec<f64>,
        fun: f64,
        status: MinimizeStatus,
        iterations: usize,
        evaluations: usize,
        jac: Option<Vec<f64>>,
    ) -> Self {
        Self {
            x,
            fun,
            success: status.is_success(),
            status,
            message: status.to_string(),
            iterations,
            evaluations,
            jac,
        }
    }
}

/// Result of minimizing a function of one variable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalarMinimum {
    pub x: f64,
    pub fun: f64,
    pub success: bool,
    pub status: MinimizeStatus,
    pub iterations: usize,
    pub evaluations: usize,
}

impl From<MinimizeResult> for ScalarMinimum {
    fn from(result: MinimizeResult) -> Self {
        Self {
            x: result.x[0],
            fun: result.fun,
            success: result.success,
            status: result.status,
            iterations: result.iterations,
            evaluations: result.evaluations,
        }
    }
}

/// Counts evaluations and maps non-finite values to +inf so comparisons stay
/// well ordered.
struct Counted<F> {
    objective: F,
    evaluations: usize,
}

impl<F> Counted<F>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    fn eval(&mut self, x: &[f64]) -> Result<f64> {
        self.evaluations += 1;
        let value = (self.objective)(x)
            .with_context(|| format!("Objective evaluation failed at x = {:?}", x))?;
        Ok(if value.is_nan() { f64::INFINITY } else { value })
    }
}

/// Minimizes `objective` starting from `x0`.
pub fn minimize<F>(objective: F, x0: &[f64], method: Method) -> Result<MinimizeResult>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    if x0.is_empty() {
        bail!("Initial guess must have positive dimension.");
    }
    if x0.iter().any(|v| !v.is_finite()) {
        bail!("Initial guess contains non-finite values.");
    }
    let mut counted = Counted {
        objective,
        evaluations: 0,
    };
    let result = match method {
        Method::NelderMead(settings) => nelder_mead(&mut counted, x0, settings)?,
        Method::Bfgs(settings) => bfgs(&mut counted, x0, settings)?,
    };
    debug!(
        x = ?result.x,
        fun = result.fun,
        iterations = result.iterations,
        evaluations = result.evaluations,
        status = ?result.status,
        "minimization finished"
    );
    Ok(result)
}

/// Minimizes a function of one variable starting from `guess`.
pub fn minimize_scalar<F>(mut objective: F, guess: f64, method: Method) -> Result<ScalarMinimum>
where
    F: FnMut(f64) -> Result<f64>,
{
    minimize(|x: &[f64]| objective(x[0]), &[guess], method).map(ScalarMinimum::from)
}

fn nelder_mead<F>(
    counted: &mut Counted<F>,
    x0: &[f64],
    settings: NelderMeadSettings,
) -> Result<MinimizeResult>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    if !(settings.xatol > 0.0) || !(settings.fatol > 0.0) {
        bail!("xatol and fatol must be positive.");
    }
    if !(settings.initial_spread > 0.0) || !(settings.zero_spread > 0.0) {
        bail!("Initial simplex spread must be positive.");
    }

    // Reflection, expansion, contraction, shrink.
    const RHO: f64 = 1.0;
    const CHI: f64 = 2.0;
    const PSI: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let n = x0.len();
    let max_iterations = settings.max_iterations.unwrap_or(200 * n);
    let max_evaluations = settings.max_evaluations.unwrap_or(200 * n);

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(x0.to_vec());
    for k in 0..n {
        let mut vertex = x0.to_vec();
        vertex[k] = if vertex[k] != 0.0 {
            (1.0 + settings.initial_spread) * vertex[k]
        } else {
            settings.zero_spread
        };
        simplex.push(vertex);
    }
    let mut values = Vec::with_capacity(n + 1);
    for vertex in &simplex {
        values.push(counted.eval(vertex)?);
    }

    let mut iterations = 0usize;
    let status = loop {
        sort_simplex(&mut simplex, &mut values);

        let x_spread = simplex[1..]
            .iter()
            .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        let f_spread = values[1..]
            .iter()
            .map(|v| (v - values[0]).abs())
            .fold(0.0, f64::max);
        if x_spread <= settings.xatol && f_spread <= settings.fatol {
            break MinimizeStatus::Converged;
        }
        if iterations >= max_iterations {
            break MinimizeStatus::MaxIterations;
        }
        if counted.evaluations >= max_evaluations {
            break MinimizeStatus::MaxEvaluations;
        }
        iterations += 1;

        let worst = n;
        let centroid: Vec<f64> = (0..n)
            .map(|i| simplex[..n].iter().map(|v| v[i]).sum::<f64>() / n as f64)
            .collect();
        let worst_vertex = simplex[worst].clone();
        let along = |scale: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&worst_vertex)
                .map(|(c, w)| c + scale * (c - w))
                .collect()
        };

        let reflected = along(RHO);
        let f_reflected = counted.eval(&reflected)?;

        if f_reflected < values[0] {
            let expanded = along(RHO * CHI);
            let f_expanded = counted.eval(&expanded)?;
            if f_expanded < f_reflected {
                simplex[worst] = expanded;
                values[worst] = f_expanded;
            } else {
                simplex[worst] = reflected;
                values[worst] = f_reflected;
            }
            continue;
        }
        if f_reflected < values[n - 1] {
            simplex[worst] = reflected;
            values[worst] = f_reflected;
            continue;
        }

        let mut shrink = false;
        if f_reflected < values[worst] {
            let contracted = along(PSI * RHO);
            let f_contracted = counted.eval(&contracted)?;
            if f_contracted <= f_reflected {
                simplex[worst] = contracted;
                values[worst] = f_contracted;
            } else {
                shrink = true;
            }
        } else {
            let contracted = along(-PSI);
            let f_contracted = counted.eval(&contracted)?;
            if f_contracted < values[worst] {
                simplex[worst] = contracted;
                values[worst] = f_contracted;
            } else {
                shrink = true;
            }
        }

        if shrink {
            let best = simplex[0].clone();
            for j in 1..=n {
                for i in 0..n {
                    simplex[j][i] = best[i] + SIGMA * (simplex[j][i] - best[i]);
                }
                values[j] = counted.eval(&simplex[j])?;
            }
        }
    };

    sort_simplex(&mut simplex, &mut values);
    let status = if values[0].is_finite() {
        status
    } else {
        MinimizeStatus::NonFinite
    };
    Ok(MinimizeResult::new(
        simplex.swap_remove(0),
        values[0],
        status,
        iterations,
        counted.evaluations,
        None,
    ))
}

fn sort_simplex(simplex: &mut Vec<Vec<f64>>, values: &mut Vec<f64>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let sorted_vertices: Vec<Vec<f64>> = order.iter().map(|&i| simplex[i].clone()).collect();
    let sorted_values: Vec<f64> = order.iter().map(|&i| values[i]).collect();
    *simplex = sorted_vertices;
    *values = sorted_values;
}

fn bfgs<F>(counted: &mut Counted<F>, x0: &[f64], settings: BfgsSettings) -> Result<MinimizeResult>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    if !(settings.gtol > 0.0) || !(settings.eps > 0.0) {
        bail!("gtol and eps must be positive.");
    }
    if !(settings.armijo > 0.0 && settings.armijo < 1.0) {
        bail!("armijo must lie in (0, 1).");
    }
    if !(settings.backtrack > 0.0 && settings.backtrack < 1.0) {
        bail!("backtrack must lie in (0, 1).");
    }

    let n = x0.len();
    let max_iterations = settings.max_iterations.unwrap_or(200 * n);
    let identity = DMatrix::<f64>::identity(n, n);
    let mut inverse_hessian = identity.clone();

    let mut x = DVector::from_column_slice(x0);
    let mut fx = counted.eval(x.as_slice())?;
    let mut gradient = forward_gradient(counted, &x, fx, settings.eps)?;
    let mut iterations = 0usize;

    let status = loop {
        if !fx.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
            break MinimizeStatus::NonFinite;
        }
        if gradient.amax() <= settings.gtol {
            break MinimizeStatus::Converged;
        }
        if iterations >= max_iterations {
            break MinimizeStatus::MaxIterations;
        }
        iterations += 1;

        let mut direction = -(&inverse_hessian * &gradient);
        let mut slope = gradient.dot(&direction);
        if !(slope < 0.0) {
            // Curvature information went bad; restart from steepest descent.
            inverse_hessian = identity.clone();
            direction = -gradient.clone();
            slope = gradient.dot(&direction);
        }

        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..settings.max_line_search {
            let candidate = &x + alpha * &direction;
            let f_candidate = counted.eval(candidate.as_slice())?;
            if f_candidate <= fx + settings.armijo * alpha * slope {
                accepted = Some((candidate, f_candidate));
                break;
            }
            alpha *= settings.backtrack;
        }
        let Some((x_new, f_new)) = accepted else {
            break MinimizeStatus::PrecisionLoss;
        };

        let gradient_new = forward_gradient(counted, &x_new, f_new, settings.eps)?;
        let s = &x_new - &x;
        let y = &gradient_new - &gradient;
        let sy = y.dot(&s);
        if sy > 0.0 && sy.is_finite() {
            let rho = 1.0 / sy;
            let left = &identity - rho * (&s * y.transpose());
            let right = &identity - rho * (&y * s.transpose());
            inverse_hessian = &left * &inverse_hessian * &right + rho * (&s * s.transpose());
        }

        x = x_new;
        fx = f_new;
        gradient = gradient_new;
    };

    Ok(MinimizeResult::new(
        x.iter().copied().collect(),
        fx,
        status,
        iterations,
        counted.evaluations,
        Some(gradient.iter().copied().collect()),
    ))
}

fn forward_gradient<F>(
    counted: &mut Counted<F>,
    x: &DVector<f64>,
    fx: f64,
    eps: f64,
) -> Result<DVector<f64>>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    let mut gradient = DVector::zeros(x.len());
    let mut probe = x.clone();
    for i in 0..x.len() {
        probe[i] = x[i] + eps;
        gradient[i] = (counted.eval(probe.as_slice())? - fx) / eps;
        probe[i] = x[i];
    }
    Ok(gradient)
}

#[cfg(test)]
mod tests {
    use super::{
        minimize, minimize_scalar, BfgsSettings, Method, MinimizeStatus, NelderMeadSettings,
    };
    use anyhow::anyhow;

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn nelder_mead() -> Method {
        Method::NelderMead(NelderMeadSettings::default())
    }

    fn rosenbrock(x: &[f64]) -> anyhow::Result<f64> {
        Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
    }

    #[test]
    fn bfgs_finds_quadratic_minimum() {
        let result = minimize(
            |x| Ok((x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2) + 5.0),
            &[0.0, 0.0],
            Method::default(),
        )
        .expect("minimization should run");
        assert!(result.success, "{}", result.message);
        assert_eq!(result.status, MinimizeStatus::Converged);
        assert!((result.x[0] - 3.0).abs() < 1e-4);
        assert!((result.x[1] + 1.0).abs() < 1e-4);
        assert!((result.fun - 5.0).abs() < 1e-8);
        assert!(result.jac.is_some());
    }

    #[test]
    fn nelder_mead_finds_rosenbrock_minimum() {
        let settings = NelderMeadSettings {
            xatol: 1e-8,
            fatol: 1e-10,
            max_iterations: Some(2000),
            max_evaluations: Some(4000),
            ..NelderMeadSettings::default()
        };
        let result = minimize(rosenbrock, &[-1.2, 1.0], Method::NelderMead(settings))
            .expect("minimization should run");
        assert!(result.success, "{}", result.message);
        assert!((result.x[0] - 1.0).abs() < 1e-4);
        assert!((result.x[1] - 1.0).abs() < 1e-4);
        assert!(result.jac.is_none());
    }

    #[test]
    fn scalar_minimum_of_cosine() {
        let result = minimize_scalar(|t| Ok(t.cos()), 2.5, nelder_mead())
            .expect("minimization should run");
        assert!(result.success);
        assert!((result.x - std::f64::consts::PI).abs() < 1e-3);
        assert!((result.fun + 1.0).abs() < 1e-6);

        let result = minimize_scalar(|t| Ok(t.cos()), 2.5, Method::default())
            .expect("minimization should run");
        assert!((result.x - std::f64::consts::PI).abs() < 1e-3);
    }

    #[test]
    fn zero_guess_uses_absolute_spread() {
        let result = minimize_scalar(|t| Ok((t - 0.01).powi(2)), 0.0, nelder_mead())
            .expect("minimization should run");
        assert!(result.success);
        assert!((result.x - 0.01).abs() < 1e-3);
    }

    #[test]
    fn iteration_budget_reports_failure_without_error() {
        let settings = NelderMeadSettings {
            max_iterations: Some(3),
            ..NelderMeadSettings::default()
        };
        let result = minimize(rosenbrock, &[-1.2, 1.0], Method::NelderMead(settings))
            .expect("minimization should run");
        assert!(!result.success);
        assert_eq!(result.status, MinimizeStatus::MaxIterations);
        assert_eq!(result.iterations, 3);

        let settings = BfgsSettings {
            max_iterations: Some(1),
            ..BfgsSettings::default()
        };
        let result = minimize(rosenbrock, &[-1.2, 1.0], Method::Bfgs(settings))
            .expect("minimization should run");
        assert!(!result.success);
        assert_eq!(result.status, MinimizeStatus::MaxIterations);
    }

    #[test]
    fn unbounded_objective_is_not_a_success() {
        let result = minimize_scalar(|t| Ok(-t), 1.0, Method::default())
            .expect("minimization should run");
        assert!(!result.success);
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert_err_contains(minimize(|_| Ok(0.0), &[], Method::default()), "positive dimension");
        assert_err_contains(
            minimize(|_| Ok(0.0), &[f64::INFINITY], Method::default()),
            "non-finite",
        );
        assert_err_contains(
            minimize(
                |_| Ok(0.0),
                &[1.0],
                Method::NelderMead(NelderMeadSettings {
                    xatol: 0.0,
                    ..NelderMeadSettings::default()
                }),
            ),
            "xatol",
        );
    }

    #[test]
    fn objective_errors_propagate() {
        assert_err_contains(
            minimize_scalar(|_| Err(anyhow!("solver exploded")), 1.0, nelder_mead()),
            "solver exploded",
        );
    }
}
