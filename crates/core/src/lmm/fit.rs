//! Optimization of the profiled deviance over the covariance parameters.
//!
//! The evaluator is wrapped as an `argmin` cost function and minimized with
//! Nelder-Mead. Lower bounds are honored by projecting every trial point onto
//! the feasible box before it is evaluated.

use std::cell::RefCell;

use argmin::core::{
    CostFunction, Error, Executor, State, TerminationReason, TerminationStatus,
};
use argmin::solver::neldermead::NelderMead;
use nalgebra::DMatrix;

use crate::error::{LmmError, Result};
use crate::matrix::dense::covariance_to_correlation;
use crate::model::{MixedModel, RandomEffects};

use super::pls::{PlsEvaluator, PlsSolution};
use super::result::{FitResult, NamedEffect, RandomEffectBlock, TermCovariance};

/// Settings for [`MixedModel::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Maximum number of Nelder-Mead iterations.
    pub max_iterations: u64,
    /// Stop when the standard deviation of the simplex costs falls below this.
    pub sd_tolerance: f64,
    /// Offset of the initial simplex vertices from the starting point.
    pub initial_step: f64,
    /// REML criterion (true) or ML deviance (false).
    pub reml: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            sd_tolerance: 1e-10,
            initial_step: 0.25,
            reml: true,
        }
    }
}

impl FitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_iterations(mut self, n: u64) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn sd_tolerance(mut self, tol: f64) -> Self {
        self.sd_tolerance = tol;
        self
    }

    pub fn initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self
    }

    pub fn reml(mut self, reml: bool) -> Self {
        self.reml = reml;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(LmmError::Configuration(
                "max_iterations must be positive".to_string(),
            ));
        }
        if !(self.sd_tolerance > 0.0) {
            return Err(LmmError::Configuration(
                "sd_tolerance must be positive".to_string(),
            ));
        }
        if !(self.initial_step > 0.0) || !self.initial_step.is_finite() {
            return Err(LmmError::Configuration(
                "initial_step must be positive and finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// `theta` clamped to its lower bounds.
fn project(theta: &[f64], lower: &[f64]) -> Vec<f64> {
    theta.iter().zip(lower).map(|(&t, &l)| t.max(l)).collect()
}

/// Exposes an evaluator as an `argmin` minimization problem.
///
/// `CostFunction::cost` takes `&self` while evaluation mutates the evaluator's
/// cache, hence the `RefCell`.
struct DevianceProblem<'e, 'a> {
    evaluator: RefCell<&'e mut PlsEvaluator<'a>>,
    lower: &'e [f64],
}

impl CostFunction for DevianceProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let theta = project(theta, self.lower);
        Ok(self.evaluator.borrow_mut().objective(&theta)?)
    }
}

fn initial_simplex(theta0: &[f64], step: f64) -> Vec<Vec<f64>> {
    let mut vertices = vec![theta0.to_vec()];
    for i in 0..theta0.len() {
        let mut v = theta0.to_vec();
        v[i] += step;
        vertices.push(v);
    }
    vertices
}

/// Recover a crate error passed through `argmin`, or wrap the backend's own.
fn from_argmin(e: Error) -> LmmError {
    match e.downcast::<LmmError>() {
        Ok(inner) => inner,
        Err(e) => LmmError::Optimizer(e.to_string()),
    }
}

/// Minimize the evaluator's objective from `theta0`.
///
/// Returns the projected optimum, the iteration count and whether the solver
/// reported convergence.
pub fn minimize(
    evaluator: &mut PlsEvaluator<'_>,
    theta0: &[f64],
    lower: &[f64],
    options: &FitOptions,
) -> Result<(Vec<f64>, u64, bool)> {
    options.validate()?;
    if theta0.len() != evaluator.n_theta() || lower.len() != theta0.len() {
        return Err(LmmError::DimensionMismatch {
            expected: evaluator.n_theta(),
            got: if theta0.len() != evaluator.n_theta() {
                theta0.len()
            } else {
                lower.len()
            },
            context: "starting theta / lower bounds".to_string(),
        });
    }
    let start = project(theta0, lower);

    let solver = NelderMead::new(initial_simplex(&start, options.initial_step))
        .with_sd_tolerance(options.sd_tolerance)
        .map_err(from_argmin)?;
    let problem = DevianceProblem {
        evaluator: RefCell::new(evaluator),
        lower,
    };
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(options.max_iterations))
        .run()
        .map_err(from_argmin)?;

    let state = result.state();
    let best = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| LmmError::Optimizer("optimizer returned no parameters".to_string()))?;
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    if !converged {
        log::warn!(
            "Nelder-Mead stopped without converging: {:?}",
            state.get_termination_status()
        );
    }
    Ok((project(&best, lower), state.get_iter(), converged))
}

impl MixedModel {
    /// Fit the model by minimizing the REML criterion or ML deviance.
    pub fn fit(&self) -> Result<FitResult> {
        let re = &self.random_effects;
        let mut evaluator = self.evaluator()?;
        let (theta, n_iterations, converged) =
            minimize(&mut evaluator, &re.theta, &re.lower, &self.options)?;

        evaluator.evaluate(&theta)?;
        let solution = evaluator
            .solution()
            .cloned()
            .ok_or_else(|| LmmError::Optimizer("no solution at the optimum".to_string()))?;

        log::info!(
            "fit finished after {} iterations (converged = {}): {} = {:.6}, theta = {:?}",
            n_iterations,
            converged,
            if self.options.reml { "REML criterion" } else { "deviance" },
            solution.deviance,
            theta
        );

        self.collect_result(theta, solution, n_iterations, converged)
    }

    fn collect_result(
        &self,
        theta: Vec<f64>,
        solution: PlsSolution,
        n_iterations: u64,
        converged: bool,
    ) -> Result<FitResult> {
        let re = &self.random_effects;
        let sigma2 = solution.sigma * solution.sigma;

        let covariances = re
            .relative_covariances(&theta)?
            .into_iter()
            .zip(&re.terms)
            .map(|(relative, term)| {
                let covariance = relative * sigma2;
                let (std_devs, correlation) = covariance_to_correlation(&covariance);
                TermCovariance {
                    term: term.name.clone(),
                    covariance,
                    std_devs,
                    correlation,
                }
            })
            .collect();

        let fixed_effects = self
            .fixed_names
            .iter()
            .zip(&solution.beta)
            .map(|(name, &estimate)| NamedEffect {
                name: name.clone(),
                estimate,
            })
            .collect();

        let residuals = self
            .y
            .iter()
            .zip(&solution.mu)
            .map(|(y, mu)| y - mu)
            .collect();

        Ok(FitResult {
            n_theta: theta.len(),
            theta,
            deviance: solution.deviance,
            reml: solution.reml,
            fixed_effects,
            sigma: solution.sigma,
            covariances,
            random_effects: split_modes(re, &solution.b),
            fitted: solution.mu,
            residuals,
            n_iterations,
            converged,
            n_obs: self.n_obs(),
            n_fixed_params: self.n_fixed(),
        })
    }
}

/// Per-term blocks of `b`; within a term the effects of one level are
/// contiguous.
fn split_modes(re: &RandomEffects, b: &[f64]) -> Vec<RandomEffectBlock> {
    re.terms
        .iter()
        .map(|term| {
            let nc = term.n_columns;
            let modes = DMatrix::from_fn(term.n_levels, nc, |l, j| {
                b[term.row_offset + l * nc + j]
            });
            RandomEffectBlock {
                term: term.name.clone(),
                levels: term.level_names.clone(),
                modes,
            }
        })
        .collect()
}
