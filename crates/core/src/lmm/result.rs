use nalgebra::DMatrix;

/// The result of fitting a linear mixed model.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Covariance parameters at the optimum.
    pub theta: Vec<f64>,
    /// REML criterion or ML deviance at the optimum.
    pub deviance: f64,
    pub reml: bool,
    /// Fixed effects.
    pub fixed_effects: Vec<NamedEffect>,
    /// Residual standard deviation.
    pub sigma: f64,
    /// Per-term covariance of the random effects (scaled by sigma^2).
    pub covariances: Vec<TermCovariance>,
    /// Conditional modes, organized by random term.
    pub random_effects: Vec<RandomEffectBlock>,
    /// Fitted values, offset included.
    pub fitted: Vec<f64>,
    /// Residuals: y - fitted.
    pub residuals: Vec<f64>,
    /// Optimizer iterations performed.
    pub n_iterations: u64,
    /// Whether the optimizer reported convergence.
    pub converged: bool,
    /// Model dimensions.
    pub n_obs: usize,
    pub n_fixed_params: usize,
    pub n_theta: usize,
}

/// A named fixed-effect estimate.
#[derive(Debug, Clone)]
pub struct NamedEffect {
    pub name: String,
    pub estimate: f64,
}

/// Random-effects covariance of one term.
#[derive(Debug, Clone)]
pub struct TermCovariance {
    pub term: String,
    /// `sigma^2 T'T`, `nc x nc`.
    pub covariance: DMatrix<f64>,
    pub std_devs: Vec<f64>,
    pub correlation: DMatrix<f64>,
}

/// Conditional modes of a single random term: one row per level, one column
/// per model-matrix column.
#[derive(Debug, Clone)]
pub struct RandomEffectBlock {
    pub term: String,
    pub levels: Vec<String>,
    pub modes: DMatrix<f64>,
}

impl RandomEffectBlock {
    /// Modes of the level named `level`, if present.
    pub fn level(&self, level: &str) -> Option<Vec<f64>> {
        let i = self.levels.iter().position(|l| l == level)?;
        Some(self.modes.row(i).iter().copied().collect())
    }
}

impl FitResult {
    /// Log-likelihood (restricted when fitted by REML): `-deviance / 2`.
    pub fn log_likelihood(&self) -> f64 {
        -0.5 * self.deviance
    }

    /// Number of estimated parameters: fixed effects, theta and sigma.
    pub fn n_parameters(&self) -> usize {
        self.n_fixed_params + self.n_theta + 1
    }

    /// AIC = -2 * logL + 2 * k.
    pub fn aic(&self) -> f64 {
        self.deviance + 2.0 * self.n_parameters() as f64
    }

    /// BIC = -2 * logL + k * ln(n).
    pub fn bic(&self) -> f64 {
        self.deviance + self.n_parameters() as f64 * (self.n_obs as f64).ln()
    }

    /// Print a formatted summary of the model fit.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        let method = if self.reml { "REML" } else { "ML" };
        s.push_str(&format!("=== Linear Mixed Model Fit ({method}) ===\n\n"));
        s.push_str(&format!(
            "Observations: {}   Fixed params: {}   Covariance params: {}\n",
            self.n_obs, self.n_fixed_params, self.n_theta
        ));
        s.push_str(&format!(
            "Converged: {}   Iterations: {}\n\n",
            self.converged, self.n_iterations
        ));

        let label = if self.reml { "REML criterion" } else { "Deviance" };
        s.push_str(&format!("{label}: {:.4}\n", self.deviance));
        s.push_str(&format!("Log-likelihood: {:.4}\n", self.log_likelihood()));
        s.push_str(&format!("AIC: {:.4}\n", self.aic()));
        s.push_str(&format!("BIC: {:.4}\n\n", self.bic()));

        s.push_str("--- Random Effects ---\n");
        for cov in &self.covariances {
            for (j, sd) in cov.std_devs.iter().enumerate() {
                s.push_str(&format!(
                    "  {}[{}]: variance={:.6}  sd={:.6}",
                    cov.term,
                    j,
                    cov.covariance[(j, j)],
                    sd
                ));
                if j > 0 {
                    let corr: Vec<String> = (0..j)
                        .map(|k| format!("{:.3}", cov.correlation[(j, k)]))
                        .collect();
                    s.push_str(&format!("  corr=[{}]", corr.join(", ")));
                }
                s.push('\n');
            }
        }
        s.push_str(&format!(
            "  Residual: variance={:.6}  sd={:.6}\n",
            self.sigma * self.sigma,
            self.sigma
        ));

        s.push_str("\n--- Fixed Effects ---\n");
        for ef in &self.fixed_effects {
            s.push_str(&format!("  {}: {:.6}\n", ef.name, ef.estimate));
        }

        for block in &self.random_effects {
            s.push_str(&format!(
                "\n--- Conditional Modes: {} ({} levels) ---\n",
                block.term,
                block.levels.len()
            ));
            let show = block.levels.len().min(10);
            for (i, level) in block.levels.iter().take(show).enumerate() {
                let row: Vec<String> =
                    block.modes.row(i).iter().map(|v| format!("{v:.6}")).collect();
                s.push_str(&format!("  {}: {}\n", level, row.join("  ")));
            }
            if block.levels.len() > 10 {
                s.push_str(&format!("  ... and {} more\n", block.levels.len() - 10));
            }
        }

        s
    }
}
