use crate::error::{LmmError, Result};
use crate::lmm::{FitOptions, PlsEvaluator};
use crate::types::DenseMatrix;

use super::design::intercept_column;
use super::random_effects::{RandomEffects, RandomTerm};

/// A fully specified linear mixed model, ready for fitting.
#[derive(Debug, Clone)]
pub struct MixedModel {
    /// Response vector (y).
    pub y: Vec<f64>,
    /// Fixed effects design matrix (X), `n x p`.
    pub x: DenseMatrix,
    /// Names of the columns of X.
    pub fixed_names: Vec<String>,
    /// Assembled random-effects structure.
    pub random_effects: RandomEffects,
    /// Prior weights (None = unit weights).
    pub weights: Option<Vec<f64>>,
    /// Offset added to the linear predictor (None = zero).
    pub offset: Option<Vec<f64>>,
    pub options: FitOptions,
}

impl MixedModel {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    /// A fresh deviance evaluator borrowing this model's data.
    pub fn evaluator(&self) -> Result<PlsEvaluator<'_>> {
        PlsEvaluator::from_random_effects(
            &self.x,
            &self.y,
            &self.random_effects,
            self.weights.as_deref(),
            self.offset.as_deref(),
            self.options.reml,
        )
    }
}

/// Builder for constructing a [`MixedModel`].
#[derive(Debug, Default)]
pub struct MixedModelBuilder {
    response: Option<Vec<f64>>,
    fixed: Option<(DenseMatrix, Vec<String>)>,
    random_terms: Vec<RandomTerm>,
    weights: Option<Vec<f64>>,
    offset: Option<Vec<f64>>,
    options: FitOptions,
}

impl MixedModelBuilder {
    /// Create a new builder with default fit options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response vector.
    pub fn response(mut self, y: Vec<f64>) -> Self {
        self.response = Some(y);
        self
    }

    /// Set the fixed-effects design. If never called, X is a column of ones.
    pub fn fixed(mut self, x: DenseMatrix) -> Self {
        let names = (0..x.ncols()).map(|j| format!("x{}", j + 1)).collect();
        self.fixed = Some((x, names));
        self
    }

    /// Set the fixed-effects design with column names.
    pub fn fixed_named(mut self, x: DenseMatrix, names: &[&str]) -> Self {
        self.fixed = Some((x, names.iter().map(|s| s.to_string()).collect()));
        self
    }

    /// Add a random-effects term. Terms keep the order in which they are added.
    pub fn random(mut self, term: RandomTerm) -> Self {
        self.random_terms.push(term);
        self
    }

    /// Set prior weights.
    pub fn weights(mut self, w: Vec<f64>) -> Self {
        self.weights = Some(w);
        self
    }

    /// Set an offset for the linear predictor.
    pub fn offset(mut self, offset: Vec<f64>) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Choose REML (default) or maximum likelihood.
    pub fn reml(mut self, reml: bool) -> Self {
        self.options.reml = reml;
        self
    }

    /// Replace all fit options.
    pub fn options(mut self, options: FitOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and assemble the model.
    pub fn build(self) -> Result<MixedModel> {
        let y = self
            .response
            .ok_or_else(|| LmmError::Data("response not set".to_string()))?;
        let n = y.len();

        let (x, fixed_names) = match self.fixed {
            Some((x, names)) => {
                if names.len() != x.ncols() {
                    return Err(LmmError::DimensionMismatch {
                        expected: x.ncols(),
                        got: names.len(),
                        context: "fixed-effect names vs columns of X".to_string(),
                    });
                }
                (x, names)
            }
            None => (intercept_column(n), vec!["(Intercept)".to_string()]),
        };
        if x.nrows() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: x.nrows(),
                context: "rows of X vs length of y".to_string(),
            });
        }

        if self.random_terms.is_empty() {
            return Err(LmmError::Data(
                "at least one random-effects term is required".to_string(),
            ));
        }
        let random_effects = RandomEffects::assemble(&self.random_terms)?;
        if random_effects.n_obs() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: random_effects.n_obs(),
                context: "grouping factor length vs length of y".to_string(),
            });
        }

        for (label, v) in [("weights", &self.weights), ("offset", &self.offset)] {
            if let Some(v) = v {
                if v.len() != n {
                    return Err(LmmError::DimensionMismatch {
                        expected: n,
                        got: v.len(),
                        context: format!("length of {label}"),
                    });
                }
            }
        }
        self.options.validate()?;

        Ok(MixedModel {
            y,
            x,
            fixed_names,
            random_effects,
            weights: self.weights,
            offset: self.offset,
            options: self.options,
        })
    }
}
