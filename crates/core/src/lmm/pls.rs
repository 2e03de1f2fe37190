//! Penalized least squares evaluation of the profiled deviance.
//!
//! For covariance parameters `theta` the evaluator solves
//!
//! ```text
//! min_{beta, u}  || W^{1/2} (y - offset - X beta - Z Lambda u) ||^2 + ||u||^2
//! ```
//!
//! through the sparse Cholesky factor of `A = Lambdat Zt W Z Lambda + I`:
//!
//! ```text
//! RZX' RZX = (Lambdat Zt W X)' A^{-1} (Lambdat Zt W X)
//! DD       = X'WX - RZX' RZX
//! DD beta  = X'Wy - RZX' cu
//! u        = A^{-1} Lambdat Zt W (y - offset - X beta)
//! ```
//!
//! and returns `log|A| (+ log|DD|) + n_eff (1 + log(2 pi pwrss / n_eff))`.

use std::borrow::Cow;
use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::error::{LmmError, Result};
use crate::matrix::dense::solve_spd_with_logdet;
use crate::matrix::sparse::{
    product_pattern, scale_columns, sparse_dense_product, spmv, spmv_into, xt_y, UpperPattern,
};
use crate::matrix::SparseCholeskySolver;
use crate::model::{RandomEffects, ThetaMapping};
use crate::types::{DenseMatrix, SparseMat};

/// Read-only data an evaluator is built from.
#[derive(Debug, Clone, Copy)]
pub struct PlsInputs<'a> {
    /// Fixed-effects design, `n x p`.
    pub x: &'a DenseMatrix,
    /// Response, length `n`.
    pub y: &'a [f64],
    /// Transposed random-effects design, `q x n`.
    pub zt: &'a SparseMat,
    /// Prior weights (default: all ones).
    pub weights: Option<&'a [f64]>,
    /// Offset added to the linear predictor (default: zeros).
    pub offset: Option<&'a [f64]>,
}

impl<'a> PlsInputs<'a> {
    pub fn new(x: &'a DenseMatrix, y: &'a [f64], zt: &'a SparseMat) -> Self {
        Self {
            x,
            y,
            zt,
            weights: None,
            offset: None,
        }
    }

    pub fn weights(mut self, weights: &'a [f64]) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn offset(mut self, offset: &'a [f64]) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Results of the most recent successful evaluation.
#[derive(Debug, Clone)]
pub struct PlsSolution {
    pub theta: Vec<f64>,
    /// Fixed-effects estimates.
    pub beta: Vec<f64>,
    /// Spherical random effects.
    pub u: Vec<f64>,
    /// Random-effects modes, `Lambdat' u`.
    pub b: Vec<f64>,
    /// Fitted mean, offset included.
    pub mu: Vec<f64>,
    /// Weighted residual sum of squares plus `||u||^2`.
    pub pwrss: f64,
    /// `log|A|`, twice the log-determinant of the sparse Cholesky factor.
    pub ld_l2: f64,
    /// `log|DD|`.
    pub ld_rx2: f64,
    /// Residual standard deviation, `sqrt(pwrss / n_eff)`.
    pub sigma: f64,
    /// Profiled deviance (ML) or REML criterion.
    pub deviance: f64,
    pub reml: bool,
}

/// Mutable state of an evaluator.
///
/// Owned exclusively by one [`PlsEvaluator`]; every evaluation overwrites the
/// buffers it reads, so a failed evaluation leaves nothing behind that a later
/// one depends on.
#[derive(Debug, Default)]
pub struct PlsCache {
    /// Sparse Cholesky factor; analyzed on the first evaluation.
    factor: Option<SparseCholeskySolver>,
    /// Values of `A` on the fixed upper pattern.
    a_values: Vec<f64>,
    /// Column of `Lambdat * ZtW`.
    column: Vec<f64>,
    solution: Option<PlsSolution>,
    n_analyses: usize,
    n_evaluations: usize,
}

impl PlsCache {
    /// Number of symbolic analyses performed (at most one after success).
    pub fn n_analyses(&self) -> usize {
        self.n_analyses
    }

    /// Number of evaluations attempted.
    pub fn n_evaluations(&self) -> usize {
        self.n_evaluations
    }

    pub fn solution(&self) -> Option<&PlsSolution> {
        self.solution.as_ref()
    }
}

/// Stateful profiled-deviance evaluator `theta -> scalar`.
///
/// Not safe for concurrent use: every evaluation takes `&mut self`. Separate
/// instances share nothing and may run on different threads.
#[derive(Debug)]
pub struct PlsEvaluator<'a> {
    x: &'a DenseMatrix,
    y: &'a [f64],
    zt: &'a SparseMat,
    offset: Cow<'a, [f64]>,
    reml: bool,

    /// Private copy of `Lambdat`; only its values change.
    lambdat: SparseMat,
    mapping: Box<dyn ThetaMapping + 'a>,

    sqrt_w: Vec<f64>,
    ztw: SparseMat,
    xtwx: DenseMatrix,
    xtwy: Vec<f64>,
    ztwx: DenseMatrix,
    ztwy: Vec<f64>,
    /// Structural rows of each column of `Lambdat * ZtW`.
    lz_rows: Vec<Vec<usize>>,
    a_pattern: UpperPattern,

    cache: PlsCache,
}

impl<'a> PlsEvaluator<'a> {
    /// Validate the inputs and precompute all `theta`-independent products.
    pub fn new(
        inputs: PlsInputs<'a>,
        lambdat: SparseMat,
        mapping: Box<dyn ThetaMapping + 'a>,
        reml: bool,
    ) -> Result<Self> {
        let PlsInputs {
            x,
            y,
            zt,
            weights,
            offset,
        } = inputs;
        let n = y.len();
        let p = x.ncols();
        let q = zt.rows();

        if x.nrows() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: x.nrows(),
                context: "rows of X vs length of y".to_string(),
            });
        }
        if zt.cols() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: zt.cols(),
                context: "columns of Zt vs length of y".to_string(),
            });
        }
        if lambdat.rows() != q || lambdat.cols() != q {
            return Err(LmmError::DimensionMismatch {
                expected: q,
                got: if lambdat.rows() != q {
                    lambdat.rows()
                } else {
                    lambdat.cols()
                },
                context: "Lambdat must be q x q with q = rows of Zt".to_string(),
            });
        }
        if !lambdat.is_csc() {
            // Mapped values are written in column-major storage order.
            return Err(LmmError::Data(
                "Lambdat must be stored in CSC format".to_string(),
            ));
        }
        if lambdat.iter().any(|(_, (row, col))| row > col) {
            return Err(LmmError::Data(
                "Lambdat must have an upper-triangular pattern".to_string(),
            ));
        }
        if reml && p >= n {
            return Err(LmmError::Data(format!(
                "REML needs more observations ({n}) than fixed effects ({p})"
            )));
        }
        if n == 0 {
            return Err(LmmError::Data("no observations".to_string()));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(LmmError::Data("response contains non-finite values".to_string()));
        }

        let sqrt_w: Vec<f64> = match weights {
            Some(w) => {
                if w.len() != n {
                    return Err(LmmError::DimensionMismatch {
                        expected: n,
                        got: w.len(),
                        context: "length of weights".to_string(),
                    });
                }
                if w.iter().any(|&wi| !(wi >= 0.0) || !wi.is_finite()) {
                    return Err(LmmError::InvalidParameter(
                        "weights must be finite and non-negative".to_string(),
                    ));
                }
                w.iter().map(|wi| wi.sqrt()).collect()
            }
            None => vec![1.0; n],
        };
        let offset = match offset {
            Some(o) => {
                if o.len() != n {
                    return Err(LmmError::DimensionMismatch {
                        expected: n,
                        got: o.len(),
                        context: "length of offset".to_string(),
                    });
                }
                Cow::Borrowed(o)
            }
            None => Cow::Owned(vec![0.0; n]),
        };

        let wx = DMatrix::from_fn(n, p, |i, j| sqrt_w[i] * x[(i, j)]);
        let wy: Vec<f64> = (0..n).map(|i| sqrt_w[i] * (y[i] - offset[i])).collect();
        let ztw = scale_columns(zt, &sqrt_w);

        let xtwx = wx.transpose() * &wx;
        let xtwy: Vec<f64> = (0..p)
            .map(|j| (0..n).map(|i| wx[(i, j)] * wy[i]).sum())
            .collect();
        let ztwx = sparse_dense_product(&ztw, &wx);
        let ztwy = spmv(&ztw, &wy);

        let lz_rows = product_pattern(&lambdat, &ztw);
        let a_pattern = UpperPattern::from_outer_products(q, &lz_rows);

        log::debug!(
            "PLS evaluator: n = {n}, p = {p}, q = {q}, nnz(Lambdat) = {}, nnz(A upper) = {}, reml = {reml}",
            lambdat.nnz(),
            a_pattern.nnz()
        );

        let cache = PlsCache {
            a_values: vec![0.0; a_pattern.nnz()],
            column: vec![0.0; q],
            ..Default::default()
        };

        Ok(Self {
            x,
            y,
            zt,
            offset,
            reml,
            lambdat,
            mapping,
            sqrt_w,
            ztw,
            xtwx,
            xtwy,
            ztwx,
            ztwy,
            lz_rows,
            a_pattern,
            cache,
        })
    }

    /// Evaluator for an assembled random-effects structure.
    pub fn from_random_effects(
        x: &'a DenseMatrix,
        y: &'a [f64],
        random_effects: &'a RandomEffects,
        weights: Option<&'a [f64]>,
        offset: Option<&'a [f64]>,
        reml: bool,
    ) -> Result<Self> {
        let inputs = PlsInputs {
            x,
            y,
            zt: &random_effects.zt,
            weights,
            offset,
        };
        Self::new(
            inputs,
            random_effects.lambdat.clone(),
            Box::new(random_effects.mapping.clone()),
            reml,
        )
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_random(&self) -> usize {
        self.zt.rows()
    }

    pub fn n_theta(&self) -> usize {
        self.mapping.n_theta()
    }

    pub fn reml(&self) -> bool {
        self.reml
    }

    /// Switch between the REML criterion and the ML deviance.
    pub fn set_reml(&mut self, reml: bool) -> Result<()> {
        if reml && self.n_fixed() >= self.n_obs() {
            return Err(LmmError::Data(
                "REML needs more observations than fixed effects".to_string(),
            ));
        }
        self.reml = reml;
        Ok(())
    }

    /// The evaluator's copy of `Lambdat` with the most recently mapped values.
    pub fn lambdat(&self) -> &SparseMat {
        &self.lambdat
    }

    pub fn cache(&self) -> &PlsCache {
        &self.cache
    }

    /// Solution of the last successful evaluation.
    pub fn solution(&self) -> Option<&PlsSolution> {
        self.cache.solution.as_ref()
    }

    /// Evaluate the profiled deviance (or REML criterion) at `theta`.
    pub fn evaluate(&mut self, theta: &[f64]) -> Result<f64> {
        self.cache.n_evaluations += 1;
        self.cache.solution = None;

        self.update_lambdat(theta)?;
        self.update_factor()?;
        let solution = self.solve(theta)?;
        let deviance = solution.deviance;

        log::debug!("theta = {theta:?} -> {deviance:.6}");
        self.cache.solution = Some(solution);
        Ok(deviance)
    }

    /// [`evaluate`](Self::evaluate) for optimizers: numerical failures become
    /// `f64::INFINITY` so the search can move away from that region. Validation
    /// and configuration errors are returned as errors.
    pub fn objective(&mut self, theta: &[f64]) -> Result<f64> {
        match self.evaluate(theta) {
            Ok(value) => Ok(value),
            Err(e) if e.is_numerical() => {
                log::warn!("deviance evaluation failed at theta = {theta:?}: {e}");
                Ok(f64::INFINITY)
            }
            Err(e) => Err(e),
        }
    }

    /// Write the mapped values into `Lambdat`; the pattern is untouched.
    fn update_lambdat(&mut self, theta: &[f64]) -> Result<()> {
        let values = self.mapping.map(theta)?;
        if values.len() != self.lambdat.nnz() {
            return Err(LmmError::Configuration(format!(
                "parameter mapping returned {} values for {} structural non-zeros of Lambdat",
                values.len(),
                self.lambdat.nnz()
            )));
        }
        self.lambdat.data_mut().copy_from_slice(&values);
        if values.iter().any(|v| !v.is_finite()) {
            return Err(LmmError::CholeskyFailed(format!(
                "non-finite Lambdat values at theta = {theta:?}"
            )));
        }
        Ok(())
    }

    /// Numeric values of `A = Lambdat ZtW (Lambdat ZtW)' + I` on the
    /// fixed pattern, then (re)factorization.
    fn update_factor(&mut self) -> Result<()> {
        let values = &mut self.cache.a_values;
        let column = &mut self.cache.column;
        values.fill(0.0);

        for (i, rows) in self.lz_rows.iter().enumerate() {
            for &r in rows {
                column[r] = 0.0;
            }
            if let Some(ztw_col) = self.ztw.outer_view(i) {
                for (k, &zv) in ztw_col.iter() {
                    if let Some(l_col) = self.lambdat.outer_view(k) {
                        for (r, &lv) in l_col.iter() {
                            column[r] += lv * zv;
                        }
                    }
                }
            }
            for (a, &r1) in rows.iter().enumerate() {
                for &r2 in &rows[a..] {
                    let pos = self.a_pattern.position(r1, r2).ok_or_else(|| {
                        LmmError::Configuration(format!(
                            "entry ({r1}, {r2}) outside the analyzed pattern"
                        ))
                    })?;
                    values[pos] += column[r1] * column[r2];
                }
            }
        }
        for j in 0..self.a_pattern.dim() {
            if let Some(pos) = self.a_pattern.position(j, j) {
                values[pos] += 1.0;
            }
        }

        let upper = self.a_pattern.triplets(values);
        match self.cache.factor.as_mut() {
            Some(factor) => factor.factorize(&upper),
            None => {
                let mut factor = SparseCholeskySolver::analyze(self.a_pattern.dim(), &upper)?;
                self.cache.n_analyses += 1;
                let result = factor.factorize(&upper);
                // The permutation is kept even if this first numeric step fails.
                self.cache.factor = Some(factor);
                result
            }
        }
    }

    /// Fixed effects, modes and the criterion from the current factor.
    fn solve(&self, theta: &[f64]) -> Result<PlsSolution> {
        let factor = self.cache.factor.as_ref().ok_or_else(|| {
            LmmError::CholeskyFailed("sparse factor not initialized".to_string())
        })?;
        let n = self.n_obs();
        let p = self.n_fixed();

        // Lambdat Zt W y and Lambdat Zt W X.
        let mut lztwy = vec![0.0; self.n_random()];
        spmv_into(&self.lambdat, &self.ztwy, &mut lztwy);
        let lztwx = sparse_dense_product(&self.lambdat, &self.ztwx);

        // A^{-1} applied to both; RZX'RZX = lztwx' A^{-1} lztwx, RZX'cu likewise.
        let a_inv_y = factor.solve(&lztwy)?;
        let a_inv_x = factor.solve_matrix(&lztwx)?;

        let mut dd = &self.xtwx - lztwx.transpose() * &a_inv_x;
        dd = (&dd + dd.transpose()) * 0.5;
        let rhs: Vec<f64> = (0..p)
            .map(|j| {
                let cross: f64 = (0..lztwy.len()).map(|k| lztwx[(k, j)] * a_inv_y[k]).sum();
                self.xtwy[j] - cross
            })
            .collect();

        let (beta, ld_rx2) = if p == 0 {
            (Vec::new(), 0.0)
        } else {
            solve_spd_with_logdet(&dd, &rhs).ok_or_else(|| LmmError::SingularMatrix {
                context: "fixed-effects downdate X'WX - RZX'RZX".to_string(),
            })?
        };

        let u: Vec<f64> = (0..a_inv_y.len())
            .map(|k| a_inv_y[k] - (0..p).map(|j| a_inv_x[(k, j)] * beta[j]).sum::<f64>())
            .collect();
        let b = xt_y(&self.lambdat, &u);

        let zb = xt_y(self.zt, &b);
        let mu: Vec<f64> = (0..n)
            .map(|i| {
                let xb: f64 = (0..p).map(|j| self.x[(i, j)] * beta[j]).sum();
                zb[i] + xb + self.offset[i]
            })
            .collect();

        let wrss: f64 = (0..n)
            .map(|i| {
                let r = self.sqrt_w[i] * (self.y[i] - mu[i]);
                r * r
            })
            .sum();
        let pwrss = wrss + u.iter().map(|v| v * v).sum::<f64>();

        let n_eff = if self.reml { (n - p) as f64 } else { n as f64 };
        let ld_l2 = factor.log_determinant()?;
        let logdet = if self.reml { ld_l2 + ld_rx2 } else { ld_l2 };
        let deviance = logdet + n_eff * (1.0 + (2.0 * PI * pwrss).ln() - n_eff.ln());

        if !deviance.is_finite() {
            return Err(LmmError::SingularMatrix {
                context: format!("non-finite deviance (pwrss = {pwrss}, logdet = {logdet})"),
            });
        }

        Ok(PlsSolution {
            theta: theta.to_vec(),
            beta,
            u,
            b,
            mu,
            pwrss,
            ld_l2,
            ld_rx2,
            sigma: (pwrss / n_eff).sqrt(),
            deviance,
            reml: self.reml,
        })
    }
}
