use nalgebra::{DMatrix, DVector};

/// Solve A*x = b for SPD A via Cholesky and also return log|A| from the same
/// factorization. Returns None if A is not positive definite.
pub fn solve_spd_with_logdet(a: &DMatrix<f64>, b: &[f64]) -> Option<(Vec<f64>, f64)> {
    let chol = a.clone().cholesky()?;
    let l = chol.l_dirty();
    let logdet = 2.0 * (0..a.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>();
    let x = chol.solve(&DVector::from_column_slice(b));
    Some((x.as_slice().to_vec(), logdet))
}

/// Compute the log-determinant of an SPD matrix via Cholesky: log|A| = 2 * sum(log(diag(L))).
pub fn log_determinant_spd(a: &DMatrix<f64>) -> Option<f64> {
    let chol = a.clone().cholesky()?;
    let l = chol.l_dirty();
    Some(2.0 * (0..a.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>())
}

/// Standard deviations and correlation matrix of a covariance matrix.
///
/// Correlations involving a zero-variance component are reported as 0.
pub fn covariance_to_correlation(cov: &DMatrix<f64>) -> (Vec<f64>, DMatrix<f64>) {
    let n = cov.nrows();
    let sd: Vec<f64> = (0..n).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
    let corr = DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            1.0
        } else if sd[i] > 0.0 && sd[j] > 0.0 {
            cov[(i, j)] / (sd[i] * sd[j])
        } else {
            0.0
        }
    });
    (sd, corr)
}
