use nalgebra::DMatrix;

use crate::error::{LmmError, Result};

/// An `n x 1` column of ones.
pub fn intercept_column(n: usize) -> DMatrix<f64> {
    DMatrix::from_element(n, 1, 1.0)
}

/// `[1, x]`: intercept and one covariate, the usual random intercept-and-slope
/// model matrix.
pub fn intercept_and_slope(x: &[f64]) -> DMatrix<f64> {
    DMatrix::from_fn(x.len(), 2, |i, j| if j == 0 { 1.0 } else { x[i] })
}

/// Assemble a dense design matrix from equally long columns.
pub fn dense_from_columns(columns: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let n = columns.first().map_or(0, |c| c.len());
    for (j, col) in columns.iter().enumerate() {
        if col.len() != n {
            return Err(LmmError::DimensionMismatch {
                expected: n,
                got: col.len(),
                context: format!("design column {j}"),
            });
        }
    }
    Ok(DMatrix::from_fn(n, columns.len(), |i, j| columns[j][i]))
}
