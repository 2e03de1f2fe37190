use nalgebra::DMatrix;
use sprs::TriMat;

use crate::data::FactorColumn;
use crate::error::{LmmError, Result};
use crate::types::SparseMat;

/// Transposed indicator matrix of a grouping factor: `J'[l, i] = 1` when
/// observation `i` belongs to level `l`. Dimension `nl x n`.
pub fn indicator_transposed(factor: &FactorColumn) -> SparseMat {
    let mut tri = TriMat::new((factor.n_levels(), factor.len()));
    for (i, &code) in factor.codes().iter().enumerate() {
        tri.add_triplet(code, i, 1.0);
    }
    tri.to_csc()
}

/// Column-wise Khatri-Rao product of sparse `a` (m x n) and dense `b` (k x n).
///
/// Column `i` of the result is `kron(a[:, i], b[:, i])`, so row `r * k + j`
/// holds `a[r, i] * b[j, i]`. Every product with a structural entry of `a`
/// is stored, including zeros from `b`.
pub fn khatri_rao(a: &SparseMat, b: &DMatrix<f64>) -> Result<SparseMat> {
    if a.cols() != b.ncols() {
        return Err(LmmError::DimensionMismatch {
            expected: a.cols(),
            got: b.ncols(),
            context: "khatri_rao: column count".to_string(),
        });
    }
    let k = b.nrows();
    let mut tri = TriMat::new((a.rows() * k, a.cols()));
    for (val, (row, col)) in a.iter() {
        for j in 0..k {
            tri.add_triplet(row * k + j, col, val * b[(j, col)]);
        }
    }
    Ok(tri.to_csc())
}

/// Rows of `Zt` contributed by one random-effects term.
///
/// For a factor with `nl` levels and an `n x nc` model matrix the result is
/// `(nl * nc) x n`: row `l * nc + j`, column `i` equals `mm[i, j]` when
/// observation `i` is in level `l`. Columns keep the observation order.
pub fn z_section(factor: &FactorColumn, model_matrix: &DMatrix<f64>) -> Result<SparseMat> {
    if factor.len() != model_matrix.nrows() {
        return Err(LmmError::DimensionMismatch {
            expected: factor.len(),
            got: model_matrix.nrows(),
            context: "z_section: model matrix rows vs grouping factor length".to_string(),
        });
    }
    if model_matrix.ncols() == 0 {
        return Err(LmmError::Data(
            "random-effects model matrix has no columns".to_string(),
        ));
    }
    khatri_rao(&indicator_transposed(factor), &model_matrix.transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intercept_and_index(n: usize) -> DMatrix<f64> {
        DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { (i + 1) as f64 })
    }

    #[test]
    fn test_indicator() {
        let f = FactorColumn::new(&["a", "b", "a"]);
        let jt = indicator_transposed(&f);
        assert_eq!((jt.rows(), jt.cols()), (2, 3));
        assert_eq!(jt.get(0, 2).copied(), Some(1.0));
        assert_eq!(jt.get(1, 2), None);
    }

    #[test]
    fn test_z_section_intercept_and_slope() {
        let f = FactorColumn::new(&["a", "b", "c", "a", "b", "c"]);
        let mm = intercept_and_index(6);
        let zt = z_section(&f, &mm).unwrap();

        assert_eq!((zt.rows(), zt.cols()), (6, 6));
        assert_eq!(zt.nnz(), 12);
        for i in 0..6 {
            let level = i % 3;
            for row in 0..6 {
                let value = zt.get(row, i).copied().unwrap_or(0.0);
                if row == 2 * level {
                    assert_relative_eq!(value, 1.0);
                } else if row == 2 * level + 1 {
                    assert_relative_eq!(value, (i + 1) as f64);
                } else {
                    assert_eq!(value, 0.0);
                }
            }
        }
    }

    #[test]
    fn test_z_section_single_column_is_indicator() {
        let f = FactorColumn::new(&["x", "y", "x", "z"]);
        let mm = DMatrix::from_element(4, 1, 1.0);
        let zt = z_section(&f, &mm).unwrap();
        let jt = indicator_transposed(&f);
        assert_eq!(zt.to_dense(), jt.to_dense());
    }

    #[test]
    fn test_z_section_length_mismatch() {
        let f = FactorColumn::new(&["a", "b", "c"]);
        let mm = intercept_and_index(4);
        assert!(matches!(
            z_section(&f, &mm),
            Err(LmmError::DimensionMismatch { .. })
        ));
    }
}
