//! Relative covariance factor blocks.
//!
//! A random-effects term with `nc` columns has an `nc x nc` upper-triangular
//! template `T` (the transposed Cholesky-like factor of the term's relative
//! covariance `T'T`), replicated block-diagonally once per grouping level.
//!
//! Parameters follow the lower triangle of `T'` in column-major order, so for
//! `nc = 2` the vector is `[t11, t12, t22]` and for `nc = 3`
//! `[t11, t12, t13, t22, t23, t33]`.

use nalgebra::DMatrix;

use crate::error::{LmmError, Result};
use crate::matrix::sparse::{sparse_diagonal, structural_positions};
use crate::matrix::TripletBuilder;
use crate::types::SparseMat;

use super::mapping::{LambdaIndex, ThetaMapping};

/// Number of free parameters of an `nc x nc` template.
pub fn n_template_params(nc: usize) -> usize {
    nc * (nc + 1) / 2
}

/// Parameter index of template entry (row, col), row <= col.
pub fn template_param_index(nc: usize, row: usize, col: usize) -> usize {
    debug_assert!(row <= col && col < nc);
    row * (2 * nc - row + 1) / 2 + (col - row)
}

/// Dense `nc x nc` upper-triangular template filled from a parameter segment.
pub fn template_matrix(nc: usize, theta: &[f64]) -> Result<DMatrix<f64>> {
    if theta.len() != n_template_params(nc) {
        return Err(LmmError::DimensionMismatch {
            expected: n_template_params(nc),
            got: theta.len(),
            context: "template parameter segment".to_string(),
        });
    }
    Ok(DMatrix::from_fn(nc, nc, |r, c| {
        if r <= c {
            theta[template_param_index(nc, r, c)]
        } else {
            0.0
        }
    }))
}

/// One term's contribution to `Lambdat`.
#[derive(Debug, Clone)]
pub struct CovarianceBlock {
    /// Number of grouping-factor levels (replicates).
    pub n_levels: usize,
    /// Number of model-matrix columns (template size).
    pub n_columns: usize,
    /// `nc x nc` upper-triangular template holding the initial values.
    pub template: SparseMat,
    /// Initial parameters: 1 on the template diagonal, 0 above it.
    pub theta: Vec<f64>,
    /// Lower bounds: 0 for diagonal parameters, -inf otherwise.
    pub lower: Vec<f64>,
    /// Block-diagonal replication of the template, `nl * nc` square.
    pub lambdat: SparseMat,
    /// Parameter index of every structural non-zero of `lambdat`.
    pub mapping: LambdaIndex,
}

impl CovarianceBlock {
    /// Values for all structural non-zeros of the replicated block.
    pub fn update_lambdatx(&self, theta: &[f64]) -> Result<Vec<f64>> {
        self.mapping.map(theta)
    }

    pub fn n_theta(&self) -> usize {
        self.theta.len()
    }
}

/// Build the covariance block for a term with `nl` levels and `nc` columns.
pub fn block_lambdat(nl: usize, nc: usize) -> Result<CovarianceBlock> {
    if nl == 0 || nc == 0 {
        return Err(LmmError::InvalidParameter(format!(
            "covariance block needs at least one level and one column (nl = {nl}, nc = {nc})"
        )));
    }

    if nc == 1 {
        return Ok(CovarianceBlock {
            n_levels: nl,
            n_columns: 1,
            template: sparse_diagonal(&[1.0]),
            theta: vec![1.0],
            lower: vec![0.0],
            lambdat: sparse_diagonal(&vec![1.0; nl]),
            mapping: LambdaIndex::new(vec![0; nl], 1)?,
        });
    }

    let n_theta = n_template_params(nc);
    let mut theta = vec![0.0; n_theta];
    let mut lower = vec![f64::NEG_INFINITY; n_theta];
    for r in 0..nc {
        let k = template_param_index(nc, r, r);
        theta[k] = 1.0;
        lower[k] = 0.0;
    }

    let mut template = TripletBuilder::new(nc, nc);
    let mut replicated = TripletBuilder::new(nl * nc, nl * nc);
    for c in 0..nc {
        for r in 0..=c {
            let val = theta[template_param_index(nc, r, c)];
            template.add(r, c, val);
            for level in 0..nl {
                replicated.add(level * nc + r, level * nc + c, val);
            }
        }
    }
    let lambdat = replicated.to_csc();

    let lind = structural_positions(&lambdat)
        .into_iter()
        .map(|(row, col)| template_param_index(nc, row % nc, col % nc))
        .collect();

    Ok(CovarianceBlock {
        n_levels: nl,
        n_columns: nc,
        template: template.to_csc(),
        theta,
        lower,
        lambdat,
        mapping: LambdaIndex::new(lind, n_theta)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::sparse::spmv;

    #[test]
    fn test_scalar_block() {
        let block = block_lambdat(3, 1).unwrap();
        assert_eq!((block.lambdat.rows(), block.lambdat.cols()), (3, 3));
        assert_eq!(block.lambdat.nnz(), 3);
        assert_eq!(spmv(&block.lambdat, &[1.0, 1.0, 1.0]), vec![1.0, 1.0, 1.0]);
        assert_eq!(block.theta, vec![1.0]);
        assert_eq!(block.lower, vec![0.0]);
        assert_eq!(block.update_lambdatx(&[5.0]).unwrap(), vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_param_index_order() {
        assert_eq!(template_param_index(2, 0, 0), 0);
        assert_eq!(template_param_index(2, 0, 1), 1);
        assert_eq!(template_param_index(2, 1, 1), 2);
        assert_eq!(template_param_index(3, 1, 2), 4);
        assert_eq!(template_param_index(3, 2, 2), 5);
    }

    #[test]
    fn test_two_column_block() {
        let block = block_lambdat(2, 2).unwrap();
        assert_eq!(block.theta, vec![1.0, 0.0, 1.0]);
        assert_eq!(block.lower, vec![0.0, f64::NEG_INFINITY, 0.0]);
        assert_eq!(block.template.nnz(), 3);
        // Three structural non-zeros per replicate, explicit zeros included.
        assert_eq!(block.lambdat.nnz(), 6);
        assert_eq!(block.mapping.lind(), &[0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_three_column_lind_follows_storage_order() {
        let block = block_lambdat(1, 3).unwrap();
        // CSC order of an upper-triangular 3x3: (0,0) (0,1) (1,1) (0,2) (1,2) (2,2)
        assert_eq!(block.mapping.lind(), &[0, 1, 3, 2, 4, 5]);

        let values = block
            .update_lambdatx(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let mut lambdat = block.lambdat.clone();
        lambdat.data_mut().copy_from_slice(&values);
        assert_eq!(lambdat.get(0, 2).copied(), Some(3.0));
        assert_eq!(lambdat.get(1, 2).copied(), Some(5.0));
        assert_eq!(lambdat.get(1, 1).copied(), Some(4.0));
    }

    #[test]
    fn test_bounds_count_diagonals() {
        for nc in 2..5 {
            let block = block_lambdat(4, nc).unwrap();
            assert_eq!(block.lower.len(), nc * (nc + 1) / 2);
            assert_eq!(block.lower.iter().filter(|&&l| l == 0.0).count(), nc);
            assert!(block
                .lower
                .iter()
                .all(|&l| l == 0.0 || l == f64::NEG_INFINITY));
        }
    }

    #[test]
    fn test_template_matrix() {
        let t = template_matrix(2, &[2.0, 0.5, 1.5]).unwrap();
        assert_eq!(t, DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.0, 1.5]));
        assert!(template_matrix(2, &[1.0]).is_err());
    }

    #[test]
    fn test_empty_block_rejected() {
        assert!(block_lambdat(0, 2).is_err());
        assert!(block_lambdat(2, 0).is_err());
    }
}
