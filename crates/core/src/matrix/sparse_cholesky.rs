//! Sparse Cholesky solver using the faer library.
//!
//! Wraps faer's sparse LLT factorization of the PLS system matrix
//! `Lambdat * Zt * W * Z * Lambda + I`. Symbolic analysis (fill-reducing AMD
//! permutation, elimination tree, pattern of L) is done once; the numeric
//! factorization is redone on every deviance evaluation as `theta` changes.
//!
//! # Usage
//! ```ignore
//! let mut solver = SparseCholeskySolver::analyze(q, &upper_triplets)?;
//! solver.factorize(&upper_triplets)?;
//! let x = solver.solve(&rhs)?;
//! let ld = solver.log_determinant()?;
//! ```
//!
//! The symbolic factorization is forced to be simplicial so that the diagonal of
//! `L` can be read directly from the column pointers.

use crate::error::{LmmError, Result};
use crate::types::DenseMatrix;

use faer::dyn_stack::{GlobalPodBuffer, PodStack};
use faer::sparse::linalg::cholesky::{
    factorize_symbolic_cholesky, CholeskySymbolicParams, LltRef, SymbolicCholesky,
    SymbolicCholeskyRaw,
};
use faer::sparse::linalg::SupernodalThreshold;
use faer::sparse::{CreationError, SparseColMat};
use faer::Index as FaerIndex; // for .zx() method on index types
use faer::Parallelism;
use faer::Side;

/// Build faer's CSC matrix from upper-triangular (row <= col) triplets.
fn upper_triplets_to_faer(
    n: usize,
    upper: &[(usize, usize, f64)],
) -> Result<SparseColMat<usize, f64>> {
    match SparseColMat::<usize, f64>::try_new_from_triplets(n, n, upper) {
        Ok(mat) => Ok(mat),
        Err(CreationError::Generic(e)) => Err(LmmError::CholeskyFailed(format!(
            "Failed to create faer sparse matrix: {e}"
        ))),
        Err(CreationError::OutOfBounds { row, col }) => Err(LmmError::CholeskyFailed(format!(
            "Index out of bounds: row={row}, col={col}"
        ))),
    }
}

/// Sparse Cholesky solver using faer.
///
/// Splits symbolic analysis (done once, when the sparsity pattern is known)
/// from numeric factorization (redone for every new set of values). The
/// values passed to [`factorize`](Self::factorize) must lie on the pattern
/// given to [`analyze`](Self::analyze).
pub struct SparseCholeskySolver {
    /// Symbolic factorization (fill-reducing permutation + elimination tree).
    symbolic: SymbolicCholesky<usize>,
    /// Numerical values of the L factor.
    l_values: Vec<f64>,
    /// Dimension of the system.
    dim: usize,
    /// Whether `l_values` holds a successful factorization.
    factored: bool,
}

impl std::fmt::Debug for SparseCholeskySolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseCholeskySolver")
            .field("dim", &self.dim)
            .field("nnz_l", &self.l_values.len())
            .field("factored", &self.factored)
            .finish()
    }
}

impl SparseCholeskySolver {
    /// Symbolic analysis of an upper-triangular pattern. Values are ignored.
    pub fn analyze(n: usize, upper: &[(usize, usize, f64)]) -> Result<Self> {
        let faer_mat = upper_triplets_to_faer(n, upper)?;

        let params = CholeskySymbolicParams {
            supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
            ..Default::default()
        };
        let symbolic = factorize_symbolic_cholesky(
            faer_mat.symbolic(),
            Side::Upper,
            Default::default(), // SymmetricOrdering::default() = Amd
            params,
        )
        .map_err(|e| LmmError::CholeskyFailed(format!("Symbolic factorization failed: {e}")))?;

        let l_values = vec![0.0f64; symbolic.len_values()];
        log::debug!(
            "sparse Cholesky analysis: dim = {n}, nnz(A upper) = {}, nnz(L) = {}",
            upper.len(),
            l_values.len()
        );

        Ok(Self {
            symbolic,
            l_values,
            dim: n,
            factored: false,
        })
    }

    /// Numeric factorization of new values on the analyzed pattern.
    ///
    /// On failure the previous factor is discarded; a later successful call
    /// restores a usable state.
    pub fn factorize(&mut self, upper: &[(usize, usize, f64)]) -> Result<()> {
        let faer_mat = upper_triplets_to_faer(self.dim, upper)?;
        self.factored = false;

        let parallelism = Parallelism::None;
        let req = self
            .symbolic
            .factorize_numeric_llt_req::<f64>(parallelism)
            .map_err(|e| LmmError::CholeskyFailed(format!("Memory requirement error: {e}")))?;
        let mut mem = GlobalPodBuffer::new(req);

        self.symbolic
            .factorize_numeric_llt(
                self.l_values.as_mut_slice(),
                faer_mat.as_ref(),
                Side::Upper,
                Default::default(), // LltRegularization::default()
                parallelism,
                PodStack::new(&mut mem),
            )
            .map_err(|_| LmmError::NotPositiveDefinite)?;

        self.factored = true;
        Ok(())
    }

    fn ensure_factored(&self) -> Result<()> {
        if self.factored {
            Ok(())
        } else {
            Err(LmmError::CholeskyFailed(
                "no valid numeric factorization available".to_string(),
            ))
        }
    }

    /// Solve A * X = B in place for a column-major n x k block.
    fn solve_block_in_place(&self, data: &mut [f64], k: usize) -> Result<()> {
        let llt = LltRef::<'_, usize, f64>::new(&self.symbolic, &self.l_values);
        let sol_mat = faer::mat::from_column_major_slice_mut(data, self.dim, k);

        let req = self
            .symbolic
            .solve_in_place_req::<f64>(k)
            .map_err(|e| LmmError::CholeskyFailed(format!("Solve memory error: {e}")))?;
        let mut mem = GlobalPodBuffer::new(req);

        llt.solve_in_place_with_conj(
            faer::Conj::No,
            sol_mat,
            Parallelism::None,
            PodStack::new(&mut mem),
        );
        Ok(())
    }

    /// Solve the system A*x = b, returning x.
    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>> {
        self.ensure_factored()?;
        if rhs.len() != self.dim {
            return Err(LmmError::DimensionMismatch {
                expected: self.dim,
                got: rhs.len(),
                context: "SparseCholeskySolver::solve: rhs dimension".to_string(),
            });
        }

        let mut sol_data = rhs.to_vec();
        self.solve_block_in_place(&mut sol_data, 1)?;
        Ok(sol_data)
    }

    /// Solve A * X = B for a dense right-hand side with several columns.
    pub fn solve_matrix(&self, rhs: &DenseMatrix) -> Result<DenseMatrix> {
        self.ensure_factored()?;
        if rhs.nrows() != self.dim {
            return Err(LmmError::DimensionMismatch {
                expected: self.dim,
                got: rhs.nrows(),
                context: "SparseCholeskySolver::solve_matrix: rhs rows".to_string(),
            });
        }
        if rhs.ncols() == 0 {
            return Ok(rhs.clone());
        }

        // nalgebra and faer are both column-major.
        let mut sol_data = rhs.as_slice().to_vec();
        self.solve_block_in_place(&mut sol_data, rhs.ncols())?;
        Ok(DenseMatrix::from_column_slice(
            self.dim,
            rhs.ncols(),
            &sol_data,
        ))
    }

    /// Compute log|A| = 2 * sum(log(diag(L))) where A = L*L'.
    pub fn log_determinant(&self) -> Result<f64> {
        self.ensure_factored()?;
        match self.symbolic.raw() {
            SymbolicCholeskyRaw::Simplicial(sym_simpl) => {
                // Simplicial L is CSC; L(i,i) is the first entry of column i.
                let col_ptrs = sym_simpl.col_ptrs();
                let mut log_det = 0.0;
                for i in 0..self.dim {
                    let col_start = col_ptrs[i].zx();
                    log_det += self.l_values[col_start].ln();
                }
                Ok(2.0 * log_det)
            }
            SymbolicCholeskyRaw::Supernodal(_) => Err(LmmError::CholeskyFailed(
                "log-determinant requires a simplicial factorization".to_string(),
            )),
        }
    }

    /// Returns the dimension of the system.
    pub fn dim(&self) -> usize {
        self.dim
    }
}
