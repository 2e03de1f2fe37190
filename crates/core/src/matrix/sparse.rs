use nalgebra::DMatrix;
use sprs::{CsMat, TriMat};

use crate::error::{LmmError, Result};

/// Incremental sparse matrix builder using triplet (COO) format.
///
/// Duplicate entries at the same (row, col) are summed when converting to CSC.
/// Explicit zeros are kept as structural entries, which matters for `Lambdat`
/// whose off-diagonal parameters start at zero.
#[derive(Debug)]
pub struct TripletBuilder {
    triplet: TriMat<f64>,
}

impl TripletBuilder {
    /// Create a new builder for a matrix of the given dimensions.
    pub fn new(nrow: usize, ncol: usize) -> Self {
        Self {
            triplet: TriMat::new((nrow, ncol)),
        }
    }

    /// Add a value at (row, col). Duplicate entries will be summed.
    pub fn add(&mut self, row: usize, col: usize, val: f64) {
        self.triplet.add_triplet(row, col, val);
    }

    /// Convert to a CSC (Compressed Sparse Column) matrix.
    pub fn to_csc(&self) -> CsMat<f64> {
        self.triplet.to_csc()
    }
}

/// Create a sparse identity matrix of dimension n in CSC format.
pub fn sparse_identity(n: usize) -> CsMat<f64> {
    sparse_diagonal(&vec![1.0; n])
}

/// Create a sparse diagonal matrix from a vector of diagonal values.
pub fn sparse_diagonal(diag: &[f64]) -> CsMat<f64> {
    let n = diag.len();
    let mut tri = TriMat::new((n, n));
    for (i, &val) in diag.iter().enumerate() {
        tri.add_triplet(i, i, val);
    }
    tri.to_csc()
}

/// Multiply a sparse matrix by a dense vector: result = A * x.
pub fn spmv(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let nrow = a.rows();
    let mut result = vec![0.0; nrow];
    spmv_into(a, x, &mut result);
    result
}

/// Multiply a sparse matrix by a dense vector into an existing buffer.
/// result = A * x (buffer must have length == a.rows()).
pub fn spmv_into(a: &CsMat<f64>, x: &[f64], result: &mut [f64]) {
    assert_eq!(a.cols(), x.len());
    assert_eq!(a.rows(), result.len());

    result.fill(0.0);
    for (val, (row, col)) in a.iter() {
        result[row] += val * x[col];
    }
}

/// Compute A' * y for a sparse matrix A and dense vector y.
pub fn xt_y(a: &CsMat<f64>, y: &[f64]) -> Vec<f64> {
    assert_eq!(a.rows(), y.len());
    let mut result = vec![0.0; a.cols()];
    for (val, (row, col)) in a.iter() {
        result[col] += val * y[row];
    }
    result
}

/// Dense product A * B for sparse A (m x k) and dense B (k x p).
pub fn sparse_dense_product(a: &CsMat<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    assert_eq!(a.cols(), b.nrows());
    let mut result = DMatrix::zeros(a.rows(), b.ncols());
    for (val, (row, col)) in a.iter() {
        for j in 0..b.ncols() {
            result[(row, j)] += val * b[(col, j)];
        }
    }
    result
}

/// Scale column j of A by `scale[j]`, keeping the sparsity pattern.
pub fn scale_columns(a: &CsMat<f64>, scale: &[f64]) -> CsMat<f64> {
    assert_eq!(a.cols(), scale.len());
    let mut tri = TriMat::new((a.rows(), a.cols()));
    for (val, (row, col)) in a.iter() {
        tri.add_triplet(row, col, val * scale[col]);
    }
    tri.to_csc()
}

/// Stack matrices vertically: [A1; A2; ...]. All blocks must share a column count.
pub fn vstack(blocks: &[CsMat<f64>]) -> Result<CsMat<f64>> {
    let ncol = blocks.first().map_or(0, |b| b.cols());
    let nrow: usize = blocks.iter().map(|b| b.rows()).sum();

    let mut tri = TriMat::new((nrow, ncol));
    let mut row_offset = 0;
    for block in blocks {
        if block.cols() != ncol {
            return Err(LmmError::DimensionMismatch {
                expected: ncol,
                got: block.cols(),
                context: "vstack: block column count".to_string(),
            });
        }
        for (val, (row, col)) in block.iter() {
            tri.add_triplet(row_offset + row, col, *val);
        }
        row_offset += block.rows();
    }
    Ok(tri.to_csc())
}

/// Block-diagonal matrix diag(B1, B2, ...).
pub fn block_diagonal(blocks: &[CsMat<f64>]) -> CsMat<f64> {
    let nrow: usize = blocks.iter().map(|b| b.rows()).sum();
    let ncol: usize = blocks.iter().map(|b| b.cols()).sum();

    let mut tri = TriMat::new((nrow, ncol));
    let (mut row_offset, mut col_offset) = (0, 0);
    for block in blocks {
        for (val, (row, col)) in block.iter() {
            tri.add_triplet(row_offset + row, col_offset + col, *val);
        }
        row_offset += block.rows();
        col_offset += block.cols();
    }
    tri.to_csc()
}

/// Structural row indices of each column of A * B, independent of the values.
///
/// Numeric products can lose entries through cancellation or zero-valued
/// parameters; the structural pattern cannot.
pub fn product_pattern(a: &CsMat<f64>, b: &CsMat<f64>) -> Vec<Vec<usize>> {
    assert_eq!(a.cols(), b.rows());
    let a_csc = if a.is_csc() { a.clone() } else { a.to_csc() };
    let b_csc = if b.is_csc() { b.clone() } else { b.to_csc() };

    let mut marker = vec![usize::MAX; a.rows()];
    let mut pattern = Vec::with_capacity(b.cols());
    for j in 0..b_csc.cols() {
        let mut rows = Vec::new();
        if let Some(b_col) = b_csc.outer_view(j) {
            for (k, _) in b_col.iter() {
                if let Some(a_col) = a_csc.outer_view(k) {
                    for (i, _) in a_col.iter() {
                        if marker[i] != j {
                            marker[i] = j;
                            rows.push(i);
                        }
                    }
                }
            }
        }
        rows.sort_unstable();
        pattern.push(rows);
    }
    pattern
}

/// Upper-triangular CSC pattern of `B * B' + I`, built from the structural
/// row sets of the columns of `B`.
///
/// The pattern is fixed once; numeric values are accumulated into a flat
/// buffer addressed by [`position`](UpperPattern::position).
#[derive(Debug, Clone)]
pub struct UpperPattern {
    dim: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
}

impl UpperPattern {
    pub fn from_outer_products(dim: usize, column_rows: &[Vec<usize>]) -> Self {
        let mut cols: Vec<Vec<usize>> = (0..dim).map(|j| vec![j]).collect();
        for rows in column_rows {
            for (a, &r1) in rows.iter().enumerate() {
                for &r2 in &rows[a..] {
                    let (lo, hi) = if r1 <= r2 { (r1, r2) } else { (r2, r1) };
                    cols[hi].push(lo);
                }
            }
        }

        let mut col_ptr = Vec::with_capacity(dim + 1);
        let mut row_idx = Vec::new();
        col_ptr.push(0);
        for mut rows in cols {
            rows.sort_unstable();
            rows.dedup();
            row_idx.extend(rows);
            col_ptr.push(row_idx.len());
        }
        Self {
            dim,
            col_ptr,
            row_idx,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nnz(&self) -> usize {
        self.row_idx.len()
    }

    /// Offset of entry (row, col), row <= col, in the value buffer.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.col_ptr[col];
        let end = self.col_ptr[col + 1];
        self.row_idx[start..end]
            .binary_search(&row)
            .ok()
            .map(|k| start + k)
    }

    /// (row, col, value) triplets for a value buffer of length `nnz()`.
    pub fn triplets(&self, values: &[f64]) -> Vec<(usize, usize, f64)> {
        assert_eq!(values.len(), self.nnz());
        let mut out = Vec::with_capacity(self.nnz());
        for col in 0..self.dim {
            for k in self.col_ptr[col]..self.col_ptr[col + 1] {
                out.push((self.row_idx[k], col, values[k]));
            }
        }
        out
    }
}

/// (row, col) positions of the structural non-zeros of A, in storage order.
pub fn structural_positions(a: &CsMat<f64>) -> Vec<(usize, usize)> {
    a.iter().map(|(_, (row, col))| (row, col)).collect()
}
