/// The scalar type used throughout the library.
pub type Scalar = f64;

/// Dense matrix type (column-major).
pub type DenseMatrix = nalgebra::DMatrix<Scalar>;

/// Sparse matrix type (CSC format).
pub type SparseMat = sprs::CsMat<Scalar>;
