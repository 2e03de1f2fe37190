pub mod dense;
pub mod sparse;
pub mod sparse_cholesky;

pub use sparse::TripletBuilder;
pub use sparse_cholesky::SparseCholeskySolver;
