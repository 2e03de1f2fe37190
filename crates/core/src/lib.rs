pub mod data;
pub mod error;
pub mod lmm;
pub mod matrix;
pub mod model;
pub mod types;

pub use error::{ErrorKind, LmmError, Result};
