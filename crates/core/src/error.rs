use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmmError {
    #[error("Data error: {0}")]
    Data(String),

    #[error("Dimension mismatch: expected {expected}, got {got} in {context}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        context: String,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Cholesky factorization failed: {0}")]
    CholeskyFailed(String),

    #[error("Singular matrix encountered in {context}")]
    SingularMatrix { context: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Optimizer error: {0}")]
    Optimizer(String),
}

/// Coarse classification of [`LmmError`] variants.
///
/// Validation errors are caller bugs and fatal to construction. Numerical errors
/// depend on the covariance parameters being evaluated and can be routed around by
/// an optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Numerical,
    Configuration,
    Optimizer,
}

impl LmmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LmmError::Data(_)
            | LmmError::DimensionMismatch { .. }
            | LmmError::InvalidParameter(_) => ErrorKind::Validation,
            LmmError::NotPositiveDefinite
            | LmmError::CholeskyFailed(_)
            | LmmError::SingularMatrix { .. } => ErrorKind::Numerical,
            LmmError::Configuration(_) => ErrorKind::Configuration,
            LmmError::Optimizer(_) => ErrorKind::Optimizer,
        }
    }

    /// Shorthand for `self.kind() == ErrorKind::Numerical`.
    pub fn is_numerical(&self) -> bool {
        self.kind() == ErrorKind::Numerical
    }
}

pub type Result<T> = std::result::Result<T, LmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let e = LmmError::DimensionMismatch {
            expected: 3,
            got: 2,
            context: "X rows".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert!(LmmError::NotPositiveDefinite.is_numerical());
        assert_eq!(
            LmmError::Configuration("bad".into()).kind(),
            ErrorKind::Configuration
        );
        assert!(!LmmError::Optimizer("x".into()).is_numerical());
    }

    #[test]
    fn test_display() {
        let e = LmmError::DimensionMismatch {
            expected: 5,
            got: 4,
            context: "Zt columns".into(),
        };
        assert_eq!(
            e.to_string(),
            "Dimension mismatch: expected 5, got 4 in Zt columns"
        );
    }
}
