use crate::error::{LmmError, Result};

/// Maps a covariance parameter vector `theta` to the structural non-zero values
/// of `Lambdat`, in the matrix's CSC storage order.
///
/// Value `k` of the output lands at position `k` of the column-major value
/// array, so `Lambdat` itself must be CSC; evaluators reject a CSR matrix.
///
/// The evaluator calls [`map`](ThetaMapping::map) once per deviance evaluation
/// and writes the result straight into the values of its private `Lambdat`; the
/// output length must equal the number of structural non-zeros.
pub trait ThetaMapping: Send + Sync + std::fmt::Debug {
    /// Number of covariance parameters accepted.
    fn n_theta(&self) -> usize;

    /// Values for the structural non-zeros of `Lambdat`.
    fn map(&self, theta: &[f64]) -> Result<Vec<f64>>;
}

fn check_theta_len(expected: usize, theta: &[f64]) -> Result<()> {
    if theta.len() != expected {
        return Err(LmmError::DimensionMismatch {
            expected,
            got: theta.len(),
            context: "theta length".to_string(),
        });
    }
    Ok(())
}

/// Index-array mapping: non-zero `k` of `Lambdat` takes `theta[lind[k]]`.
///
/// Built once at assembly time; applying it is a plain gather.
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaIndex {
    lind: Vec<usize>,
    n_theta: usize,
}

impl LambdaIndex {
    pub fn new(lind: Vec<usize>, n_theta: usize) -> Result<Self> {
        if let Some(&bad) = lind.iter().find(|&&k| k >= n_theta) {
            return Err(LmmError::Configuration(format!(
                "Lind entry {bad} out of range for {n_theta} parameters"
            )));
        }
        Ok(Self { lind, n_theta })
    }

    /// The index array (one entry per structural non-zero).
    pub fn lind(&self) -> &[usize] {
        &self.lind
    }

    /// Number of structural non-zeros addressed.
    pub fn len(&self) -> usize {
        self.lind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lind.is_empty()
    }

    /// Gather into an existing buffer of length `self.len()`.
    pub fn map_into(&self, theta: &[f64], out: &mut [f64]) -> Result<()> {
        check_theta_len(self.n_theta, theta)?;
        if out.len() != self.lind.len() {
            return Err(LmmError::DimensionMismatch {
                expected: self.lind.len(),
                got: out.len(),
                context: "Lambdat values buffer".to_string(),
            });
        }
        for (dst, &k) in out.iter_mut().zip(&self.lind) {
            *dst = theta[k];
        }
        Ok(())
    }

    /// Append `other` with its parameter indices shifted past this mapping's.
    pub fn concat(&self, other: &LambdaIndex) -> LambdaIndex {
        let mut lind = self.lind.clone();
        lind.extend(other.lind.iter().map(|&k| k + self.n_theta));
        LambdaIndex {
            lind,
            n_theta: self.n_theta + other.n_theta,
        }
    }
}

impl ThetaMapping for LambdaIndex {
    fn n_theta(&self) -> usize {
        self.n_theta
    }

    fn map(&self, theta: &[f64]) -> Result<Vec<f64>> {
        let mut out = vec![0.0; self.lind.len()];
        self.map_into(theta, &mut out)?;
        Ok(out)
    }
}

/// Mapping backed by an arbitrary function, for custom parameterizations.
pub struct FnMapping<F> {
    n_theta: usize,
    f: F,
}

impl<F> FnMapping<F>
where
    F: Fn(&[f64]) -> Vec<f64> + Send + Sync,
{
    pub fn new(n_theta: usize, f: F) -> Self {
        Self { n_theta, f }
    }
}

impl<F> std::fmt::Debug for FnMapping<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMapping")
            .field("n_theta", &self.n_theta)
            .finish_non_exhaustive()
    }
}

impl<F> ThetaMapping for FnMapping<F>
where
    F: Fn(&[f64]) -> Vec<f64> + Send + Sync,
{
    fn n_theta(&self) -> usize {
        self.n_theta
    }

    fn map(&self, theta: &[f64]) -> Result<Vec<f64>> {
        check_theta_len(self.n_theta, theta)?;
        Ok((self.f)(theta))
    }
}
