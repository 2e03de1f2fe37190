use nalgebra::DMatrix;

use crate::data::FactorColumn;
use crate::error::{LmmError, Result};
use crate::matrix::sparse::{block_diagonal, sparse_diagonal, vstack};
use crate::types::SparseMat;

use super::covariance::{block_lambdat, template_matrix};
use super::mapping::{LambdaIndex, ThetaMapping};
use super::term::z_section;

/// One random-effects term: a grouping factor and its dense model matrix.
#[derive(Debug, Clone)]
pub struct RandomTerm {
    pub name: String,
    pub factor: FactorColumn,
    pub model_matrix: DMatrix<f64>,
}

impl RandomTerm {
    pub fn new(name: &str, factor: FactorColumn, model_matrix: DMatrix<f64>) -> Self {
        Self {
            name: name.to_string(),
            factor,
            model_matrix,
        }
    }

    /// A random intercept: model matrix is a single column of ones.
    pub fn intercept(name: &str, factor: FactorColumn) -> Self {
        let n = factor.len();
        Self::new(name, factor, DMatrix::from_element(n, 1, 1.0))
    }
}

/// Layout of one term inside the assembled structures.
#[derive(Debug, Clone)]
pub struct TermInfo {
    pub name: String,
    pub n_levels: usize,
    pub n_columns: usize,
    pub n_theta: usize,
    /// First row of this term in `Zt` (and row/column in `Lambdat`).
    pub row_offset: usize,
    /// First entry of this term in `theta`.
    pub theta_offset: usize,
    pub level_names: Vec<String>,
}

impl TermInfo {
    /// Number of random effects contributed by this term.
    pub fn n_effects(&self) -> usize {
        self.n_levels * self.n_columns
    }
}

/// Assembled random-effects structure.
///
/// The mapping's output is in the CSC storage order of `lambdat`, and the term
/// order of `theta` matches the row order of `zt` and the block order of
/// `lambdat`.
#[derive(Debug, Clone)]
pub struct RandomEffects {
    /// Transposed random-effects design, `q x n`.
    pub zt: SparseMat,
    /// Relative covariance factor, `q x q` upper triangular, at the initial theta.
    pub lambdat: SparseMat,
    /// Initial covariance parameters.
    pub theta: Vec<f64>,
    /// Lower bounds for `theta` (no upper bounds).
    pub lower: Vec<f64>,
    /// Combined parameter-to-values mapping.
    pub mapping: LambdaIndex,
    /// Per-term layout, in term order.
    pub terms: Vec<TermInfo>,
}

impl RandomEffects {
    /// Combine per-term designs and covariance blocks.
    pub fn assemble(terms: &[RandomTerm]) -> Result<Self> {
        let first = terms.first().ok_or_else(|| {
            LmmError::Data("at least one random-effects term is required".to_string())
        })?;
        let n = first.factor.len();

        let mut z_blocks = Vec::with_capacity(terms.len());
        let mut lambda_blocks = Vec::with_capacity(terms.len());
        let mut mapping: Option<LambdaIndex> = None;
        let mut theta = Vec::new();
        let mut lower = Vec::new();
        let mut infos = Vec::with_capacity(terms.len());
        let mut row_offset = 0;

        for term in terms {
            if term.factor.len() != n {
                return Err(LmmError::DimensionMismatch {
                    expected: n,
                    got: term.factor.len(),
                    context: format!("grouping factor length of term '{}'", term.name),
                });
            }
            let nl = term.factor.n_levels();
            let nc = term.model_matrix.ncols();

            z_blocks.push(z_section(&term.factor, &term.model_matrix)?);
            let block = block_lambdat(nl, nc)?;

            infos.push(TermInfo {
                name: term.name.clone(),
                n_levels: nl,
                n_columns: nc,
                n_theta: block.n_theta(),
                row_offset,
                theta_offset: theta.len(),
                level_names: term.factor.level_names(),
            });
            row_offset += nl * nc;
            theta.extend_from_slice(&block.theta);
            lower.extend_from_slice(&block.lower);
            mapping = Some(match mapping {
                None => block.mapping.clone(),
                Some(prev) => prev.concat(&block.mapping),
            });
            lambda_blocks.push(block.lambdat);
        }

        let zt = vstack(&z_blocks)?;
        let mapping = mapping.ok_or_else(|| {
            LmmError::Data("at least one random-effects term is required".to_string())
        })?;

        let lambdat = if infos.iter().all(|t| t.n_columns == 1) {
            // Scalar terms only: Lambdat is diagonal.
            sparse_diagonal(&mapping.map(&theta)?)
        } else {
            block_diagonal(&lambda_blocks)
        };

        if lambdat.nnz() != mapping.len() {
            return Err(LmmError::Configuration(format!(
                "Lambdat has {} structural non-zeros but the mapping produces {}",
                lambdat.nnz(),
                mapping.len()
            )));
        }

        log::info!(
            "assembled {} random-effects term(s): n = {}, q = {}, theta length = {}, nnz(Lambdat) = {}",
            infos.len(),
            n,
            zt.rows(),
            theta.len(),
            lambdat.nnz()
        );

        Ok(Self {
            zt,
            lambdat,
            theta,
            lower,
            mapping,
            terms: infos,
        })
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.zt.cols()
    }

    /// Total number of random effects.
    pub fn q(&self) -> usize {
        self.zt.rows()
    }

    pub fn n_theta(&self) -> usize {
        self.theta.len()
    }

    /// Values of all structural non-zeros of `Lambdat` for `theta`.
    pub fn update_lambdatx(&self, theta: &[f64]) -> Result<Vec<f64>> {
        self.mapping.map(theta)
    }

    /// A copy of `Lambdat` holding the values for `theta`.
    pub fn lambdat_at(&self, theta: &[f64]) -> Result<SparseMat> {
        let values = self.update_lambdatx(theta)?;
        let mut lambdat = self.lambdat.clone();
        lambdat.data_mut().copy_from_slice(&values);
        Ok(lambdat)
    }

    /// `theta` split into per-term segments.
    pub fn theta_segments<'a>(&self, theta: &'a [f64]) -> Result<Vec<&'a [f64]>> {
        if theta.len() != self.n_theta() {
            return Err(LmmError::DimensionMismatch {
                expected: self.n_theta(),
                got: theta.len(),
                context: "theta length".to_string(),
            });
        }
        Ok(self
            .terms
            .iter()
            .map(|t| &theta[t.theta_offset..t.theta_offset + t.n_theta])
            .collect())
    }

    /// Relative covariance `T'T` of one level of each term (multiply by
    /// sigma^2 for the random-effects covariance).
    pub fn relative_covariances(&self, theta: &[f64]) -> Result<Vec<DMatrix<f64>>> {
        self.theta_segments(theta)?
            .into_iter()
            .zip(&self.terms)
            .map(|(segment, term)| {
                let t = template_matrix(term.n_columns, segment)?;
                Ok(t.transpose() * t)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::sparse::structural_positions;
    use approx::assert_relative_eq;

    fn slope_term(name: &str, labels: &[&str]) -> RandomTerm {
        let n = labels.len();
        let mm = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        RandomTerm::new(name, FactorColumn::new(labels), mm)
    }

    #[test]
    fn test_scalar_terms_give_diagonal_lambdat() {
        let terms = vec![
            RandomTerm::intercept("g", FactorColumn::new(&["a", "b", "a", "c"])),
            RandomTerm::intercept("h", FactorColumn::new(&["x", "x", "y", "y"])),
        ];
        let re = RandomEffects::assemble(&terms).unwrap();
        assert_eq!(re.q(), 5);
        assert_eq!(re.n_obs(), 4);
        assert_eq!(re.theta, vec![1.0, 1.0]);
        assert_eq!(re.lower, vec![0.0, 0.0]);
        assert_eq!(re.lambdat.nnz(), 5);
        assert_eq!(re.mapping.lind(), &[0, 0, 0, 1, 1]);
        assert_eq!(
            re.update_lambdatx(&[2.0, 3.0]).unwrap(),
            vec![2.0, 2.0, 2.0, 3.0, 3.0]
        );
        assert_eq!(re.terms[1].row_offset, 3);
        assert_eq!(re.terms[1].theta_offset, 1);
    }

    #[test]
    fn test_mixed_terms_ordering() {
        let labels = ["a", "b", "a", "b", "c", "c"];
        let terms = vec![
            RandomTerm::intercept("g1", FactorColumn::new(&["u", "u", "v", "v", "w", "w"])),
            slope_term("g2", &labels),
        ];
        let re = RandomEffects::assemble(&terms).unwrap();

        assert_eq!(re.q(), 3 + 6);
        assert_eq!(re.theta, vec![1.0, 1.0, 0.0, 1.0]);
        assert_eq!(re.lower[..2], [0.0, 0.0]);
        assert_eq!(re.lower[2], f64::NEG_INFINITY);

        // Each structural non-zero receives the parameter of its own term.
        let values = re.update_lambdatx(&[7.0, 1.0, 2.0, 3.0]).unwrap();
        for ((row, col), value) in structural_positions(&re.lambdat).into_iter().zip(values) {
            if row < 3 {
                assert_eq!(value, 7.0);
            } else {
                let (r, c) = ((row - 3) % 2, (col - 3) % 2);
                let expected = match (r, c) {
                    (0, 0) => 1.0,
                    (0, 1) => 2.0,
                    _ => 3.0,
                };
                assert_eq!(value, expected);
            }
        }
    }

    #[test]
    fn test_zt_is_vertical_stack() {
        let terms = vec![
            RandomTerm::intercept("g", FactorColumn::new(&["a", "b", "a"])),
            slope_term("h", &["x", "x", "y"]),
        ];
        let re = RandomEffects::assemble(&terms).unwrap();
        assert_eq!((re.zt.rows(), re.zt.cols()), (2 + 4, 3));
        // Observation 2 is level "a" of g and level "y" of h, slope value 2.
        assert_eq!(re.zt.get(0, 2).copied(), Some(1.0));
        assert_eq!(re.zt.get(2 + 2, 2).copied(), Some(1.0));
        assert_eq!(re.zt.get(2 + 3, 2).copied(), Some(2.0));
    }

    #[test]
    fn test_lambdat_at_keeps_pattern() {
        let re = RandomEffects::assemble(&[slope_term("g", &["a", "b", "a", "b"])]).unwrap();
        let before = structural_positions(&re.lambdat);
        let lt = re.lambdat_at(&[2.0, 0.0, 0.5]).unwrap();
        assert_eq!(structural_positions(&lt), before);
        assert_eq!(lt.get(0, 0).copied(), Some(2.0));
        assert_eq!(lt.get(0, 1).copied(), Some(0.0));
        assert_eq!(lt.get(1, 1).copied(), Some(0.5));
    }

    #[test]
    fn test_relative_covariances() {
        let re = RandomEffects::assemble(&[
            RandomTerm::intercept("g", FactorColumn::new(&["a", "b"])),
            slope_term("h", &["x", "y"]),
        ])
        .unwrap();
        let covs = re.relative_covariances(&[2.0, 1.0, 0.5, 1.0]).unwrap();
        assert_relative_eq!(covs[0][(0, 0)], 4.0);
        // T = [[1, 0.5], [0, 1]] => T'T = [[1, 0.5], [0.5, 1.25]]
        assert_relative_eq!(covs[1][(0, 1)], 0.5);
        assert_relative_eq!(covs[1][(1, 1)], 1.25);
    }

    #[test]
    fn test_assemble_rejects_inconsistent_lengths() {
        let terms = vec![
            RandomTerm::intercept("g", FactorColumn::new(&["a", "b", "a"])),
            RandomTerm::intercept("h", FactorColumn::new(&["x", "y"])),
        ];
        assert!(matches!(
            RandomEffects::assemble(&terms),
            Err(LmmError::DimensionMismatch { .. })
        ));
        assert!(RandomEffects::assemble(&[]).is_err());
    }
}
