use std::fmt::Display;

use indexmap::IndexMap;

use crate::error::{LmmError, Result};

/// A grouping factor: observations mapped to integer level codes.
///
/// Levels are discovered in order of first appearance and assigned 0-based codes.
/// The code of an observation selects its block of rows in `Zt` and its replicate of
/// the covariance template in `Lambdat`.
#[derive(Debug, Clone)]
pub struct FactorColumn {
    /// Maps level label -> integer code (0-based), ordered by first appearance.
    levels: IndexMap<String, usize>,
    /// The integer codes for each observation.
    codes: Vec<usize>,
}

impl FactorColumn {
    /// Create a new `FactorColumn` from string labels.
    ///
    /// # Examples
    /// ```
    /// use lmm_pls_core::data::FactorColumn;
    ///
    /// let col = FactorColumn::new(&["A", "B", "A", "C", "B"]);
    /// assert_eq!(col.n_levels(), 3);
    /// assert_eq!(col.codes(), &[0, 1, 0, 2, 1]);
    /// ```
    pub fn new<S: AsRef<str>>(values: &[S]) -> Self {
        let mut levels = IndexMap::new();
        let mut codes = Vec::with_capacity(values.len());

        for val in values {
            let next_code = levels.len();
            let code = *levels.entry(val.as_ref().to_string()).or_insert(next_code);
            codes.push(code);
        }

        FactorColumn { levels, codes }
    }

    /// Create a factor from labels of any displayable type (integers, ids, ...).
    pub fn from_labels<T: Display>(values: &[T]) -> Self {
        let labels: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Self::new(&labels)
    }

    /// Create a factor from pre-computed codes in `0..n_levels`.
    ///
    /// Levels are named by their code. Every level must be used by at least one
    /// observation, otherwise `Zt` would contain empty rows.
    pub fn from_codes(codes: Vec<usize>, n_levels: usize) -> Result<Self> {
        let mut seen = vec![false; n_levels];
        for &code in &codes {
            if code >= n_levels {
                return Err(LmmError::Data(format!(
                    "factor code {code} out of range for {n_levels} levels"
                )));
            }
            seen[code] = true;
        }
        if let Some(unused) = seen.iter().position(|&s| !s) {
            return Err(LmmError::Data(format!(
                "factor level {unused} has no observations"
            )));
        }

        let levels = (0..n_levels).map(|k| (k.to_string(), k)).collect();
        Ok(FactorColumn { levels, codes })
    }

    /// Returns the number of distinct levels.
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Returns a slice of the integer codes for each observation.
    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    /// Returns a reference to the ordered level map (level name -> code).
    pub fn levels(&self) -> &IndexMap<String, usize> {
        &self.levels
    }

    /// Level names in code order.
    pub fn level_names(&self) -> Vec<String> {
        self.levels.keys().cloned().collect()
    }

    /// Returns the level name for a given integer code, or `None` if the code
    /// is out of range.
    pub fn level_name(&self, code: usize) -> Option<&str> {
        self.levels.get_index(code).map(|(name, _)| name.as_str())
    }

    /// Returns the number of observations (rows).
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Returns `true` if the column has no observations.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_basic() {
        let col = FactorColumn::new(&["A", "B", "A", "C", "B"]);
        assert_eq!(col.n_levels(), 3);
        assert_eq!(col.len(), 5);
        assert_eq!(col.codes(), &[0, 1, 0, 2, 1]);
    }

    #[test]
    fn test_level_order_is_first_appearance() {
        let col = FactorColumn::new(&["C", "A", "B", "A"]);
        assert_eq!(col.level_names(), vec!["C", "A", "B"]);
        assert_eq!(col.codes(), &[0, 1, 2, 1]);
    }

    #[test]
    fn test_level_name_lookup() {
        let col = FactorColumn::new(&["X", "Y", "Z"]);
        assert_eq!(col.level_name(0), Some("X"));
        assert_eq!(col.level_name(2), Some("Z"));
        assert_eq!(col.level_name(3), None);
    }

    #[test]
    fn test_from_labels_integers() {
        let col = FactorColumn::from_labels(&[10, 20, 10, 30]);
        assert_eq!(col.n_levels(), 3);
        assert_eq!(col.codes(), &[0, 1, 0, 2]);
        assert_eq!(col.level_name(1), Some("20"));
    }

    #[test]
    fn test_from_codes() {
        let col = FactorColumn::from_codes(vec![1, 0, 1, 2], 3).unwrap();
        assert_eq!(col.n_levels(), 3);
        assert_eq!(col.codes(), &[1, 0, 1, 2]);
        assert_eq!(col.level_name(0), Some("0"));
    }

    #[test]
    fn test_from_codes_rejects_out_of_range_and_unused() {
        assert!(FactorColumn::from_codes(vec![0, 3], 3).is_err());
        assert!(FactorColumn::from_codes(vec![0, 0, 2], 3).is_err());
    }

    #[test]
    fn test_empty() {
        let col = FactorColumn::new::<&str>(&[]);
        assert_eq!(col.n_levels(), 0);
        assert!(col.is_empty());
    }
}
