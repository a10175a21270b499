use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{FlatMix, OperationMix, cumulative, index_overrides, pick, take_rows};
use crate::error::{ConfigurationError, DefinitionError};

/// Digits of precision the stationary distribution must settle to.
const PRECISION: i32 = 4;
/// Highest matrix power tried before giving up.
const MAX_POWER: usize = 9999;

/// A transition matrix: row = previous operation, column = next operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixMix {
    pub operations: Vec<String>,
    pub matrix: Vec<Vec<f64>>,
    pub deviation: f64,
}

impl MatrixMix {
    pub fn new(operations: Vec<String>, matrix: Vec<Vec<f64>>, deviation: f64) -> Result<Self, DefinitionError> {
        let n = operations.len();
        if n == 0 {
            return Err(DefinitionError::InvalidMix("matrix mix has no operations".into()));
        }
        if matrix.len() != n {
            return Err(DefinitionError::InvalidMix(format!(
                "mix matrix must be {n} x {n} (#ops x #ops) in size, found {} rows",
                matrix.len()
            )));
        }
        for (i, row) in matrix.iter().enumerate() {
            if row.len() != n {
                return Err(DefinitionError::InvalidMix(format!(
                    "all rows in mix matrix must be {n} (#ops) in size, row {i} has {}",
                    row.len()
                )));
            }
            if row.iter().any(|r| *r < 0.0 || !r.is_finite()) || row.iter().sum::<f64>() <= 0.0 {
                return Err(DefinitionError::InvalidMix(format!("row {i} of mix matrix has no usable weight")));
            }
        }
        Ok(Self {
            operations,
            matrix,
            deviation,
        })
    }

    pub fn normalize(&mut self) {
        for row in &mut self.matrix {
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|r| *r /= total);
            }
        }
    }

    /// Computes the stationary distribution by raising the matrix to
    /// increasing powers until every column agrees across all rows to
    /// [`PRECISION`] digits.
    pub fn flat_mix(&self) -> Result<FlatMix, DefinitionError> {
        let n = self.matrix.len();
        if n == 1 {
            return Ok(FlatMix {
                operations: self.operations.clone(),
                ratios: vec![1.0],
                deviation: self.deviation,
            });
        }
        let multiplier = 10f64.powi(PRECISION);
        let threshold = 1.0 / multiplier;

        let mut power = multiply(&self.matrix, &self.matrix);
        for p in 3..=MAX_POWER {
            power = multiply(&power, &self.matrix);
            if let Some(ratios) = stable_columns(&power, threshold, multiplier) {
                tracing::trace!(power = p, "obtained stable mix");
                return Ok(FlatMix {
                    operations: self.operations.clone(),
                    ratios,
                    deviation: self.deviation,
                });
            }
        }
        Err(DefinitionError::MatrixNotConvergent { iterations: MAX_POWER })
    }

    pub fn selector(&self) -> MatrixSelector {
        MatrixSelector {
            op: None,
            cumulative: self.matrix.iter().map(|row| cumulative(row)).collect(),
        }
    }

    pub(super) fn configure(&mut self, overrides: &[OperationMix]) -> Result<(), ConfigurationError> {
        let n = self.operations.len();
        if let Some(o) = overrides.iter().find(|o| o.ratios.len() != n) {
            return Err(ConfigurationError::MixShape {
                expected: n,
                actual: o.ratios.len(),
            });
        }
        let (positions, ratios) = index_overrides(overrides);
        let rows = take_rows(&self.operations, ratios)?;
        // Columns are in configured order, which may differ from the declared one.
        for (i, row) in rows.iter().enumerate() {
            for (j, name) in self.operations.iter().enumerate() {
                self.matrix[i][j] = row[positions[name.as_str()]];
            }
        }
        Ok(())
    }
}

fn multiply(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = a.len();
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            out[i][j] = (0..n).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Returns the per column value when all rows agree, `None` otherwise.
fn stable_columns(m: &[Vec<f64>], threshold: f64, multiplier: f64) -> Option<Vec<f64>> {
    let n = m.len();
    let mut results = vec![0.0; n];
    for (j, result) in results.iter_mut().enumerate() {
        let mut comparator = 0i64;
        for i in 0..n - 1 {
            comparator = (m[i][j] * multiplier).round() as i64;
            for row in m.iter().skip(i + 1) {
                if (m[i][j] - row[j]).abs() > threshold {
                    return None;
                }
                if comparator != (row[j] * multiplier).round() as i64 {
                    return None;
                }
            }
        }
        *result = comparator as f64 * threshold;
    }
    Some(results)
}

#[derive(Debug, Clone)]
pub struct MatrixSelector {
    op: Option<usize>,
    cumulative: Vec<Vec<f64>>,
}

impl MatrixSelector {
    /// The first selection after a reset is always operation 0.
    pub fn select<R: Rng>(&mut self, rng: &mut R) -> usize {
        let next = match self.op {
            None => 0,
            Some(prev) => pick(&self.cumulative[prev], rng),
        };
        self.op = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.op = None;
    }
}
