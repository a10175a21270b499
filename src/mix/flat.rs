use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{OperationMix, cumulative, index_overrides, pick, take_rows};
use crate::error::{ConfigurationError, DefinitionError};

/// Weighted random choice among the operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatMix {
    pub operations: Vec<String>,
    pub ratios: Vec<f64>,
    pub deviation: f64,
}

impl FlatMix {
    pub fn new(operations: Vec<String>, ratios: Vec<f64>, deviation: f64) -> Result<Self, DefinitionError> {
        if operations.is_empty() {
            return Err(DefinitionError::InvalidMix("flat mix has no operations".into()));
        }
        if ratios.len() != operations.len() {
            return Err(DefinitionError::MixSize {
                mix: ratios.len(),
                operations: operations.len(),
            });
        }
        if ratios.iter().any(|r| *r < 0.0 || !r.is_finite()) {
            return Err(DefinitionError::InvalidMix(format!("negative or non finite ratio in {ratios:?}")));
        }
        if ratios.iter().sum::<f64>() <= 0.0 {
            return Err(DefinitionError::InvalidMix("flat mix ratios sum to zero".into()));
        }
        Ok(Self {
            operations,
            ratios,
            deviation,
        })
    }

    pub fn normalize(&mut self) {
        let total: f64 = self.ratios.iter().sum();
        if total > 0.0 {
            self.ratios.iter_mut().for_each(|r| *r /= total);
        }
        tracing::trace!(ratios = ?self.ratios, "normalized flat mix");
    }

    pub fn selector(&self) -> FlatSelector {
        FlatSelector {
            cumulative: cumulative(&self.ratios),
        }
    }

    pub(super) fn configure(&mut self, overrides: &[OperationMix]) -> Result<(), ConfigurationError> {
        if let Some(o) = overrides.iter().find(|o| o.ratios.len() != 1) {
            return Err(ConfigurationError::Parse(format!(
                "flat mix takes exactly one ratio per operation, {} has {}",
                o.name,
                o.ratios.len()
            )));
        }
        let (_, ratios) = index_overrides(overrides);
        let rows = take_rows(&self.operations, ratios)?;
        self.ratios = rows.iter().map(|r| r[0]).collect();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FlatSelector {
    cumulative: Vec<f64>,
}

impl FlatSelector {
    pub fn select<R: Rng>(&mut self, rng: &mut R) -> usize {
        pick(&self.cumulative, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn mix(ratios: &[f64]) -> FlatMix {
        let ops = (0..ratios.len()).map(|i| format!("op{i}")).collect();
        let mut m = FlatMix::new(ops, ratios.to_vec(), 2.0).unwrap();
        m.normalize();
        m
    }

    #[test]
    fn size_mismatch_is_a_definition_error() {
        let err = FlatMix::new(vec!["a".into(), "b".into()], vec![1.0], 2.0).unwrap_err();
        assert_eq!(err, DefinitionError::MixSize { mix: 1, operations: 2 });
    }

    #[test]
    fn zero_weight_is_never_selected() {
        let m = mix(&[1.0, 0.0, 1.0]);
        let mut sel = m.selector();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10_000 {
            assert_ne!(sel.select(&mut rng), 1);
        }
    }

    #[test]
    fn selection_frequency_follows_ratios() {
        let m = mix(&[60.0, 30.0, 10.0]);
        let mut sel = m.selector();
        let mut rng = StdRng::seed_from_u64(3);
        let mut counts = [0usize; 3];
        let n = 100_000;
        for _ in 0..n {
            counts[sel.select(&mut rng)] += 1;
        }
        for (count, expected) in counts.iter().zip([0.6, 0.3, 0.1]) {
            let ratio = *count as f64 / n as f64;
            assert!((ratio - expected).abs() < 0.01, "{ratio} vs {expected}");
        }
    }
}
