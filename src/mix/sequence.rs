use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{FlatMix, SequenceSpec, cumulative, pick};
use crate::error::DefinitionError;

/// Deterministic round robin through a declared sequence. An operation may
/// appear in the sequence more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedSequence {
    /// Distinct operation names, in order of first use.
    pub operations: Vec<String>,
    /// The sequence as indices into `operations`.
    pub sequence: Vec<usize>,
    pub deviation: f64,
}

impl FixedSequence {
    pub fn new(names: Vec<String>, deviation: f64) -> Result<Self, DefinitionError> {
        if names.is_empty() {
            return Err(DefinitionError::InvalidMix("fixed sequence has no operations".into()));
        }
        let mut operations: Vec<String> = Vec::new();
        let sequence = names
            .into_iter()
            .map(|name| match operations.iter().position(|o| *o == name) {
                Some(p) => p,
                None => {
                    operations.push(name);
                    operations.len() - 1
                }
            })
            .collect();
        Ok(Self {
            operations,
            sequence,
            deviation,
        })
    }

    /// Each operation weighs as often as it appears in the sequence.
    pub fn flat_mix(&self) -> FlatMix {
        let mut ratios = vec![0.0; self.operations.len()];
        let step = 1.0 / self.sequence.len() as f64;
        for op in &self.sequence {
            ratios[*op] += step;
        }
        FlatMix {
            operations: self.operations.clone(),
            ratios,
            deviation: self.deviation,
        }
    }

    pub fn selector(&self) -> FixedSequenceSelector {
        FixedSequenceSelector {
            current: None,
            sequence: self.sequence.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedSequenceSelector {
    current: Option<usize>,
    sequence: Vec<usize>,
}

impl FixedSequenceSelector {
    pub fn select(&mut self) -> usize {
        let next = match self.current {
            Some(c) if c + 1 < self.sequence.len() => c + 1,
            _ => 0,
        };
        self.current = Some(next);
        self.sequence[next]
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Weighted choice between named sequences. Once a sequence is drawn it is
/// walked to its end before the next draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatSequenceMix {
    /// Union of the operation names of all sequences, in order of first use.
    pub operations: Vec<String>,
    /// Every sequence as indices into `operations`.
    pub sequences: Vec<Vec<usize>>,
    pub weights: Vec<f64>,
    pub deviation: f64,
}

impl FlatSequenceMix {
    pub fn new(sequences: &[SequenceSpec], deviation: f64) -> Result<Self, DefinitionError> {
        if sequences.is_empty() {
            return Err(DefinitionError::InvalidMix("flat sequence mix has no sequences".into()));
        }
        let mut operations: Vec<String> = Vec::new();
        let mut indexed = Vec::with_capacity(sequences.len());
        for (i, seq) in sequences.iter().enumerate() {
            if seq.operations.is_empty() {
                return Err(DefinitionError::InvalidMix(format!("sequence {i} is empty")));
            }
            if seq.weight < 0.0 || !seq.weight.is_finite() {
                return Err(DefinitionError::InvalidMix(format!("sequence {i} has an invalid weight")));
            }
            let idx = seq
                .operations
                .iter()
                .map(|name| match operations.iter().position(|o| o == name) {
                    Some(p) => p,
                    None => {
                        operations.push(name.clone());
                        operations.len() - 1
                    }
                })
                .collect();
            indexed.push(idx);
        }
        let weights: Vec<f64> = sequences.iter().map(|s| s.weight).collect();
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(DefinitionError::InvalidMix("sequence weights sum to zero".into()));
        }
        Ok(Self {
            operations,
            sequences: indexed,
            weights,
            deviation,
        })
    }

    pub fn normalize(&mut self) {
        let total: f64 = self.weights.iter().sum();
        if total > 0.0 {
            self.weights.iter_mut().for_each(|w| *w /= total);
        }
    }

    /// Long run frequency of every operation: each sequence contributes its
    /// operations in proportion to its weight.
    pub fn flat_mix(&self) -> FlatMix {
        let mut ratios = vec![0.0; self.operations.len()];
        let mut total = 0.0;
        for (seq, weight) in self.sequences.iter().zip(&self.weights) {
            for op in seq {
                ratios[*op] += weight;
            }
            total += weight * seq.len() as f64;
        }
        if total > 0.0 {
            ratios.iter_mut().for_each(|r| *r /= total);
        }
        FlatMix {
            operations: self.operations.clone(),
            ratios,
            deviation: self.deviation,
        }
    }

    pub fn selector(&self) -> FlatSequenceSelector {
        let mut s = FlatSequenceSelector {
            cumulative: cumulative(&self.weights),
            sequences: self.sequences.clone(),
            current: 0,
            index: 0,
        };
        s.reset();
        s
    }
}

#[derive(Debug, Clone)]
pub struct FlatSequenceSelector {
    cumulative: Vec<f64>,
    sequences: Vec<Vec<usize>>,
    current: usize,
    index: usize,
}

impl FlatSequenceSelector {
    pub fn select<R: Rng>(&mut self, rng: &mut R) -> usize {
        if self.index >= self.sequences[self.current].len() {
            self.index = 0;
            self.current = pick(&self.cumulative, rng);
        }
        let op = self.sequences[self.current][self.index];
        self.index += 1;
        op
    }

    /// The next select draws a fresh sequence.
    pub fn reset(&mut self) {
        self.current = 0;
        self.index = self.sequences[0].len();
    }
}
