//! Operation mixes and their selectors.
//!
//! A [`Mix`] is the read-only policy a driver declares for choosing its next
//! operation. Every simulated user derives its own [`Selector`] from it, the
//! only mutable piece of mix state, and calls [`Selector::select`] once per
//! iteration with its own random source.
//!
//! Four kinds are available, resolved from [`MixSpec::kind`]:
//!
//! - `flat`: weighted random choice, see [`FlatMix`].
//! - `matrix`: the next operation depends on the previous one, see [`MatrixMix`].
//! - `fixed_sequence`: deterministic round robin, see [`FixedSequence`].
//! - `flat_sequence`: weighted choice between whole sequences, see [`FlatSequenceMix`].
//!
//! Whatever the kind, [`Mix::flat_mix`] gives the canonical per-operation ratio
//! used when checking the achieved mix after a run.
mod flat;
mod matrix;
mod sequence;

pub use flat::{FlatMix, FlatSelector};
pub use matrix::{MatrixMix, MatrixSelector};
pub use sequence::{FixedSequence, FixedSequenceSelector, FlatSequenceMix, FlatSequenceSelector};

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, DefinitionError};

pub const FLAT: &str = "flat";
pub const MATRIX: &str = "matrix";
pub const FIXED_SEQUENCE: &str = "fixed_sequence";
pub const FLAT_SEQUENCE: &str = "flat_sequence";

/// Allowed deviation of the achieved mix, in percent, when none is declared.
pub const DEFAULT_DEVIATION: f64 = 2.0;

/// Declared form of a [`Mix`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixSpec {
    pub kind: String,
    /// Operation names covered by the mix, in order. For `flat`, `matrix` and
    /// `fixed_sequence` an empty list means every operation of the driver.
    pub operations: Vec<String>,
    /// `flat` ratios, positional over `operations`. Empty means all equal.
    pub ratios: Vec<f64>,
    /// `matrix` rows, positional over `operations`.
    pub matrix: Vec<Vec<f64>>,
    /// `flat_sequence` sequences.
    pub sequences: Vec<SequenceSpec>,
    pub deviation: f64,
}

impl Default for MixSpec {
    fn default() -> Self {
        Self {
            kind: FLAT.to_string(),
            operations: Vec::new(),
            ratios: Vec::new(),
            matrix: Vec::new(),
            sequences: Vec::new(),
            deviation: DEFAULT_DEVIATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub operations: Vec<String>,
    /// Relative weight of the sequence, conventionally in percent.
    pub weight: f64,
}

/// One row of a run-time ratio override, keyed by operation name.
///
/// A flat mix reads only `ratios[0]`, a matrix mix reads the whole row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMix {
    pub name: String,
    pub ratios: Vec<f64>,
}

impl MixSpec {
    pub fn flat(operations: &[&str], ratios: &[f64]) -> Self {
        Self {
            kind: FLAT.into(),
            operations: operations.iter().map(|s| s.to_string()).collect(),
            ratios: ratios.to_vec(),
            ..Default::default()
        }
    }

    pub fn matrix(operations: &[&str], matrix: Vec<Vec<f64>>) -> Self {
        Self {
            kind: MATRIX.into(),
            operations: operations.iter().map(|s| s.to_string()).collect(),
            matrix,
            ..Default::default()
        }
    }

    pub fn fixed_sequence(operations: &[&str]) -> Self {
        Self {
            kind: FIXED_SEQUENCE.into(),
            operations: operations.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn flat_sequence(sequences: Vec<SequenceSpec>) -> Self {
        Self {
            kind: FLAT_SEQUENCE.into(),
            sequences,
            ..Default::default()
        }
    }

    /// Resolves the kind, validates the parameters and normalizes the ratios.
    ///
    /// `all_operations` is the full operation list of the driver, used when
    /// the declaration leaves `operations` empty.
    pub fn build(&self, all_operations: &[String]) -> Result<Mix, DefinitionError> {
        let names = if self.operations.is_empty() {
            all_operations.to_vec()
        } else {
            self.operations.clone()
        };
        let mut mix = match self.kind.as_str() {
            FLAT => {
                let ratios = if self.ratios.is_empty() {
                    vec![1.0; names.len()]
                } else {
                    self.ratios.clone()
                };
                Mix::Flat(FlatMix::new(names, ratios, self.deviation)?)
            }
            MATRIX => Mix::Matrix(MatrixMix::new(names, self.matrix.clone(), self.deviation)?),
            FIXED_SEQUENCE => Mix::FixedSequence(FixedSequence::new(names, self.deviation)?),
            FLAT_SEQUENCE => Mix::FlatSequence(FlatSequenceMix::new(&self.sequences, self.deviation)?),
            other => {
                return Err(DefinitionError::UnknownKind {
                    family: "mix",
                    kind: other.to_string(),
                });
            }
        };
        mix.normalize();
        if let Mix::Matrix(m) = &mix {
            // Surface a non-convergent matrix now rather than at report time.
            m.flat_mix()?;
        }
        Ok(mix)
    }
}

/// A validated operation mix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mix {
    Flat(FlatMix),
    Matrix(MatrixMix),
    FixedSequence(FixedSequence),
    FlatSequence(FlatSequenceMix),
}

impl Mix {
    /// The default mix of a driver: every operation equally likely.
    pub fn uniform(operations: Vec<String>) -> Result<Self, DefinitionError> {
        let ratios = vec![1.0; operations.len()];
        let mut mix = Mix::Flat(FlatMix::new(operations, ratios, DEFAULT_DEVIATION)?);
        mix.normalize();
        Ok(mix)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mix::Flat(_) => FLAT,
            Mix::Matrix(_) => MATRIX,
            Mix::FixedSequence(_) => FIXED_SEQUENCE,
            Mix::FlatSequence(_) => FLAT_SEQUENCE,
        }
    }

    /// Operation names in selector index order.
    pub fn operations(&self) -> &[String] {
        match self {
            Mix::Flat(m) => &m.operations,
            Mix::Matrix(m) => &m.operations,
            Mix::FixedSequence(m) => &m.operations,
            Mix::FlatSequence(m) => &m.operations,
        }
    }

    pub fn deviation(&self) -> f64 {
        match self {
            Mix::Flat(m) => m.deviation,
            Mix::Matrix(m) => m.deviation,
            Mix::FixedSequence(m) => m.deviation,
            Mix::FlatSequence(m) => m.deviation,
        }
    }

    /// Scales the selection weights of every row to sum to 1.
    pub fn normalize(&mut self) {
        match self {
            Mix::Flat(m) => m.normalize(),
            Mix::Matrix(m) => m.normalize(),
            Mix::FixedSequence(_) => {}
            Mix::FlatSequence(m) => m.normalize(),
        }
    }

    /// Per-thread selection state.
    pub fn selector(&self) -> Selector {
        match self {
            Mix::Flat(m) => Selector::Flat(m.selector()),
            Mix::Matrix(m) => Selector::Matrix(m.selector()),
            Mix::FixedSequence(m) => Selector::FixedSequence(m.selector()),
            Mix::FlatSequence(m) => Selector::FlatSequence(m.selector()),
        }
    }

    /// The implied long-run ratio of every operation.
    pub fn flat_mix(&self) -> Result<FlatMix, DefinitionError> {
        match self {
            Mix::Flat(m) => Ok(m.clone()),
            Mix::Matrix(m) => m.flat_mix(),
            Mix::FixedSequence(m) => Ok(m.flat_mix()),
            Mix::FlatSequence(m) => Ok(m.flat_mix()),
        }
    }

    /// Applies a run-time ratio override. An empty override changes nothing.
    /// The mix is normalized again afterwards.
    pub fn configure(&mut self, overrides: &[OperationMix]) -> Result<(), ConfigurationError> {
        if overrides.is_empty() {
            return Ok(());
        }
        match self {
            Mix::Flat(m) => m.configure(overrides)?,
            Mix::Matrix(m) => {
                m.configure(overrides)?;
                m.normalize();
                m.flat_mix()?;
                return Ok(());
            }
            Mix::FixedSequence(_) => return Err(ConfigurationError::FixedSequenceOverride),
            // Sequence weights are part of the definition only.
            Mix::FlatSequence(_) => return Ok(()),
        }
        self.normalize();
        Ok(())
    }
}

/// Per-thread selection state derived from a [`Mix`].
#[derive(Debug, Clone)]
pub enum Selector {
    Flat(FlatSelector),
    Matrix(MatrixSelector),
    FixedSequence(FixedSequenceSelector),
    FlatSequence(FlatSequenceSelector),
}

impl Selector {
    /// Returns the index of the next operation to run.
    pub fn select<R: Rng>(&mut self, rng: &mut R) -> usize {
        match self {
            Selector::Flat(s) => s.select(rng),
            Selector::Matrix(s) => s.select(rng),
            Selector::FixedSequence(s) => s.select(),
            Selector::FlatSequence(s) => s.select(rng),
        }
    }

    /// Forgets any positional state, the next select starts over.
    pub fn reset(&mut self) {
        match self {
            Selector::Flat(_) => {}
            Selector::Matrix(s) => s.reset(),
            Selector::FixedSequence(s) => s.reset(),
            Selector::FlatSequence(s) => s.reset(),
        }
    }
}

/// Collects an override into a name keyed map, keeping the configured
/// position of every name.
fn index_overrides(overrides: &[OperationMix]) -> (HashMap<&str, usize>, HashMap<&str, &[f64]>) {
    let mut positions = HashMap::with_capacity(overrides.len());
    let mut ratios = HashMap::with_capacity(overrides.len());
    for (i, o) in overrides.iter().enumerate() {
        positions.insert(o.name.as_str(), i);
        ratios.insert(o.name.as_str(), o.ratios.as_slice());
    }
    (positions, ratios)
}

/// Takes the configured row of every declared operation out of `ratios`, in
/// declared order, and fails on missing or left over names.
fn take_rows<'a>(
    operations: &[String],
    mut ratios: HashMap<&str, &'a [f64]>,
) -> Result<Vec<&'a [f64]>, ConfigurationError> {
    let mut rows = Vec::with_capacity(operations.len());
    for name in operations {
        match ratios.remove(name.as_str()) {
            Some(row) => rows.push(row),
            None => return Err(ConfigurationError::MissingRatio(name.clone())),
        }
    }
    if !ratios.is_empty() {
        let mut extra: Vec<&str> = ratios.keys().copied().collect();
        extra.sort_unstable();
        return Err(ConfigurationError::UnknownOperations(extra.join(", ")));
    }
    Ok(rows)
}

/// Turns `[a, b, c]` into `[a, a+b, a+b+c]`.
fn cumulative(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// Index of the first cumulative weight not below a uniform draw in [0, 1).
fn pick<R: Rng>(cumulative: &[f64], rng: &mut R) -> usize {
    let val: f64 = rng.random();
    cumulative
        .iter()
        .position(|c| val <= *c)
        .unwrap_or(cumulative.len().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let spec = MixSpec {
            kind: "weighted".into(),
            ..Default::default()
        };
        assert!(matches!(
            spec.build(&names(&["a"])),
            Err(DefinitionError::UnknownKind { family: "mix", .. })
        ));
    }

    #[test]
    fn empty_flat_spec_is_uniform_over_all_operations() {
        let mix = MixSpec::default().build(&names(&["a", "b", "c", "d"])).unwrap();
        let flat = mix.flat_mix().unwrap();
        assert_eq!(flat.operations, names(&["a", "b", "c", "d"]));
        assert!(flat.ratios.iter().all(|r| (*r - 0.25).abs() < 1e-12));
        assert_eq!(flat.deviation, DEFAULT_DEVIATION);
    }

    #[test]
    fn normalized_rows_sum_to_one() {
        let specs = [
            MixSpec::flat(&["a", "b", "c"], &[50.0, 30.0, 25.0]),
            MixSpec::matrix(
                &["a", "b"],
                vec![vec![10.0, 30.0], vec![7.0, 7.0]],
            ),
            MixSpec::flat_sequence(vec![
                SequenceSpec {
                    operations: names(&["a", "b"]),
                    weight: 70.0,
                },
                SequenceSpec {
                    operations: names(&["c"]),
                    weight: 50.0,
                },
            ]),
        ];
        for spec in specs {
            let mix = spec.build(&names(&["a", "b", "c"])).unwrap();
            match &mix {
                Mix::Flat(m) => assert!((m.ratios.iter().sum::<f64>() - 1.0).abs() < 1e-9),
                Mix::Matrix(m) => {
                    for row in &m.matrix {
                        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
                    }
                }
                Mix::FlatSequence(m) => {
                    assert!((m.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9)
                }
                Mix::FixedSequence(_) => unreachable!(),
            }
        }
    }

    mod configure {
        use super::*;

        fn row(name: &str, ratios: &[f64]) -> OperationMix {
            OperationMix {
                name: name.into(),
                ratios: ratios.to_vec(),
            }
        }

        #[test]
        fn flat_override_is_keyed_by_name() {
            let mut mix = MixSpec::flat(&["a", "b"], &[1.0, 1.0])
                .build(&[])
                .unwrap();
            mix.configure(&[row("b", &[3.0]), row("a", &[1.0])]).unwrap();
            let flat = mix.flat_mix().unwrap();
            assert!((flat.ratios[0] - 0.25).abs() < 1e-12);
            assert!((flat.ratios[1] - 0.75).abs() < 1e-12);
        }

        #[test]
        fn missing_name_is_an_error() {
            let mut mix = MixSpec::flat(&["a", "b"], &[1.0, 1.0])
                .build(&[])
                .unwrap();
            assert_eq!(
                mix.configure(&[row("a", &[1.0])]),
                Err(ConfigurationError::MissingRatio("b".into()))
            );
        }

        #[test]
        fn extra_names_are_an_error() {
            let mut mix = MixSpec::flat(&["a"], &[1.0]).build(&[]).unwrap();
            assert_eq!(
                mix.configure(&[row("a", &[1.0]), row("z", &[1.0]), row("y", &[2.0])]),
                Err(ConfigurationError::UnknownOperations("y, z".into()))
            );
        }

        #[test]
        fn fixed_sequence_rejects_overrides() {
            let mut mix = MixSpec::fixed_sequence(&["a", "b"]).build(&[]).unwrap();
            assert!(mix.configure(&[]).is_ok());
            assert_eq!(
                mix.configure(&[row("a", &[1.0])]),
                Err(ConfigurationError::FixedSequenceOverride)
            );
        }

        #[test]
        fn matrix_rows_are_reordered_by_position() {
            let mut mix = MixSpec::matrix(&["a", "b"], vec![vec![1.0, 1.0], vec![1.0, 1.0]])
                .build(&[])
                .unwrap();
            // Configured in the order b, a: columns follow that order too.
            mix.configure(&[row("b", &[1.0, 3.0]), row("a", &[1.0, 1.0])])
                .unwrap();
            let Mix::Matrix(m) = &mix else {
                panic!("not a matrix")
            };
            assert!((m.matrix[0][0] - 0.5).abs() < 1e-12);
            assert!((m.matrix[0][1] - 0.5).abs() < 1e-12);
            assert!((m.matrix[1][0] - 0.75).abs() < 1e-12);
            assert!((m.matrix[1][1] - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn pick_falls_back_to_last_index() {
        let mut rng = StdRng::seed_from_u64(1);
        // Rounding may leave the last cumulative weight just below 1.
        let cum = [0.3, 0.6, 0.999_999_999];
        for _ in 0..100 {
            assert!(pick(&cum, &mut rng) < 3);
        }
    }
}
