//! Pacing distributions.
//!
//! A [`Cycle`] decides how long a simulated user waits before invoking its next
//! operation. The wait is measured either from the previous invoke
//! ([`CycleType::CycleTime`]) or from the previous response
//! ([`CycleType::ThinkTime`]). The tag does not change how the distribution is
//! sampled, only which reference point the engine adds the delay to.
//!
//! Cycles are declared with a [`CycleSpec`], a plain serde struct whose `kind`
//! is resolved through [`CycleSpec::build`]. Unknown kinds are rejected at load
//! time. All declared values are in milliseconds; built cycles work in
//! nanoseconds.
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Histogram max used when a think time distribution can produce nothing but
/// zero, two seconds of data preparation is plenty.
const ZERO_DELAY_HISTOGRAM_MAX: f64 = 2e9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleType {
    /// Delay is counted from the previous invoke time.
    #[serde(alias = "CYCLETIME")]
    CycleTime,
    /// Delay is counted from the previous response time.
    #[default]
    #[serde(alias = "THINKTIME")]
    ThinkTime,
}

/// The shape of the delay distribution, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    Fixed {
        time: i64,
    },
    Uniform {
        min: i64,
        max: i64,
    },
    NegativeExponential {
        min: i64,
        mean: i64,
        max: i64,
        /// Truncate samples below `min` instead of shifting the whole
        /// distribution by `min`.
        truncate: bool,
    },
}

/// A validated pacing distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_type: CycleType,
    /// Allowed deviation of the measured average delay from the targeted one,
    /// in percent.
    pub deviation: f64,
    pub distribution: Distribution,
}

impl Cycle {
    /// A fixed zero think time, the default initial delay of every mix.
    pub fn zero_think_time() -> Self {
        Self {
            cycle_type: CycleType::ThinkTime,
            deviation: 5.0,
            distribution: Distribution::Fixed { time: 0 },
        }
    }

    /// Samples the next delay, in nanoseconds. Never negative.
    pub fn delay<R: Rng>(&self, rng: &mut R) -> i64 {
        match self.distribution {
            Distribution::Fixed { time } => time,
            Distribution::Uniform { min, max } => {
                if min == max {
                    min
                } else {
                    rng.random_range(min..=max)
                }
            }
            Distribution::NegativeExponential {
                min,
                mean,
                max,
                truncate,
            } => {
                if mean <= 0 {
                    return 0;
                }
                let (shift, effective_mean) = if truncate { (0, mean) } else { (min, mean - min) };
                let mut x: f64 = rng.random();
                if x == 0.0 {
                    x = 1e-20;
                }
                let delay = shift + (effective_mean as f64 * -x.ln()).round() as i64;
                delay.clamp(min, max)
            }
        }
    }

    /// Upper bound used to size delay histograms, in nanoseconds.
    pub fn histogram_max(&self) -> f64 {
        let max = match self.distribution {
            Distribution::Fixed { time } => time as f64 * 2.0,
            Distribution::Uniform { max, .. } => max as f64 * 1.5,
            Distribution::NegativeExponential { max, .. } => max as f64,
        };
        if max > 0.0 { max } else { ZERO_DELAY_HISTOGRAM_MAX }
    }

    pub fn kind(&self) -> &'static str {
        match self.distribution {
            Distribution::Fixed { .. } => FIXED_TIME,
            Distribution::Uniform { .. } => UNIFORM,
            Distribution::NegativeExponential { .. } => NEGATIVE_EXPONENTIAL,
        }
    }
}

pub const FIXED_TIME: &str = "fixed_time";
pub const UNIFORM: &str = "uniform";
pub const NEGATIVE_EXPONENTIAL: &str = "negative_exponential";

/// Declared form of a [`Cycle`], values in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSpec {
    pub kind: String,
    #[serde(rename = "type")]
    pub cycle_type: CycleType,
    pub deviation: f64,
    /// `fixed_time` only.
    pub time: i64,
    pub min: i64,
    /// `negative_exponential` only.
    pub mean: i64,
    /// `-1` means five times the mean for `negative_exponential`.
    pub max: i64,
    pub truncate_at_min: bool,
}

impl Default for CycleSpec {
    fn default() -> Self {
        Self {
            kind: FIXED_TIME.to_string(),
            cycle_type: CycleType::ThinkTime,
            deviation: 5.0,
            time: 0,
            min: 0,
            mean: 1000,
            max: 5000,
            truncate_at_min: true,
        }
    }
}

impl CycleSpec {
    pub fn fixed(cycle_type: CycleType, time_ms: i64) -> Self {
        Self {
            kind: FIXED_TIME.into(),
            cycle_type,
            time: time_ms,
            ..Default::default()
        }
    }

    pub fn uniform(cycle_type: CycleType, min_ms: i64, max_ms: i64) -> Self {
        Self {
            kind: UNIFORM.into(),
            cycle_type,
            min: min_ms,
            max: max_ms,
            ..Default::default()
        }
    }

    pub fn negative_exponential(cycle_type: CycleType, min_ms: i64, mean_ms: i64, max_ms: i64) -> Self {
        Self {
            kind: NEGATIVE_EXPONENTIAL.into(),
            cycle_type,
            min: min_ms,
            mean: mean_ms,
            max: max_ms,
            ..Default::default()
        }
    }

    pub fn with_deviation(mut self, deviation: f64) -> Self {
        self.deviation = deviation;
        self
    }

    /// Resolves the declared kind and validates its parameters.
    pub fn build(&self) -> Result<Cycle, DefinitionError> {
        let distribution = match self.kind.as_str() {
            FIXED_TIME => self.fixed_time()?,
            UNIFORM => self.uniform_dist()?,
            NEGATIVE_EXPONENTIAL => self.negative_exponential_dist()?,
            other => {
                return Err(DefinitionError::UnknownKind {
                    family: "cycle",
                    kind: other.to_string(),
                });
            }
        };
        if self.deviation < 0.0 {
            return Err(invalid(self.kind_name(), "deviation < 0"));
        }
        Ok(Cycle {
            cycle_type: self.cycle_type,
            deviation: self.deviation,
            distribution,
        })
    }

    fn kind_name(&self) -> &'static str {
        match self.kind.as_str() {
            FIXED_TIME => FIXED_TIME,
            UNIFORM => UNIFORM,
            _ => NEGATIVE_EXPONENTIAL,
        }
    }

    fn fixed_time(&self) -> Result<Distribution, DefinitionError> {
        if self.time < 0 {
            return Err(invalid(FIXED_TIME, "time < 0"));
        }
        if self.time == 0 && self.cycle_type == CycleType::CycleTime {
            return Err(invalid(FIXED_TIME, "cycle time cannot be 0, use think time instead"));
        }
        Ok(Distribution::Fixed {
            time: self.time * NANOS_PER_MILLI,
        })
    }

    fn uniform_dist(&self) -> Result<Distribution, DefinitionError> {
        if self.min < 0 {
            return Err(invalid(UNIFORM, "min < 0"));
        }
        if self.max < 0 {
            return Err(invalid(UNIFORM, "max < 0"));
        }
        if self.min > self.max {
            return Err(invalid(UNIFORM, "min > max"));
        }
        if self.max == 0 && self.cycle_type == CycleType::CycleTime {
            return Err(invalid(UNIFORM, "cycle time max cannot be 0"));
        }
        Ok(Distribution::Uniform {
            min: self.min * NANOS_PER_MILLI,
            max: self.max * NANOS_PER_MILLI,
        })
    }

    fn negative_exponential_dist(&self) -> Result<Distribution, DefinitionError> {
        let max = if self.max == -1 { 5 * self.mean } else { self.max };
        if self.min < 0 {
            return Err(invalid(NEGATIVE_EXPONENTIAL, "min < 0"));
        }
        if self.mean < 0 {
            return Err(invalid(NEGATIVE_EXPONENTIAL, "mean < 0"));
        }
        if max < 0 {
            return Err(invalid(NEGATIVE_EXPONENTIAL, "max < 0"));
        }
        if self.min > self.mean {
            return Err(invalid(NEGATIVE_EXPONENTIAL, "min > mean"));
        }
        if self.mean > max {
            return Err(invalid(NEGATIVE_EXPONENTIAL, "mean > max"));
        }
        if max == 0 && self.cycle_type == CycleType::CycleTime {
            return Err(invalid(NEGATIVE_EXPONENTIAL, "cycle time max cannot be 0"));
        }
        Ok(Distribution::NegativeExponential {
            min: self.min * NANOS_PER_MILLI,
            mean: self.mean * NANOS_PER_MILLI,
            max: max * NANOS_PER_MILLI,
            truncate: self.truncate_at_min,
        })
    }
}

fn invalid(kind: &'static str, reason: &str) -> DefinitionError {
    DefinitionError::InvalidCycle {
        kind,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::StdRng};

    mod build {
        use super::*;

        #[test]
        fn zero_cycle_time_is_rejected() {
            let err = CycleSpec::fixed(CycleType::CycleTime, 0).build().unwrap_err();
            assert!(matches!(err, DefinitionError::InvalidCycle { kind: FIXED_TIME, .. }));
        }

        #[test]
        fn zero_think_time_is_legal() {
            let cycle = CycleSpec::fixed(CycleType::ThinkTime, 0).build().unwrap();
            assert_eq!(cycle.distribution, Distribution::Fixed { time: 0 });
        }

        #[test]
        fn unknown_kind_is_a_definition_error() {
            let spec = CycleSpec {
                kind: "poisson".into(),
                ..Default::default()
            };
            assert_eq!(
                spec.build().unwrap_err(),
                DefinitionError::UnknownKind {
                    family: "cycle",
                    kind: "poisson".into()
                }
            );
        }

        #[test]
        fn uniform_min_above_max() {
            assert!(CycleSpec::uniform(CycleType::ThinkTime, 10, 5).build().is_err());
            assert!(CycleSpec::uniform(CycleType::CycleTime, 0, 0).build().is_err());
            assert!(CycleSpec::uniform(CycleType::ThinkTime, 0, 0).build().is_ok());
        }

        #[test]
        fn negative_exponential_ordering() {
            assert!(CycleSpec::negative_exponential(CycleType::ThinkTime, 10, 5, 50).build().is_err());
            assert!(CycleSpec::negative_exponential(CycleType::ThinkTime, 0, 60, 50).build().is_err());
            assert!(CycleSpec::negative_exponential(CycleType::CycleTime, 0, 0, 0).build().is_err());
        }

        #[test]
        fn negative_exponential_default_max_is_five_means() {
            let cycle = CycleSpec::negative_exponential(CycleType::ThinkTime, 0, 100, -1)
                .build()
                .unwrap();
            assert_eq!(
                cycle.distribution,
                Distribution::NegativeExponential {
                    min: 0,
                    mean: 100 * NANOS_PER_MILLI,
                    max: 500 * NANOS_PER_MILLI,
                    truncate: true,
                }
            );
        }

        #[test]
        fn loads_from_json() {
            let spec: CycleSpec = serde_json::from_str(
                r#"{"kind": "uniform", "type": "CYCLETIME", "min": 100, "max": 300, "deviation": 2}"#,
            )
            .unwrap();
            let cycle = spec.build().unwrap();
            assert_eq!(cycle.cycle_type, CycleType::CycleTime);
            assert_eq!(cycle.deviation, 2.0);
            assert_eq!(cycle.kind(), UNIFORM);
        }
    }

    mod histogram_max {
        use super::*;

        #[test]
        fn per_distribution() {
            let fixed = CycleSpec::fixed(CycleType::CycleTime, 10).build().unwrap();
            assert_eq!(fixed.histogram_max(), 20e6);
            let uniform = CycleSpec::uniform(CycleType::ThinkTime, 0, 10).build().unwrap();
            assert_eq!(uniform.histogram_max(), 15e6);
            let negexp = CycleSpec::negative_exponential(CycleType::ThinkTime, 0, 10, 40)
                .build()
                .unwrap();
            assert_eq!(negexp.histogram_max(), 40e6);
        }

        #[test]
        fn zero_delay_uses_two_seconds() {
            assert_eq!(Cycle::zero_think_time().histogram_max(), 2e9);
        }
    }

    proptest! {
        #[test]
        fn uniform_delay_within_bounds(seed in any::<u64>(), min in 0i64..1000, span in 0i64..1000) {
            let cycle = CycleSpec::uniform(CycleType::ThinkTime, min, min + span).build().unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..32 {
                let d = cycle.delay(&mut rng);
                prop_assert!(d >= min * NANOS_PER_MILLI && d <= (min + span) * NANOS_PER_MILLI);
            }
        }

        #[test]
        fn negative_exponential_delay_within_bounds(
            seed in any::<u64>(),
            min in 0i64..100,
            extra_mean in 0i64..1000,
            extra_max in 0i64..5000,
            truncate in any::<bool>(),
        ) {
            let mean = min + extra_mean;
            let max = mean + extra_max;
            let mut spec = CycleSpec::negative_exponential(CycleType::ThinkTime, min, mean, max);
            spec.truncate_at_min = truncate;
            let cycle = spec.build().unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..32 {
                let d = cycle.delay(&mut rng);
                prop_assert!(d >= 0);
                if mean > 0 {
                    prop_assert!(d >= min * NANOS_PER_MILLI && d <= max * NANOS_PER_MILLI);
                } else {
                    prop_assert_eq!(d, 0);
                }
            }
        }

        #[test]
        fn fixed_delay_is_exact(seed in any::<u64>(), time in 1i64..100_000) {
            let cycle = CycleSpec::fixed(CycleType::CycleTime, time).build().unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            prop_assert_eq!(cycle.delay(&mut rng), time * NANOS_PER_MILLI);
        }
    }

    #[test]
    fn negative_exponential_mean_is_close() {
        let cycle = CycleSpec::negative_exponential(CycleType::ThinkTime, 0, 100, 10_000)
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let sum: i64 = (0..n).map(|_| cycle.delay(&mut rng)).sum();
        let avg_ms = sum as f64 / n as f64 / 1e6;
        assert!((avg_ms - 100.0).abs() < 5.0, "average {avg_ms}");
    }
}
