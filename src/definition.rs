//! Benchmark definitions.
//!
//! A [`BenchmarkSpec`] is the structural, serde friendly description of a
//! benchmark: its drivers, their operations, mixes and pacing. It can be read
//! from JSON or TOML. [`BenchmarkDefinition::from_spec`] validates it once into
//! immutable [`DriverDefinition`]s that every thread of a run shares.
//!
//! Operation indices are global within a driver: the foreground mix
//! operations come first, in mix order, followed by the background mix
//! operations.
use serde::{Deserialize, Serialize};

use crate::cycle::{Cycle, CycleSpec};
use crate::error::DefinitionError;
use crate::mix::{Mix, MixSpec};

/// Who stamps the invoke and respond times of an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimingMode {
    /// The transport layer records the times around the request.
    #[default]
    Auto,
    /// Workload code calls `record_time` around the critical section.
    Manual,
}

/// Unit used to declare percentile limits and to report response times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseTimeUnit {
    #[default]
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl ResponseTimeUnit {
    /// Nanoseconds in one unit.
    pub fn nanos(self) -> f64 {
        match self {
            ResponseTimeUnit::Seconds => 1e9,
            ResponseTimeUnit::Milliseconds => 1e6,
            ResponseTimeUnit::Microseconds => 1e3,
            ResponseTimeUnit::Nanoseconds => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResponseTimeUnit::Seconds => "seconds",
            ResponseTimeUnit::Milliseconds => "milliseconds",
            ResponseTimeUnit::Microseconds => "microseconds",
            ResponseTimeUnit::Nanoseconds => "nanoseconds",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSpec {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub drivers: Vec<DriverSpec>,
}

/// A percentile as declared: `90`, `"99.9"`, `"95th"` or `"99%"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PercentileDecl {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSpec {
    pub name: String,
    /// Unit of the driver metric.
    pub metric: String,
    pub ops_unit: String,
    pub thread_per_scale: f64,
    pub percentiles: Vec<PercentileDecl>,
    pub response_time_unit: ResponseTimeUnit,
    pub operations: Vec<OperationDecl>,
    pub mix: MixSpec,
    /// Pacing of the first foreground operation. Defaults to no delay.
    pub initial_delay: Option<CycleSpec>,
    pub background: Option<BackgroundSpec>,
    /// Thread 0 runs `Driver::pre_run` before any paced operation.
    pub pre_run: bool,
    /// Thread 0 runs `Driver::post_run` after every other thread ended.
    pub post_run: bool,
}

impl Default for DriverSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            metric: "ops/sec".into(),
            ops_unit: "operations".into(),
            thread_per_scale: 1.0,
            percentiles: vec![PercentileDecl::Number(90.0)],
            response_time_unit: ResponseTimeUnit::default(),
            operations: Vec::new(),
            mix: MixSpec::default(),
            initial_delay: None,
            background: None,
            pre_run: false,
            post_run: false,
        }
    }
}

/// A second, independent stream of operations run by the same threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSpec {
    pub operations: Vec<OperationDecl>,
    #[serde(default)]
    pub mix: MixSpec,
    pub initial_delay: Option<CycleSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationDecl {
    pub name: String,
    pub cycle: Option<CycleSpec>,
    pub timing: TimingMode,
    /// One limit per driver percentile, in the driver response time unit.
    /// A limit of zero or below is reported but never checked.
    pub percentile_limits: Vec<f64>,
    pub count_to_metric: bool,
}

impl Default for OperationDecl {
    fn default() -> Self {
        Self {
            name: String::new(),
            cycle: None,
            timing: TimingMode::Auto,
            percentile_limits: Vec::new(),
            count_to_metric: true,
        }
    }
}

impl OperationDecl {
    pub fn new(name: &str, cycle: CycleSpec, percentile_limits: &[f64]) -> Self {
        Self {
            name: name.into(),
            cycle: Some(cycle),
            percentile_limits: percentile_limits.to_vec(),
            ..Default::default()
        }
    }

    pub fn manual(mut self) -> Self {
        self.timing = TimingMode::Manual;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub value: f64,
    /// The number as declared, e.g. `99.9`.
    pub label: String,
    /// Ordinal suffix, e.g. `th`.
    pub suffix: String,
}

impl Percentile {
    fn parse(decl: &PercentileDecl) -> Result<Self, DefinitionError> {
        let (text, declared_suffix) = match decl {
            PercentileDecl::Number(v) => (v.to_string(), None),
            PercentileDecl::Text(s) => {
                let s = s.trim().trim_end_matches('%');
                match s.char_indices().rev().find(|(_, c)| c.is_ascii_digit()) {
                    Some((i, _)) if i + 1 < s.len() => {
                        let suffix = &s[i + 1..];
                        if !matches!(suffix, "th" | "st" | "nd" | "rd") {
                            return Err(DefinitionError::Parse(format!("invalid percentile suffix {suffix}")));
                        }
                        (s[..=i].to_string(), Some(suffix.to_string()))
                    }
                    _ => (s.to_string(), None),
                }
            }
        };
        let value: f64 = text
            .parse()
            .map_err(|_| DefinitionError::Parse(format!("percentile {text} not a number")))?;
        if value <= 0.0 || value >= 100.0 {
            return Err(DefinitionError::InvalidPercentile(value));
        }
        let suffix = declared_suffix.unwrap_or_else(|| ordinal_suffix(&text));
        Ok(Self {
            value,
            label: text,
            suffix,
        })
    }
}

fn ordinal_suffix(number: &str) -> String {
    if number.contains('.') {
        return "th".into();
    }
    let n: u64 = number.parse().unwrap_or_default();
    let suffix = if (n % 100) / 10 == 1 {
        "th"
    } else {
        match n % 10 {
            1 => "st",
            2 => "nd",
            3 => "rd",
            _ => "th",
        }
    };
    suffix.into()
}

/// A validated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    pub cycle: Cycle,
    pub timing: TimingMode,
    pub percentile_limits: Vec<f64>,
    pub count_to_metric: bool,
}

/// A validated driver, shared read-only by all of its threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverDefinition {
    pub name: String,
    pub metric: String,
    pub ops_unit: String,
    pub thread_per_scale: f64,
    pub percentiles: Vec<Percentile>,
    pub response_time_unit: ResponseTimeUnit,
    /// Foreground operations followed by background operations.
    pub operations: Vec<OperationSpec>,
    pub mix: Mix,
    pub background: Option<Mix>,
    /// Foreground and background initial delays.
    pub initial_delay: [Cycle; 2],
    pub pre_run: bool,
    pub post_run: bool,
    /// Largest positive percentile limit, in the response time unit.
    pub max_percentile: f64,
}

impl DriverDefinition {
    pub fn from_spec(spec: &DriverSpec) -> Result<Self, DefinitionError> {
        let percentiles = spec
            .percentiles
            .iter()
            .map(Percentile::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let (fg_ops, mix) = build_stream(&spec.name, &spec.operations, &spec.mix)?;
        let mut operations = fg_ops;
        let mut initial_delay = [Cycle::zero_think_time(); 2];
        if let Some(delay) = &spec.initial_delay {
            initial_delay[0] = delay.build()?;
        }

        let background = match &spec.background {
            Some(bg) => {
                let (bg_ops, bg_mix) = build_stream(&spec.name, &bg.operations, &bg.mix)?;
                let delay = bg.initial_delay.as_ref().ok_or_else(|| DefinitionError::MissingInitialDelay {
                    driver: spec.name.clone(),
                })?;
                initial_delay[1] = delay.build()?;
                operations.extend(bg_ops);
                Some(bg_mix)
            }
            None => None,
        };

        for (i, op) in operations.iter().enumerate() {
            if operations[..i].iter().any(|o| o.name == op.name) {
                return Err(DefinitionError::DuplicateOperation(op.name.clone()));
            }
        }

        let mut max_percentile = f64::MIN_POSITIVE;
        for op in &operations {
            if op.percentile_limits.len() != percentiles.len() {
                return Err(DefinitionError::PercentileLimitMismatch {
                    operation: op.name.clone(),
                    expected: percentiles.len(),
                    actual: op.percentile_limits.len(),
                });
            }
            for limit in &op.percentile_limits {
                if *limit > 0.0 && *limit > max_percentile {
                    max_percentile = *limit;
                }
            }
        }
        if percentiles.is_empty() || max_percentile <= f64::MIN_POSITIVE {
            return Err(DefinitionError::NoPercentileLimit {
                driver: spec.name.clone(),
            });
        }

        Ok(Self {
            name: spec.name.clone(),
            metric: spec.metric.clone(),
            ops_unit: spec.ops_unit.clone(),
            thread_per_scale: spec.thread_per_scale,
            percentiles,
            response_time_unit: spec.response_time_unit,
            operations,
            mix,
            background,
            initial_delay,
            pre_run: spec.pre_run,
            post_run: spec.post_run,
            max_percentile,
        })
    }

    /// Number of foreground operations, the offset of the background ones.
    pub fn fg_operations(&self) -> usize {
        self.mix.operations().len()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.operations.iter().map(|o| o.name.clone()).collect()
    }

    /// Mix of stream `mix_id`, 0 for foreground and 1 for background.
    pub fn mix(&self, mix_id: usize) -> Option<&Mix> {
        match mix_id {
            0 => Some(&self.mix),
            1 => self.background.as_ref(),
            _ => None,
        }
    }

    /// Largest percentile limit in nanoseconds.
    pub fn max_percentile_nanos(&self) -> i64 {
        (self.max_percentile * self.response_time_unit.nanos()).round() as i64
    }

    /// Upper bound of all operation delays, in nanoseconds.
    pub fn delay_histogram_max(&self) -> f64 {
        self.operations
            .iter()
            .map(|o| o.cycle.histogram_max())
            .fold(0.0, f64::max)
    }
}

/// Builds the operations of one stream and its mix, with the operations in
/// mix order so that the selector index is the operation index.
fn build_stream(
    driver: &str,
    decls: &[OperationDecl],
    mix: &MixSpec,
) -> Result<(Vec<OperationSpec>, Mix), DefinitionError> {
    if decls.is_empty() {
        return Err(DefinitionError::NoOperations { driver: driver.into() });
    }
    let names: Vec<String> = decls.iter().map(|d| d.name.clone()).collect();
    let mix = mix.build(&names)?;
    let mix_ops = mix.operations();
    if mix_ops.len() != decls.len() || !decls.iter().all(|d| mix_ops.contains(&d.name)) {
        return Err(DefinitionError::MixSize {
            mix: mix_ops.len(),
            operations: decls.len(),
        });
    }
    let ops = mix_ops
        .iter()
        .map(|name| {
            let decl = decls.iter().find(|d| &d.name == name).ok_or_else(|| {
                DefinitionError::InvalidMix(format!("mix operation {name} is not declared"))
            })?;
            let cycle = decl.cycle.as_ref().ok_or_else(|| DefinitionError::MissingCycle {
                operation: decl.name.clone(),
            })?;
            Ok(OperationSpec {
                name: decl.name.clone(),
                cycle: cycle.build()?,
                timing: decl.timing,
                percentile_limits: decl.percentile_limits.clone(),
                count_to_metric: decl.count_to_metric,
            })
        })
        .collect::<Result<Vec<_>, DefinitionError>>()?;
    Ok((ops, mix))
}

/// A validated benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkDefinition {
    pub name: String,
    pub version: String,
    pub drivers: Vec<DriverDefinition>,
}

impl BenchmarkDefinition {
    pub fn from_spec(spec: &BenchmarkSpec) -> Result<Self, DefinitionError> {
        let mut drivers: Vec<DriverDefinition> = Vec::with_capacity(spec.drivers.len());
        for d in &spec.drivers {
            if drivers.iter().any(|existing| existing.name == d.name) {
                return Err(DefinitionError::DuplicateDriver(d.name.clone()));
            }
            drivers.push(DriverDefinition::from_spec(d)?);
        }
        tracing::debug!("Loaded benchmark {} with {} drivers", spec.name, drivers.len());
        Ok(Self {
            name: spec.name.clone(),
            version: spec.version.clone(),
            drivers,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        let spec: BenchmarkSpec = serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Self::from_spec(&spec)
    }

    pub fn from_toml(text: &str) -> Result<Self, DefinitionError> {
        let spec: BenchmarkSpec = toml::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        Self::from_spec(&spec)
    }

    /// Index and definition of the driver called `name`.
    pub fn driver(&self, name: &str) -> Option<(usize, &DriverDefinition)> {
        self.drivers.iter().enumerate().find(|(_, d)| d.name == name)
    }
}
