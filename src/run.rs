//! Run configuration.
//!
//! [`RunSchedule`] holds the phase lengths shared by every agent. In
//! [`RunControl::Time`] mode the phases are seconds, in
//! [`RunControl::Cycles`] mode they are numbers of operations per thread.
//! [`RunConfig`] adds the per driver overrides and is what a run is started
//! with; it can be built programmatically or read from JSON or TOML.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::definition::{BenchmarkDefinition, DriverDefinition};
use crate::error::ConfigurationError;
use crate::mix::OperationMix;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunControl {
    #[default]
    Time,
    Cycles,
}

#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSchedule {
    #[builder(default = 0)]
    pub ramp_up: u64,
    pub steady_state: u64,
    #[builder(default = 0)]
    pub ramp_down: u64,
    #[builder(default)]
    pub run_control: RunControl,
    /// All threads wait for the agreed start time instead of starting to
    /// cycle as soon as they are up.
    #[builder(default = false)]
    pub simultaneous_start: bool,
    #[builder(default = 200)]
    pub ms_between_thread_start: u64,
    /// Start the threads of all agents at once rather than one agent after
    /// another.
    #[builder(default = false)]
    pub parallel_agent_thread_start: bool,
}

impl Default for RunSchedule {
    fn default() -> Self {
        Self::builder().steady_state(0).build()
    }
}

impl RunSchedule {
    pub fn total(&self) -> u64 {
        self.ramp_up + self.steady_state + self.ramp_down
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.steady_state == 0 {
            return Err(ConfigurationError::SteadyState);
        }
        Ok(())
    }
}

/// Periodic in-flight statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeStatsConfig {
    pub enabled: bool,
    /// Seconds between snapshots.
    pub interval: u64,
}

impl Default for RuntimeStatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10,
        }
    }
}

/// One step of a variable load schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPeriod {
    /// Seconds this step lasts.
    pub duration: u64,
    /// Threads of the whole driver running during this step.
    pub threads: usize,
}

impl LoadPeriod {
    /// Parses `duration,threads` lines. Blank lines are skipped, lines that
    /// do not contain the pattern are skipped with a warning.
    pub fn parse_schedule(text: &str) -> Vec<LoadPeriod> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let parsed = Self::parse_line(line);
                if parsed.is_none() {
                    tracing::warn!("Invalid entry \"{line}\" in load variation file");
                }
                parsed
            })
            .collect()
    }

    fn parse_line(line: &str) -> Option<LoadPeriod> {
        let (duration, threads) = line.split_once(',')?;
        let duration = duration.trim().rsplit(|c: char| !c.is_ascii_digit()).next()?;
        let threads = threads.trim();
        let digits = threads.find(|c: char| !c.is_ascii_digit()).unwrap_or(threads.len());
        Some(LoadPeriod {
            duration: duration.parse().ok()?,
            threads: threads[..digits].parse().ok()?,
        })
    }
}

/// Run time overrides for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub name: String,
    /// Agents to use. `None` uses every agent supplied for the driver.
    pub agents: Option<usize>,
    /// Threads across all agents. `None` derives them from the scale.
    pub threads: Option<usize>,
    /// Seconds per throughput and response time graph bucket.
    pub graph_interval: u64,
    pub operation_mix: Vec<OperationMix>,
    pub background_mix: Vec<OperationMix>,
    /// Free form properties exposed to workload code.
    pub properties: BTreeMap<String, String>,
    pub variable_load: Vec<LoadPeriod>,
    /// A file of `duration,threads` lines, read when `variable_load` is empty.
    pub variable_load_file: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            agents: None,
            threads: None,
            graph_interval: 10,
            operation_mix: Vec::new(),
            background_mix: Vec::new(),
            properties: BTreeMap::new(),
            variable_load: Vec::new(),
            variable_load_file: None,
        }
    }
}

impl DriverConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn variable_load(&self) -> Result<Vec<LoadPeriod>, ConfigurationError> {
        if !self.variable_load.is_empty() {
            return Ok(self.variable_load.clone());
        }
        match &self.variable_load_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConfigurationError::Parse(format!("variable load file {}: {e}", path.display()))
                })?;
                Ok(LoadPeriod::parse_schedule(&text))
            }
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    #[serde(flatten)]
    pub schedule: RunSchedule,
    #[builder(default = 1)]
    pub scale: u32,
    /// Hours, sizes the graphs of cycle controlled runs.
    #[builder(default = 6.0)]
    pub max_run_time: f64,
    #[builder(default)]
    pub runtime_stats: RuntimeStatsConfig,
    #[builder(default)]
    pub drivers: Vec<DriverConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::builder().schedule(RunSchedule::default()).build()
    }
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    pub fn runtime_stats_interval(&self) -> Duration {
        Duration::from_secs(self.runtime_stats.interval.max(1))
    }

    /// Applies the overrides to `definition` and computes thread counts.
    ///
    /// Drivers without a [`DriverConfig`] run with their defaults. Overrides
    /// naming an unknown driver are rejected.
    pub fn resolve(&self, definition: &BenchmarkDefinition) -> Result<Vec<ResolvedDriver>, ConfigurationError> {
        self.schedule.validate()?;
        if let Some(unknown) = self.drivers.iter().find(|c| definition.driver(&c.name).is_none()) {
            return Err(ConfigurationError::UnknownDriver(unknown.name.clone()));
        }
        definition
            .drivers
            .iter()
            .enumerate()
            .map(|(index, def)| {
                let config = self
                    .drivers
                    .iter()
                    .find(|c| c.name == def.name)
                    .cloned()
                    .unwrap_or_else(|| DriverConfig::new(&def.name));
                ResolvedDriver::new(index, def, config, self.scale)
            })
            .collect()
    }
}

/// A driver definition with the run overrides applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDriver {
    pub index: usize,
    pub definition: DriverDefinition,
    pub threads: usize,
    pub agents: Option<usize>,
    pub graph_interval: Duration,
    pub properties: BTreeMap<String, String>,
    pub variable_load: Vec<LoadPeriod>,
}

impl ResolvedDriver {
    fn new(index: usize, def: &DriverDefinition, config: DriverConfig, scale: u32) -> Result<Self, ConfigurationError> {
        let mut definition = def.clone();
        definition.mix.configure(&config.operation_mix)?;
        if let Some(bg) = definition.background.as_mut() {
            bg.configure(&config.background_mix)?;
        }
        let threads = config
            .threads
            .unwrap_or_else(|| (scale as f64 * def.thread_per_scale).round() as usize);
        if threads == 0 {
            return Err(ConfigurationError::NoThreads(def.name.clone()));
        }
        let variable_load = config.variable_load()?;
        Ok(Self {
            index,
            definition,
            threads,
            agents: config.agents,
            graph_interval: Duration::from_secs(config.graph_interval.max(1)),
            properties: config.properties,
            variable_load,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::{CycleSpec, CycleType};
    use crate::definition::{BenchmarkSpec, DriverSpec, OperationDecl};
    use crate::mix::MixSpec;

    fn definition() -> BenchmarkDefinition {
        let driver = DriverSpec {
            name: "web".into(),
            thread_per_scale: 2.5,
            operations: vec![
                OperationDecl::new("a", CycleSpec::fixed(CycleType::ThinkTime, 0), &[1.0]),
                OperationDecl::new("b", CycleSpec::fixed(CycleType::ThinkTime, 0), &[1.0]),
            ],
            mix: MixSpec::flat(&["a", "b"], &[50.0, 50.0]),
            ..Default::default()
        };
        BenchmarkDefinition::from_spec(&BenchmarkSpec {
            name: "bench".into(),
            version: String::new(),
            drivers: vec![driver],
        })
        .unwrap()
    }

    fn schedule() -> RunSchedule {
        RunSchedule::builder().steady_state(10).build()
    }

    #[test]
    fn schedule_defaults() {
        let s = schedule();
        assert_eq!(s.ms_between_thread_start, 200);
        assert_eq!(s.run_control, RunControl::Time);
        assert!(!s.simultaneous_start);
        assert_eq!(RunSchedule::default().validate(), Err(ConfigurationError::SteadyState));
    }

    mod resolve {
        use super::*;

        #[test]
        fn threads_come_from_scale() {
            let config = RunConfig::builder().schedule(schedule()).scale(3).build();
            let drivers = config.resolve(&definition()).unwrap();
            // round(3 * 2.5)
            assert_eq!(drivers[0].threads, 8);
            assert_eq!(drivers[0].graph_interval, Duration::from_secs(10));
        }

        #[test]
        fn mix_override_is_applied() {
            let mut driver = DriverConfig::new("web").with_threads(4);
            driver.operation_mix = vec![
                OperationMix {
                    name: "a".into(),
                    ratios: vec![1.0],
                },
                OperationMix {
                    name: "b".into(),
                    ratios: vec![3.0],
                },
            ];
            let config = RunConfig::builder().schedule(schedule()).drivers(vec![driver]).build();
            let drivers = config.resolve(&definition()).unwrap();
            let flat = drivers[0].definition.mix.flat_mix().unwrap();
            assert!((flat.ratios[1] - 0.75).abs() < 1e-12);
            assert_eq!(drivers[0].threads, 4);
        }

        #[test]
        fn unknown_driver_is_rejected() {
            let config = RunConfig::builder()
                .schedule(schedule())
                .drivers(vec![DriverConfig::new("mobile")])
                .build();
            assert_eq!(
                config.resolve(&definition()),
                Err(ConfigurationError::UnknownDriver("mobile".into()))
            );
        }

        #[test]
        fn zero_threads_is_rejected() {
            let config = RunConfig::builder()
                .schedule(schedule())
                .drivers(vec![DriverConfig::new("web").with_threads(0)])
                .build();
            assert_eq!(
                config.resolve(&definition()),
                Err(ConfigurationError::NoThreads("web".into()))
            );
        }
    }

    #[test]
    fn variable_load_lines() {
        let text = "60,10\n\n  120,25  \nbogus\n30,x\n";
        assert_eq!(
            LoadPeriod::parse_schedule(text),
            vec![
                LoadPeriod {
                    duration: 60,
                    threads: 10
                },
                LoadPeriod {
                    duration: 120,
                    threads: 25
                },
            ]
        );
    }

    #[test]
    fn run_config_from_toml() {
        let text = r#"
            ramp_up = 30
            steady_state = 300
            run_control = "TIME"
            scale = 10

            [runtime_stats]
            enabled = true
            interval = 5

            [[drivers]]
            name = "web"
            threads = 12
            properties = { host = "localhost" }
        "#;
        let config = RunConfig::from_toml(text).unwrap();
        assert_eq!(config.schedule.ramp_up, 30);
        assert_eq!(config.schedule.ms_between_thread_start, 200);
        assert!(config.runtime_stats.enabled);
        assert_eq!(config.drivers[0].threads, Some(12));
        assert_eq!(config.drivers[0].properties["host"], "localhost");
        assert!(matches!(RunConfig::from_json("not json"), Err(ConfigurationError::Parse(_))));
    }
}
