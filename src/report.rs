use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::path::PathBuf;
use typed_builder::TypedBuilder;

use crate::cycle::CycleType;
use crate::definition::DriverDefinition;
use crate::master::{DriverResults, RunResults};
use crate::metrics::{CustomStat, Metrics, OperationStats};
use crate::mix::FlatMix;
use crate::run::RunControl;

/// A [`Report`] is the processed form of the [`RunResults`] of a run.
///
/// Reports turn merged statistics into figures and verdicts. They are pure
/// data: built through [`From<RunResults>`], free of I/O, and serializable so
/// a [`Reporter`] can ship them anywhere.
///
/// # Example
/// ```rust
/// use fleetload::master::RunResults;
/// use fleetload::report::Report;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Throughput {
///     per_driver: Vec<u64>,
/// }
///
/// impl From<RunResults> for Throughput {
///     fn from(r: RunResults) -> Self {
///         Self { per_driver: r.drivers.iter().map(|d| d.total.tx_steady()).collect() }
///     }
/// }
///
/// impl Report for Throughput {}
/// ```
pub trait Report
where
    Self: Send + Sync + Debug + From<RunResults> + Serialize + DeserializeOwned,
{
}

/// A [`Reporter`] consumes a [`Report`] and performs the side effects:
/// printing it, writing it to a file or sending it to a service.
#[async_trait]
pub trait Reporter<R: Report> {
    async fn report(&self, report: R) -> anyhow::Result<()>;
}

/// Pass/fail summary of a run.
///
/// The run passed when every driver passed, and a driver passed when all of
/// its checks did: mix ratios, percentile limits, delay deviations and any
/// custom statistic with a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub benchmark: String,
    pub run_control: RunControl,
    pub scale: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub passed: bool,
    pub drivers: Vec<DriverSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSummary {
    pub name: String,
    pub metric: f64,
    pub metric_unit: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_ops: u64,
    pub ops_unit: String,
    pub users: usize,
    /// Little's law check: average cycle time times throughput, which should
    /// come close to the number of users.
    pub rt_x_tps: f64,
    pub passed: bool,
    pub mix: MixSummary,
    pub response_times: ResponseTimes,
    pub delay_times: Vec<DelayCheck>,
    pub custom: Vec<CustomSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixSummary {
    /// Fraction, e.g. `0.02` for 2%.
    pub allowed_deviation: f64,
    pub operations: Vec<MixCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixCheck {
    pub name: String,
    pub background: bool,
    pub successes: u64,
    pub failures: u64,
    pub mix: f64,
    pub required_mix: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTimes {
    pub unit: String,
    pub operations: Vec<ResponseCheck>,
}

/// Response times of one operation, `None` without steady state samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCheck {
    pub name: String,
    pub background: bool,
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub sd: Option<f64>,
    pub percentiles: Vec<PercentileCheck>,
    pub passed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileCheck {
    pub nth: String,
    pub suffix: String,
    pub limit: Option<f64>,
    pub value: f64,
    /// The percentile lies beyond the histogram, `value` is a lower bound.
    pub overflow: bool,
}

/// Delays in seconds, `None` without steady state samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayCheck {
    pub name: String,
    pub background: bool,
    pub cycle_type: CycleType,
    pub targeted_avg: Option<f64>,
    pub actual_avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub passed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomSection {
    pub name: String,
    pub stats: Vec<CustomStat>,
}

impl From<RunResults> for Summary {
    fn from(results: RunResults) -> Self {
        let drivers: Vec<DriverSummary> = results
            .drivers
            .iter()
            .map(|d| summarize(d, &results))
            .collect();
        Self {
            benchmark: results.benchmark,
            run_control: results.schedule.run_control,
            scale: results.scale,
            start_time: wall_time(results.start_time),
            passed: drivers.iter().all(|d| d.passed),
            drivers,
        }
    }
}

impl Report for Summary {}

fn wall_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Seconds the metric is computed over.
fn steady_seconds(results: &RunResults, total: &Metrics) -> f64 {
    match results.schedule.run_control {
        RunControl::Time => results.schedule.steady_state as f64,
        RunControl::Cycles => (total.end_time as f64 / 1000.0).max(f64::MIN_POSITIVE),
    }
}

fn summarize(d: &DriverResults, results: &RunResults) -> DriverSummary {
    let def = d.definition.as_ref();
    let m = &d.total;
    let steady = steady_seconds(results, m);

    let metric_tx: u64 = m
        .operations
        .iter()
        .zip(&def.operations)
        .filter(|(_, op)| op.count_to_metric)
        .map(|(s, _)| s.tx_steady)
        .sum();

    let mix = mix_checks(def, m);
    let response_times = response_checks(d);
    let delay_times = delay_checks(def, &m.operations);
    let custom: Vec<CustomSection> = m
        .attachments
        .iter()
        .map(|(name, metrics)| CustomSection {
            name: name.to_string(),
            stats: metrics.results(),
        })
        .filter(|s| !s.stats.is_empty())
        .collect();

    let passed = mix.operations.iter().all(|c| c.passed)
        && response_times.operations.iter().all(|c| c.passed != Some(false))
        && delay_times.iter().all(|c| c.passed != Some(false))
        && custom.iter().flat_map(|s| &s.stats).all(|s| s.passed != Some(false));

    DriverSummary {
        name: def.name.clone(),
        metric: metric_tx as f64 / steady,
        metric_unit: def.metric.clone(),
        start_time: wall_time(m.start_time),
        end_time: wall_time(m.start_time.saturating_add(m.end_time)),
        total_ops: m.tx_steady(),
        ops_unit: def.ops_unit.clone(),
        users: m.thread_count,
        rt_x_tps: m.cycle_sum as f64 / (steady * 1e9),
        passed,
        mix,
        response_times,
        delay_times,
        custom,
    }
}

/// Target ratios of all operations, foreground followed by background.
fn targets(def: &DriverDefinition) -> Vec<(f64, f64)> {
    let flat = |mix: Option<FlatMix>, len: usize| -> Vec<(f64, f64)> {
        match mix {
            Some(m) => {
                let sum: f64 = m.ratios.iter().sum();
                m.ratios.iter().map(|r| (r / sum, m.deviation)).collect()
            }
            None => vec![(f64::NAN, 0.0); len],
        }
    };
    let fg = def.fg_operations();
    let mut all = flat(def.mix.flat_mix().ok(), fg);
    if let Some(bg) = def.background.as_ref() {
        all.extend(flat(bg.flat_mix().ok(), def.operations.len() - fg));
    }
    all
}

fn mix_checks(def: &DriverDefinition, m: &Metrics) -> MixSummary {
    let fg = def.fg_operations();
    let sum_fg: u64 = m.operations[..fg].iter().map(|o| o.tx_steady).sum();
    let sum_bg: u64 = m.operations[fg..].iter().map(|o| o.tx_steady).sum();
    let operations = m
        .operations
        .iter()
        .zip(targets(def))
        .enumerate()
        .map(|(i, (o, (required_mix, deviation)))| {
            let sum = if i < fg { sum_fg } else { sum_bg };
            let mix = if sum > 0 { o.tx_steady as f64 / sum as f64 } else { 0.0 };
            MixCheck {
                name: def.operations[i].name.clone(),
                background: i >= fg,
                successes: o.tx_steady,
                failures: o.err_steady,
                mix,
                required_mix,
                passed: 100.0 * (mix - required_mix).abs() <= deviation,
            }
        })
        .collect();
    MixSummary {
        allowed_deviation: def.mix.deviation() / 100.0,
        operations,
    }
}

fn response_checks(d: &DriverResults) -> ResponseTimes {
    let def = d.definition.as_ref();
    let buckets = d.layout.buckets;
    let precision = def.response_time_unit.nanos();
    let fg = def.fg_operations();
    let operations = d
        .total
        .operations
        .iter()
        .zip(&def.operations)
        .enumerate()
        .map(|(i, (o, spec))| {
            let mut check = ResponseCheck {
                name: spec.name.clone(),
                background: i >= fg,
                avg: None,
                max: None,
                sd: None,
                percentiles: Vec::new(),
                passed: None,
            };
            if o.tx_steady == 0 {
                return check;
            }
            let n = o.tx_steady as f64;
            check.avg = Some(o.resp_sum_steady / n / precision);
            check.max = Some(o.resp_max as f64 / precision);
            check.sd = Some((o.sum_squares_steady / n).sqrt() / precision);

            let mut passed = true;
            for (j, pct) in def.percentiles.iter().enumerate() {
                let nanos = buckets.percentile(&o.resp_hist, o.tx_steady, pct.value);
                let overflow = buckets.is_overflow(nanos);
                let limit = spec.percentile_limits.get(j).copied().filter(|l| *l > 0.0);
                if let Some(limit) = limit
                    && nanos > (limit * precision).round() as i64
                {
                    passed = false;
                }
                let shown = if overflow { buckets.coarse_max } else { nanos };
                check.percentiles.push(PercentileCheck {
                    nth: pct.label.clone(),
                    suffix: pct.suffix.clone(),
                    limit,
                    value: shown as f64 / precision,
                    overflow,
                });
            }
            check.passed = Some(passed);
            check
        })
        .collect();
    ResponseTimes {
        unit: def.response_time_unit.label().to_string(),
        operations,
    }
}

fn delay_checks(def: &DriverDefinition, operations: &[OperationStats]) -> Vec<DelayCheck> {
    let fg = def.fg_operations();
    operations
        .iter()
        .zip(&def.operations)
        .enumerate()
        .map(|(i, (o, spec))| {
            let cycle = spec.cycle;
            let mut check = DelayCheck {
                name: spec.name.clone(),
                background: i >= fg,
                cycle_type: cycle.cycle_type,
                targeted_avg: None,
                actual_avg: None,
                min: None,
                max: None,
                passed: None,
            };
            if o.delay_count == 0 {
                return check;
            }
            let count = o.delay_count as f64 * 1e9;
            let avg = o.delay_sum as f64 / count;
            let targeted = o.targeted_delay_sum as f64 / count;
            // A zero think time has no deviation to check.
            let passed = if cycle.cycle_type == CycleType::CycleTime || targeted > 0.001 {
                (avg - targeted).abs() / targeted <= cycle.deviation / 100.0
            } else {
                true
            };
            check.targeted_avg = Some(targeted);
            check.actual_avg = Some(avg);
            check.min = Some(o.delay_min as f64 / 1e9);
            check.max = Some(o.delay_max as f64 / 1e9);
            check.passed = Some(passed);
            check
        })
        .collect()
}

/// Time series and histograms of a run, for plotting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detail {
    pub benchmark: String,
    pub drivers: Vec<DriverDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverDetail {
    pub name: String,
    pub operations: Vec<String>,
    pub graph_interval_secs: f64,
    /// Operations per second in each graph interval, per operation.
    pub throughput: Vec<Vec<f64>>,
    /// Average response time in each graph interval, per operation.
    pub response_time: Vec<Vec<f64>>,
    pub response_hist: Vec<Vec<u64>>,
    pub delay_hist: Vec<Vec<u64>>,
    pub targeted_delay_hist: Vec<Vec<u64>>,
    /// Width of a delay histogram bucket in nanoseconds.
    pub delay_bucket: i64,
}

impl From<RunResults> for Detail {
    fn from(results: RunResults) -> Self {
        let drivers = results
            .drivers
            .iter()
            .map(|d| {
                let layout = &d.layout;
                let interval = layout.graph_bucket as f64 / 1e9;
                let precision = d.definition.response_time_unit.nanos();
                let ops = &d.total.operations;
                DriverDetail {
                    name: d.definition.name.clone(),
                    operations: layout.operations.clone(),
                    graph_interval_secs: interval,
                    throughput: ops
                        .iter()
                        .map(|o| o.throughput_graph.iter().map(|c| *c as f64 / interval).collect())
                        .collect(),
                    response_time: ops
                        .iter()
                        .map(|o| {
                            o.throughput_graph
                                .iter()
                                .zip(&o.resp_graph)
                                .map(|(n, sum)| if *n == 0 { 0.0 } else { *sum as f64 / *n as f64 / precision })
                                .collect()
                        })
                        .collect(),
                    response_hist: ops.iter().map(|o| o.resp_hist.clone()).collect(),
                    delay_hist: ops.iter().map(|o| o.delay_hist.clone()).collect(),
                    targeted_delay_hist: ops.iter().map(|o| o.targeted_delay_hist.clone()).collect(),
                    delay_bucket: layout.delay_bucket,
                }
            })
            .collect();
        Self {
            benchmark: results.benchmark,
            drivers,
        }
    }
}

impl Report for Detail {}

/// Writes any report as JSON, to a file or to stdout.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct JsonReporter {
    #[builder(default, setter(strip_option, into))]
    pub path: Option<PathBuf>,
    #[builder(default = true)]
    pub pretty: bool,
}

#[async_trait]
impl<R: Report + 'static> Reporter<R> for JsonReporter {
    async fn report(&self, report: R) -> anyhow::Result<()> {
        let text = if self.pretty {
            serde_json::to_string_pretty(&report)?
        } else {
            serde_json::to_string(&report)?
        };
        match &self.path {
            Some(path) => {
                std::fs::write(path, text)?;
                tracing::info!("Report written to {}", path.display());
            }
            None => println!("{text}"),
        }
        Ok(())
    }
}

/// Logs the headline figures of a [`Summary`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter<Summary> for LogReporter {
    async fn report(&self, report: Summary) -> anyhow::Result<()> {
        for d in &report.drivers {
            tracing::info!(
                "{}: {:.3} {} over {} users, {} {}, passed: {}",
                d.name,
                d.metric,
                d.metric_unit,
                d.users,
                d.total_ops,
                d.ops_unit,
                d.passed
            );
            for c in d.response_times.operations.iter().filter(|c| c.passed == Some(false)) {
                tracing::warn!("{}.{}: response time limit exceeded", d.name, c.name);
            }
        }
        tracing::info!("{}: passed: {}", report.benchmark, report.passed);
        Ok(())
    }
}
