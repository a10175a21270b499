//! Statistics of a run.
//!
//! Every simulated user owns one [`Metrics`] and feeds it [`Sample`]s. When the
//! run is over the per-thread objects are merged into per-agent, per-host and
//! run totals through the [`Aggregate`] contract. Nothing here computes the
//! final percentiles or pass/fail verdicts; that is the job of
//! [`crate::report`].
//!
//! # Response time histogram
//!
//! Response times are bucketed relative to the largest percentile limit of
//! the driver. The first 300 buckets are *fine*, 1/200 of that limit each, and
//! cover up to 1.5 times the limit. The next 70 buckets are 10 times wider and
//! reach 5 times the limit. The last coarse bucket also collects everything
//! beyond, with the sum of those overflow times kept on the side.
//!
//! ```text
//! 0 ........ fine_max (300 x fine) ........ coarse_max (69 x coarse + fine_max) ... overflow
//! ```
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::DriverDefinition;
use crate::run::{RunControl, RunSchedule};

pub mod custom;
pub mod runtime;
pub mod variance;

pub use custom::{Attachments, CustomMetrics, CustomStat};
pub use runtime::{OperationRuntimeStats, RuntimeMetrics, RuntimeStats};

use variance::{add_sample, add_sum_square};

pub const RESPONSE_BUCKET_RATIO: i64 = 10;
pub const COARSE_BUCKETS: usize = 70;
pub const FINE_BUCKETS: usize = (100 - COARSE_BUCKETS) * RESPONSE_BUCKET_RATIO as usize;
pub const RESPONSE_BUCKETS: usize = FINE_BUCKETS + COARSE_BUCKETS;
pub const DELAY_BUCKETS: usize = 100;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Statistics that can be built from samples and combined with peers.
///
/// `merge` must not depend on the order in which peers are combined, so the
/// result of [`pairwise`] is the same as merging one after the other.
pub trait Aggregate
where
    Self: Send + std::fmt::Debug + Clone,
{
    /// The sample type this aggregate summarizes.
    type Metric;

    /// Incorporate a single sample.
    fn consume(&mut self, metric: &Self::Metric);

    /// Incorporate several samples.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Combine another population into this one.
    fn merge(&mut self, other: Self);
}

/// Reduces `items` as a balanced tree: neighbours are merged in rounds until
/// one aggregate is left. Keeps the populations merged at each step of
/// similar size, which is what the variance update is most accurate for.
pub fn pairwise<A: Aggregate>(mut items: Vec<A>) -> Option<A> {
    while items.len() > 1 {
        let mut next = Vec::with_capacity(items.len().div_ceil(2));
        let mut iter = items.into_iter();
        while let Some(mut left) = iter.next() {
            if let Some(right) = iter.next() {
                left.merge(right);
            }
            next.push(left);
        }
        items = next;
    }
    items.pop()
}

/// Boundaries of the response time histogram, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBuckets {
    pub fine: i64,
    pub coarse: i64,
    pub fine_max: i64,
    pub coarse_max: i64,
}

impl ResponseBuckets {
    pub fn new(max_percentile_nanos: i64) -> Self {
        let fine = (max_percentile_nanos / 200).max(1);
        let fine_max = fine * FINE_BUCKETS as i64;
        let coarse = fine * RESPONSE_BUCKET_RATIO;
        let coarse_max = coarse * (COARSE_BUCKETS as i64 - 1) + fine_max;
        Self {
            fine,
            coarse,
            fine_max,
            coarse_max,
        }
    }

    /// Bucket of `response` and whether it went to the overflow bucket.
    pub fn bucket(&self, response: i64) -> (usize, bool) {
        if response < self.fine_max {
            ((response / self.fine) as usize, false)
        } else if response < self.coarse_max {
            (((response - self.fine_max) / self.coarse) as usize + FINE_BUCKETS, false)
        } else {
            (RESPONSE_BUCKETS - 1, true)
        }
    }

    /// Lower bound of bucket `k`. Anything past the histogram reads as one
    /// coarse bucket beyond the overflow boundary.
    pub fn bucket_value(&self, k: usize) -> i64 {
        if k < FINE_BUCKETS {
            k as i64 * self.fine
        } else if k < RESPONSE_BUCKETS {
            (k - FINE_BUCKETS) as i64 * self.coarse + self.fine_max
        } else {
            self.coarse_max + self.coarse
        }
    }

    /// Index one past the bucket holding the `pct` percentile of `count`
    /// samples, so the reported value is the upper bound of that bucket.
    pub fn percentile_bucket(hist: &[u64], count: u64, pct: f64) -> usize {
        let target = (count as f64 * (pct / 100.0)) as u64;
        let mut sum = 0;
        let mut k = 0;
        while k < hist.len() {
            sum += hist[k];
            if sum >= target {
                break;
            }
            k += 1;
        }
        k + 1
    }

    /// Percentile value for pass/fail checks. Past the histogram this is two
    /// coarse buckets beyond the overflow boundary so it can never pass a limit
    /// inside the histogram.
    pub fn percentile(&self, hist: &[u64], count: u64, pct: f64) -> i64 {
        let k = Self::percentile_bucket(hist, count, pct);
        if k < RESPONSE_BUCKETS {
            self.bucket_value(k)
        } else {
            2 * self.coarse + self.coarse_max
        }
    }

    /// Whether a percentile from [`ResponseBuckets::percentile`] lies beyond
    /// the histogram and should be reported as "more than `coarse_max`".
    pub fn is_overflow(&self, nanos: i64) -> bool {
        nanos > self.coarse_max + self.coarse
    }
}

/// Shape shared by every [`Metrics`] of one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsLayout {
    pub driver_type: usize,
    pub driver_name: String,
    pub operations: Vec<String>,
    /// Operations `0..fg_operations` belong to the foreground mix.
    pub fg_operations: usize,
    /// Seconds or cycles, following `run_control`.
    pub steady_state: u64,
    pub run_control: RunControl,
    pub buckets: ResponseBuckets,
    pub delay_bucket: i64,
    pub graph_bucket: i64,
    pub graph_buckets: usize,
}

impl MetricsLayout {
    pub fn new(
        driver_type: usize,
        def: &DriverDefinition,
        schedule: &RunSchedule,
        graph_interval: Duration,
        max_run_time_hours: f64,
    ) -> Self {
        let interval = graph_interval.as_secs().max(1);
        // Time runs size the graphs to the run, cycle runs to the longest
        // run that is allowed.
        let graph_buckets = match schedule.run_control {
            RunControl::Time => 1 + schedule.total() / interval,
            RunControl::Cycles => (3600.0 * max_run_time_hours / interval as f64).ceil() as u64,
        };
        Self {
            driver_type,
            driver_name: def.name.clone(),
            operations: def.operation_names(),
            fg_operations: def.fg_operations(),
            steady_state: schedule.steady_state,
            run_control: schedule.run_control,
            buckets: ResponseBuckets::new(def.max_percentile_nanos()),
            delay_bucket: ((def.delay_histogram_max() / DELAY_BUCKETS as f64).ceil() as i64).max(1),
            graph_bucket: interval as i64 * NANOS_PER_SEC,
            graph_buckets: (graph_buckets as usize).max(1),
        }
    }

    fn delay_bucket_of(&self, delay: i64) -> usize {
        ((delay.max(0) / self.delay_bucket) as usize).min(DELAY_BUCKETS - 1)
    }
}

/// Counters of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub tx_steady: u64,
    pub tx_total: u64,
    pub err_steady: u64,
    pub err_total: u64,
    pub delay_count: u64,
    pub resp_sum_steady: f64,
    pub resp_sum_total: f64,
    /// Sum of the response times that landed in the overflow bucket.
    pub hi_resp_sum_steady: f64,
    pub sum_squares_steady: f64,
    pub sum_squares_total: f64,
    pub resp_max: i64,
    pub delay_sum: i64,
    pub targeted_delay_sum: i64,
    pub delay_max: i64,
    pub delay_min: i64,
    pub resp_hist: Vec<u64>,
    pub delay_hist: Vec<u64>,
    pub targeted_delay_hist: Vec<u64>,
    pub throughput_graph: Vec<u64>,
    pub resp_graph: Vec<i64>,
}

impl OperationStats {
    fn new(graph_buckets: usize) -> Self {
        Self {
            tx_steady: 0,
            tx_total: 0,
            err_steady: 0,
            err_total: 0,
            delay_count: 0,
            resp_sum_steady: 0.0,
            resp_sum_total: 0.0,
            hi_resp_sum_steady: 0.0,
            sum_squares_steady: 0.0,
            sum_squares_total: 0.0,
            resp_max: 0,
            delay_sum: 0,
            targeted_delay_sum: 0,
            delay_max: 0,
            delay_min: i32::MAX as i64,
            resp_hist: vec![0; RESPONSE_BUCKETS],
            delay_hist: vec![0; DELAY_BUCKETS],
            targeted_delay_hist: vec![0; DELAY_BUCKETS],
            throughput_graph: vec![0; graph_buckets],
            resp_graph: vec![0; graph_buckets],
        }
    }

    fn merge(&mut self, other: &OperationStats) {
        // The sums of squares must see the counts from before the merge.
        self.sum_squares_steady = add_sum_square(
            self.sum_squares_steady,
            self.tx_steady,
            self.resp_sum_steady,
            other.sum_squares_steady,
            other.tx_steady,
            other.resp_sum_steady,
        );
        self.sum_squares_total = add_sum_square(
            self.sum_squares_total,
            self.tx_total,
            self.resp_sum_total,
            other.sum_squares_total,
            other.tx_total,
            other.resp_sum_total,
        );
        self.tx_steady += other.tx_steady;
        self.tx_total += other.tx_total;
        self.err_steady += other.err_steady;
        self.err_total += other.err_total;
        self.delay_count += other.delay_count;
        self.resp_sum_steady += other.resp_sum_steady;
        self.resp_sum_total += other.resp_sum_total;
        self.hi_resp_sum_steady += other.hi_resp_sum_steady;
        self.delay_sum += other.delay_sum;
        self.targeted_delay_sum += other.targeted_delay_sum;
        self.resp_max = self.resp_max.max(other.resp_max);
        self.delay_max = self.delay_max.max(other.delay_max);
        self.delay_min = self.delay_min.min(other.delay_min);
        add_into(&mut self.resp_hist, &other.resp_hist);
        add_into(&mut self.delay_hist, &other.delay_hist);
        add_into(&mut self.targeted_delay_hist, &other.targeted_delay_hist);
        add_into(&mut self.throughput_graph, &other.throughput_graph);
        add_into(&mut self.resp_graph, &other.resp_graph);
    }
}

fn add_into<T: Copy + std::ops::AddAssign>(mine: &mut [T], theirs: &[T]) {
    mine.iter_mut().zip(theirs).for_each(|(a, b)| *a += *b);
}

/// The pacing observed before one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelaySample {
    /// The operation whose cycle produced the delay, i.e. the previous one of
    /// the same stream.
    pub operation: usize,
    /// Background cycles are left out of the Little's law check.
    pub foreground: bool,
    /// Invoke to invoke time, when both ends fall into steady state.
    pub cycle_time: Option<i64>,
    /// The measured think or cycle time, when it falls into steady state.
    pub delay_time: Option<i64>,
    /// The delay the cycle asked for.
    pub targeted: i64,
}

/// A single observation recorded by a simulated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// A successful transaction with its monotonic invoke and respond times.
    Tx {
        operation: usize,
        invoke: i64,
        respond: i64,
        pause: i64,
        steady: bool,
    },
    /// A failed transaction.
    Error {
        operation: usize,
        respond: Option<i64>,
        steady: bool,
    },
    Delay(DelaySample),
}

/// Statistics of one thread, or of any merge of threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub layout: Arc<MetricsLayout>,
    /// `None` once populations of different hosts were merged.
    pub host: Option<String>,
    /// Threads this object represents.
    pub thread_count: usize,
    /// Sum of foreground steady state cycle times, for the Little's law check.
    pub cycle_sum: i64,
    pub operations: Vec<OperationStats>,
    /// Wall-clock milliseconds of the run start.
    pub start_time: i64,
    /// Milliseconds from the run start to the last response.
    pub end_time: i64,
    #[serde(skip)]
    pub attachments: Attachments,
    #[serde(skip)]
    start_nanos: Option<i64>,
    #[serde(skip)]
    end_nanos: Option<i64>,
}

impl Metrics {
    pub fn new(layout: Arc<MetricsLayout>, host: Option<String>) -> Self {
        let operations = (0..layout.operations.len())
            .map(|_| OperationStats::new(layout.graph_buckets))
            .collect();
        Self {
            layout,
            host,
            thread_count: 0,
            cycle_sum: 0,
            operations,
            start_time: i64::MAX,
            end_time: 0,
            attachments: Attachments::default(),
            start_nanos: None,
            end_nanos: None,
        }
    }

    /// Sets the monotonic run start the graphs are relative to.
    pub fn set_start_nanos(&mut self, start: i64) {
        self.start_nanos = Some(start);
    }

    /// Finalizes `end_time` from the last recorded response.
    pub fn wrap(&mut self) {
        if let (Some(start), Some(end)) = (self.start_nanos, self.end_nanos) {
            self.end_time = (end - start) / NANOS_PER_MILLI;
        }
    }

    pub fn record_tx(&mut self, operation: usize, invoke: i64, respond: i64, pause: i64, steady: bool) {
        self.thread_count = self.thread_count.max(1);
        self.end_nanos = Some(respond);
        let mut response = respond - invoke - pause;
        if response < 0 {
            tracing::warn!(
                "Pause time too large - invoke : {invoke}, respond : {respond}, pause : {pause}"
            );
            response = 0;
        }

        let layout = &self.layout;
        let graph_bucket = self.start_nanos.map(|start| respond - start).filter(|e| *e > 0).map(|elapsed| {
            ((elapsed / layout.graph_bucket) as usize).min(layout.graph_buckets - 1)
        });
        let (bucket, overflow) = layout.buckets.bucket(response);

        let stats = &mut self.operations[operation];
        if let Some(g) = graph_bucket {
            stats.throughput_graph[g] += 1;
            stats.resp_graph[g] += response;
        }

        let x = response as f64;
        stats.tx_total += 1;
        stats.resp_sum_total += x;
        stats.sum_squares_total = add_sample(stats.sum_squares_total, stats.tx_total, stats.resp_sum_total, x);

        if steady {
            stats.tx_steady += 1;
            stats.resp_sum_steady += x;
            stats.sum_squares_steady =
                add_sample(stats.sum_squares_steady, stats.tx_steady, stats.resp_sum_steady, x);
            stats.resp_hist[bucket] += 1;
            if overflow {
                stats.hi_resp_sum_steady += x;
            }
            stats.resp_max = stats.resp_max.max(response);
        }
    }

    pub fn record_error(&mut self, operation: usize, respond: Option<i64>, steady: bool) {
        self.thread_count = self.thread_count.max(1);
        let stats = &mut self.operations[operation];
        stats.err_total += 1;
        if steady {
            stats.err_steady += 1;
        }
        if respond.is_some() {
            self.end_nanos = respond;
        }
    }

    pub fn record_delay(&mut self, sample: &DelaySample) {
        if sample.foreground
            && let Some(cycle) = sample.cycle_time
        {
            self.cycle_sum += cycle;
        }
        let Some(actual) = sample.delay_time else {
            return;
        };
        let actual_bucket = self.layout.delay_bucket_of(actual);
        let targeted_bucket = self.layout.delay_bucket_of(sample.targeted);
        let stats = &mut self.operations[sample.operation];
        stats.delay_count += 1;
        stats.delay_sum += actual;
        stats.targeted_delay_sum += sample.targeted;
        stats.delay_max = stats.delay_max.max(actual);
        stats.delay_min = stats.delay_min.min(actual);
        stats.delay_hist[actual_bucket] += 1;
        stats.targeted_delay_hist[targeted_bucket] += 1;
    }

    /// Steady state transactions across all operations.
    pub fn tx_steady(&self) -> u64 {
        self.operations.iter().map(|o| o.tx_steady).sum()
    }

    pub fn attach(&mut self, name: &str, metrics: Box<dyn CustomMetrics>) {
        self.attachments.attach(name, metrics);
    }
}

impl Aggregate for Metrics {
    type Metric = Sample;

    fn consume(&mut self, metric: &Sample) {
        match *metric {
            Sample::Tx {
                operation,
                invoke,
                respond,
                pause,
                steady,
            } => self.record_tx(operation, invoke, respond, pause, steady),
            Sample::Error {
                operation,
                respond,
                steady,
            } => self.record_error(operation, respond, steady),
            Sample::Delay(ref delay) => self.record_delay(delay),
        }
    }

    fn merge(&mut self, other: Self) {
        if self.host != other.host {
            self.host = None;
        }
        self.thread_count += other.thread_count;
        self.cycle_sum += other.cycle_sum;
        for (mine, theirs) in self.operations.iter_mut().zip(&other.operations) {
            mine.merge(theirs);
        }
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.end_nanos = self.end_nanos.max(other.end_nanos);
        self.attachments.merge(other.attachments);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::custom::tests::Counter;

    const MS: i64 = NANOS_PER_MILLI;

    /// Two operations, a 100ms max percentile, 10s graph buckets.
    pub(crate) fn layout() -> Arc<MetricsLayout> {
        Arc::new(MetricsLayout {
            driver_type: 0,
            driver_name: "web".into(),
            operations: vec!["browse".into(), "buy".into()],
            fg_operations: 2,
            steady_state: 60,
            run_control: RunControl::Time,
            buckets: ResponseBuckets::new(100 * MS),
            delay_bucket: 20 * MS,
            graph_bucket: 10 * NANOS_PER_SEC,
            graph_buckets: 7,
        })
    }

    fn metrics() -> Metrics {
        let mut m = Metrics::new(layout(), Some("host-a".into()));
        m.set_start_nanos(0);
        m
    }

    mod buckets {
        use super::*;

        #[test]
        fn sizes_follow_the_max_percentile() {
            let b = ResponseBuckets::new(100 * MS);
            assert_eq!(b.fine, MS / 2);
            assert_eq!(b.fine_max, 150 * MS);
            assert_eq!(b.coarse, 5 * MS);
            assert_eq!(b.coarse_max, 495 * MS);
        }

        #[test]
        fn fine_coarse_boundary() {
            let b = ResponseBuckets::new(100 * MS);
            assert_eq!(b.bucket(b.fine_max - 1), (FINE_BUCKETS - 1, false));
            assert_eq!(b.bucket(b.fine_max), (FINE_BUCKETS, false));
            assert_eq!(b.bucket(b.coarse_max - 1), (RESPONSE_BUCKETS - 2, false));
            assert_eq!(b.bucket(b.coarse_max), (RESPONSE_BUCKETS - 1, true));
        }

        #[test]
        fn zero_percentile_limit_still_buckets() {
            let b = ResponseBuckets::new(0);
            assert_eq!(b.fine, 1);
            assert_eq!(b.bucket(10).0, 10);
        }

        #[test]
        fn percentile_reports_the_next_bucket() {
            let b = ResponseBuckets::new(100 * MS);
            let mut hist = vec![0u64; RESPONSE_BUCKETS];
            hist[10] = 90;
            hist[20] = 10;
            assert_eq!(b.percentile(&hist, 100, 90.0), 11 * b.fine);
            assert_eq!(b.percentile(&hist, 100, 95.0), 21 * b.fine);
        }

        #[test]
        fn percentile_past_the_histogram_is_overflow() {
            let b = ResponseBuckets::new(100 * MS);
            let mut hist = vec![0u64; RESPONSE_BUCKETS];
            hist[RESPONSE_BUCKETS - 1] = 10;
            let p = b.percentile(&hist, 10, 90.0);
            assert!(b.is_overflow(p));
            assert!(!b.is_overflow(b.percentile(&hist, 0, 90.0)));
        }
    }

    mod record {
        use super::*;

        #[test]
        fn steady_tx_fills_histogram_and_graph() {
            let mut m = metrics();
            m.record_tx(0, 12 * NANOS_PER_SEC, 12 * NANOS_PER_SEC + 20 * MS, 0, true);
            let s = &m.operations[0];
            assert_eq!((s.tx_steady, s.tx_total), (1, 1));
            assert_eq!(s.resp_hist[40], 1);
            assert_eq!(s.throughput_graph[1], 1);
            assert_eq!(s.resp_graph[1], 20 * MS);
            assert_eq!(s.resp_max, 20 * MS);
            assert_eq!(m.thread_count, 1);
        }

        #[test]
        fn ramp_tx_only_counts_total() {
            let mut m = metrics();
            m.record_tx(1, MS, 3 * MS, 0, false);
            let s = &m.operations[1];
            assert_eq!((s.tx_steady, s.tx_total), (0, 1));
            assert_eq!(s.resp_hist.iter().sum::<u64>(), 0);
            assert_eq!(s.resp_max, 0);
        }

        #[test]
        fn overflow_is_summed_separately() {
            let mut m = metrics();
            let far = 10 * NANOS_PER_SEC;
            m.record_tx(0, NANOS_PER_SEC, NANOS_PER_SEC + far, 0, true);
            let s = &m.operations[0];
            assert_eq!(s.resp_hist[RESPONSE_BUCKETS - 1], 1);
            assert_eq!(s.hi_resp_sum_steady, far as f64);
        }

        #[test]
        fn late_responses_go_to_the_last_graph_bucket() {
            let mut m = metrics();
            let late = 500 * NANOS_PER_SEC;
            m.record_tx(0, late, late + MS, 0, true);
            assert_eq!(m.operations[0].throughput_graph[6], 1);
        }

        #[test]
        fn negative_response_counts_as_zero() {
            let mut m = metrics();
            m.record_tx(0, 10 * MS, 12 * MS, 5 * MS, true);
            assert_eq!(m.operations[0].resp_sum_total, 0.0);
            assert_eq!(m.operations[0].resp_hist[0], 1);
        }

        #[test]
        fn errors() {
            let mut m = metrics();
            m.record_error(1, Some(4 * NANOS_PER_SEC), true);
            m.record_error(1, None, false);
            let s = &m.operations[1];
            assert_eq!((s.err_steady, s.err_total), (1, 2));
            m.wrap();
            assert_eq!(m.end_time, 4000);
        }

        #[test]
        fn delays() {
            let mut m = metrics();
            m.consume(&Sample::Delay(DelaySample {
                operation: 0,
                foreground: true,
                cycle_time: Some(150 * MS),
                delay_time: Some(100 * MS),
                targeted: 90 * MS,
            }));
            m.consume(&Sample::Delay(DelaySample {
                operation: 0,
                foreground: false,
                cycle_time: Some(40 * MS),
                delay_time: Some(10 * NANOS_PER_SEC),
                targeted: 30 * MS,
            }));
            m.consume(&Sample::Delay(DelaySample {
                operation: 1,
                foreground: true,
                cycle_time: None,
                delay_time: None,
                targeted: 30 * MS,
            }));
            let s = &m.operations[0];
            assert_eq!(m.cycle_sum, 150 * MS);
            assert_eq!(s.delay_count, 2);
            assert_eq!(s.delay_min, 100 * MS);
            assert_eq!(s.delay_max, 10 * NANOS_PER_SEC);
            assert_eq!(s.delay_hist[5], 1);
            assert_eq!(s.delay_hist[DELAY_BUCKETS - 1], 1);
            assert_eq!(s.targeted_delay_hist[4], 1);
            assert_eq!(s.targeted_delay_hist[1], 1);
            assert_eq!(m.operations[1].delay_count, 0);
        }
    }

    mod merge {
        use super::*;
        use crate::metrics::variance::Moments;

        fn thread(responses: &[i64], host: &str) -> Metrics {
            let mut m = Metrics::new(layout(), Some(host.into()));
            m.set_start_nanos(0);
            for (i, r) in responses.iter().enumerate() {
                let invoke = NANOS_PER_SEC + i as i64 * 100 * MS;
                m.record_tx(0, invoke, invoke + r, 0, true);
            }
            m
        }

        #[test]
        fn pairwise_matches_one_pass() {
            let all: Vec<i64> = (0..50).map(|i| (i * 37 % 101) * MS).collect();
            let threads: Vec<Metrics> = all.chunks(7).map(|c| thread(c, "host-a")).collect();
            let merged = pairwise(threads).unwrap();

            let mut expected = Moments::default();
            all.iter().for_each(|x| expected.push(*x as f64));
            let s = &merged.operations[0];
            assert_eq!(s.tx_steady, 50);
            assert_eq!(merged.thread_count, 8);
            assert!((s.sum_squares_steady - expected.s).abs() <= 1e-6 * expected.s);
            assert_eq!(s.resp_hist.iter().sum::<u64>(), 50);
            assert_eq!(merged.host.as_deref(), Some("host-a"));
        }

        #[test]
        fn different_hosts_lose_the_host() {
            let mut a = thread(&[MS], "host-a");
            a.merge(thread(&[MS], "host-b"));
            assert_eq!(a.host, None);
        }

        #[test]
        fn times_and_extremes() {
            let mut a = thread(&[5 * MS], "h");
            a.start_time = 2_000;
            a.end_time = 10;
            a.operations[0].delay_min = 7;
            let mut b = thread(&[9 * MS], "h");
            b.start_time = 1_000;
            b.end_time = 30;
            b.operations[0].delay_min = 3;
            a.merge(b);
            assert_eq!(a.start_time, 1_000);
            assert_eq!(a.end_time, 30);
            assert_eq!(a.operations[0].resp_max, 9 * MS);
            assert_eq!(a.operations[0].delay_min, 3);
        }

        #[test]
        fn attachments_travel_along() {
            let mut a = thread(&[MS], "h");
            a.attach("hits", Box::new(Counter { count: 2, target: 0 }));
            let mut b = thread(&[MS], "h");
            b.attach("hits", Box::new(Counter { count: 5, target: 0 }));
            a.merge(b);
            assert_eq!(a.attachments.get("hits").unwrap().results()[0].result, "7");
        }

        #[test]
        fn pairwise_of_nothing() {
            assert!(pairwise(Vec::<Metrics>::new()).is_none());
        }
    }
}
