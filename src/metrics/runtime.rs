//! In-flight statistics.
//!
//! While a run is in progress every agent periodically snapshots the metrics
//! of its threads into a [`RuntimeMetrics`] and ships it to the coordinator.
//! Comparing two consecutive snapshots gives the *current* rates over the
//! last interval; the latest snapshot alone gives the *overall* steady state
//! figures so far.
use serde::{Deserialize, Serialize};

use super::variance::{add_sum_square, subtract_sum_square};
use super::{Aggregate, Metrics, ResponseBuckets};
use crate::run::RunSchedule;

/// Column labels of [`RuntimeStats::values`], in order.
pub const LABELS: [&str; 9] = [
    "CThru", "OThru", "CErr", "CResp", "OResp", "CSD", "OSD", "C90%Resp", "O90%Resp",
];

pub const C_THRUPUT: usize = 0;
pub const O_THRUPUT: usize = 1;
pub const C_ERRORS: usize = 2;
pub const C_RESP: usize = 3;
pub const O_RESP: usize = 4;
pub const C_SD: usize = 5;
pub const O_SD: usize = 6;
pub const C_RESP90: usize = 7;
pub const O_RESP90: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationRuntimeStats {
    pub tx_steady: u64,
    pub tx_total: u64,
    pub err_steady: u64,
    pub err_total: u64,
    pub resp_sum_steady: f64,
    pub resp_sum_total: f64,
    pub hi_resp_sum_steady: f64,
    pub sum_squares_steady: f64,
    pub sum_squares_total: f64,
    pub resp_hist: Vec<u64>,
}

impl OperationRuntimeStats {
    fn add(&mut self, tx_steady: u64, tx_total: u64, sum_squares: (f64, f64), other: &Self) {
        self.sum_squares_steady = add_sum_square(
            self.sum_squares_steady,
            self.tx_steady,
            self.resp_sum_steady,
            sum_squares.0,
            tx_steady,
            other.resp_sum_steady,
        );
        self.sum_squares_total = add_sum_square(
            self.sum_squares_total,
            self.tx_total,
            self.resp_sum_total,
            sum_squares.1,
            tx_total,
            other.resp_sum_total,
        );
        self.tx_steady += tx_steady;
        self.tx_total += tx_total;
        self.err_steady += other.err_steady;
        self.err_total += other.err_total;
        self.resp_sum_steady += other.resp_sum_steady;
        self.resp_sum_total += other.resp_sum_total;
        self.hi_resp_sum_steady += other.hi_resp_sum_steady;
        if self.resp_hist.len() < other.resp_hist.len() {
            self.resp_hist.resize(other.resp_hist.len(), 0);
        }
        self.resp_hist
            .iter_mut()
            .zip(&other.resp_hist)
            .for_each(|(a, b)| *a += *b);
    }
}

impl From<&super::OperationStats> for OperationRuntimeStats {
    fn from(s: &super::OperationStats) -> Self {
        Self {
            tx_steady: s.tx_steady,
            tx_total: s.tx_total,
            err_steady: s.err_steady,
            err_total: s.err_total,
            resp_sum_steady: s.resp_sum_steady,
            resp_sum_total: s.resp_sum_total,
            hi_resp_sum_steady: s.hi_resp_sum_steady,
            sum_squares_steady: s.sum_squares_steady,
            sum_squares_total: s.sum_squares_total,
            resp_hist: s.resp_hist.clone(),
        }
    }
}

/// A snapshot of the response time statistics of one agent, or of a driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub sequence: u32,
    /// Milliseconds since the run start.
    pub timestamp: i64,
    pub driver_type: usize,
    pub buckets: ResponseBuckets,
    pub operations: Vec<OperationRuntimeStats>,
}

/// Values derived from two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Seconds since the run start.
    pub timestamp: f64,
    /// `values[label][operation]`, `NaN` where no value could be computed.
    pub values: Vec<Vec<f64>>,
}

impl RuntimeMetrics {
    pub fn new(driver_type: usize, sequence: u32, timestamp: i64) -> Self {
        Self {
            sequence,
            timestamp,
            driver_type,
            ..Default::default()
        }
    }

    fn copy(&mut self, m: &Metrics) {
        self.driver_type = m.layout.driver_type;
        self.buckets = m.layout.buckets;
        self.operations = m.operations.iter().map(OperationRuntimeStats::from).collect();
    }

    fn add_metrics(&mut self, m: &Metrics) {
        for (mine, theirs) in self.operations.iter_mut().zip(&m.operations) {
            let other = OperationRuntimeStats::from(theirs);
            mine.add(
                theirs.tx_steady,
                theirs.tx_total,
                (theirs.sum_squares_steady, theirs.sum_squares_total),
                &other,
            );
        }
    }

    /// Current and overall statistics, comparing against the snapshot
    /// `prev` taken one interval earlier. `precision` is nanoseconds per
    /// reporting unit.
    pub fn results(&self, prev: &RuntimeMetrics, schedule: &RunSchedule, precision: f64) -> RuntimeStats {
        let steady_start = schedule.ramp_up as i64 * 1000;
        let steady_end = (schedule.ramp_up + schedule.steady_state) as i64 * 1000;
        let elapsed = if self.timestamp > steady_end {
            schedule.steady_state as i64 * 1000
        } else if self.timestamp > steady_start {
            self.timestamp - steady_start
        } else {
            0
        };
        let time_diff = (self.timestamp - prev.timestamp) as f64;

        let ops = self.operations.len();
        let mut values = vec![vec![f64::NAN; ops]; LABELS.len()];
        let empty = OperationRuntimeStats::default();

        for (i, op) in self.operations.iter().enumerate() {
            let before = prev.operations.get(i).unwrap_or(&empty);
            let n_tx = op.tx_total.saturating_sub(before.tx_total);

            values[C_THRUPUT][i] = n_tx as f64 * 1000.0 / time_diff;
            if elapsed > 0 {
                values[O_THRUPUT][i] = op.tx_steady as f64 * 1000.0 / elapsed as f64;
            }
            values[C_ERRORS][i] = op.err_total.saturating_sub(before.err_total) as f64 * 1000.0 / time_diff;
            if op.resp_sum_total > before.resp_sum_total {
                values[C_RESP][i] = (op.resp_sum_total - before.resp_sum_total) / (n_tx as f64 * precision);
            }

            if n_tx > 0 {
                let s = subtract_sum_square(
                    op.sum_squares_total,
                    op.tx_total,
                    op.resp_sum_total,
                    before.sum_squares_total,
                    before.tx_total,
                    before.resp_sum_total,
                );
                if s == 0.0 {
                    values[C_SD][i] = 0.0;
                } else if !s.is_nan() {
                    values[C_SD][i] = (s / n_tx as f64).sqrt() / precision;
                }
            }

            if op.tx_steady > 0 {
                values[O_RESP][i] = op.resp_sum_steady / (op.tx_steady as f64 * precision);
                values[O_SD][i] = (op.sum_squares_steady / op.tx_steady as f64).sqrt() / precision;

                if op.tx_steady > before.tx_steady {
                    let diff: Vec<u64> = op
                        .resp_hist
                        .iter()
                        .enumerate()
                        .map(|(k, c)| c.saturating_sub(before.resp_hist.get(k).copied().unwrap_or(0)))
                        .collect();
                    let k = ResponseBuckets::percentile_bucket(&diff, op.tx_steady - before.tx_steady, 90.0);
                    values[C_RESP90][i] = self.buckets.bucket_value(k) as f64 / precision;
                }
                let k = ResponseBuckets::percentile_bucket(&op.resp_hist, op.tx_steady, 90.0);
                values[O_RESP90][i] = self.buckets.bucket_value(k) as f64 / precision;
            }
        }

        RuntimeStats {
            timestamp: self.timestamp as f64 / 1000.0,
            values,
        }
    }
}

impl Aggregate for RuntimeMetrics {
    type Metric = Metrics;

    /// The first metrics consumed initialize the snapshot, later ones are added.
    fn consume(&mut self, metric: &Metrics) {
        if self.operations.is_empty() {
            self.copy(metric);
        } else {
            self.add_metrics(metric);
        }
    }

    fn merge(&mut self, other: Self) {
        self.timestamp = self.timestamp.max(other.timestamp);
        if self.operations.is_empty() {
            self.driver_type = other.driver_type;
            self.buckets = other.buckets;
            self.operations = other.operations;
            return;
        }
        for (mine, theirs) in self.operations.iter_mut().zip(&other.operations) {
            mine.add(
                theirs.tx_steady,
                theirs.tx_total,
                (theirs.sum_squares_steady, theirs.sum_squares_total),
                theirs,
            );
        }
    }
}

impl RuntimeStats {
    /// `label=a/b/c` for one statistic across all operations, `-` for missing values.
    pub fn format(&self, label: usize, decimals: usize) -> String {
        let row = self.values[label]
            .iter()
            .map(|v| if v.is_nan() { "-".to_string() } else { format!("{v:.decimals$}") })
            .collect::<Vec<_>>()
            .join("/");
        format!("{}={}", LABELS[label], row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::layout;

    const MS: i64 = 1_000_000;
    const SEC: i64 = 1_000_000_000;

    fn thread(responses: &[i64]) -> Metrics {
        let mut m = Metrics::new(layout(), None);
        m.set_start_nanos(0);
        for (i, r) in responses.iter().enumerate() {
            let invoke = SEC + i as i64 * 10 * MS;
            m.record_tx(0, invoke, invoke + r, 0, true);
        }
        m
    }

    fn snapshot(seq: u32, timestamp: i64, threads: &[Metrics]) -> RuntimeMetrics {
        let mut r = RuntimeMetrics::new(0, seq, timestamp);
        r.aggregate(threads);
        r
    }

    fn schedule() -> RunSchedule {
        RunSchedule::builder().ramp_up(0).steady_state(60).build()
    }

    #[test]
    fn consume_copies_then_adds() {
        let r = snapshot(1, 10_000, &[thread(&[MS, 3 * MS]), thread(&[5 * MS])]);
        let op = &r.operations[0];
        assert_eq!(op.tx_total, 3);
        assert_eq!(op.resp_sum_total, (9 * MS) as f64);
        // Deviations from the mean of 3ms: 2, 0, 2.
        assert!((op.sum_squares_total - (8 * MS * MS) as f64).abs() < 1.0);
        assert_eq!(r.buckets, layout().buckets);
    }

    #[test]
    fn merge_keeps_latest_timestamp() {
        let mut a = snapshot(2, 20_000, &[thread(&[MS])]);
        a.merge(snapshot(2, 20_050, &[thread(&[MS])]));
        assert_eq!(a.timestamp, 20_050);
        assert_eq!(a.operations[0].tx_steady, 2);

        let mut empty = RuntimeMetrics::default();
        empty.merge(a.clone());
        assert_eq!(empty.operations, a.operations);
    }

    mod results {
        use super::*;

        #[test]
        fn current_and_overall() {
            let prev = snapshot(1, 10_000, &[thread(&[2 * MS; 10])]);
            let now = snapshot(2, 20_000, &[thread(&[2 * MS; 30])]);
            let stats = now.results(&prev, &schedule(), 1e6);

            assert_eq!(stats.timestamp, 20.0);
            // 20 new tx over 10s.
            assert!((stats.values[C_THRUPUT][0] - 2.0).abs() < 1e-9);
            // 30 tx over 20s of steady state.
            assert!((stats.values[O_THRUPUT][0] - 1.5).abs() < 1e-9);
            assert!((stats.values[C_RESP][0] - 2.0).abs() < 1e-9);
            assert!((stats.values[O_RESP][0] - 2.0).abs() < 1e-9);
            assert_eq!(stats.values[C_SD][0], 0.0);
            assert_eq!(stats.values[C_ERRORS][0], 0.0);
            // 2ms is bucket 4 of 0.5ms buckets, reported as the next boundary.
            assert!((stats.values[O_RESP90][0] - 2.5).abs() < 1e-9);
            assert!((stats.values[C_RESP90][0] - 2.5).abs() < 1e-9);
        }

        #[test]
        fn idle_operations_are_missing() {
            let prev = snapshot(1, 10_000, &[thread(&[])]);
            let now = snapshot(2, 20_000, &[thread(&[])]);
            let stats = now.results(&prev, &schedule(), 1e6);
            assert_eq!(stats.values[C_THRUPUT][1], 0.0);
            assert!(stats.values[C_RESP][1].is_nan());
            assert!(stats.values[O_RESP90][1].is_nan());
            assert_eq!(stats.format(C_RESP, 2), "CResp=-/-");
        }

        #[test]
        fn nothing_in_steady_state_yet() {
            let sched = RunSchedule::builder().ramp_up(60).steady_state(60).build();
            let prev = snapshot(1, 10_000, &[thread(&[MS])]);
            let now = snapshot(2, 20_000, &[thread(&[MS, MS])]);
            let stats = now.results(&prev, &sched, 1e6);
            assert!(stats.values[O_THRUPUT][0].is_nan());
            assert_eq!(stats.format(C_THRUPUT, 2), "CThru=0.10/0.00");
        }
    }
}
