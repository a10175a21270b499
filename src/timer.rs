//! Benchmark clock.
//!
//! Every process keeps a [`Timer`] anchored at a shared *benchmark epoch*, an
//! instant expressed in wall-clock nanoseconds. Pacing happens in a monotonic
//! nanosecond domain local to the process (`Timer::now`), so wall-clock jumps
//! never disturb a run. The coordinator owns the epoch and ships it to
//! agents as a [`TimerRef`]; each agent then corrects for clock skew with
//! [`Timer::calibrate_clock`] so that relative millisecond times mean the same
//! instant on every host.
//!
//! # Sleeping
//!
//! [`Timer::wakeup_at`] sleeps until an absolute monotonic time. OS sleeps
//! overshoot, so the timer wakes up `compensation` early. The compensation
//! starts at 5ms and is refined during ramp up by a background sleep
//! calibrator (see [`Timer::calibrate`]).
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{CommunicationError, FatalError};

const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Initial sleep overshoot allowance, both for compensation and deviation.
const INITIAL_COMPENSATION: i64 = 5 * NANOS_PER_MILLI;
/// Compensation above this makes pacing meaningless.
const MAX_COMPENSATION: i64 = 100 * NANOS_PER_MILLI;
/// Sleep calibration needs at least this much ramp up left.
const MIN_CALIBRATION_WINDOW: i64 = 5 * NANOS_PER_SEC;
/// Longest single sleep, so stop requests are noticed.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

/// Serializable handle to a benchmark epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRef {
    /// Benchmark epoch in wall-clock nanoseconds since the UNIX epoch.
    pub epoch_wall_nanos: i64,
}

#[derive(Debug)]
pub struct Timer {
    origin: Instant,
    origin_wall_nanos: i64,
    epoch_wall_nanos: AtomicI64,
    compensation: AtomicI64,
    deviation: AtomicU64,
}

fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a timer whose epoch is 10ms from now.
    pub fn new() -> Self {
        let origin = Instant::now();
        let origin_wall_nanos = wall_nanos();
        Self::with_origin(origin, origin_wall_nanos, origin_wall_nanos + 10 * NANOS_PER_MILLI)
    }

    /// Rebuilds a timer on this host for an epoch received from elsewhere.
    pub fn from_ref(r: TimerRef) -> Self {
        Self::with_origin(Instant::now(), wall_nanos(), r.epoch_wall_nanos)
    }

    fn with_origin(origin: Instant, origin_wall_nanos: i64, epoch_wall_nanos: i64) -> Self {
        Self {
            origin,
            origin_wall_nanos,
            epoch_wall_nanos: AtomicI64::new(epoch_wall_nanos),
            compensation: AtomicI64::new(INITIAL_COMPENSATION),
            deviation: AtomicU64::new((INITIAL_COMPENSATION as f64).to_bits()),
        }
    }

    pub fn to_ref(&self) -> TimerRef {
        TimerRef {
            epoch_wall_nanos: self.epoch_wall_nanos.load(Ordering::Acquire),
        }
    }

    /// Monotonic nanoseconds since this timer was created on this host.
    pub fn now(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    /// The benchmark epoch in the monotonic domain of this host.
    fn epoch_nanos(&self) -> i64 {
        self.epoch_wall_nanos.load(Ordering::Acquire) - self.origin_wall_nanos
    }

    /// Milliseconds elapsed since the benchmark epoch.
    pub fn time_millis(&self) -> i64 {
        self.to_rel_time(self.now()).div_euclid(NANOS_PER_MILLI)
    }

    /// Nanoseconds elapsed since the benchmark epoch, at full resolution.
    pub fn rel_nanos(&self) -> i64 {
        self.to_rel_time(self.now())
    }

    /// Converts milliseconds relative to the epoch to the monotonic domain.
    pub fn to_abs_nanos(&self, rel_millis: i64) -> i64 {
        self.epoch_nanos() + rel_millis * NANOS_PER_MILLI
    }

    /// Converts a monotonic time to nanoseconds relative to the epoch.
    pub fn to_rel_time(&self, abs_nanos: i64) -> i64 {
        abs_nanos - self.epoch_nanos()
    }

    /// Converts a monotonic time to wall-clock milliseconds since the UNIX epoch.
    pub fn to_wall_millis(&self, abs_nanos: i64) -> i64 {
        (self.origin_wall_nanos + abs_nanos).div_euclid(NANOS_PER_MILLI)
    }

    /// Moves the epoch later by `offset_nanos`, so a host whose clock runs
    /// ahead of the coordinator's by that much reads the same relative times.
    pub fn adjust_base_time(&self, offset_nanos: i64) {
        self.epoch_wall_nanos.fetch_add(offset_nanos, Ordering::AcqRel);
    }

    pub fn compensation(&self) -> i64 {
        self.compensation.load(Ordering::Relaxed)
    }

    pub fn deviation(&self) -> f64 {
        f64::from_bits(self.deviation.load(Ordering::Relaxed))
    }

    fn set_deviation(&self, deviation: f64) {
        self.deviation.store(deviation.to_bits(), Ordering::Relaxed);
        // Round up to the next full millisecond.
        let compensation = (deviation / NANOS_PER_MILLI as f64) as i64 + 1;
        self.compensation.store(compensation * NANOS_PER_MILLI, Ordering::Relaxed);
    }

    /// Sleeps until `at` (monotonic nanoseconds) less the compensation.
    pub fn wakeup_at(&self, at: i64) {
        let never = AtomicBool::new(false);
        self.wakeup_at_or_stop(at, &never);
    }

    /// Like [`Timer::wakeup_at`] but gives up as soon as `stop` is raised.
    /// Returns `false` when stopped.
    pub fn wakeup_at_or_stop(&self, at: i64, stop: &AtomicBool) -> bool {
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            let remaining = at - self.compensation() - self.now();
            if remaining <= 0 {
                return true;
            }
            thread::sleep(Duration::from_nanos(remaining as u64).min(SLEEP_SLICE));
        }
    }

    /// Starts the sleep calibrator if more than five seconds are left until
    /// `end_ramp_up`. `on_fatal` is called if the host turns out to be too slow
    /// to pace anything.
    pub fn calibrate<F>(self: &Arc<Self>, label: &str, end_ramp_up: i64, on_fatal: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(FatalError) + Send + 'static,
    {
        if end_ramp_up - self.now() <= MIN_CALIBRATION_WINDOW {
            tracing::warn!(
                "{label}: Ramp up too short. Could not run calibration. Please increase ramp up by at least 5 seconds"
            );
            return None;
        }
        let timer = Arc::clone(self);
        let label = label.to_string();
        thread::Builder::new()
            .name("sleep-calibrator".into())
            .spawn(move || timer.run_sleep_calibration(&label, end_ramp_up, on_fatal))
            .map_err(|e| tracing::error!("unable to start sleep calibrator: {e}"))
            .ok()
    }

    fn run_sleep_calibration<F: FnOnce(FatalError)>(&self, label: &str, end: i64, on_fatal: F) {
        let mut rng = rand::rng();
        let mut max_sleep: Option<i64> = None;
        let mut after = i64::MIN;
        let mut count = 0u64;
        let mut dev_sum = 0i64;
        loop {
            let intended: i64 = rng.random_range(10..=30);
            let max = *max_sleep.get_or_insert(intended * NANOS_PER_MILLI);
            if after != i64::MIN && after + max >= end {
                break;
            }
            let before = self.now();
            thread::sleep(Duration::from_millis(intended as u64));
            after = self.now();
            let actual = after - before;
            dev_sum += actual - intended * NANOS_PER_MILLI;
            count += 1;
            if actual > max {
                max_sleep = Some(actual);
            }
            if count % 50 == 0 {
                self.set_deviation(dev_sum as f64 / count as f64);
            }
        }
        if count > 0 {
            self.set_deviation(dev_sum as f64 / count as f64);
        }
        let compensation = self.compensation();
        if compensation > MAX_COMPENSATION {
            tracing::error!(
                "{label}: System needed time compensation of {} ms. Values over 100ms are unacceptable for a driver",
                compensation / NANOS_PER_MILLI
            );
            on_fatal(FatalError::Compensation(compensation / NANOS_PER_MILLI));
            return;
        }
        tracing::info!(
            "{label}: Calibration succeeded. Sleep time deviation: {:.3} ms, compensation: {} ms.",
            self.deviation() / NANOS_PER_MILLI as f64,
            compensation / NANOS_PER_MILLI
        );
    }

    /// Measures the offset between this host and the coordinator's clock and
    /// moves the local epoch by it.
    ///
    /// `master_millis` reads the coordinator's milliseconds since the epoch.
    /// The attempt with the smallest round trip wins; the offset is
    /// `t1 - tm + latency / 2`.
    pub fn calibrate_clock<F>(&self, cfg: &ClockCalibration, mut master_millis: F) -> Result<ClockOffset, CommunicationError>
    where
        F: FnMut() -> Result<i64, CommunicationError>,
    {
        let mut best: Option<(i64, i64)> = None;
        for attempt in 0..cfg.attempts {
            if attempt > 0 {
                thread::sleep(cfg.interval);
            }
            let t1 = self.rel_nanos();
            let tm = master_millis()? * NANOS_PER_MILLI;
            let t2 = self.rel_nanos();
            let latency = t2 - t1;
            if best.is_none_or(|(l, _)| latency < l) {
                best = Some((latency, t1 - tm));
            }
        }
        let (latency, diff) = best.unwrap_or((0, 0));
        let offset = diff + latency / 2;
        let valid = latency <= cfg.max_latency.as_nanos() as i64;
        if valid {
            tracing::info!(
                "Clock offset to master is {:.3} ms, best round trip {:.3} ms",
                offset as f64 / NANOS_PER_MILLI as f64,
                latency as f64 / NANOS_PER_MILLI as f64
            );
        } else {
            tracing::error!(
                "Best round trip latency to master is {:.3} ms, above {} ms. This run may be invalid!",
                latency as f64 / NANOS_PER_MILLI as f64,
                cfg.max_latency.as_millis()
            );
        }
        self.adjust_base_time(offset);
        Ok(ClockOffset {
            offset_nanos: offset,
            latency_nanos: latency,
            valid,
        })
    }
}

/// Knobs for the agent to coordinator clock handshake.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
pub struct ClockCalibration {
    #[builder(default = 25)]
    pub attempts: usize,
    #[builder(default = Duration::from_millis(100))]
    pub interval: Duration,
    /// Round trips above this flag the run as potentially invalid.
    #[builder(default = Duration::from_millis(10))]
    pub max_latency: Duration,
}

impl Default for ClockCalibration {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Outcome of [`Timer::calibrate_clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffset {
    pub offset_nanos: i64,
    pub latency_nanos: i64,
    /// `false` when the best round trip exceeded the configured bound.
    pub valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_shared_through_ref() {
        let master = Timer::new();
        let agent = Timer::from_ref(master.to_ref());
        let diff = master.time_millis() - agent.time_millis();
        assert!(diff.abs() <= 1, "diff {diff}");
    }

    #[test]
    fn abs_and_rel_conversions_are_inverse() {
        let timer = Timer::new();
        let abs = timer.to_abs_nanos(1_500);
        assert_eq!(timer.to_rel_time(abs), 1_500 * NANOS_PER_MILLI);
    }

    #[test]
    fn adjust_base_time_shifts_relative_time() {
        let timer = Timer::new();
        let before = timer.to_abs_nanos(0);
        timer.adjust_base_time(250 * NANOS_PER_MILLI);
        assert_eq!(timer.to_abs_nanos(0) - before, 250 * NANOS_PER_MILLI);
    }

    #[test]
    fn deviation_rounds_compensation_up() {
        let timer = Timer::new();
        assert_eq!(timer.compensation(), 5 * NANOS_PER_MILLI);
        timer.set_deviation(1_200_000.0);
        assert_eq!(timer.compensation(), 2 * NANOS_PER_MILLI);
        timer.set_deviation(0.0);
        assert_eq!(timer.compensation(), NANOS_PER_MILLI);
    }

    mod wakeup_at {
        use super::*;

        #[test]
        fn sleeps_until_target_less_compensation() {
            let timer = Timer::new();
            let target = timer.now() + 30 * NANOS_PER_MILLI;
            timer.wakeup_at(target);
            assert!(timer.now() >= target - timer.compensation());
        }

        #[test]
        fn past_target_returns_immediately() {
            let timer = Timer::new();
            let start = timer.now();
            timer.wakeup_at(start - NANOS_PER_SEC);
            assert!(timer.now() - start < 5 * NANOS_PER_MILLI);
        }

        #[test]
        fn stop_flag_interrupts() {
            let timer = Timer::new();
            let stop = AtomicBool::new(true);
            assert!(!timer.wakeup_at_or_stop(timer.now() + 60 * NANOS_PER_SEC, &stop));
        }
    }

    mod calibrate_clock {
        use super::*;

        fn fast() -> ClockCalibration {
            ClockCalibration::builder()
                .attempts(5)
                .interval(Duration::from_millis(5))
                .build()
        }

        #[test]
        fn corrects_a_skewed_agent_clock() {
            let master = Arc::new(Timer::new());
            // The agent clock runs 250ms ahead of the master.
            let agent = Timer::from_ref(TimerRef {
                epoch_wall_nanos: master.to_ref().epoch_wall_nanos - 250 * NANOS_PER_MILLI,
            });
            let m = Arc::clone(&master);
            let offset = agent
                .calibrate_clock(&fast(), move || {
                    // 4ms simulated round trip, read in the middle.
                    thread::sleep(Duration::from_millis(2));
                    let t = m.time_millis();
                    thread::sleep(Duration::from_millis(2));
                    Ok(t)
                })
                .unwrap();
            assert!(offset.latency_nanos >= 4 * NANOS_PER_MILLI);
            let err = (offset.offset_nanos - 250 * NANOS_PER_MILLI).abs();
            assert!(err < 2 * NANOS_PER_MILLI, "offset error {err}ns");

            // Both sides now agree on the same instant within 2ms.
            let target = 2_000;
            let drift = (agent.to_abs_nanos(target) - agent.now()) - (master.to_abs_nanos(target) - master.now());
            assert!(drift.abs() < 2 * NANOS_PER_MILLI, "drift {drift}ns");
        }

        #[test]
        fn slow_round_trip_is_flagged_but_not_fatal() {
            let master = Arc::new(Timer::new());
            let agent = Timer::from_ref(master.to_ref());
            let m = Arc::clone(&master);
            let offset = agent
                .calibrate_clock(&fast(), move || {
                    thread::sleep(Duration::from_millis(6));
                    let t = m.time_millis();
                    thread::sleep(Duration::from_millis(6));
                    Ok(t)
                })
                .unwrap();
            assert!(!offset.valid);
        }

        #[test]
        fn communication_errors_propagate() {
            let agent = Timer::new();
            let res = agent.calibrate_clock(&fast(), || Err(CommunicationError::Closed));
            assert_eq!(res.unwrap_err(), CommunicationError::Closed);
        }
    }

    #[test]
    fn short_ramp_up_skips_sleep_calibration() {
        let timer = Arc::new(Timer::new());
        let end = timer.now() + NANOS_PER_SEC;
        assert!(timer.calibrate("test", end, |_| {}).is_none());
    }
}
