//! What workload code sees of the engine.
//!
//! Every simulated user owns one [`DriverContext`] and passes it to its
//! [`Driver`] on each invocation. Through it the workload reads properties,
//! records timing around the critical section of an operation (manual
//! timing) or lets a transport do it (auto timing), asks whether the current
//! transaction counts toward steady state and attaches custom statistics.
//!
//! # Timing
//!
//! The engine sets an *intended invoke time* before each operation. The first
//! timing call of the operation sleeps until that instant and stamps the
//! invoke time; a later call stamps the respond time. Time spent between a
//! response and a follow-up request of the same operation can be excluded as
//! *pause time*.
//!
//! ```rust
//! use fleetload::context::{Driver, DriverContext};
//! use fleetload::error::DriverError;
//!
//! struct Store;
//!
//! impl Driver for Store {
//!     fn invoke(&mut self, operation: &str, ctx: &mut DriverContext) -> Result<(), DriverError> {
//!         match operation {
//!             "browse" => ctx.transport(|| std::thread::sleep(std::time::Duration::from_millis(2))),
//!             _ => ctx.transport(|| ()),
//!         }
//!         Ok(())
//!     }
//! }
//! ```
use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::definition::{DriverDefinition, TimingMode};
use crate::error::{DriverError, FatalError};
use crate::metrics::{Attachments, CustomMetrics};
use crate::run::{RunControl, RunSchedule};
use crate::timer::Timer;

/// Marker for a timestamp that was not recorded.
pub const TIME_NOT_SET: i64 = i64::MIN;

/// Timestamps of the operation in flight, in monotonic nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    pub intended_invoke_time: i64,
    pub invoke_time: i64,
    pub respond_time: i64,
    /// A response seen before the operation issued another request.
    pub last_respond_time: i64,
    pub pause_time: i64,
}

impl Default for TimingInfo {
    fn default() -> Self {
        Self {
            intended_invoke_time: TIME_NOT_SET,
            invoke_time: TIME_NOT_SET,
            respond_time: TIME_NOT_SET,
            last_respond_time: TIME_NOT_SET,
            pause_time: 0,
        }
    }
}

impl TimingInfo {
    pub(crate) fn reset(&mut self, intended: i64) {
        *self = Self {
            intended_invoke_time: intended,
            ..Default::default()
        };
    }
}

/// Facts about the agent a thread runs in, shared by all its threads.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub driver_type: usize,
    pub agent_id: usize,
    pub host: String,
    /// Threads of this agent.
    pub threads: usize,
    /// Threads of the driver across all agents.
    pub driver_threads: usize,
    /// Global id of the first thread of this agent.
    pub first_thread: usize,
    pub scale: u32,
    pub schedule: RunSchedule,
    pub properties: Arc<BTreeMap<String, String>>,
}

/// Steady state boundaries of one thread.
///
/// In time mode the boundaries are monotonic nanoseconds, in cycle mode they
/// are cycle counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SteadyWindow {
    pub control: RunControl,
    pub start_time_set: bool,
    pub cycle_count: i64,
    pub end_ramp_up: i64,
    pub end_steady: i64,
    pub end_ramp_down: i64,
}

impl SteadyWindow {
    pub fn new(control: RunControl) -> Self {
        Self {
            control,
            start_time_set: false,
            cycle_count: 0,
            end_ramp_up: i64::MAX,
            end_steady: i64::MAX,
            end_ramp_down: i64::MAX,
        }
    }

    /// Whether a transaction spanning `start..end` is in steady state.
    pub fn is_steady(&self, start: i64, end: i64) -> bool {
        match self.control {
            RunControl::Time => self.start_time_set && start >= self.end_ramp_up && end < self.end_steady,
            RunControl::Cycles => {
                // The cycle in flight is not counted yet.
                let cycle = self.cycle_count + 1;
                self.start_time_set && cycle > self.end_ramp_up && cycle <= self.end_steady
            }
        }
    }
}

/// Per thread view of the engine handed to workload code.
#[derive(Debug)]
pub struct DriverContext {
    timer: Arc<Timer>,
    definition: Arc<DriverDefinition>,
    agent: Arc<AgentInfo>,
    thread_id: usize,
    pause_supported: bool,
    pub(crate) timing: TimingInfo,
    pub(crate) current_operation: Option<usize>,
    pub(crate) window: SteadyWindow,
    pub(crate) rng: StdRng,
    pub(crate) attachments: Attachments,
    pub(crate) reset_requested: bool,
}

impl DriverContext {
    pub(crate) fn new(
        timer: Arc<Timer>,
        definition: Arc<DriverDefinition>,
        agent: Arc<AgentInfo>,
        thread_id: usize,
        rng: StdRng,
    ) -> Self {
        let window = SteadyWindow::new(agent.schedule.run_control);
        Self {
            timer,
            definition,
            agent,
            thread_id,
            pause_supported: true,
            timing: TimingInfo::default(),
            current_operation: None,
            window,
            rng,
            attachments: Attachments::default(),
            reset_requested: false,
        }
    }

    pub fn scale(&self) -> u32 {
        self.agent.scale
    }

    pub fn clients_in_agent(&self) -> usize {
        self.agent.threads
    }

    pub fn clients_in_driver(&self) -> usize {
        self.agent.driver_threads
    }

    /// Global id of this thread within the driver.
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn agent_id(&self) -> usize {
        self.agent.agent_id
    }

    pub fn driver_name(&self) -> &str {
        &self.definition.name
    }

    pub fn current_operation(&self) -> Option<&str> {
        self.current_operation.map(|op| self.definition.operations[op].name.as_str())
    }

    pub fn operation_id(&self) -> Option<usize> {
        self.current_operation
    }

    pub fn operation_count(&self) -> usize {
        self.definition.operations.len()
    }

    pub fn random(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.agent.properties.get(name).map(String::as_str)
    }

    pub fn ramp_up(&self) -> u64 {
        self.agent.schedule.ramp_up
    }

    pub fn steady_state(&self) -> u64 {
        self.agent.schedule.steady_state
    }

    pub fn ramp_down(&self) -> u64 {
        self.agent.schedule.ramp_down
    }

    /// Milliseconds since the benchmark epoch.
    pub fn time_millis(&self) -> i64 {
        self.timer.time_millis()
    }

    /// Nanoseconds since the benchmark epoch.
    pub fn nano_time(&self) -> i64 {
        self.timer.rel_nanos()
    }

    /// Nanoseconds since the benchmark epoch at which steady state begins.
    /// Only meaningful in time controlled runs.
    pub fn steady_state_start_nanos(&self) -> i64 {
        self.timer.to_rel_time(self.window.end_ramp_up)
    }

    /// Sleeps until `rel_nanos` nanoseconds after the benchmark epoch.
    pub fn wakeup_at(&self, rel_nanos: i64) {
        self.timer.wakeup_at(self.timer.to_abs_nanos(0) + rel_nanos);
    }

    /// Restarts the mix of the current stream at the next selection.
    pub fn reset_mix(&mut self) {
        self.reset_requested = true;
    }

    pub fn is_pause_supported(&self) -> bool {
        self.pause_supported
    }

    pub fn set_pause_supported(&mut self, pause: bool) {
        self.pause_supported = pause;
    }

    /// Registers custom statistics under `name`. They are merged with the
    /// statistics of the other threads when the run ends.
    pub fn attach_metrics(&mut self, name: &str, metrics: Box<dyn CustomMetrics>) {
        self.attachments.attach(name, metrics);
    }

    pub fn attachment_mut(&mut self, name: &str) -> Option<&mut Box<dyn CustomMetrics>> {
        self.attachments.get_mut(name)
    }

    pub fn timing(&self) -> &TimingInfo {
        &self.timing
    }

    fn operation(&self, call: &'static str) -> Result<usize, FatalError> {
        self.current_operation.ok_or(FatalError::OutsideOperation(call))
    }

    fn timing_mode(&self, op: usize) -> TimingMode {
        self.definition.operations[op].timing
    }

    fn require_manual(&self, call: &'static str) -> Result<(), FatalError> {
        let op = self.operation(call)?;
        if self.timing_mode(op) != TimingMode::Manual {
            let operation = self.definition.operations[op].name.clone();
            tracing::error!(
                "Driver: {}, Operation: {operation}, timing: MANUAL illegal call to {call}() in driver code.",
                self.definition.name
            );
            return Err(FatalError::ManualTimingOnly { operation });
        }
        Ok(())
    }

    /// Manual timing. The first call of an operation waits for the intended
    /// invoke time and stamps the invoke time, the next stamps the respond
    /// time. After [`DriverContext::pause_time`] the next call ends the pause
    /// instead.
    pub fn record_time(&mut self) -> Result<(), FatalError> {
        self.require_manual("record_time")?;
        let t = &mut self.timing;
        if t.invoke_time == TIME_NOT_SET {
            self.timer.wakeup_at(t.intended_invoke_time);
            t.invoke_time = self.timer.now();
        } else if t.last_respond_time != TIME_NOT_SET {
            t.pause_time += self.timer.now() - t.last_respond_time;
            t.last_respond_time = TIME_NOT_SET;
        } else {
            t.respond_time = self.timer.now();
        }
        Ok(())
    }

    /// Manual timing. Starts excluding time from the response time until the
    /// next [`DriverContext::record_time`].
    pub fn pause_time(&mut self) -> Result<(), FatalError> {
        self.require_manual("pause_time")?;
        if self.timing.last_respond_time == TIME_NOT_SET {
            self.timing.last_respond_time = self.timer.now();
        }
        Ok(())
    }

    /// Auto timing hook for transports, called right before a request is
    /// sent. Returns the recorded time, or `None` when nothing was recorded.
    ///
    /// The first request of an operation waits for the intended invoke time.
    /// A further request after a response counts the gap as pause time.
    pub fn record_start_time(&mut self) -> Option<i64> {
        let op = self.current_operation?;
        if self.timing_mode(op) != TimingMode::Auto {
            return None;
        }
        let t = &mut self.timing;
        if t.invoke_time == TIME_NOT_SET {
            if t.respond_time != TIME_NOT_SET {
                tracing::warn!("Respond time already set before sleeping. Please report a bug.");
            }
            self.timer.wakeup_at(t.intended_invoke_time);
            t.invoke_time = self.timer.now();
            Some(t.invoke_time)
        } else if self.pause_supported && t.respond_time != TIME_NOT_SET {
            if t.respond_time < t.invoke_time {
                tracing::warn!(
                    "Respond time ({}) less than invoke time ({}). Please report a bug.",
                    t.respond_time,
                    t.invoke_time
                );
            }
            t.last_respond_time = t.respond_time;
            t.respond_time = TIME_NOT_SET;
            let now = self.timer.now();
            t.pause_time += now - t.last_respond_time;
            Some(now)
        } else {
            None
        }
    }

    /// Auto timing hook for transports, called when the response has been
    /// read.
    pub fn record_end_time(&mut self) -> Option<i64> {
        let op = self.current_operation?;
        if self.timing_mode(op) != TimingMode::Auto {
            return None;
        }
        if self.timing.invoke_time == TIME_NOT_SET {
            tracing::warn!(
                "Read before write! Some input may still be in the buffer from the previous operation. Ignoring such input."
            );
            return None;
        }
        let now = self.timer.now();
        self.timing.respond_time = now;
        Some(now)
    }

    /// Runs `request` between [`DriverContext::record_start_time`] and
    /// [`DriverContext::record_end_time`].
    pub fn transport<T>(&mut self, request: impl FnOnce() -> T) -> T {
        self.record_start_time();
        let out = request();
        self.record_end_time();
        out
    }

    /// Whether the operation in flight counts toward steady state.
    ///
    /// In time controlled runs this needs the response time, so it may only be
    /// called after the response was recorded.
    pub fn is_tx_steady_state(&self) -> Result<bool, FatalError> {
        let op = self.operation("is_tx_steady_state")?;
        let mut respond = self.timing.respond_time;
        if self.window.control == RunControl::Time && respond == TIME_NOT_SET {
            if self.timing.last_respond_time == TIME_NOT_SET {
                return Err(FatalError::SteadyStateUnknown {
                    operation: self.definition.operations[op].name.clone(),
                });
            }
            tracing::debug!("Potential pending open request.");
            respond = self.timing.last_respond_time;
        }
        Ok(self.window.is_steady(self.timing.invoke_time, respond))
    }

    pub(crate) fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }
}

/// Workload code of one simulated user.
///
/// A driver instance is created on, and only used by, its own thread.
pub trait Driver {
    /// Runs `operation` once. Recoverable failures are returned as
    /// [`DriverError::Failed`] or [`DriverError::Expected`];
    /// [`DriverError::Fatal`] aborts the run.
    fn invoke(&mut self, operation: &str, ctx: &mut DriverContext) -> Result<(), DriverError>;

    /// Runs once on thread 0 before any operation is paced, if the driver
    /// declares a pre-run hook.
    fn pre_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    /// Runs once on thread 0 after every other thread of its agent ended, if
    /// the driver declares a post-run hook.
    fn post_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Creates the driver of a thread.
pub type DriverFactory = Arc<dyn Fn(&DriverContext) -> anyhow::Result<Box<dyn Driver>> + Send + Sync>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cycle::{CycleSpec, CycleType};
    use crate::definition::{DriverSpec, OperationDecl};
    use rand::SeedableRng;

    pub(crate) fn definition() -> Arc<DriverDefinition> {
        let spec = DriverSpec {
            name: "store".into(),
            operations: vec![
                OperationDecl::new("browse", CycleSpec::fixed(CycleType::ThinkTime, 0), &[1.0]),
                OperationDecl::new("checkout", CycleSpec::fixed(CycleType::ThinkTime, 0), &[1.0]).manual(),
            ],
            ..Default::default()
        };
        Arc::new(DriverDefinition::from_spec(&spec).unwrap())
    }

    pub(crate) fn agent_info(schedule: RunSchedule) -> Arc<AgentInfo> {
        Arc::new(AgentInfo {
            driver_type: 0,
            agent_id: 0,
            host: "localhost".into(),
            threads: 1,
            driver_threads: 1,
            first_thread: 0,
            scale: 1,
            schedule,
            properties: Arc::new(BTreeMap::from([("url".to_string(), "http://localhost".to_string())])),
        })
    }

    fn context() -> DriverContext {
        DriverContext::new(
            Arc::new(Timer::new()),
            definition(),
            agent_info(RunSchedule::builder().steady_state(10).build()),
            0,
            StdRng::seed_from_u64(7),
        )
    }

    fn start(ctx: &mut DriverContext, op: usize) {
        let now = ctx.timer.now();
        ctx.timing.reset(now);
        ctx.current_operation = Some(op);
    }

    #[test]
    fn properties_and_ids() {
        let ctx = context();
        assert_eq!(ctx.property("url"), Some("http://localhost"));
        assert_eq!(ctx.property("missing"), None);
        assert_eq!(ctx.driver_name(), "store");
        assert_eq!(ctx.current_operation(), None);
        assert_eq!(ctx.operation_count(), 2);
    }

    mod manual {
        use super::*;

        #[test]
        fn invoke_then_respond() {
            let mut ctx = context();
            start(&mut ctx, 1);
            ctx.record_time().unwrap();
            ctx.record_time().unwrap();
            let t = ctx.timing;
            assert_ne!(t.invoke_time, TIME_NOT_SET);
            assert!(t.respond_time >= t.invoke_time);
            assert_eq!(t.pause_time, 0);
        }

        #[test]
        fn pause_is_accumulated() {
            let mut ctx = context();
            start(&mut ctx, 1);
            ctx.record_time().unwrap();
            ctx.pause_time().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
            ctx.record_time().unwrap();
            assert!(ctx.timing.pause_time >= 5_000_000);
            assert_eq!(ctx.timing.respond_time, TIME_NOT_SET);
            ctx.record_time().unwrap();
            assert_ne!(ctx.timing.respond_time, TIME_NOT_SET);
        }

        #[test]
        fn rejected_for_auto_operations() {
            let mut ctx = context();
            start(&mut ctx, 0);
            assert!(matches!(ctx.record_time(), Err(FatalError::ManualTimingOnly { .. })));
            assert!(matches!(ctx.pause_time(), Err(FatalError::ManualTimingOnly { .. })));
        }

        #[test]
        fn rejected_outside_an_operation() {
            let mut ctx = context();
            assert!(matches!(ctx.record_time(), Err(FatalError::OutsideOperation("record_time"))));
        }
    }

    mod auto {
        use super::*;

        #[test]
        fn transport_stamps_both_ends() {
            let mut ctx = context();
            start(&mut ctx, 0);
            ctx.transport(|| std::thread::sleep(std::time::Duration::from_millis(2)));
            let t = ctx.timing;
            assert!(t.respond_time - t.invoke_time >= 2_000_000);
        }

        #[test]
        fn second_request_counts_pause() {
            let mut ctx = context();
            start(&mut ctx, 0);
            ctx.transport(|| ());
            std::thread::sleep(std::time::Duration::from_millis(3));
            ctx.transport(|| ());
            assert!(ctx.timing.pause_time >= 3_000_000);
        }

        #[test]
        fn pause_can_be_disabled() {
            let mut ctx = context();
            ctx.set_pause_supported(false);
            start(&mut ctx, 0);
            ctx.transport(|| ());
            let first = ctx.timing.invoke_time;
            ctx.transport(|| ());
            assert_eq!(ctx.timing.invoke_time, first);
            assert_eq!(ctx.timing.pause_time, 0);
        }

        #[test]
        fn read_before_write_is_ignored() {
            let mut ctx = context();
            start(&mut ctx, 0);
            assert_eq!(ctx.record_end_time(), None);
            assert_eq!(ctx.timing.respond_time, TIME_NOT_SET);
        }

        #[test]
        fn manual_operations_are_left_alone() {
            let mut ctx = context();
            start(&mut ctx, 1);
            assert_eq!(ctx.record_start_time(), None);
        }
    }

    mod steady_state {
        use super::*;

        #[test]
        fn time_window() {
            let mut ctx = context();
            start(&mut ctx, 0);
            ctx.window.start_time_set = true;
            ctx.window.end_ramp_up = 100;
            ctx.window.end_steady = 200;
            ctx.timing.invoke_time = 150;
            ctx.timing.respond_time = 199;
            assert!(ctx.is_tx_steady_state().unwrap());
            ctx.timing.respond_time = 200;
            assert!(!ctx.is_tx_steady_state().unwrap());
        }

        #[test]
        fn needs_a_response() {
            let mut ctx = context();
            start(&mut ctx, 0);
            ctx.timing.invoke_time = 150;
            assert!(matches!(
                ctx.is_tx_steady_state(),
                Err(FatalError::SteadyStateUnknown { .. })
            ));
            ctx.timing.last_respond_time = 160;
            assert!(ctx.is_tx_steady_state().is_ok());
        }

        #[test]
        fn cycle_window_counts_the_cycle_in_flight() {
            let mut w = SteadyWindow::new(RunControl::Cycles);
            w.start_time_set = true;
            w.end_ramp_up = 2;
            w.end_steady = 4;
            w.cycle_count = 1;
            assert!(!w.is_steady(0, 0));
            w.cycle_count = 2;
            assert!(w.is_steady(0, 0));
            w.cycle_count = 4;
            assert!(!w.is_steady(0, 0));
        }
    }
}
