//! The per-host share of a driver.
//!
//! An [`Agent`] owns the threads of one driver on one host. It is configured
//! once, runs the pre-run hook on thread 0, starts its remaining threads
//! staggered in time, hands the agreed start time down to them and finally
//! collects their statistics. All calls block; the control plane runs them
//! off the async runtime.
mod stats;
mod thread;

pub use thread::RunState;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use self::stats::StatsCollector;
use self::thread::ThreadHandle;
use crate::context::{AgentInfo, DriverFactory};
use crate::control::{AgentRun, MasterHandle};
use crate::definition::DriverDefinition;
use crate::latch::CountDownLatch;
use crate::metrics::{Metrics, MetricsLayout, pairwise};
use crate::run::{LoadPeriod, RunControl};
use crate::timer::{ClockCalibration, Timer, TimerRef};

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Grace period for thread 0 to leave its post-run hook on termination.
const POST_RUN_GRACE: Duration = Duration::from_secs(60);

/// State shared by an agent and its threads.
pub(crate) struct AgentShared {
    pub info: Arc<AgentInfo>,
    pub name: String,
    pub timer: Arc<Timer>,
    pub definition: Arc<DriverDefinition>,
    pub factory: DriverFactory,
    pub layout: Arc<MetricsLayout>,
    pub master: Arc<dyn MasterHandle>,
    pub seed: Option<u64>,
    start_time: AtomicI64,
    /// Released once every thread is initialized.
    pub thread_start: CountDownLatch,
    /// Released once the start time is known.
    pub time_set: CountDownLatch,
    /// Released by thread 0 after the pre-run hook.
    pub pre_run: Option<CountDownLatch>,
    /// Releases thread 0 after the pre-run hook.
    pub start: Option<CountDownLatch>,
    /// Released by thread 0 when its run ends.
    pub finish: Option<CountDownLatch>,
    /// Releases the post-run hook of thread 0.
    pub post_run: Option<CountDownLatch>,
    pub variable_load: bool,
    running_threads: AtomicUsize,
    load_switch_time: AtomicI64,
    aborted: AtomicBool,
}

impl std::fmt::Debug for AgentShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentShared")
            .field("name", &self.name)
            .field("info", &self.info)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

impl AgentShared {
    /// Absolute start time in monotonic nanoseconds.
    pub fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::Acquire)
    }

    /// Threads with an id at or above this are parked by the variable load.
    pub fn running_threads(&self) -> usize {
        self.running_threads.load(Ordering::Acquire)
    }

    pub fn load_switch_time(&self) -> i64 {
        self.load_switch_time.load(Ordering::Acquire)
    }

    pub fn aborted(&self) -> &AtomicBool {
        &self.aborted
    }

    /// Releases every latch a thread may block on and tells the coordinator.
    /// Only the first call has an effect.
    pub fn abort_run(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!("{}: Aborting run", self.name);
        for latch in [&self.start, &self.post_run, &self.pre_run].into_iter().flatten() {
            latch.count_down();
        }
        self.master.abort_run();
    }
}

/// One driver's share of threads on one host.
#[derive(Debug)]
pub struct Agent {
    shared: Arc<AgentShared>,
    threads: Mutex<Vec<Arc<ThreadHandle>>>,
    stats: Mutex<Option<StatsCollector>>,
    variable_load: Vec<LoadPeriod>,
    runtime_stats: Option<Duration>,
    clock: ClockCalibration,
    /// Monotonic nanoseconds before which thread 1 may not start.
    earliest_start: AtomicI64,
}

impl Agent {
    /// Prepares the agent for a run and, if the driver declares one, runs the
    /// pre-run hook on thread 0 before returning.
    pub fn configure(
        id: usize,
        host: String,
        master: Arc<dyn MasterHandle>,
        run: AgentRun,
        timer: TimerRef,
        factory: DriverFactory,
    ) -> Self {
        let name = format!("{}Agent[{}]", run.definition.name, id);
        let timer = Arc::new(Timer::from_ref(timer));
        let info = Arc::new(AgentInfo {
            driver_type: run.driver_type,
            agent_id: id,
            host,
            threads: run.threads,
            driver_threads: run.driver_threads,
            first_thread: run.first_thread,
            scale: run.scale,
            schedule: run.schedule.clone(),
            properties: Arc::clone(&run.properties),
        });
        let owns_hooks = run.first_thread == 0;
        let pre_run = owns_hooks && run.definition.pre_run;
        let post_run = owns_hooks && run.definition.post_run;
        let shared = Arc::new(AgentShared {
            info,
            name,
            timer,
            definition: Arc::clone(&run.definition),
            factory,
            layout: Arc::clone(&run.layout),
            master,
            seed: run.seed,
            start_time: AtomicI64::new(i64::MAX),
            thread_start: CountDownLatch::new(run.threads),
            time_set: CountDownLatch::new(1),
            pre_run: pre_run.then(|| CountDownLatch::new(1)),
            start: pre_run.then(|| CountDownLatch::new(1)),
            finish: post_run.then(|| CountDownLatch::new(1)),
            post_run: post_run.then(|| CountDownLatch::new(1)),
            variable_load: !run.variable_load.is_empty(),
            running_threads: AtomicUsize::new(usize::MAX),
            load_switch_time: AtomicI64::new(i64::MAX),
            aborted: AtomicBool::new(false),
        });
        tracing::info!(
            "{}: Configured with {} threads, first thread {}",
            shared.name,
            run.threads,
            run.first_thread
        );
        let agent = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(run.threads)),
            stats: Mutex::new(None),
            variable_load: run.variable_load,
            runtime_stats: run.runtime_stats,
            clock: run.clock,
            earliest_start: AtomicI64::new(0),
        };
        agent.do_pre_run();
        agent
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the coordinator starts all agents at once.
    pub fn parallel_start(&self) -> bool {
        self.shared.info.schedule.parallel_agent_thread_start
    }

    fn between(&self) -> i64 {
        self.shared.info.schedule.ms_between_thread_start as i64 * NANOS_PER_MILLI
    }

    fn spawn(&self, local: usize) -> bool {
        match ThreadHandle::spawn(&self.shared, local) {
            Ok(handle) => {
                self.threads.lock().push(Arc::new(handle));
                true
            }
            Err(e) => {
                tracing::error!("{}: unable to spawn thread {local}: {e}", self.shared.name);
                self.shared.abort_run();
                false
            }
        }
    }

    fn do_pre_run(&self) {
        let Some(latch) = self.shared.pre_run.as_ref() else {
            return;
        };
        if !self.spawn(0) {
            return;
        }
        latch.wait_or_stop(self.shared.aborted());
        let now = self.shared.timer.now();
        self.earliest_start.store(now + self.between(), Ordering::Release);
        tracing::info!("{}: Pre-run completed", self.shared.name);
    }

    /// Synchronizes the clock with the coordinator and starts the threads,
    /// `ms_between_thread_start` apart.
    pub fn start_threads(&self) {
        let shared = &self.shared;
        if let Some(start) = shared.start.as_ref() {
            start.count_down();
            let earliest = self.earliest_start.load(Ordering::Acquire);
            shared.timer.wakeup_at_or_stop(earliest, shared.aborted());
        }

        let master = Arc::clone(&shared.master);
        if let Err(e) = shared.timer.calibrate_clock(&self.clock, || master.current_time_millis()) {
            tracing::error!("{}: Clock synchronization failed. {e}", shared.name);
            shared.abort_run();
            return;
        }

        let first = usize::from(shared.pre_run.is_some());
        let between = self.between();
        let base = shared.timer.now();
        for (count, local) in (first..shared.info.threads).enumerate() {
            if shared.aborted().load(Ordering::Acquire) {
                break;
            }
            let mut wakeup = base + between * count as i64;
            let now = shared.timer.now();
            if wakeup < now {
                wakeup = now + between / 3;
            }
            if count > 0 && !shared.timer.wakeup_at_or_stop(wakeup, shared.aborted()) {
                break;
            }
            if !self.spawn(local) {
                break;
            }
        }
        tracing::info!(
            "{}: Successfully started {} driver threads.",
            shared.name,
            self.threads.lock().len()
        );

        if !self.variable_load.is_empty() {
            let shared = Arc::clone(&self.shared);
            let periods = self.variable_load.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-load", shared.name))
                .spawn(move || control_load(&shared, &periods));
            if let Err(e) = spawned {
                tracing::error!("{}: unable to start variable load controller: {e}", self.shared.name);
            }
        }
    }

    /// Waits until every thread passed its initialization.
    pub fn wait_for_thread_start(&self) {
        self.shared.thread_start.wait_or_stop(self.shared.aborted());
    }

    /// Releases the threads against the start time the coordinator agreed
    /// on, in milliseconds relative to the benchmark epoch.
    pub fn set_start_time(&self, rel_millis: i64) {
        let shared = &self.shared;
        let start = shared.timer.to_abs_nanos(rel_millis);
        shared.start_time.store(start, Ordering::Release);
        shared.time_set.count_down();
        tracing::debug!("{}: Start time set to {rel_millis} ms", shared.name);

        if shared.info.schedule.run_control != RunControl::Time {
            return;
        }
        if let Some(interval) = self.runtime_stats {
            let threads = self.handles().iter().map(|t| Arc::clone(&t.metrics)).collect();
            match StatsCollector::start(shared, threads, interval) {
                Ok(collector) => *self.stats.lock() = Some(collector),
                Err(e) => tracing::error!("{}: unable to start runtime statistics: {e}", shared.name),
            }
        }
        let end_ramp_up = start + shared.info.schedule.ramp_up as i64 * NANOS_PER_SEC;
        let abort = Arc::clone(shared);
        shared.timer.calibrate(&shared.name, end_ramp_up, move |e| {
            tracing::error!("{}: {e}", abort.name);
            abort.abort_run();
        });
    }

    /// Statistics of all threads, merged. `None` without threads.
    pub fn results(&self) -> Option<Metrics> {
        let results: Vec<Metrics> = self.handles().iter().map(|t| t.result()).collect();
        let total = pairwise(results)?;
        tracing::debug!("{}: Collected results of {} threads", self.shared.name, total.thread_count);
        Some(total)
    }

    /// Waits for all threads to end on their own. With a post-run hook,
    /// thread 0 is only waited for up to the point where it finished running.
    pub fn join(&self) {
        let hooked = self.shared.finish.is_some();
        for t in self.handles().iter().rev() {
            if !(hooked && t.id == 0) {
                t.join();
            }
        }
        if let Some(finish) = self.shared.finish.as_ref() {
            finish.wait_or_stop(self.shared.aborted());
        }
        self.cancel_stats();
        tracing::info!("{}: All threads ended", self.shared.name);
    }

    /// Releases the post-run hook of thread 0 and waits for it to finish.
    pub fn post_run(&self) {
        let Some(latch) = self.shared.post_run.as_ref() else {
            return;
        };
        latch.count_down();
        if let Some(t) = self.handles().iter().find(|t| t.id == 0) {
            t.join();
        }
    }

    /// Stops threads that outlived the run. Thread 0 is allowed to finish
    /// its post-run hook.
    pub fn terminate(&self) {
        let hooked = self.shared.finish.is_some();
        let mut forced = 0;
        for t in self.handles() {
            let stop = if hooked && t.id == 0 {
                t.state.get() == RunState::Running
            } else {
                t.is_alive()
            };
            if stop {
                t.stop();
                forced += 1;
            }
        }
        if let Some(finish) = self.shared.finish.as_ref()
            && !finish.wait_timeout(POST_RUN_GRACE)
        {
            tracing::warn!("{}: Thread 0 did not finish in time", self.shared.name);
        }
        if forced > 0 {
            tracing::warn!("{}: Forcefully terminated {forced} threads", self.shared.name);
        }
    }

    /// Stops every thread and the statistics collection right away.
    pub fn kill(&self) {
        self.shared.aborted.store(true, Ordering::Release);
        for t in self.handles() {
            t.stop();
        }
        for latch in [&self.shared.start, &self.shared.post_run, &self.shared.pre_run].into_iter().flatten() {
            latch.count_down();
        }
        if let Some(stats) = self.stats.lock().as_ref() {
            stats.stop();
        }
        tracing::info!("{}: Killed", self.shared.name);
    }

    /// States of the threads, in start order.
    pub fn thread_states(&self) -> Vec<RunState> {
        self.handles().iter().map(|t| t.state.get()).collect()
    }

    fn handles(&self) -> Vec<Arc<ThreadHandle>> {
        self.threads.lock().clone()
    }

    fn cancel_stats(&self) {
        if let Some(stats) = self.stats.lock().take() {
            stats.cancel();
        }
    }
}

/// Switches the number of active threads at every period boundary after
/// ramp up. Periods repeat until the end of the run.
fn control_load(shared: &AgentShared, periods: &[LoadPeriod]) {
    if !shared.time_set.wait_or_stop(shared.aborted()) {
        return;
    }
    let schedule = &shared.info.schedule;
    let end = shared.start_time() + schedule.total() as i64 * NANOS_PER_SEC;
    let mut switch = shared.start_time() + schedule.ramp_up as i64 * NANOS_PER_SEC;
    shared.load_switch_time.store(switch, Ordering::Release);
    'run: loop {
        for period in periods {
            if !shared.timer.wakeup_at_or_stop(switch, shared.aborted()) || switch >= end {
                break 'run;
            }
            shared.running_threads.store(period.threads, Ordering::Release);
            switch += period.duration as i64 * NANOS_PER_SEC;
            shared.load_switch_time.store(switch, Ordering::Release);
            tracing::info!(
                "{}: Active threads: {} next {} seconds.",
                shared.name,
                period.threads,
                period.duration
            );
        }
        if periods.iter().all(|p| p.duration == 0) {
            break;
        }
    }
    shared.running_threads.store(usize::MAX, Ordering::Release);
}
