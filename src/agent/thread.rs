//! One simulated user.
//!
//! Every thread owns its [`Driver`], its [`DriverContext`] and its
//! [`Metrics`]. It moves forward through [`RunState`] and, while running,
//! paces operations against their intended invoke times:
//!
//! 1. every stream (foreground, and background in time controlled runs)
//!    selects its next operation and computes when it should start, from the
//!    previous invoke time for cycle times or the previous respond time for
//!    think times;
//! 2. the stream with the earliest invoke time runs, the foreground wins ties;
//! 3. the transaction is classified as ramp or steady state and recorded,
//!    together with the delay that preceded it.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::AgentShared;
use crate::context::{Driver, DriverContext, TIME_NOT_SET};
use crate::cycle::CycleType;
use crate::definition::{DriverDefinition, TimingMode};
use crate::error::{DriverError, FatalError};
use crate::latch::CountDownLatch;
use crate::metrics::{DelaySample, Metrics};
use crate::mix::Selector;
use crate::run::RunControl;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Longest nap of a thread parked by the variable load controller.
const PARKED_NAP: i64 = 100 * NANOS_PER_MILLI;

/// Life cycle of a thread. States are only ever entered in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    NotStarted,
    Initializing,
    PreRun,
    Running,
    PostRun,
    Ended,
}

/// A [`RunState`] others can wait on.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunState::NotStarted),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> RunState {
        *self.state.lock()
    }

    fn set(&self, state: RunState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    fn compare_and_set(&self, from: RunState, to: RunState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        self.changed.notify_all();
        true
    }

    /// Waits up to `timeout` for `state` or a later one.
    pub fn wait_for(&self, state: RunState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.state.lock();
        while *current < state {
            if self.changed.wait_until(&mut current, deadline).timed_out() {
                return *current >= state;
            }
        }
        true
    }
}

/// The agent's grip on one of its threads.
#[derive(Debug)]
pub(crate) struct ThreadHandle {
    pub id: usize,
    pub name: String,
    pub state: Arc<StateCell>,
    pub metrics: Arc<Mutex<Metrics>>,
    stop: Arc<AtomicBool>,
    ended: Arc<CountDownLatch>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Counts the latch down when the thread exits, panics included.
struct ExitGuard(Arc<CountDownLatch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

impl ThreadHandle {
    /// Spawns the thread with agent local index `local`.
    pub fn spawn(shared: &Arc<AgentShared>, local: usize) -> std::io::Result<Self> {
        let id = shared.info.first_thread + local;
        let name = format!("{}[{}].{}", shared.definition.name, shared.info.agent_id, id);
        let state = Arc::new(StateCell::new());
        let stop = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(Mutex::new(Metrics::new(
            Arc::clone(&shared.layout),
            Some(shared.info.host.clone()),
        )));
        let worker = Worker::new(
            Arc::clone(shared),
            id,
            name.clone(),
            Arc::clone(&state),
            Arc::clone(&stop),
            Arc::clone(&metrics),
        );
        let ended = Arc::new(CountDownLatch::new(1));
        let guard = ExitGuard(Arc::clone(&ended));
        let join = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            worker.run()
        })?;
        Ok(Self {
            id,
            name,
            state,
            metrics,
            stop,
            ended,
            join: Mutex::new(Some(join)),
        })
    }

    /// Asks the thread to stop at its next opportunity.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.ended.count() > 0
    }

    /// Waits for the thread to end. Concurrent and repeated calls all wait.
    pub fn join(&self) {
        self.ended.wait();
        let handle = self.join.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!("{}: thread panicked", self.name);
        }
    }

    /// The statistics of the thread so far.
    pub fn result(&self) -> Metrics {
        let mut metrics = self.metrics.lock();
        metrics.wrap();
        metrics.clone()
    }
}

/// Pacing state of one mix.
#[derive(Debug)]
struct Stream {
    mix_id: usize,
    /// Index of the first operation of this mix in the driver.
    offset: usize,
    selector: Selector,
    previous: Option<usize>,
    next: Option<usize>,
    invoke_time: i64,
    /// The delay the cycle asked for before `next`.
    delay: i64,
    start: i64,
    end: i64,
}

impl Stream {
    fn new(mix_id: usize, offset: usize, selector: Selector, now: i64) -> Self {
        Self {
            mix_id,
            offset,
            selector,
            previous: None,
            next: None,
            invoke_time: TIME_NOT_SET,
            delay: 0,
            start: now,
            end: now,
        }
    }

    fn forget(&mut self) {
        self.previous = None;
        self.next = None;
        self.selector.reset();
    }
}

enum Outcome {
    Done,
    /// Failed before its intended start, nothing happened yet.
    Retry,
}

struct Worker {
    shared: Arc<AgentShared>,
    definition: Arc<DriverDefinition>,
    id: usize,
    name: String,
    state: Arc<StateCell>,
    stop: Arc<AtomicBool>,
    metrics: Arc<Mutex<Metrics>>,
    ctx: DriverContext,
    streams: Vec<Stream>,
    in_ramp: bool,
}

impl Worker {
    fn new(
        shared: Arc<AgentShared>,
        id: usize,
        name: String,
        state: Arc<StateCell>,
        stop: Arc<AtomicBool>,
        metrics: Arc<Mutex<Metrics>>,
    ) -> Self {
        let rng = match shared.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_os_rng(),
        };
        let definition = Arc::clone(&shared.definition);
        let ctx = DriverContext::new(
            Arc::clone(&shared.timer),
            Arc::clone(&definition),
            Arc::clone(&shared.info),
            id,
            rng,
        );
        Self {
            shared,
            definition,
            id,
            name,
            state,
            stop,
            metrics,
            ctx,
            streams: Vec::new(),
            in_ramp: true,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn control(&self) -> RunControl {
        self.shared.info.schedule.run_control
    }

    fn run(mut self) {
        self.state.set(RunState::Initializing);
        let mut driver = match (self.shared.factory)(&self.ctx) {
            Ok(driver) => driver,
            Err(e) => {
                tracing::error!("{}: Error initializing driver object. {e:#}", self.name);
                self.shared.abort_run();
                self.shared.thread_start.count_down();
                self.finish(None);
                return;
            }
        };

        let outcome = self.pre_run(driver.as_mut());
        self.shared.thread_start.count_down();
        if let Err(e) = outcome.and_then(|()| self.drive(driver.as_mut())) {
            tracing::error!("{}: {e}", self.name);
            self.shared.abort_run();
        }
        self.finish(Some(driver.as_mut()));
    }

    fn pre_run(&mut self, driver: &mut dyn Driver) -> Result<(), FatalError> {
        if self.id == 0
            && let Some(latch) = self.shared.pre_run.as_ref()
        {
            self.state.set(RunState::PreRun);
            tracing::debug!("{}: Invoking pre-run hook", self.name);
            let outcome = hook(&self.name, "pre_run", driver.pre_run(&mut self.ctx));
            latch.count_down();
            outcome?;
            if let Some(start) = self.shared.start.as_ref() {
                start.wait_or_stop(&self.stop);
            }
            tracing::trace!("{}: Thread 0 got start latch, now executing.", self.name);
        }
        self.state.set(RunState::Running);
        Ok(())
    }

    /// Runs thread 0's post-run hook once the agent released it, then ends.
    fn finish(&mut self, driver: Option<&mut dyn Driver>) {
        if self.id == 0
            && let Some(finish) = self.shared.finish.as_ref()
        {
            let post_run = self.state.compare_and_set(RunState::Running, RunState::PostRun);
            finish.count_down();
            if post_run && let (Some(driver), Some(latch)) = (driver, self.shared.post_run.as_ref()) {
                tracing::trace!("{}: Thread 0 finished, awaiting post-run latch", self.name);
                if latch.wait_or_stop(&self.stop) {
                    tracing::debug!("{}: Invoking post-run hook", self.name);
                    if let Err(e) = hook(&self.name, "post_run", driver.post_run(&mut self.ctx)) {
                        tracing::error!("{}: {e}", self.name);
                        self.shared.abort_run();
                    }
                    tracing::trace!("{}: Thread 0 finished post-run.", self.name);
                }
            }
        }
        let attachments = std::mem::take(&mut self.ctx.attachments);
        self.metrics.lock().attachments.merge(attachments);
        self.state.set(RunState::Ended);
    }

    fn drive(&mut self, driver: &mut dyn Driver) -> Result<(), FatalError> {
        let schedule = self.shared.info.schedule.clone();
        if schedule.simultaneous_start && !self.wait_start_time()? {
            return Ok(());
        }
        if self.control() == RunControl::Cycles {
            let w = &mut self.ctx.window;
            w.end_ramp_up = schedule.ramp_up as i64;
            w.end_steady = w.end_ramp_up + schedule.steady_state as i64;
            w.end_ramp_down = w.end_steady + schedule.ramp_down as i64;
        }

        let now = self.shared.timer.now();
        self.streams.push(Stream::new(0, 0, self.definition.mix.selector(), now));
        // Background operations only run in time controlled runs.
        if self.control() == RunControl::Time
            && let Some(bg) = self.definition.background.as_ref()
        {
            self.streams.push(Stream::new(1, self.definition.fg_operations(), bg.selector(), now));
        }

        tracing::debug!("{}: Start of run.", self.name);
        let mut chosen: Option<usize> = None;
        while !self.stopped() {
            if self.parked() {
                chosen = None;
                if self.past_ramp_down(self.shared.timer.now()) {
                    break;
                }
                continue;
            }
            self.check_start_time();

            for s in 0..self.streams.len() {
                if chosen.is_none_or(|c| c == s) {
                    self.propose(s);
                }
            }
            let s = self.earliest();
            chosen = Some(s);

            if self.control() == RunControl::Time && self.past_ramp_down(self.streams[s].invoke_time) {
                break;
            }
            if let Outcome::Retry = self.invoke(driver, s)? {
                continue;
            }

            let t = self.ctx.timing;
            {
                let stream = &mut self.streams[s];
                stream.start = t.invoke_time;
                stream.end = t.respond_time;
            }
            let done = match self.control() {
                RunControl::Time => self.past_ramp_down(t.respond_time),
                RunControl::Cycles => self.ctx.window.cycle_count > self.ctx.window.end_ramp_down,
            };
            if done {
                break;
            }
        }
        tracing::debug!("{}: End of run.", self.name);
        Ok(())
    }

    fn past_ramp_down(&self, time: i64) -> bool {
        let w = &self.ctx.window;
        self.control() == RunControl::Time && w.start_time_set && time >= w.end_ramp_down
    }

    /// Waits for the agreed start time. Returns `false` when stopped first.
    fn wait_start_time(&mut self) -> Result<bool, FatalError> {
        if !self.shared.time_set.wait_or_stop(&self.stop) {
            return Ok(false);
        }
        self.begin_window();
        let start = self.shared.start_time();
        let delay = start - self.shared.timer.now();
        if delay <= 0 {
            tracing::error!("{}: Start time is set {} nanosecs too late.", self.name, -delay);
            return Err(FatalError::StartTimeMissed(-delay / NANOS_PER_MILLI));
        }
        Ok(self.shared.timer.wakeup_at_or_stop(start, &self.stop))
    }

    /// Threads started before the agreed start time learn it on the fly.
    fn check_start_time(&mut self) {
        if !self.shared.info.schedule.simultaneous_start
            && !self.ctx.window.start_time_set
            && self.control() == RunControl::Time
            && self.shared.time_set.count() == 0
        {
            self.begin_window();
        }
    }

    fn begin_window(&mut self) {
        let start = self.shared.start_time();
        let schedule = &self.shared.info.schedule;
        let w = &mut self.ctx.window;
        w.start_time_set = true;
        if w.control == RunControl::Time {
            w.end_ramp_up = start + schedule.ramp_up as i64 * NANOS_PER_SEC;
            w.end_steady = w.end_ramp_up + schedule.steady_state as i64 * NANOS_PER_SEC;
            w.end_ramp_down = w.end_steady + schedule.ramp_down as i64 * NANOS_PER_SEC;
        }
        let mut metrics = self.metrics.lock();
        metrics.set_start_nanos(start);
        metrics.start_time = self.shared.timer.to_wall_millis(start);
    }

    /// Sleeps while the variable load controller has this thread parked.
    fn parked(&mut self) -> bool {
        if !self.shared.variable_load || self.id < self.shared.running_threads() {
            return false;
        }
        tracing::debug!(
            "{}: Current load level: ({}) Thread {} sleeping.",
            self.name,
            self.shared.running_threads(),
            self.id
        );
        let now = self.shared.timer.now();
        let wakeup = self.shared.load_switch_time().max(now).min(now + PARKED_NAP);
        self.shared.timer.wakeup_at_or_stop(wakeup, &self.stop);
        self.streams.iter_mut().for_each(Stream::forget);
        true
    }

    /// Selects the next operation of stream `s` and when it should start.
    fn propose(&mut self, s: usize) {
        let definition = &self.definition;
        let stream = &mut self.streams[s];
        stream.previous = stream.next;
        let cycle = match stream.previous {
            Some(op) => &definition.operations[op].cycle,
            None => &definition.initial_delay[stream.mix_id],
        };
        stream.next = Some(stream.offset + stream.selector.select(&mut self.ctx.rng));
        stream.delay = cycle.delay(&mut self.ctx.rng);
        stream.invoke_time = match cycle.cycle_type {
            CycleType::CycleTime => stream.start + stream.delay,
            CycleType::ThinkTime => stream.end + stream.delay,
        };
    }

    /// The stream to run next; the foreground wins ties.
    fn earliest(&self) -> usize {
        let mut best = 0;
        for (s, stream) in self.streams.iter().enumerate().skip(1) {
            if stream.invoke_time < self.streams[best].invoke_time {
                best = s;
            }
        }
        best
    }

    fn invoke(&mut self, driver: &mut dyn Driver, s: usize) -> Result<Outcome, FatalError> {
        let stream = &self.streams[s];
        let Some(op) = stream.next else {
            return Ok(Outcome::Retry);
        };
        self.ctx.timing.reset(stream.invoke_time);
        self.ctx.current_operation = Some(op);

        let definition = Arc::clone(&self.definition);
        let name = definition.operations[op].name.as_str();
        let result = driver.invoke(name, &mut self.ctx);
        if std::mem::take(&mut self.ctx.reset_requested) {
            self.streams[s].selector.reset();
        }

        let outcome = match result {
            Ok(()) => {
                self.validate_time_completion(op)?;
                self.check_ramp();
                let t = self.ctx.timing;
                self.metrics
                    .lock()
                    .record_tx(op, t.invoke_time, t.respond_time, t.pause_time, !self.in_ramp);
                self.record_delay(s);
                Outcome::Done
            }
            Err(DriverError::Fatal(e)) => {
                tracing::error!("{}.{name}: {e:#}", self.name);
                return Err(FatalError::Driver(e));
            }
            Err(err) => self.operation_failed(s, op, &err),
        };
        self.ctx.current_operation = None;
        Ok(outcome)
    }

    fn validate_time_completion(&mut self, op: usize) -> Result<(), FatalError> {
        let spec = &self.definition.operations[op];
        let t = &mut self.ctx.timing;
        if t.invoke_time == TIME_NOT_SET {
            let operation = spec.name.clone();
            return Err(match spec.timing {
                TimingMode::Auto => FatalError::TransportNotCalled { operation },
                TimingMode::Manual => FatalError::RecordTimeNotCalled { operation },
            });
        }
        if t.respond_time == TIME_NOT_SET {
            if t.last_respond_time == TIME_NOT_SET {
                return Err(FatalError::ResponseNotRecorded {
                    operation: spec.name.clone(),
                });
            }
            t.respond_time = t.last_respond_time;
            tracing::debug!("Potential open request in operation {}.", spec.name);
        }
        Ok(())
    }

    /// Counts a failed operation and salvages what timing it left behind.
    fn operation_failed(&mut self, s: usize, op: usize, err: &DriverError) -> Outcome {
        let timer = Arc::clone(&self.shared.timer);
        {
            let t = &mut self.ctx.timing;
            if t.respond_time == TIME_NOT_SET && t.last_respond_time != TIME_NOT_SET {
                tracing::debug!(
                    "Potential open request in operation {}.",
                    self.definition.operations[op].name
                );
                t.respond_time = t.last_respond_time;
            }
        }

        match self.control() {
            RunControl::Time => {
                let t = &mut self.ctx.timing;
                let mut record_delay = true;
                if t.invoke_time == TIME_NOT_SET {
                    if timer.now() < t.intended_invoke_time {
                        self.record_error(op, None);
                        self.log_error(op, err);
                        return Outcome::Retry;
                    }
                    t.invoke_time = timer.now();
                    t.respond_time = t.invoke_time;
                    record_delay = false;
                } else if t.respond_time == TIME_NOT_SET {
                    t.respond_time = timer.now();
                }
                self.check_ramp();
                self.record_error(op, Some(self.ctx.timing.respond_time));
                self.log_error(op, err);
                if record_delay {
                    self.record_delay(s);
                }
            }
            RunControl::Cycles => {
                self.check_ramp();
                let respond = self.ctx.timing.respond_time;
                self.record_error(op, (respond != TIME_NOT_SET).then_some(respond));
                self.log_error(op, err);
                let stream = &self.streams[s];
                let t = &mut self.ctx.timing;
                if t.invoke_time == TIME_NOT_SET {
                    if timer.now() < t.intended_invoke_time {
                        t.invoke_time = stream.start;
                        t.respond_time = stream.end;
                    } else {
                        t.invoke_time = timer.now();
                        t.respond_time = t.invoke_time;
                    }
                } else {
                    if t.respond_time == TIME_NOT_SET {
                        t.respond_time = t.invoke_time;
                    }
                    self.record_delay(s);
                }
            }
        }
        Outcome::Done
    }

    fn record_error(&mut self, op: usize, respond: Option<i64>) {
        self.metrics.lock().record_error(op, respond, !self.in_ramp);
    }

    fn log_error(&self, op: usize, err: &DriverError) {
        let cause = match err {
            DriverError::Failed(e) | DriverError::Expected(e) | DriverError::Fatal(e) => e,
        };
        let mut message = format!("{}.{}: {cause:#}", self.name, self.definition.operations[op].name);
        if self.in_ramp {
            message.push_str(
                "\nNote: Error not counted in result.\nEither transaction start or end time is not within steady state.",
            );
        }
        match err {
            DriverError::Expected(_) => tracing::debug!("{message}"),
            _ => tracing::warn!("{message}"),
        }
    }

    /// Classifies the transaction in flight as ramp or steady state.
    fn check_ramp(&mut self) {
        let t = self.ctx.timing;
        match self.control() {
            RunControl::Time => {
                self.in_ramp = !self.ctx.window.is_steady(t.invoke_time, t.respond_time);
            }
            RunControl::Cycles => {
                if !self.shared.info.schedule.simultaneous_start
                    && !self.ctx.window.start_time_set
                    && self.shared.time_set.count() == 0
                {
                    let start = self.shared.start_time();
                    if t.invoke_time != TIME_NOT_SET && t.invoke_time >= start {
                        // This transaction started after the run start and counts.
                        self.begin_window();
                        self.ctx.window.cycle_count += 1;
                        self.in_ramp = true;
                    } else if t.invoke_time == TIME_NOT_SET && self.shared.timer.now() >= start {
                        self.begin_window();
                        self.in_ramp = true;
                    }
                } else if self.ctx.window.start_time_set {
                    let w = &mut self.ctx.window;
                    w.cycle_count += 1;
                    self.in_ramp = !(w.cycle_count > w.end_ramp_up && w.cycle_count <= w.end_steady);
                }
            }
        }
    }

    /// Records the delay that preceded the transaction in flight. The first
    /// operation of a stream has no predecessor and records nothing.
    fn record_delay(&mut self, s: usize) {
        let stream = &self.streams[s];
        let Some(previous) = stream.previous else {
            return;
        };
        let t = self.ctx.timing;
        let w = &self.ctx.window;
        let cycle_time = w
            .is_steady(stream.start, t.invoke_time)
            .then(|| t.invoke_time - stream.start);
        let delay_time = match self.definition.operations[previous].cycle.cycle_type {
            CycleType::CycleTime => cycle_time,
            CycleType::ThinkTime if stream.end >= 0 => w
                .is_steady(stream.end, t.invoke_time)
                .then(|| t.invoke_time - stream.end),
            CycleType::ThinkTime => cycle_time,
        };
        self.metrics.lock().record_delay(&DelaySample {
            operation: previous,
            foreground: stream.mix_id == 0,
            cycle_time,
            delay_time,
            targeted: stream.delay,
        });
    }
}

/// Maps the outcome of a pre or post-run hook. Only fatal errors matter.
fn hook(thread: &str, name: &str, result: Result<(), DriverError>) -> Result<(), FatalError> {
    match result {
        Ok(()) => Ok(()),
        Err(DriverError::Fatal(e)) => Err(FatalError::Driver(e)),
        Err(e) => {
            tracing::warn!("{thread}.{name}: {e}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::agent::tests::{TestMaster, agent_run, schedule};
    use crate::context::tests::definition;
    use crate::cycle::CycleSpec;
    use crate::definition::{BackgroundSpec, DriverSpec, OperationDecl};
    use crate::mix::MixSpec;
    use crate::run::{LoadPeriod, RunSchedule};

    /// Logs every call it gets.
    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        skip_transport: bool,
        fail: bool,
    }

    impl Driver for Recorder {
        fn invoke(&mut self, operation: &str, ctx: &mut DriverContext) -> Result<(), DriverError> {
            self.log.lock().push(operation.to_string());
            if self.fail {
                return Err(DriverError::failed(anyhow::anyhow!("{operation} refused")));
            }
            if !self.skip_transport {
                ctx.transport(|| std::thread::sleep(Duration::from_millis(1)));
            }
            Ok(())
        }

        fn pre_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
            self.log.lock().push("pre_run".into());
            Ok(())
        }

        fn post_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
            self.log.lock().push("post_run".into());
            Ok(())
        }
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, skip_transport: bool) -> crate::context::DriverFactory {
        let log = Arc::clone(log);
        Arc::new(move |_: &DriverContext| {
            Ok(Box::new(Recorder {
                log: Arc::clone(&log),
                skip_transport,
                fail: false,
            }) as Box<dyn Driver>)
        })
    }

    fn think(ms: i64) -> CycleSpec {
        CycleSpec::fixed(CycleType::ThinkTime, ms)
    }

    fn configure(
        master: &Arc<TestMaster>,
        definition: Arc<DriverDefinition>,
        threads: usize,
        schedule: RunSchedule,
        factory: crate::context::DriverFactory,
    ) -> Agent {
        Agent::configure(
            0,
            "localhost".into(),
            master.clone(),
            agent_run(definition, threads, schedule),
            master.timer.to_ref(),
            factory,
        )
    }

    fn execute(agent: &Agent, master: &TestMaster) {
        agent.start_threads();
        agent.wait_for_thread_start();
        agent.set_start_time(master.timer.time_millis() + 100);
        agent.join();
    }

    /// A worker that is never spawned, for stepping through by hand.
    fn worker(definition: Arc<DriverDefinition>) -> (Agent, Worker) {
        let master = Arc::new(TestMaster::default());
        let agent = configure(&master, definition, 1, schedule(), recording(&Arc::default(), false));
        let metrics = Metrics::new(Arc::clone(&agent.shared.layout), None);
        let w = Worker::new(
            Arc::clone(&agent.shared),
            0,
            "store[0].0".into(),
            Arc::new(StateCell::new()),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Mutex::new(metrics)),
        );
        (agent, w)
    }

    fn count(log: &[String], name: &str) -> usize {
        log.iter().filter(|l| *l == name).count()
    }

    #[test]
    fn foreground_wins_ties() {
        let (_agent, mut w) = worker(definition());
        let now = w.shared.timer.now();
        w.streams.push(Stream::new(0, 0, w.definition.mix.selector(), now));
        w.streams.push(Stream::new(1, 0, w.definition.mix.selector(), now));
        w.streams[0].invoke_time = now + 10;
        w.streams[1].invoke_time = now + 10;
        assert_eq!(w.earliest(), 0);
        w.streams[1].invoke_time = now + 9;
        assert_eq!(w.earliest(), 1);
    }

    #[test]
    fn cycle_time_paces_from_invoke_and_think_time_from_respond() {
        let spec = DriverSpec {
            name: "feed".into(),
            operations: vec![
                OperationDecl::new("poll", CycleSpec::fixed(CycleType::CycleTime, 50), &[1.0]),
                OperationDecl::new("read", think(20), &[1.0]),
            ],
            mix: MixSpec::fixed_sequence(&["poll", "read"]),
            ..Default::default()
        };
        let (_agent, mut w) = worker(Arc::new(DriverDefinition::from_spec(&spec).unwrap()));
        w.streams.push(Stream::new(0, 0, w.definition.mix.selector(), 1_000));

        w.propose(0);
        assert_eq!(w.streams[0].next, Some(0));
        assert_eq!(w.streams[0].invoke_time, 1_000);

        w.streams[0].start = 2_000;
        w.streams[0].end = 7_000;
        w.propose(0);
        assert_eq!((w.streams[0].previous, w.streams[0].next), (Some(0), Some(1)));
        assert_eq!(w.streams[0].invoke_time, 2_000 + 50 * NANOS_PER_MILLI);

        w.propose(0);
        assert_eq!(w.streams[0].previous, Some(1));
        assert_eq!(w.streams[0].invoke_time, 7_000 + 20 * NANOS_PER_MILLI);
    }

    #[test]
    fn missing_transport_is_fatal() {
        let (_agent, mut w) = worker(definition());
        let now = w.shared.timer.now();
        w.streams.push(Stream::new(0, 0, w.definition.mix.selector(), now));
        w.streams[0].invoke_time = now;

        let mut silent = Recorder {
            skip_transport: true,
            ..Default::default()
        };
        w.streams[0].next = Some(0);
        assert!(matches!(
            w.invoke(&mut silent, 0),
            Err(FatalError::TransportNotCalled { operation }) if operation == "browse"
        ));
        w.streams[0].next = Some(1);
        assert!(matches!(
            w.invoke(&mut silent, 0),
            Err(FatalError::RecordTimeNotCalled { operation }) if operation == "checkout"
        ));
    }

    #[test]
    fn early_failure_is_retried() {
        let (_agent, mut w) = worker(definition());
        let now = w.shared.timer.now();
        w.streams.push(Stream::new(0, 0, w.definition.mix.selector(), now));
        w.streams[0].next = Some(0);
        let mut failing = Recorder {
            fail: true,
            ..Default::default()
        };

        w.streams[0].invoke_time = now + 10 * NANOS_PER_SEC;
        assert!(matches!(w.invoke(&mut failing, 0), Ok(Outcome::Retry)));

        w.streams[0].invoke_time = now - NANOS_PER_MILLI;
        assert!(matches!(w.invoke(&mut failing, 0), Ok(Outcome::Done)));
        assert!(w.ctx.timing.invoke_time >= now);

        let metrics = w.metrics.lock();
        assert_eq!(metrics.operations[0].err_total, 2);
        assert_eq!(metrics.tx_steady(), 0);
    }

    #[test]
    fn driver_without_transport_aborts_the_run() {
        let master = Arc::new(TestMaster::default());
        let log = Arc::default();
        let agent = configure(&master, definition(), 2, schedule(), recording(&log, true));
        execute(&agent, &master);
        assert!(master.aborted.load(Ordering::Acquire));
        assert!(agent.thread_states().iter().all(|s| *s == RunState::Ended));
        assert_eq!(agent.results().map(|m| m.tx_steady()), Some(0));
    }

    #[test]
    fn background_stream_interleaves_with_foreground() {
        let spec = DriverSpec {
            name: "feed".into(),
            operations: vec![OperationDecl::new("browse", think(10), &[1.0])],
            background: Some(BackgroundSpec {
                operations: vec![OperationDecl::new("poll", CycleSpec::fixed(CycleType::CycleTime, 50), &[1.0])],
                mix: MixSpec::default(),
                initial_delay: Some(think(0)),
            }),
            ..Default::default()
        };
        let master = Arc::new(TestMaster::default());
        let log = Arc::default();
        let agent = configure(
            &master,
            Arc::new(DriverDefinition::from_spec(&spec).unwrap()),
            1,
            schedule(),
            recording(&log, false),
        );
        execute(&agent, &master);

        let log = log.lock();
        let (browse, poll) = (count(&log, "browse"), count(&log, "poll"));
        assert!(poll >= 5, "poll ran {poll} times");
        assert!(browse > poll, "browse ran {browse} times, poll {poll}");
        let first_poll = log.iter().position(|l| l == "poll").unwrap();
        assert!(log[first_poll..].iter().any(|l| l == "browse"));

        let results = agent.results().unwrap();
        assert!(results.operations[0].tx_steady > 0);
        assert!(results.operations[1].tx_steady > 0);
    }

    #[test]
    fn hooks_run_around_the_paced_operations() {
        let spec = DriverSpec {
            name: "store".into(),
            operations: vec![OperationDecl::new("browse", think(5), &[1.0])],
            pre_run: true,
            post_run: true,
            ..Default::default()
        };
        let master = Arc::new(TestMaster::default());
        let log = Arc::default();
        let agent = configure(
            &master,
            Arc::new(DriverDefinition::from_spec(&spec).unwrap()),
            2,
            schedule(),
            recording(&log, false),
        );
        assert_eq!(log.lock().as_slice(), ["pre_run"]);
        execute(&agent, &master);
        assert!(!log.lock().iter().any(|l| l == "post_run"));
        agent.post_run();

        let log = log.lock();
        assert_eq!(log.first().map(String::as_str), Some("pre_run"));
        assert_eq!(log.last().map(String::as_str), Some("post_run"));
        assert_eq!(count(&log, "pre_run"), 1);
        assert_eq!(count(&log, "post_run"), 1);
        assert!(count(&log, "browse") > 0);
        assert!(agent.thread_states().iter().all(|s| *s == RunState::Ended));
    }

    #[test]
    fn parked_threads_stay_idle() {
        let master = Arc::new(TestMaster::default());
        let mut run = agent_run(definition(), 2, schedule());
        run.variable_load = vec![LoadPeriod {
            duration: 10,
            threads: 1,
        }];
        let agent = Agent::configure(
            0,
            "localhost".into(),
            master.clone(),
            run,
            master.timer.to_ref(),
            recording(&Arc::default(), false),
        );
        execute(&agent, &master);

        let handles = agent.handles();
        let active = handles[0].result().tx_steady();
        let parked = handles[1].result().tx_steady();
        assert_eq!(handles[1].id, 1);
        assert!(active > 0);
        assert!(parked * 10 < active, "parked thread ran {parked} transactions");
    }

    #[test]
    fn every_joiner_waits_for_the_thread() {
        let master = Arc::new(TestMaster::default());
        let agent = configure(&master, definition(), 1, schedule(), recording(&Arc::default(), false));
        agent.start_threads();
        agent.wait_for_thread_start();
        agent.set_start_time(master.timer.time_millis() + 100);

        let handle = Arc::clone(&agent.handles()[0]);
        assert!(handle.is_alive());
        std::thread::scope(|s| {
            s.spawn(|| handle.join());
            std::thread::sleep(Duration::from_millis(50));
            handle.join();
            assert_eq!(handle.state.get(), RunState::Ended);
            assert!(!handle.is_alive());
        });
    }

    #[test]
    fn state_waits_accept_later_states() {
        let cell = Arc::new(StateCell::new());
        assert!(!cell.wait_for(RunState::Running, Duration::from_millis(10)));
        let setter = Arc::clone(&cell);
        let t = std::thread::spawn(move || setter.set(RunState::PostRun));
        assert!(cell.wait_for(RunState::Running, Duration::from_secs(5)));
        t.join().unwrap();
        assert!(!cell.compare_and_set(RunState::Running, RunState::Ended));
        assert!(cell.compare_and_set(RunState::PostRun, RunState::Ended));
    }
}
