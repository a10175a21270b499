//! Control plane between the coordinator and its agents.
//!
//! The coordinator drives agents through [`AgentHandle`], agents call back
//! through [`MasterHandle`]. Both are transport agnostic: [`LocalAgent`] runs
//! an agent in-process, a remote transport only needs to forward the same
//! calls.
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::context::DriverFactory;
use crate::definition::DriverDefinition;
use crate::error::CommunicationError;
use crate::metrics::{Metrics, MetricsLayout, RuntimeMetrics};
use crate::run::{LoadPeriod, RunSchedule};
use crate::timer::{ClockCalibration, TimerRef};

/// Phases of a run as seen by the coordinator, in the order they are
/// entered. [`MasterState::Aborted`] can follow any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterState {
    Configuring,
    Starting,
    RampUp,
    SteadyState,
    RampDown,
    Results,
    Aborted,
}

impl std::fmt::Display for MasterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MasterState::Configuring => "CONFIGURING",
            MasterState::Starting => "STARTING",
            MasterState::RampUp => "RAMPUP",
            MasterState::SteadyState => "STEADYSTATE",
            MasterState::RampDown => "RAMPDOWN",
            MasterState::Results => "RESULTS",
            MasterState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// The coordinator state behind a monitor.
#[derive(Debug)]
pub struct StateMonitor {
    state: Mutex<MasterState>,
    changed: Condvar,
}

impl Default for StateMonitor {
    fn default() -> Self {
        Self {
            state: Mutex::new(MasterState::Configuring),
            changed: Condvar::new(),
        }
    }
}

impl StateMonitor {
    pub fn get(&self) -> MasterState {
        *self.state.lock()
    }

    pub fn set(&self, state: MasterState) {
        let mut current = self.state.lock();
        // Nothing leaves ABORTED.
        if *current == MasterState::Aborted {
            return;
        }
        tracing::debug!("Master state {} -> {}", *current, state);
        *current = state;
        self.changed.notify_all();
    }

    /// Blocks until `state` or any later state is reached.
    pub fn wait_for(&self, state: MasterState) {
        let mut current = self.state.lock();
        while *current < state {
            self.changed.wait(&mut current);
        }
    }

    /// Like [`StateMonitor::wait_for`] but gives up after `timeout`.
    /// Returns whether the state was reached.
    pub fn wait_for_timeout(&self, state: MasterState, timeout: Duration) -> bool {
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

/// What an agent may ask of the coordinator. Called from agent threads, so
/// every call is synchronous and cheap.
pub trait MasterHandle: Send + Sync + Debug {
    /// Milliseconds since the benchmark epoch on the coordinator's clock.
    fn current_time_millis(&self) -> Result<i64, CommunicationError>;

    /// Requests an abort of the whole run. Idempotent.
    fn abort_run(&self);

    /// Delivers an in-flight statistics snapshot.
    fn update_metrics(&self, metrics: RuntimeMetrics);

    fn current_state(&self) -> MasterState;

    fn wait_for_state(&self, state: MasterState);
}

/// Everything an agent needs to run its share of a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub driver_type: usize,
    pub agent_id: usize,
    /// Threads this agent runs.
    pub threads: usize,
    /// Global id of the first thread of this agent.
    pub first_thread: usize,
    /// Threads of the driver across all agents.
    pub driver_threads: usize,
    pub scale: u32,
    pub schedule: RunSchedule,
    pub definition: Arc<DriverDefinition>,
    pub layout: Arc<MetricsLayout>,
    pub properties: Arc<BTreeMap<String, String>>,
    pub variable_load: Vec<LoadPeriod>,
    /// Snapshot interval, `None` when runtime statistics are off.
    pub runtime_stats: Option<Duration>,
    pub clock: ClockCalibration,
    /// Seeds the thread random sources, for reproducible runs.
    pub seed: Option<u64>,
}

/// What the coordinator may ask of an agent.
///
/// Every call may fail with a [`CommunicationError`] when the agent cannot
/// be reached; the coordinator logs such failures and carries on with the
/// remaining agents.
#[async_trait]
pub trait AgentHandle: Send + Sync + Debug {
    fn id(&self) -> usize;

    fn host(&self) -> &str;

    /// Name of the driver this agent runs.
    fn driver(&self) -> &str;

    /// Prepares a run. Runs the pre-run hook when this agent hosts the
    /// first thread of the driver.
    async fn configure(
        &self,
        master: Arc<dyn MasterHandle>,
        run: AgentRun,
        timer: TimerRef,
    ) -> Result<(), CommunicationError>;

    /// Calibrates the clock and spawns the threads. Returns once all threads
    /// are spawned, or right away if the threads of all agents start in
    /// parallel.
    async fn start_threads(&self) -> Result<(), CommunicationError>;

    /// Blocks until every thread of this agent has initialized.
    async fn wait_for_thread_start(&self) -> Result<(), CommunicationError>;

    /// Broadcasts the agreed start, in milliseconds since the epoch.
    async fn set_start_time(&self, rel_millis: i64) -> Result<(), CommunicationError>;

    /// Merged statistics of all threads, `None` if no thread ran.
    async fn results(&self) -> Result<Option<Metrics>, CommunicationError>;

    /// Waits for every thread but a thread 0 with a pending post-run hook.
    async fn join(&self) -> Result<(), CommunicationError>;

    /// Lets thread 0 run its post-run hook and waits for it.
    async fn post_run(&self) -> Result<(), CommunicationError>;

    /// Stops every thread.
    async fn kill(&self) -> Result<(), CommunicationError>;

    /// Stops threads that are still running after the run should have ended.
    async fn terminate(&self) -> Result<(), CommunicationError>;

    /// Liveness check.
    async fn heartbeat(&self) -> Result<(), CommunicationError>;
}

/// An agent living in the coordinator's process. Blocking agent work runs on
/// the tokio blocking pool.
pub struct LocalAgent {
    id: usize,
    host: String,
    driver: String,
    factory: DriverFactory,
    agent: Mutex<Option<Arc<Agent>>>,
}

impl Debug for LocalAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAgent")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl LocalAgent {
    pub fn new(id: usize, host: impl Into<String>, driver: impl Into<String>, factory: DriverFactory) -> Self {
        Self {
            id,
            host: host.into(),
            driver: driver.into(),
            factory,
            agent: Mutex::new(None),
        }
    }

    fn label(&self) -> String {
        format!("{}Agent[{}]", self.driver, self.id)
    }

    fn agent(&self) -> Result<Arc<Agent>, CommunicationError> {
        self.agent
            .lock()
            .clone()
            .ok_or_else(|| CommunicationError::Unreachable(self.label(), "agent is not configured".into()))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CommunicationError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Agent>) -> T + Send + 'static,
    {
        let agent = self.agent()?;
        tokio::task::spawn_blocking(move || f(agent))
            .await
            .map_err(|e| CommunicationError::Unreachable(self.label(), e.to_string()))
    }
}

#[async_trait]
impl AgentHandle for LocalAgent {
    fn id(&self) -> usize {
        self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn driver(&self) -> &str {
        &self.driver
    }

    async fn configure(
        &self,
        master: Arc<dyn MasterHandle>,
        run: AgentRun,
        timer: TimerRef,
    ) -> Result<(), CommunicationError> {
        let (id, host, factory) = (self.id, self.host.clone(), Arc::clone(&self.factory));
        let agent = tokio::task::spawn_blocking(move || Agent::configure(id, host, master, run, timer, factory))
            .await
            .map_err(|e| CommunicationError::Unreachable(self.label(), e.to_string()))?;
        *self.agent.lock() = Some(Arc::new(agent));
        Ok(())
    }

    async fn start_threads(&self) -> Result<(), CommunicationError> {
        let agent = self.agent()?;
        if agent.parallel_start() {
            tokio::task::spawn_blocking(move || agent.start_threads());
            return Ok(());
        }
        self.blocking(|a| a.start_threads()).await
    }

    async fn wait_for_thread_start(&self) -> Result<(), CommunicationError> {
        self.blocking(|a| a.wait_for_thread_start()).await
    }

    async fn set_start_time(&self, rel_millis: i64) -> Result<(), CommunicationError> {
        self.agent()?.set_start_time(rel_millis);
        Ok(())
    }

    async fn results(&self) -> Result<Option<Metrics>, CommunicationError> {
        self.blocking(|a| a.results()).await
    }

    async fn join(&self) -> Result<(), CommunicationError> {
        self.blocking(|a| a.join()).await
    }

    async fn post_run(&self) -> Result<(), CommunicationError> {
        self.blocking(|a| a.post_run()).await
    }

    async fn kill(&self) -> Result<(), CommunicationError> {
        self.agent()?.kill();
        Ok(())
    }

    async fn terminate(&self) -> Result<(), CommunicationError> {
        self.blocking(|a| a.terminate()).await
    }

    async fn heartbeat(&self) -> Result<(), CommunicationError> {
        self.agent().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod monitor {
        use super::*;

        #[test]
        fn states_are_ordered() {
            assert!(MasterState::Configuring < MasterState::Starting);
            assert!(MasterState::RampDown < MasterState::Results);
            assert!(MasterState::Results < MasterState::Aborted);
        }

        #[test]
        fn wait_returns_when_already_past() {
            let m = StateMonitor::default();
            m.set(MasterState::RampDown);
            m.wait_for(MasterState::RampUp);
            assert!(m.wait_for_timeout(MasterState::SteadyState, Duration::ZERO));
        }

        #[test]
        fn wait_blocks_until_reached() {
            let m = Arc::new(StateMonitor::default());
            let waiter = {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    m.wait_for(MasterState::SteadyState);
                    m.get()
                })
            };
            std::thread::sleep(Duration::from_millis(20));
            m.set(MasterState::RampUp);
            std::thread::sleep(Duration::from_millis(20));
            assert!(!waiter.is_finished());
            m.set(MasterState::SteadyState);
            assert_eq!(waiter.join().unwrap(), MasterState::SteadyState);
        }

        #[test]
        fn times_out() {
            let m = StateMonitor::default();
            assert!(!m.wait_for_timeout(MasterState::Results, Duration::from_millis(10)));
        }

        #[test]
        fn aborted_is_final_and_releases_waiters() {
            let m = StateMonitor::default();
            m.set(MasterState::Aborted);
            m.set(MasterState::Results);
            assert_eq!(m.get(), MasterState::Aborted);
            m.wait_for(MasterState::Results);
        }
    }

    #[tokio::test]
    async fn unconfigured_local_agent_is_unreachable() {
        let factory: DriverFactory = Arc::new(|_| anyhow::bail!("unused"));
        let agent = LocalAgent::new(3, "localhost", "web", factory);
        assert_eq!(agent.id(), 3);
        assert!(matches!(
            agent.heartbeat().await,
            Err(CommunicationError::Unreachable(name, _)) if name == "webAgent[3]"
        ));
    }
}
