//! The coordinator of a run.
//!
//! A [`Master`] splits the threads of every driver across the agents that
//! registered for it, configures them, agrees on one start instant, sleeps
//! through the phases of the run and finally merges the statistics of all
//! agents, per host and in total.
//!
//! # Abort
//!
//! Any agent thread, the heartbeat or the coordinator itself may abort the
//! run. Every wait of the coordinator races against the abort signal; once
//! it fires, all agents are killed, joined and given the chance to run their
//! post-run hooks before [`Master::run`] returns [`RunError::Aborted`].
mod partition;
mod stats;

pub use partition::{Share, partition};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use typed_builder::TypedBuilder;

use crate::control::{AgentHandle, AgentRun, MasterHandle, MasterState, StateMonitor};
use crate::definition::{BenchmarkDefinition, DriverDefinition};
use crate::error::{CommunicationError, ConfigurationError, RunError};
use crate::metrics::{Metrics, MetricsLayout, RuntimeMetrics, pairwise};
use crate::run::{ResolvedDriver, RunConfig, RunControl, RunSchedule};
use crate::timer::{ClockCalibration, Timer};

/// The coordinator's side of the control plane, as seen by agents.
#[derive(Debug)]
struct MasterLink {
    timer: Arc<Timer>,
    monitor: Arc<StateMonitor>,
    abort: watch::Sender<bool>,
    stats: mpsc::UnboundedSender<RuntimeMetrics>,
}

impl MasterHandle for MasterLink {
    fn current_time_millis(&self) -> Result<i64, CommunicationError> {
        Ok(self.timer.time_millis())
    }

    fn abort_run(&self) {
        if !self.abort.send_replace(true) {
            tracing::error!("Run abort requested");
            self.monitor.set(MasterState::Aborted);
        }
    }

    fn update_metrics(&self, metrics: RuntimeMetrics) {
        if self.stats.send(metrics).is_err() {
            tracing::trace!("Runtime stats dropped, no writer");
        }
    }

    fn current_state(&self) -> MasterState {
        self.monitor.get()
    }

    fn wait_for_state(&self, state: MasterState) {
        self.monitor.wait_for(state);
    }
}

/// An agent and its share of a driver's threads.
#[derive(Debug)]
struct Assignment {
    agent: Arc<dyn AgentHandle>,
    share: Share,
}

impl Assignment {
    fn label(&self) -> String {
        format!("{}Agent[{}]", self.agent.driver(), self.agent.id())
    }

    fn is_first(&self) -> bool {
        self.share.first_thread == 0
    }
}

#[derive(Debug)]
struct DriverPlan {
    driver: ResolvedDriver,
    definition: Arc<DriverDefinition>,
    layout: Arc<MetricsLayout>,
    assignments: Vec<Assignment>,
}

/// Merged statistics of one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverResults {
    pub definition: Arc<DriverDefinition>,
    pub layout: Arc<MetricsLayout>,
    pub threads: usize,
    pub agents: usize,
    pub total: Metrics,
    /// One entry per host, ordered by host name.
    pub hosts: Vec<Metrics>,
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub benchmark: String,
    pub schedule: RunSchedule,
    pub scale: u32,
    /// Wall-clock milliseconds of the agreed start.
    pub start_time: i64,
    pub drivers: Vec<DriverResults>,
}

/// Coordinates one run across a set of agents.
#[derive(Debug, TypedBuilder)]
pub struct Master {
    benchmark: Arc<BenchmarkDefinition>,
    config: RunConfig,
    agents: Vec<Arc<dyn AgentHandle>>,
    #[builder(default)]
    clock: ClockCalibration,
    /// Seeds the random sources of all threads, for reproducible runs.
    #[builder(default)]
    seed: Option<u64>,
    /// How long to wait for threads past the end of ramp down before they
    /// are terminated.
    #[builder(default = Duration::from_secs(120))]
    join_grace: Duration,
    /// Lower bound of the slack between broadcasting and reaching the start
    /// time.
    #[builder(default = Duration::from_secs(3))]
    min_start_delay: Duration,
    #[builder(default = Duration::from_secs(5))]
    heartbeat: Duration,
    #[builder(default)]
    monitor: Arc<StateMonitor>,
}

impl Master {
    /// Observers may wait on this for the run to reach a state.
    pub fn monitor(&self) -> Arc<StateMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Runs the benchmark to completion or abort.
    pub async fn run(&self) -> Result<RunResults, RunError> {
        let plans = self.plan()?;
        let timer = Arc::new(Timer::new());
        let (abort, abort_rx) = watch::channel(false);
        let (stats, stats_rx) = mpsc::unbounded_channel();
        let (done, done_rx) = watch::channel(false);
        let link = Arc::new(MasterLink {
            timer,
            monitor: Arc::clone(&self.monitor),
            abort,
            stats,
        });

        let writer = self.config.runtime_stats.enabled.then(|| {
            let drivers = plans
                .iter()
                .map(|p| stats::DriverStats {
                    driver_type: p.driver.index,
                    name: p.definition.name.clone(),
                    agents: p.assignments.len(),
                    precision: p.definition.response_time_unit.nanos(),
                })
                .collect();
            tokio::spawn(stats::write(drivers, self.config.schedule.clone(), stats_rx, done_rx.clone()))
        });

        let outcome = self.execute(&plans, &link, abort_rx, done_rx).await;
        done.send_replace(true);
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            tracing::error!("Runtime stats writer failed: {e}");
        }

        match outcome {
            Ok(results) => Ok(results),
            Err(e) => {
                link.abort_run();
                self.shutdown(&plans).await;
                if let RunError::Aborted = e {
                    tracing::error!("Run aborted");
                } else {
                    tracing::error!("Run failed: {e}");
                }
                Err(e)
            }
        }
    }

    /// Matches agents to drivers and splits the threads among them.
    fn plan(&self) -> Result<Vec<DriverPlan>, RunError> {
        let resolved = self.config.resolve(&self.benchmark)?;
        let mut plans = Vec::with_capacity(resolved.len());
        for driver in resolved {
            let name = driver.definition.name.clone();
            let mut agents: Vec<_> = self.agents.iter().filter(|a| a.driver() == name).cloned().collect();
            agents.sort_by_key(|a| a.id());
            let registered = agents.len();
            agents.dedup_by_key(|a| a.id());
            if agents.len() != registered {
                tracing::warn!("Duplicate agent ids registered for driver {name}, using the first of each");
            }
            if let Some(expected) = driver.agents
                && expected != agents.len()
            {
                tracing::warn!(
                    "Driver {name} is configured for {expected} agents but {} registered",
                    agents.len()
                );
            }
            if agents.is_empty() {
                tracing::warn!("No agents registered for driver {name}, skipping it");
                continue;
            }

            let shares = partition(driver.threads, agents.len());
            if shares.len() < agents.len() {
                tracing::info!(
                    "Driver {name} runs {} threads on {} of {} agents",
                    driver.threads,
                    shares.len(),
                    agents.len()
                );
            }
            let definition = Arc::new(driver.definition.clone());
            let layout = Arc::new(MetricsLayout::new(
                driver.index,
                &definition,
                &self.config.schedule,
                driver.graph_interval,
                self.config.max_run_time,
            ));
            let assignments = agents
                .into_iter()
                .zip(shares)
                .map(|(agent, share)| Assignment { agent, share })
                .collect();
            plans.push(DriverPlan {
                driver,
                definition,
                layout,
                assignments,
            });
        }
        if plans.is_empty() {
            return Err(ConfigurationError::NoDriver.into());
        }
        Ok(plans)
    }

    fn agent_run(&self, plan: &DriverPlan, a: &Assignment) -> AgentRun {
        let runtime_stats = self.config.runtime_stats.enabled.then(|| self.config.runtime_stats_interval());
        AgentRun {
            driver_type: plan.driver.index,
            agent_id: a.agent.id(),
            threads: a.share.threads,
            first_thread: a.share.first_thread,
            driver_threads: plan.driver.threads,
            scale: self.config.scale,
            schedule: self.config.schedule.clone(),
            definition: Arc::clone(&plan.definition),
            layout: Arc::clone(&plan.layout),
            properties: Arc::new(plan.driver.properties.clone()),
            variable_load: plan.driver.variable_load.clone(),
            runtime_stats,
            clock: self.clock.clone(),
            seed: self.seed.map(|s| s.wrapping_add((plan.driver.index as u64) << 32)),
        }
    }

    async fn execute(
        &self,
        plans: &[DriverPlan],
        link: &Arc<MasterLink>,
        mut abort: watch::Receiver<bool>,
        done: watch::Receiver<bool>,
    ) -> Result<RunResults, RunError> {
        let schedule = &self.config.schedule;
        let agents: Vec<&Assignment> = plans.iter().flat_map(|p| &p.assignments).collect();
        self.monitor.set(MasterState::Starting);

        let master: Arc<dyn MasterHandle> = link.clone();
        for plan in plans {
            for a in &plan.assignments {
                let run = self.agent_run(plan, a);
                tracing::info!("Configuring {} with {} threads", a.label(), a.share.threads);
                guarded(&mut abort, a.agent.configure(Arc::clone(&master), run, link.timer.to_ref())).await??;
            }
        }
        tokio::spawn(heartbeat(
            agents.iter().map(|a| Arc::clone(&a.agent)).collect(),
            self.heartbeat,
            Arc::clone(link),
            done,
        ));

        tracing::info!("Starting threads on {} agents...", agents.len());
        if schedule.parallel_agent_thread_start {
            for a in &agents {
                guarded(&mut abort, a.agent.start_threads()).await??;
            }
            for a in &agents {
                guarded(&mut abort, a.agent.wait_for_thread_start()).await??;
            }
        } else {
            for a in &agents {
                guarded(&mut abort, a.agent.start_threads()).await??;
                guarded(&mut abort, a.agent.wait_for_thread_start()).await??;
            }
        }

        // Leave enough time for the start time to reach every agent.
        let slack = Duration::from_millis(100 * agents.len() as u64).max(self.min_start_delay);
        let start = link.timer.time_millis() + slack.as_millis() as i64;
        for a in &agents {
            guarded(&mut abort, a.agent.set_start_time(start)).await??;
        }
        let remaining = start - link.timer.time_millis();
        if remaining <= 0 {
            return Err(ConfigurationError::StartTimePassed(-remaining).into());
        }
        tracing::info!("Started all threads; run commences in {remaining} ms");
        let start_time = link.timer.to_wall_millis(link.timer.to_abs_nanos(start));
        sleep(&mut abort, Duration::from_millis(remaining as u64)).await?;

        match schedule.run_control {
            RunControl::Time => {
                self.monitor.set(MasterState::RampUp);
                sleep(&mut abort, Duration::from_secs(schedule.ramp_up)).await?;
                tracing::info!("Ramp up completed");
                self.monitor.set(MasterState::SteadyState);
                sleep(&mut abort, Duration::from_secs(schedule.steady_state)).await?;
                tracing::info!("Steady state completed");
                self.monitor.set(MasterState::RampDown);
                sleep(&mut abort, Duration::from_secs(schedule.ramp_down)).await?;
                self.join_or_terminate(&agents, &mut abort).await?;
            }
            RunControl::Cycles => {
                self.monitor.set(MasterState::SteadyState);
                guarded(&mut abort, join_agents(&agents)).await?;
            }
        }
        self.post_run(&agents, &mut abort).await?;
        tracing::info!("Ramp down completed");
        self.monitor.set(MasterState::Results);

        let mut drivers = Vec::with_capacity(plans.len());
        for plan in plans {
            drivers.push(collect(plan, start_time).await);
        }
        Ok(RunResults {
            benchmark: self.benchmark.name.clone(),
            schedule: schedule.clone(),
            scale: self.config.scale,
            start_time,
            drivers,
        })
    }

    /// Joins all agents, terminating threads that outlive the grace period.
    /// Thread 0 of every driver is terminated last, after all other agents.
    async fn join_or_terminate(
        &self,
        agents: &[&Assignment],
        abort: &mut watch::Receiver<bool>,
    ) -> Result<(), RunError> {
        let joined = tokio::time::timeout(self.join_grace, guarded(abort, join_agents(agents))).await;
        match joined {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    "Threads still running {} seconds after ramp down. Terminating...",
                    self.join_grace.as_secs()
                );
                let (first, others): (Vec<&Assignment>, Vec<&Assignment>) =
                    agents.iter().copied().partition(|a| a.is_first());
                for a in others.iter().chain(first.iter()) {
                    match tokio::time::timeout(self.join_grace, a.agent.terminate()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("{}: terminate failed: {e}", a.label()),
                        Err(_) => tracing::warn!("{}: threads ignored the stop request", a.label()),
                    }
                }
                match tokio::time::timeout(self.join_grace, guarded(abort, join_agents(agents))).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::warn!(
                            "Threads still running after termination, collecting results without them"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Releases the post-run hook on the first agent of every driver. A hook
    /// that outlives the grace period is left behind.
    async fn post_run(&self, agents: &[&Assignment], abort: &mut watch::Receiver<bool>) -> Result<(), RunError> {
        for a in agents.iter().filter(|a| a.is_first()) {
            match tokio::time::timeout(self.join_grace, guarded(abort, a.agent.post_run())).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!("{}: post-run failed: {e}", a.label()),
                Ok(Err(aborted)) => return Err(aborted),
                Err(_) => tracing::warn!(
                    "{}: post-run still busy after {} seconds",
                    a.label(),
                    self.join_grace.as_secs()
                ),
            }
        }
        Ok(())
    }

    /// Kills, joins and post-runs every agent after an abort.
    async fn shutdown(&self, plans: &[DriverPlan]) {
        self.monitor.set(MasterState::Aborted);
        let agents: Vec<&Assignment> = plans.iter().flat_map(|p| &p.assignments).collect();
        for a in &agents {
            if let Err(e) = a.agent.kill().await {
                tracing::warn!("{}: kill failed: {e}", a.label());
            }
        }
        match tokio::time::timeout(self.join_grace, join_agents(&agents)).await {
            Ok(()) => tracing::info!("All agents joined after abort"),
            Err(_) => tracing::warn!("Agents did not join within {} seconds of the abort", self.join_grace.as_secs()),
        }
        for a in agents.iter().filter(|a| a.is_first()) {
            match tokio::time::timeout(self.join_grace, a.agent.post_run()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("{}: post-run failed: {e}", a.label()),
                Err(_) => tracing::warn!("{}: post-run still busy after the abort", a.label()),
            }
        }
    }
}

/// Resolves `fut` unless the run is aborted first.
async fn guarded<T>(abort: &mut watch::Receiver<bool>, fut: impl Future<Output = T>) -> Result<T, RunError> {
    tokio::select! {
        biased;
        _ = abort.wait_for(|aborted| *aborted).map(|_| ()) => Err(RunError::Aborted),
        out = fut => Ok(out),
    }
}

async fn sleep(abort: &mut watch::Receiver<bool>, duration: Duration) -> Result<(), RunError> {
    guarded(abort, tokio::time::sleep(duration)).await
}

/// Joins all agents at once. Unreachable agents are skipped.
async fn join_agents(agents: &[&Assignment]) {
    let joined = join_all(agents.iter().map(|a| a.agent.join())).await;
    for (a, outcome) in agents.iter().zip(joined) {
        if let Err(e) = outcome {
            tracing::warn!("{}: join failed: {e}", a.label());
        }
    }
}

/// Merges the results of a driver's agents per host and in total.
async fn collect(plan: &DriverPlan, start_time: i64) -> DriverResults {
    let mut by_host: BTreeMap<String, Vec<Metrics>> = BTreeMap::new();
    for a in &plan.assignments {
        match a.agent.results().await {
            Ok(Some(metrics)) => by_host.entry(a.agent.host().to_string()).or_default().push(metrics),
            Ok(None) => tracing::debug!("{}: no results", a.label()),
            Err(e) => tracing::warn!("{}: unable to collect results: {e}", a.label()),
        }
    }
    let mut hosts: Vec<Metrics> = by_host.into_values().filter_map(pairwise).collect();
    for host in &mut hosts {
        host.start_time = start_time;
    }
    let mut total =
        pairwise(hosts.clone()).unwrap_or_else(|| Metrics::new(Arc::clone(&plan.layout), None));
    total.start_time = start_time;
    DriverResults {
        definition: Arc::clone(&plan.definition),
        layout: Arc::clone(&plan.layout),
        threads: plan.driver.threads,
        agents: plan.assignments.len(),
        total,
        hosts,
    }
}

/// Checks the agents for liveness until `done`, aborting the run on the
/// first one that fails.
async fn heartbeat(
    agents: Vec<Arc<dyn AgentHandle>>,
    every: Duration,
    link: Arc<MasterLink>,
    mut done: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = done.wait_for(|d| *d).map(|_| ()) => return,
            _ = ticker.tick() => {}
        }
        for agent in &agents {
            if let Err(e) = agent.heartbeat().await {
                tracing::error!("{}Agent[{}]: heartbeat failed: {e}", agent.driver(), agent.id());
                link.abort_run();
                return;
            }
        }
    }
}
