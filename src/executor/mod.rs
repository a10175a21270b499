//! Executor: turning a [`Scenario`] into a run.
//!
//! The `Executor` trait is the runtime that executes a `Scenario`. Different
//! executors may place agents differently: in process, on remote hosts, or a
//! mix of both.
//!
//! fleetload provides [`FleetExecutor`], which hands the scenario to a
//! [`Master`] and supplies in-process agents for every driver no remote agent
//! was registered for.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::control::{AgentHandle, LocalAgent, StateMonitor};
use crate::error::RunError;
use crate::master::{Master, RunResults};
use crate::scenario::Scenario;
use crate::timer::ClockCalibration;

/// The runtime hook that executes a `Scenario`.
pub trait Executor
where
    Self: Send + Sync + Sized,
{
    type Error;

    /// Executes the scenario and returns the merged results of all agents.
    fn exec(&self, scenario: &Scenario) -> impl Future<Output = Result<RunResults, Self::Error>> + Send;
}

/// Runs a scenario through a [`Master`].
///
/// Agents registered through `agents` are used as they are. A driver without
/// any registered agent gets in-process agents instead, as many as its
/// configuration asks for or one.
#[derive(Debug, TypedBuilder)]
pub struct FleetExecutor {
    #[builder(default)]
    agents: Vec<Arc<dyn AgentHandle>>,
    /// Host name reported by in-process agents.
    #[builder(default = "localhost".to_string(), setter(into))]
    host: String,
    #[builder(default)]
    clock: ClockCalibration,
    #[builder(default, setter(strip_option))]
    seed: Option<u64>,
    #[builder(default = Duration::from_secs(120))]
    join_grace: Duration,
    #[builder(default = Duration::from_secs(3))]
    min_start_delay: Duration,
    #[builder(default)]
    monitor: Arc<StateMonitor>,
}

impl FleetExecutor {
    /// State of the current run, shared with the [`Master`].
    pub fn monitor(&self) -> Arc<StateMonitor> {
        Arc::clone(&self.monitor)
    }

    fn agents(&self, scenario: &Scenario) -> Vec<Arc<dyn AgentHandle>> {
        let mut agents = self.agents.clone();
        for def in &scenario.benchmark.drivers {
            if agents.iter().any(|a| a.driver() == def.name) {
                continue;
            }
            let Some(factory) = scenario.driver(&def.name) else {
                tracing::warn!("No workload registered for driver {}", def.name);
                continue;
            };
            let count = scenario
                .config
                .drivers
                .iter()
                .find(|c| c.name == def.name)
                .and_then(|c| c.agents)
                .unwrap_or(1)
                .max(1);
            tracing::info!("Starting {count} local agents for driver {}", def.name);
            agents.extend((0..count).map(|id| {
                Arc::new(LocalAgent::new(id, self.host.clone(), def.name.clone(), Arc::clone(&factory)))
                    as Arc<dyn AgentHandle>
            }));
        }
        agents
    }
}

impl Executor for FleetExecutor {
    type Error = RunError;

    async fn exec(&self, scenario: &Scenario) -> Result<RunResults, Self::Error> {
        tracing::info!("Running {} ({} {})", scenario.name, scenario.benchmark.name, scenario.benchmark.version);
        let master = Master::builder()
            .benchmark(Arc::clone(&scenario.benchmark))
            .config(scenario.config.clone())
            .agents(self.agents(scenario))
            .clock(self.clock.clone())
            .seed(self.seed)
            .join_grace(self.join_grace)
            .min_start_delay(self.min_start_delay)
            .monitor(Arc::clone(&self.monitor))
            .build();
        master.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Driver, DriverContext};
    use crate::cycle::{CycleSpec, CycleType};
    use crate::definition::{BenchmarkDefinition, BenchmarkSpec, DriverSpec, OperationDecl};
    use crate::error::DriverError;
    use crate::run::{DriverConfig, RunConfig, RunSchedule};

    struct Echo;

    impl Driver for Echo {
        fn invoke(&mut self, operation: &str, ctx: &mut DriverContext) -> Result<(), DriverError> {
            ctx.transport(|| operation.len());
            Ok(())
        }
    }

    fn scenario(agents: Option<usize>) -> Scenario {
        let spec = BenchmarkSpec {
            name: "echo".into(),
            version: "0.1".into(),
            drivers: vec![
                DriverSpec {
                    name: "echo".into(),
                    operations: vec![OperationDecl::new("say", CycleSpec::fixed(CycleType::ThinkTime, 5), &[1.0])],
                    ..Default::default()
                },
                DriverSpec {
                    name: "idle".into(),
                    operations: vec![OperationDecl::new("wait", CycleSpec::fixed(CycleType::ThinkTime, 5), &[1.0])],
                    ..Default::default()
                },
            ],
        };
        let mut echo = DriverConfig::new("echo").with_threads(3);
        echo.agents = agents;
        Scenario::builder()
            .name("local")
            .benchmark(Arc::new(BenchmarkDefinition::from_spec(&spec).unwrap()))
            .config(
                RunConfig::builder()
                    .schedule(RunSchedule::builder().steady_state(1).ms_between_thread_start(5).build())
                    .drivers(vec![echo])
                    .build(),
            )
            .build()
            .with_driver("echo", |_| Ok(Echo))
    }

    #[test]
    fn local_agents_follow_the_configuration() {
        let executor = FleetExecutor::builder().build();
        let agents = executor.agents(&scenario(Some(2)));
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.driver() == "echo" && a.host() == "localhost"));
        assert_eq!(executor.agents(&scenario(None)).len(), 1);
    }

    #[test]
    fn registered_agents_take_precedence() {
        let s = scenario(Some(4));
        let remote: Arc<dyn AgentHandle> =
            Arc::new(LocalAgent::new(7, "remote", "echo", s.driver("echo").unwrap()));
        let executor = FleetExecutor::builder().agents(vec![remote]).build();
        let agents = executor.agents(&s);
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_only_drivers_with_workload() {
        let executor = FleetExecutor::builder()
            .clock(ClockCalibration::builder().attempts(2).interval(Duration::from_millis(1)).build())
            .seed(11)
            .min_start_delay(Duration::from_millis(300))
            .build();
        let results = scenario(Some(2)).run(&executor).await.unwrap();
        assert_eq!(results.drivers.len(), 1);
        let echo = &results.drivers[0];
        assert_eq!(echo.threads, 3);
        assert_eq!(echo.agents, 2);
        assert!(echo.total.tx_steady() > 0);
        assert_eq!(echo.hosts.len(), 1);
    }
}
