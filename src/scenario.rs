use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use typed_builder::TypedBuilder;

use crate::context::{Driver, DriverContext, DriverFactory};
use crate::definition::BenchmarkDefinition;
use crate::executor::Executor;
use crate::master::RunResults;
use crate::run::RunConfig;

/// A benchmark ready to run: the definition, the run configuration and the
/// workload code of each driver.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use fleetload::context::{Driver, DriverContext};
/// use fleetload::definition::BenchmarkDefinition;
/// use fleetload::error::DriverError;
/// use fleetload::scenario::Scenario;
///
/// struct Noop;
///
/// impl Driver for Noop {
///     fn invoke(&mut self, _op: &str, _ctx: &mut DriverContext) -> Result<(), DriverError> {
///         Ok(())
///     }
/// }
///
/// # fn benchmark() -> BenchmarkDefinition { unimplemented!() }
/// let scenario = Scenario::builder()
///     .name("noop")
///     .benchmark(Arc::new(benchmark()))
///     .build()
///     .with_driver("noop", |_ctx| Ok(Noop));
/// ```
#[derive(TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub benchmark: Arc<BenchmarkDefinition>,
    #[builder(default)]
    pub config: RunConfig,
    #[builder(default, setter(skip))]
    drivers: BTreeMap<String, DriverFactory>,
}

impl Scenario {
    /// Registers the workload code of driver `name`. Each thread calls
    /// `factory` once with its own context.
    pub fn with_driver<D, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        D: Driver + 'static,
        F: Fn(&DriverContext) -> anyhow::Result<D> + Send + Sync + 'static,
    {
        let boxed: DriverFactory =
            Arc::new(move |ctx: &DriverContext| Ok(Box::new(factory(ctx)?) as Box<dyn Driver>));
        self.drivers.insert(name.into(), boxed);
        self
    }

    pub fn driver(&self, name: &str) -> Option<DriverFactory> {
        self.drivers.get(name).cloned()
    }

    /// Runs the scenario with `executor`.
    pub async fn run<E: Executor>(&self, executor: &E) -> Result<RunResults, E::Error> {
        executor.exec(self).await
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("benchmark", &self.benchmark.name)
            .field("config", &self.config)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}
