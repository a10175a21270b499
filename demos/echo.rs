//! A self-contained benchmark: an in-process "store" whose operations only
//! sleep, with a background stream and a custom statistic.
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use fleetload::{
    BenchmarkDefinition, BenchmarkSpec, Driver, DriverContext, DriverError, Executor, FleetExecutor, Reporter,
    RunConfig, RunSchedule, Scenario, Summary,
    cycle::{CycleSpec, CycleType},
    definition::{BackgroundSpec, DriverSpec, OperationDecl, PercentileDecl},
    metrics::{CustomMetrics, CustomStat},
    mix::MixSpec,
    report::{Detail, JsonReporter, LogReporter},
    run::DriverConfig,
};
use rand::Rng;

#[derive(Debug, Clone, Default)]
struct CartSize {
    items: u64,
    checkouts: u64,
}

impl CustomMetrics for CartSize {
    fn merge(&mut self, other: &dyn CustomMetrics) {
        if let Some(other) = other.as_any().downcast_ref::<Self>() {
            self.items += other.items;
            self.checkouts += other.checkouts;
        }
    }

    fn results(&self) -> Vec<CustomStat> {
        let avg = self.items as f64 / self.checkouts.max(1) as f64;
        vec![
            CustomStat::new("Average cart size", format!("{avg:.2}"))
                .with_target("3.00")
                .with_allowed_deviation("1.00")
                .with_passed((avg - 3.0).abs() <= 1.0),
        ]
    }

    fn clone_box(&self) -> Box<dyn CustomMetrics> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct Store {
    cart: CartSize,
}

impl Driver for Store {
    fn invoke(&mut self, operation: &str, ctx: &mut DriverContext) -> Result<(), DriverError> {
        let work = match operation {
            "browse" => ctx.random().random_range(2..8),
            "checkout" => {
                self.cart.items += ctx.random().random_range(1..=5);
                self.cart.checkouts += 1;
                ctx.attach_metrics("cart", Box::new(self.cart.clone()));
                10
            }
            _ => 1,
        };
        ctx.transport(|| std::thread::sleep(Duration::from_millis(work)));
        if operation == "checkout" && ctx.random().random_bool(0.01) {
            return Err(DriverError::expected(anyhow::anyhow!("payment declined")));
        }
        Ok(())
    }
}

fn benchmark() -> anyhow::Result<BenchmarkDefinition> {
    let think = || CycleSpec::negative_exponential(CycleType::ThinkTime, 0, 50, 250).with_deviation(5.0);
    let spec = BenchmarkSpec {
        name: "echo".into(),
        version: "1.0".into(),
        drivers: vec![DriverSpec {
            name: "store".into(),
            metric: "tx/s".into(),
            percentiles: vec![PercentileDecl::Number(90.0), PercentileDecl::Text("99th".into())],
            operations: vec![
                OperationDecl::new("browse", think(), &[0.05, 0.1]),
                OperationDecl::new("checkout", think(), &[0.1, 0.2]),
            ],
            mix: MixSpec {
                ratios: vec![75.0, 25.0],
                ..Default::default()
            },
            background: Some(BackgroundSpec {
                operations: vec![OperationDecl::new(
                    "restock",
                    CycleSpec::fixed(CycleType::CycleTime, 1000),
                    &[0.05, 0.1],
                )],
                mix: MixSpec::default(),
                initial_delay: None,
            }),
            ..Default::default()
        }],
    };
    Ok(BenchmarkDefinition::from_spec(&spec)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RunConfig::builder()
        .schedule(
            RunSchedule::builder()
                .ramp_up(2)
                .steady_state(10)
                .ramp_down(1)
                .ms_between_thread_start(20)
                .build(),
        )
        .drivers(vec![DriverConfig::new("store").with_threads(8)])
        .build();

    let scenario = Scenario::builder()
        .name("echo")
        .benchmark(Arc::new(benchmark()?))
        .config(config)
        .build()
        .with_driver("store", |_| Ok(Store::default()));

    let results = FleetExecutor::builder().seed(42).build().exec(&scenario).await?;

    LogReporter.report(Summary::from(results.clone())).await?;
    JsonReporter::builder()
        .path("echo-detail.json")
        .pretty(false)
        .build()
        .report(Detail::from(results))
        .await?;
    Ok(())
}
