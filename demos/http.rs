use std::sync::Arc;

use fleetload::{
    BenchmarkDefinition, Driver, DriverContext, DriverError, Executor, FleetExecutor, Reporter, RunConfig,
    Scenario, Summary,
    report::{JsonReporter, LogReporter},
};
use reqwest::blocking::Client;

const BENCHMARK: &str = r#"
name = "http"
version = "1.0"

[[drivers]]
name = "browser"
metric = "req/s"
percentiles = [90, "99th"]
response_time_unit = "milliseconds"

[drivers.mix]
kind = "flat"
ratios = [80, 20]

[[drivers.operations]]
name = "home"
percentile_limits = [200, 500]
cycle = { kind = "negative_exponential", type = "THINK_TIME", min = 0, mean = 200, max = 1000 }

[[drivers.operations]]
name = "health"
percentile_limits = [100, 250]
cycle = { kind = "negative_exponential", type = "THINK_TIME", min = 0, mean = 200, max = 1000 }
"#;

const RUN: &str = r#"
ramp_up = 3
steady_state = 10
ramp_down = 2
ms_between_thread_start = 50

[runtime_stats]
enabled = true
interval = 2

[[drivers]]
name = "browser"
threads = 20
agents = 2
properties = { url = "http://localhost:3000" }
"#;

/// One per simulated user. Clients are built once per thread, never per request.
struct Browser {
    client: Client,
    url: String,
}

impl Driver for Browser {
    fn invoke(&mut self, operation: &str, ctx: &mut DriverContext) -> Result<(), DriverError> {
        let url = match operation {
            "health" => format!("{}/health", self.url),
            _ => self.url.clone(),
        };
        let client = &self.client;
        let response = ctx.transport(|| client.get(&url).send()).map_err(DriverError::failed)?;
        if !response.status().is_success() {
            return Err(DriverError::failed(anyhow::anyhow!("{url}: {}", response.status())));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let scenario = Scenario::builder()
        .name("Http scenario")
        .benchmark(Arc::new(BenchmarkDefinition::from_toml(BENCHMARK)?))
        .config(RunConfig::from_toml(RUN)?)
        .build()
        .with_driver("browser", |ctx| {
            Ok(Browser {
                client: Client::new(),
                url: ctx.property("url").unwrap_or("http://localhost:3000").to_string(),
            })
        });

    let results = FleetExecutor::builder().build().exec(&scenario).await?;

    LogReporter.report(Summary::from(results.clone())).await?;
    JsonReporter::builder()
        .path("http-summary.json")
        .build()
        .report(Summary::from(results))
        .await?;
    Ok(())
}
