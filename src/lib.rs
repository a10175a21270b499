//! fleetload: distributed load generation for Rust.
//!
//! A benchmark is a set of *drivers*, each simulating one kind of user. A
//! driver declares its operations, how the next one is chosen (the mix) and
//! how long a user waits between two of them (the cycle). At run time the
//! threads of every driver are spread over *agents*, which may live in this
//! process or on other hosts, and one *master* walks them all through the
//! same timeline: ramp up, steady state, ramp down. Only steady state counts.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: the benchmark definition, the run configuration and the
//!   workload code of each driver.
//! - [`Executor`]: responsible for actually running the scenario. The
//!   built-in [`FleetExecutor`] hands it to a [`Master`], with in-process
//!   agents where no remote agent was registered.
//! - [`Driver`]: workload code. One instance per simulated user, invoked with
//!   the name of the operation to run and its [`DriverContext`].
//! - [`Metrics`]: per-thread statistics, merged through [`Aggregate`] into
//!   per-agent, per-host and run totals.
//! - [`Report`]: transforms the merged [`RunResults`] into figures and
//!   verdicts; [`Summary`] is the pass/fail view.
//! - [`Reporter`]: consumes `Report`s and sends them somewhere (the log, a
//!   JSON file).
//!
//! # Where to start
//!
//! Read the docs for [`definition`], [`Scenario`] and [`DriverContext`].
//! `demos/` holds two complete benchmarks.

/// Pacing distributions
pub mod cycle;
/// Benchmark definitions and their validation
pub mod definition;
/// Error types
pub mod error;
/// Orchestrators that define how things will actually run
pub mod executor;
/// Operation mixes
pub mod mix;
/// Run configuration
pub mod run;
/// Main module of the framework that glues everything together
pub mod scenario;

pub mod agent;
pub mod context;
pub mod control;
pub mod latch;
pub mod master;
pub mod metrics;
pub mod report;
pub mod timer;

pub use context::{Driver, DriverContext};
pub use definition::{BenchmarkDefinition, BenchmarkSpec};
pub use error::{DriverError, RunError};
pub use executor::{Executor, FleetExecutor};
pub use master::{Master, RunResults};
pub use metrics::{Aggregate, Metrics};
pub use report::{Report, Reporter, Summary};
pub use run::{RunConfig, RunSchedule};
pub use scenario::Scenario;
