//! Error taxonomy.
//!
//! Errors are split by *when* they can happen and *who* is allowed to act on
//! them:
//!
//! - [`DefinitionError`]: the benchmark definition itself is malformed. Raised
//!   while loading, before any run starts.
//! - [`ConfigurationError`]: a run-time override conflicts with the definition.
//!   Also raised before the run starts.
//! - [`DriverError`]: returned by workload code from a single operation. Only
//!   the `Fatal` variant stops anything.
//! - [`FatalError`]: a condition that terminates the thread it happens on and
//!   escalates into a run abort through the coordinator.
//! - [`CommunicationError`]: the control plane could not reach a participant.
//! - [`RunError`]: what the coordinator and the executors return.
use thiserror::Error;

/// The benchmark definition is malformed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("unknown {family} kind '{kind}'")]
    UnknownKind { family: &'static str, kind: String },

    #[error("invalid {kind} cycle: {reason}")]
    InvalidCycle { kind: &'static str, reason: String },

    #[error("unable to parse benchmark definition: {0}")]
    Parse(String),

    #[error("no cycle defined for operation {operation}")]
    MissingCycle { operation: String },

    #[error("driver {driver} declares a background mix without an initial delay")]
    MissingInitialDelay { driver: String },

    #[error("operation {operation} has {actual} percentile limits, driver declares {expected} percentiles")]
    PercentileLimitMismatch {
        operation: String,
        expected: usize,
        actual: usize,
    },

    #[error("driver {driver} has no percentile limit set on any operation")]
    NoPercentileLimit { driver: String },

    #[error("invalid percentile {0}, must be in (0, 100)")]
    InvalidPercentile(f64),

    #[error("driver {driver} declares no operations")]
    NoOperations { driver: String },

    #[error("operation name {0} is declared more than once")]
    DuplicateOperation(String),

    #[error("mix has {mix} entries but there are {operations} operations")]
    MixSize { mix: usize, operations: usize },

    #[error("invalid mix: {0}")]
    InvalidMix(String),

    #[error("matrix mix is not convergent after {iterations} iterations")]
    MatrixNotConvergent { iterations: usize },

    #[error("driver {0} is defined more than once")]
    DuplicateDriver(String),
}

/// A run configuration conflicts with the definition or is unreadable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("unable to parse configuration: {0}")]
    Parse(String),

    #[error("configured ratio for operation {0} not found")]
    MissingRatio(String),

    #[error("invalid operation name(s) in operationMix configuration: {0}")]
    UnknownOperations(String),

    #[error("fixed sequence mix does not accept ratio overrides")]
    FixedSequenceOverride,

    #[error("operation mix override has {actual} rows, expected {expected}")]
    MixShape { expected: usize, actual: usize },

    #[error("no configuration for driver {0}")]
    UnknownDriver(String),

    #[error("steady state must be greater than zero")]
    SteadyState,

    #[error("driver {0} is configured with no threads")]
    NoThreads(String),

    #[error("no driver configured to run")]
    NoDriver,

    #[error("start time is in the past by {0} ms, agents will not be able to start together")]
    StartTimePassed(i64),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Errors raised by workload code.
///
/// `Failed` and `Expected` are recoverable: the transaction is counted as an
/// error and the thread moves on. `Fatal` stops the thread and aborts the run.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("operation failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("expected failure: {0}")]
    Expected(#[source] anyhow::Error),

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl DriverError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    pub fn expected(err: impl Into<anyhow::Error>) -> Self {
        Self::Expected(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Thread-terminating conditions detected by the engine.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("{operation}: invoke time not set, transport not called")]
    TransportNotCalled { operation: String },

    #[error("{operation}: invoke time not set, record_time() not called before critical section")]
    RecordTimeNotCalled { operation: String },

    #[error("{operation}: response time not set, transport not called or record_time() not called after critical section")]
    ResponseNotRecorded { operation: String },

    #[error("record_time() is only allowed for MANUAL timing, operation {operation} uses AUTO")]
    ManualTimingOnly { operation: String },

    #[error("{0} called outside an operation")]
    OutsideOperation(&'static str),

    #[error("{operation}: is_tx_steady_state called before the response time was captured")]
    SteadyStateUnknown { operation: String },

    #[error("start time missed by {0} ms, thread cannot start in time")]
    StartTimeMissed(i64),

    #[error("sleep compensation of {0} ms exceeds 100 ms, this system is too slow to drive load")]
    Compensation(i64),

    #[error("unable to create driver instance: {0}")]
    DriverInit(#[source] anyhow::Error),

    #[error("driver raised a fatal error: {0}")]
    Driver(#[source] anyhow::Error),
}

/// The control plane failed to reach a participant.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommunicationError {
    #[error("agent {0} is unreachable: {1}")]
    Unreachable(String, String),

    #[error("agent {0} failed its heartbeat")]
    Heartbeat(String),

    #[error("control channel closed")]
    Closed,
}

/// Errors returned by the coordinator and executors.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("run aborted")]
    Aborted,

    #[error("{0} is not allowed while the run is {1}")]
    IllegalState(&'static str, String),
}
