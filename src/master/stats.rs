//! Logging of in-flight statistics on the coordinator.
use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use crate::metrics::runtime::{C_ERRORS, C_RESP, C_RESP90, C_SD, C_THRUPUT, O_RESP, O_RESP90, O_SD, O_THRUPUT};
use crate::metrics::{RuntimeMetrics, pairwise};
use crate::run::RunSchedule;

/// What the writer needs to know of one driver.
#[derive(Debug, Clone)]
pub(crate) struct DriverStats {
    pub driver_type: usize,
    pub name: String,
    pub agents: usize,
    /// Nanoseconds per reporting unit.
    pub precision: f64,
}

/// Collects the snapshots of all agents of a driver for one sequence number
/// and logs the combined figures.
#[derive(Debug)]
struct Sequencer {
    driver: DriverStats,
    sequence: u32,
    pending: Vec<RuntimeMetrics>,
    previous: RuntimeMetrics,
}

impl Sequencer {
    fn new(driver: DriverStats) -> Self {
        let driver_type = driver.driver_type;
        Self {
            driver,
            sequence: 1,
            pending: Vec::new(),
            previous: RuntimeMetrics::new(driver_type, 0, 0),
        }
    }

    /// Returns the figures to log whenever a sequence completes.
    fn push(&mut self, snapshot: RuntimeMetrics, schedule: &RunSchedule) -> Vec<String> {
        let mut lines = Vec::new();
        if snapshot.sequence < self.sequence {
            tracing::warn!(
                "Received out-of-sequence runtime stats from {}. Expected {} but got {}. Ignoring.",
                self.driver.name,
                self.sequence,
                snapshot.sequence
            );
            return lines;
        }
        if snapshot.sequence > self.sequence {
            if !self.pending.is_empty() {
                tracing::warn!(
                    "Missing {} runtime stats from {}. Ignoring.",
                    self.driver.agents - self.pending.len(),
                    self.driver.name
                );
                lines.extend(self.flush(schedule));
            }
            self.sequence = snapshot.sequence;
        }
        self.pending.push(snapshot);
        if self.pending.len() >= self.driver.agents {
            lines.extend(self.flush(schedule));
            self.sequence += 1;
        }
        lines
    }

    fn flush(&mut self, schedule: &RunSchedule) -> Option<String> {
        let current = pairwise(std::mem::take(&mut self.pending))?;
        let stats = current.results(&self.previous, schedule, self.driver.precision);
        let line = [
            C_THRUPUT, O_THRUPUT, C_ERRORS, C_RESP, O_RESP, C_SD, O_SD, C_RESP90, O_RESP90,
        ]
        .iter()
        .map(|label| stats.format(*label, 3))
        .collect::<Vec<_>>()
        .join(" ");
        self.previous = current;
        Some(format!("{:.2}s - {}: {line}", stats.timestamp, self.driver.name))
    }
}

/// Receives snapshots until `done` is raised.
pub(crate) async fn write(
    drivers: Vec<DriverStats>,
    schedule: RunSchedule,
    mut snapshots: mpsc::UnboundedReceiver<RuntimeMetrics>,
    mut done: watch::Receiver<bool>,
) {
    let mut sequencers: Vec<Sequencer> = drivers.into_iter().map(Sequencer::new).collect();
    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else { break };
                let Some(sequencer) = sequencers.iter_mut().find(|s| s.driver.driver_type == snapshot.driver_type) else {
                    tracing::warn!("Runtime stats for unknown driver type {}", snapshot.driver_type);
                    continue;
                };
                for line in sequencer.push(snapshot, &schedule) {
                    tracing::info!("{line}");
                }
            }
            _ = done.wait_for(|d| *d).map(|_| ()) => break,
        }
    }
    tracing::debug!("Runtime statistics writer ended");
}
