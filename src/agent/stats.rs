//! Periodic snapshots of in-flight statistics.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::AgentShared;
use crate::metrics::{Aggregate, Metrics, RuntimeMetrics, pairwise};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Sends a [`RuntimeMetrics`] of all threads of an agent to the coordinator
/// every interval, from the run start until the end of ramp down.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    cancel: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatsCollector {
    pub fn start(
        shared: &Arc<AgentShared>,
        threads: Vec<Arc<Mutex<Metrics>>>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(shared);
        let stop = Arc::clone(&cancel);
        let handle = std::thread::Builder::new()
            .name(format!("{}-stats", shared.name))
            .spawn(move || collect(&shared, &threads, interval, &stop))?;
        Ok(Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stops collecting without waiting for the collector.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Stops collecting and waits for the collector to end. Returns `false`
    /// if the collector panicked.
    pub fn cancel(&self) -> bool {
        self.stop();
        let handle = self.handle.lock().take();
        match handle.map(JoinHandle::join) {
            Some(Err(_)) => {
                tracing::warn!("Runtime statistics collector panicked, its last interval is lost");
                false
            }
            _ => true,
        }
    }
}

fn collect(shared: &AgentShared, threads: &[Arc<Mutex<Metrics>>], interval: Duration, stop: &AtomicBool) {
    let interval = interval.as_nanos() as i64;
    if interval <= 0 {
        return;
    }
    let start = shared.start_time();
    let end = start + shared.info.schedule.total() as i64 * 1_000_000_000;
    let mut sequence = 1u32;
    loop {
        let wakeup = start + sequence as i64 * interval;
        if wakeup > end || !shared.timer.wakeup_at_or_stop(wakeup, stop) {
            break;
        }
        let timestamp = (shared.timer.now() - start) / NANOS_PER_MILLI;
        let snapshots = threads
            .iter()
            .map(|m| {
                let mut r = RuntimeMetrics::new(shared.info.driver_type, sequence, timestamp);
                r.consume(&m.lock());
                r
            })
            .collect();
        if let Some(mut snapshot) = pairwise(snapshots) {
            snapshot.sequence = sequence;
            snapshot.driver_type = shared.info.driver_type;
            shared.master.update_metrics(snapshot);
        }
        sequence += 1;
    }
    tracing::debug!("{}: Runtime statistics collection ended", shared.name);
}
