//! Event-driven metrics collection.
//!
//! Fire-and-forget: hot paths push small events into an unbounded channel
//! and a dedicated aggregator thread keeps the counters, logging a snapshot
//! at a fixed cadence. [`record_metric`] is a no-op until [`init`] runs, so
//! library code can record unconditionally.

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

static METRICS_SENDER: OnceCell<Sender<MetricsEvent>> = OnceCell::new();

/// Snapshot logging cadence of the aggregator thread.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Metrics events recorded by the runtime.
#[derive(Debug, Clone, Copy)]
pub enum MetricsEvent {
    /// A complete procedure was stored in the buffer pool.
    ProcedureStored,
    /// A stored procedure was evicted before the peer acknowledged it.
    ProcedureOverwritten,
    /// An on-demand segment went out.
    SegmentSent { bytes: usize },
    /// A GET → ACK transfer cycle finished.
    SessionCompleted,
    /// A session was abandoned because the peer never acknowledged.
    AckTimeout,
    /// A RAS-CP write was rejected at the ATT layer.
    CommandRejected,
}

#[derive(Debug, Default)]
struct Aggregates {
    procedures_stored: u64,
    procedures_overwritten: u64,
    segments_sent: u64,
    segment_bytes: u64,
    sessions_completed: u64,
    ack_timeouts: u64,
    commands_rejected: u64,
}

impl Aggregates {
    fn apply(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::ProcedureStored => self.procedures_stored += 1,
            MetricsEvent::ProcedureOverwritten => self.procedures_overwritten += 1,
            MetricsEvent::SegmentSent { bytes } => {
                self.segments_sent += 1;
                self.segment_bytes += bytes as u64;
            }
            MetricsEvent::SessionCompleted => self.sessions_completed += 1,
            MetricsEvent::AckTimeout => self.ack_timeouts += 1,
            MetricsEvent::CommandRejected => self.commands_rejected += 1,
        }
    }

    fn log_snapshot(&self) {
        info!(
            procedures_stored = self.procedures_stored,
            procedures_overwritten = self.procedures_overwritten,
            segments_sent = self.segments_sent,
            segment_bytes = self.segment_bytes,
            sessions_completed = self.sessions_completed,
            ack_timeouts = self.ack_timeouts,
            commands_rejected = self.commands_rejected,
            "ranging service metrics"
        );
    }
}

/// Record a metrics event. Never blocks; silently dropped before [`init`].
pub fn record_metric(event: MetricsEvent) {
    if let Some(sender) = METRICS_SENDER.get() {
        let _ = sender.try_send(event);
    }
}

/// Start the aggregator thread and install the process-wide sender.
///
/// Subsequent calls are no-ops returning `None`.
pub fn init() -> Option<JoinHandle<()>> {
    let (tx, rx) = unbounded();
    if METRICS_SENDER.set(tx).is_err() {
        return None;
    }

    let handle = std::thread::Builder::new()
        .name("ras-metrics".to_string())
        .spawn(move || aggregator_loop(rx))
        .expect("failed to spawn metrics thread");

    Some(handle)
}

fn aggregator_loop(rx: Receiver<MetricsEvent>) {
    let mut aggregates = Aggregates::default();

    loop {
        match rx.recv_timeout(SNAPSHOT_INTERVAL) {
            Ok(event) => aggregates.apply(event),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => aggregates.log_snapshot(),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                aggregates.log_snapshot();
                return;
            }
        }
    }
}
