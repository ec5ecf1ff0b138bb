//! Progress reporting abstractions for the orchestrator
//!
//! The same control loop reports to stdout (CLI) or to a channel (tests,
//! embedders) through the `ProgressReporter` trait.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::RunEvent;
use super::types::{ProgressSnapshot, RunPhase};

/// Trait for reporting run progress
pub trait ProgressReporter: Send + Sync {
    /// Report a phase change
    fn report_phase(&self, phase: RunPhase);

    /// Report a periodic progress snapshot
    fn report_progress(&self, snapshot: &ProgressSnapshot);

    /// Report any other run event
    fn report_event(&self, event: RunEvent);
}

/// Progress reporter that forwards every event to a channel
pub struct ChannelReporter {
    tx: mpsc::Sender<RunEvent>,
}

impl ChannelReporter {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }

    /// Send an event, ignoring errors (receiver may be gone)
    fn send(&self, event: RunEvent) {
        let _ = self.tx.try_send(event);
    }
}

impl ProgressReporter for ChannelReporter {
    fn report_phase(&self, phase: RunPhase) {
        self.send(RunEvent::Phase(phase));
    }

    fn report_progress(&self, snapshot: &ProgressSnapshot) {
        self.send(RunEvent::Progress(snapshot.clone()));
    }

    fn report_event(&self, event: RunEvent) {
        self.send(event);
    }
}

/// Progress reporter that prints snapshots to stdout and logs the rest
pub struct LogReporter;

impl LogReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for LogReporter {
    fn report_phase(&self, phase: RunPhase) {
        info!(%phase, "Run phase");
    }

    fn report_progress(&self, snapshot: &ProgressSnapshot) {
        println!("\n{snapshot}");
    }

    fn report_event(&self, event: RunEvent) {
        match event {
            RunEvent::Phase(phase) => self.report_phase(phase),
            RunEvent::Progress(snapshot) => self.report_progress(&snapshot),
            RunEvent::Provisioned {
                namespace,
                network_uuid,
            } => info!(%namespace, %network_uuid, "Provisioned load-test namespace"),
            RunEvent::Listening { addr } => info!(%addr, "Callback listener ready"),
            RunEvent::InstanceLaunched {
                index,
                instance_id,
                node,
            } => info!(index, %instance_id, node = ?node, "Instance launched"),
            RunEvent::LaunchFailed { index, error } => {
                warn!(index, %error, "Gave up launching instance")
            }
            RunEvent::CallbackReceived { index } => println!("    Received callback: {index}"),
            RunEvent::EarlyCallback { index } => {
                info!(index, "Callback arrived before launch result, buffered")
            }
            RunEvent::IgnoredCallback { index } => debug!(index, "Ignored callback"),
            RunEvent::InstanceDeleted { index, instance_id } => {
                info!(index, %instance_id, "Deleted instance after callback")
            }
            RunEvent::AllConfirmed => println!("\nSUCCESS - All instances have phoned home"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_reporter_forwards_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let reporter = ChannelReporter::new(tx);

        reporter.report_phase(RunPhase::Running);
        reporter.report_progress(&ProgressSnapshot::default());
        reporter.report_event(RunEvent::CallbackReceived { index: 2 });

        assert_eq!(rx.recv().await, Some(RunEvent::Phase(RunPhase::Running)));
        assert_eq!(
            rx.recv().await,
            Some(RunEvent::Progress(ProgressSnapshot::default()))
        );
        assert_eq!(rx.recv().await, Some(RunEvent::CallbackReceived { index: 2 }));
    }

    #[test]
    fn test_channel_reporter_survives_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let reporter = ChannelReporter::new(tx);
        reporter.report_phase(RunPhase::Draining);
    }
}
