//! Core types for the orchestrator
//!
//! `Machine` and `LaunchEvent` travel from launch workers to the control
//! loop; the rest describe run progress and results.

use chrono::{DateTime, Utc};
use shakenfist_client::Instance;
use std::fmt;
use std::time::Duration;

use super::cleanup::TeardownReport;

/// One launched instance, keyed by its ordinal index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    /// Correlation key carried in the boot config and the callback body
    pub index: usize,
    /// Control-plane instance UUID
    pub instance_id: String,
    /// Hypervisor node, if already scheduled
    pub node: Option<String>,
    pub console_port: Option<u16>,
}

impl Machine {
    pub fn from_instance(index: usize, instance: Instance) -> Self {
        Self {
            index,
            instance_id: instance.uuid,
            node: instance.node,
            console_port: instance.console_port,
        }
    }
}

/// Result of one launch worker
#[derive(Debug, Clone)]
pub enum LaunchEvent {
    /// The instance was created
    Launched(Machine),
    /// The worker exhausted its retry policy
    GaveUp { index: usize, error: String },
}

impl LaunchEvent {
    pub fn index(&self) -> usize {
        match self {
            LaunchEvent::Launched(machine) => machine.index,
            LaunchEvent::GaveUp { index, .. } => *index,
        }
    }
}

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum RunPhase {
    /// Creating namespace, key, network and listener
    Provisioning,
    /// Launching instances and collecting callbacks
    Running,
    /// Tearing down remote resources
    Draining,
    /// Teardown attempted; the run is over
    TornDown,
}

/// Why the control loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum RunOutcome {
    /// Every launched instance phoned home
    Completed,
    Cancelled,
    TimedOut,
}

/// An instance still waiting to phone home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingEntry {
    pub index: usize,
    pub instance_id: String,
    pub node: Option<String>,
}

/// Point-in-time view of run progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub started: usize,
    pub callbacks: usize,
    pub failed_launches: usize,
    /// Ordered by index
    pub outstanding: Vec<OutstandingEntry>,
}

impl ProgressSnapshot {
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instances: Started={} Callbacks={} Outstanding={}",
            self.started,
            self.callbacks,
            self.outstanding_count()
        )?;
        if self.failed_launches > 0 {
            write!(f, " FailedLaunches={}", self.failed_launches)?;
        }
        for entry in &self.outstanding {
            write!(
                f,
                "\n  {}: {}  {}",
                entry.index,
                entry.instance_id,
                entry.node.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}

/// Final result of a run that got past provisioning
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub namespace: String,
    pub outcome: RunOutcome,
    pub snapshot: ProgressSnapshot,
    /// Instances deleted as soon as they phoned home
    pub deleted_on_callback: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub teardown: TeardownReport,
}

impl RunSummary {
    /// True when every instance phoned home and teardown left nothing behind
    pub fn is_clean(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.teardown.is_clean()
    }
}
