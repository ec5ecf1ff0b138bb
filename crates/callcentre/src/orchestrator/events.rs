//! Orchestration events
//!
//! Emitted through a `ProgressReporter` as the run advances. The CLI logs
//! them; tests and embedders receive them over a channel.

use super::types::{ProgressSnapshot, RunPhase};

/// Event emitted by the orchestrator during a load-test run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// The run moved to a new phase
    Phase(RunPhase),
    /// Namespace, key and network exist
    Provisioned {
        namespace: String,
        network_uuid: String,
    },
    /// Listener bound and accepting callbacks
    Listening { addr: String },
    InstanceLaunched {
        index: usize,
        instance_id: String,
        node: Option<String>,
    },
    /// A launch worker exhausted its retry policy
    LaunchFailed { index: usize, error: String },
    /// An instance phoned home
    CallbackReceived { index: usize },
    /// A callback arrived before its launch result and was buffered
    EarlyCallback { index: usize },
    /// A callback that matched nothing and was ignored
    IgnoredCallback { index: usize },
    /// An instance was deleted right after phoning home
    InstanceDeleted { index: usize, instance_id: String },
    /// Periodic progress report
    Progress(ProgressSnapshot),
    /// Every launched instance phoned home
    AllConfirmed,
}
