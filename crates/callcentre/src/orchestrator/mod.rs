//! Load-test orchestration
//!
//! `Orchestrator::run` provisions a namespace and network, launches the
//! instances, correlates their phone-home callbacks and tears everything
//! down again. The control loop is the only owner of run state.

pub mod cleanup;
pub mod events;
pub mod launcher;
pub mod progress;
pub mod provision;
pub mod tracker;
pub mod types;
pub mod user_data;

pub use cleanup::{CleanupResult, OrphanCleanupReport, TeardownReport};
pub use events::RunEvent;
pub use launcher::{InstanceTemplate, Launcher, Pacing};
pub use progress::{ChannelReporter, LogReporter, ProgressReporter};
pub use provision::{RunNames, KEY_NAME, NAMESPACE_PREFIX};
pub use tracker::{CallbackDisposition, LaunchDisposition, RunTracker};
pub use types::{LaunchEvent, Machine, ProgressSnapshot, RunOutcome, RunPhase, RunSummary};
pub use user_data::{BootTemplate, TemplateError};

use anyhow::{Context as _, Result};
use chrono::Utc;
use shakenfist_client::ControlPlane;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::{CallbackListener, CALLBACK_CHANNEL_CAPACITY};
use crate::config::RunParameters;

/// Upper bound on the launch channel capacity
const MAX_LAUNCH_CHANNEL_CAPACITY: usize = 1024;

/// Runs one load test against a control plane
pub struct Orchestrator<C, R> {
    admin: Arc<C>,
    params: RunParameters,
    reporter: R,
}

impl<C, R> std::fmt::Debug for Orchestrator<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("count", &self.params.count)
            .field("listen_addr", &self.params.listen_addr)
            .finish()
    }
}

/// Mutable state owned by the control loop
struct LoopState {
    tracker: RunTracker,
    deleted_on_callback: usize,
}

impl<C, R> Orchestrator<C, R>
where
    C: ControlPlane + 'static,
    R: ProgressReporter,
{
    pub fn new(admin: C, params: RunParameters, reporter: R) -> Self {
        Self {
            admin: Arc::new(admin),
            params,
            reporter,
        }
    }

    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    /// Run the load test to completion, cancellation or timeout.
    ///
    /// Setup failures return `Err`. Once setup succeeds, teardown always
    /// runs and the result is `Ok(RunSummary)`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        self.params.validate()?;
        let boot = BootTemplate::load(&self.params.template_path).with_context(|| {
            format!(
                "Failed to load boot template {}",
                self.params.template_path.display()
            )
        })?;
        self.run_with(RunNames::generate(), boot, cancel).await
    }

    /// Run with explicit names and an already parsed template
    pub async fn run_with(
        &self,
        names: RunNames,
        boot: BootTemplate,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.params.validate()?;
        let admin = self.admin.as_ref();
        self.reporter.report_phase(RunPhase::Provisioning);
        info!(
            count = self.params.count,
            cpus = self.params.cpus,
            memory_mb = self.params.memory_mb,
            namespace = %names.namespace,
            "Starting load test"
        );

        let provisioned = provision::provision(admin, &names, &self.params).await?;
        let namespace = provisioned.namespace.clone();
        let network_uuid = provisioned.network_uuid.clone();

        let (callback_tx, mut callback_rx) = mpsc::channel(CALLBACK_CHANNEL_CAPACITY);
        let listener = match CallbackListener::bind(self.params.listen_addr, callback_tx).await {
            Ok(listener) => listener,
            Err(e) => {
                provision::unwind(
                    admin,
                    &namespace,
                    Some(&network_uuid),
                    self.params.rollback_on_failure,
                )
                .await;
                return Err(e).with_context(|| {
                    format!(
                        "Failed to bind callback listener on {}",
                        self.params.listen_addr
                    )
                });
            }
        };
        self.reporter.report_event(RunEvent::Provisioned {
            namespace: namespace.clone(),
            network_uuid: network_uuid.clone(),
        });
        self.reporter.report_event(RunEvent::Listening {
            addr: listener.local_addr().to_string(),
        });

        let launch_cancel = cancel.child_token();
        let (launch_tx, mut launch_rx) =
            mpsc::channel(self.params.count.clamp(1, MAX_LAUNCH_CHANNEL_CAPACITY));
        let launcher = Launcher::new(
            Arc::new(provisioned.scoped),
            InstanceTemplate::new(&self.params, &network_uuid, boot),
            self.params.launch_retry,
            Pacing {
                delay: self.params.launch_delay,
                max_concurrent: self.params.max_concurrent_launches,
            },
        );
        let launch_handle = launcher.spawn(self.params.count, launch_tx, launch_cancel.clone());

        let started_at = Utc::now();
        let start = Instant::now();
        self.reporter.report_phase(RunPhase::Running);

        let mut state = LoopState {
            tracker: RunTracker::new(self.params.count),
            deleted_on_callback: 0,
        };
        let outcome = self
            .control_loop(&mut state, &mut launch_rx, &mut callback_rx, &cancel)
            .await;

        self.reporter.report_phase(RunPhase::Draining);
        info!(%outcome, "Tearing down");

        launch_cancel.cancel();
        drop(launch_rx);
        if let Err(e) = launch_handle.await {
            warn!(error = %e, "Launcher task failed");
        }
        drop(callback_rx);
        listener.shutdown().await;

        let teardown = cleanup::teardown(admin, &namespace, Some(&network_uuid)).await;
        self.reporter.report_phase(RunPhase::TornDown);

        let snapshot = state.tracker.snapshot();
        self.reporter.report_progress(&snapshot);
        Ok(RunSummary {
            namespace,
            outcome,
            snapshot,
            deleted_on_callback: state.deleted_on_callback,
            started_at,
            elapsed: start.elapsed(),
            teardown,
        })
    }

    async fn control_loop(
        &self,
        state: &mut LoopState,
        launch_rx: &mut mpsc::Receiver<LaunchEvent>,
        callback_rx: &mut mpsc::Receiver<usize>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut ticker = tokio::time::interval(self.params.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        // A timeout too large to represent as an instant never fires
        let deadline = self.params.timeout.and_then(|t| Instant::now().checked_add(t));
        let timed_out = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timed_out);

        let mut launches_open = true;
        let mut callbacks_open = true;

        loop {
            tokio::select! {
                event = launch_rx.recv(), if launches_open => match event {
                    Some(event) => self.handle_launch(state, event).await,
                    None => {
                        debug!("Launch channel closed");
                        launches_open = false;
                    }
                },
                index = callback_rx.recv(), if callbacks_open => match index {
                    Some(index) => self.handle_callback(state, index).await,
                    None => {
                        error!("Callback listener stopped; no further callbacks will arrive");
                        callbacks_open = false;
                    }
                },
                _ = ticker.tick() => {
                    self.reporter.report_progress(&state.tracker.snapshot());
                }
                _ = cancel.cancelled() => {
                    info!("Run cancelled");
                    return RunOutcome::Cancelled;
                }
                _ = &mut timed_out => {
                    warn!(
                        outstanding = state.tracker.outstanding_len(),
                        started = state.tracker.started(),
                        "Timed out waiting for callbacks"
                    );
                    return RunOutcome::TimedOut;
                }
            }

            if state.tracker.is_complete() {
                self.reporter.report_event(RunEvent::AllConfirmed);
                return RunOutcome::Completed;
            }
        }
    }

    async fn handle_launch(&self, state: &mut LoopState, event: LaunchEvent) {
        match event {
            LaunchEvent::Launched(machine) => {
                let index = machine.index;
                let instance_id = machine.instance_id.clone();
                let node = machine.node.clone();

                match state.tracker.on_launched(machine) {
                    LaunchDisposition::Outstanding => {
                        self.reporter.report_event(RunEvent::InstanceLaunched {
                            index,
                            instance_id,
                            node,
                        });
                    }
                    LaunchDisposition::ConfirmedEarly(machine) => {
                        self.reporter.report_event(RunEvent::InstanceLaunched {
                            index,
                            instance_id,
                            node,
                        });
                        self.reporter
                            .report_event(RunEvent::CallbackReceived { index });
                        self.confirmed(state, &machine).await;
                    }
                    LaunchDisposition::Duplicate => {
                        error!(index, %instance_id, "Duplicate launch result ignored");
                    }
                    LaunchDisposition::OutOfRange => {
                        error!(index, %instance_id, "Launch result for unknown index ignored");
                    }
                }
            }
            LaunchEvent::GaveUp { index, error } => {
                if state.tracker.on_gave_up(index) {
                    self.reporter
                        .report_event(RunEvent::LaunchFailed { index, error });
                } else {
                    error!(index, "Duplicate launch failure ignored");
                }
            }
        }
    }

    async fn handle_callback(&self, state: &mut LoopState, index: usize) {
        match state.tracker.on_callback(index) {
            CallbackDisposition::Confirmed(machine) => {
                self.reporter
                    .report_event(RunEvent::CallbackReceived { index });
                self.confirmed(state, &machine).await;
            }
            CallbackDisposition::Early => {
                self.reporter.report_event(RunEvent::EarlyCallback { index });
            }
            CallbackDisposition::Duplicate => {
                info!(index, "Duplicate callback ignored");
                self.reporter
                    .report_event(RunEvent::IgnoredCallback { index });
            }
            CallbackDisposition::Abandoned => {
                warn!(index, "Callback from an instance whose launch gave up; ignored");
                self.reporter
                    .report_event(RunEvent::IgnoredCallback { index });
            }
            CallbackDisposition::Unknown => {
                warn!(index, count = state.tracker.count(), "Callback for unknown index ignored");
                self.reporter
                    .report_event(RunEvent::IgnoredCallback { index });
            }
        }
    }

    /// Delete a confirmed instance right away when configured to
    async fn confirmed(&self, state: &mut LoopState, machine: &Machine) {
        if !self.params.delete_on_callback {
            return;
        }
        let result = cleanup::delete_instance(self.admin.as_ref(), &machine.instance_id).await;
        if result.is_success() {
            state.deleted_on_callback += 1;
            self.reporter.report_event(RunEvent::InstanceDeleted {
                index: machine.index,
                instance_id: machine.instance_id.clone(),
            });
        }
    }
}
