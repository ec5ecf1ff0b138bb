//! Instance launcher
//!
//! One worker task per index, started at the configured pace. Each worker
//! keeps calling create-instance under the retry policy and reports a single
//! `LaunchEvent`. Cancelling the launch token stops pacing and workers alike;
//! a cancelled worker reports nothing.

use shakenfist_client::{ControlPlane, CreateInstance, DiskSpec, NetworkSpec, VideoSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{LaunchEvent, Machine};
use super::user_data::BootTemplate;
use crate::config::RunParameters;
use crate::retry::{retry, RetryOutcome, RetryPolicy};

/// Fixed per-instance settings shared by every worker
#[derive(Debug, Clone)]
pub struct InstanceTemplate {
    pub network_uuid: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_base: String,
    pub disk_size_gb: u32,
    /// Host and port substituted into the boot config
    pub callback_host: String,
    pub callback_port: u16,
    pub boot: BootTemplate,
}

impl InstanceTemplate {
    pub fn new(params: &RunParameters, network_uuid: &str, boot: BootTemplate) -> Self {
        Self {
            network_uuid: network_uuid.to_string(),
            cpus: params.cpus,
            memory_mb: params.memory_mb,
            disk_base: params.disk_base.clone(),
            disk_size_gb: params.disk_size_gb,
            callback_host: params.callback_host.clone(),
            callback_port: params.callback_port,
            boot,
        }
    }

    /// Create-instance body for one index
    pub fn request(&self, index: usize) -> CreateInstance {
        CreateInstance {
            name: instance_name(index),
            cpus: self.cpus,
            memory: self.memory_mb,
            network: vec![NetworkSpec::on(&self.network_uuid)],
            disk: vec![DiskSpec::root(&self.disk_base, self.disk_size_gb)],
            video: VideoSpec::default(),
            ssh_key: None,
            user_data: self.boot.render_encoded(index, &self.callback_host, self.callback_port),
            namespace: None,
        }
    }
}

pub fn instance_name(index: usize) -> String {
    format!("CallHome-{index}")
}

/// Pacing for worker starts
#[derive(Debug, Clone, Copy, Default)]
pub struct Pacing {
    /// Pause between starting consecutive workers
    pub delay: Duration,
    /// Bound on concurrent create calls
    pub max_concurrent: Option<usize>,
}

/// Starts one launch worker per index
pub struct Launcher<C> {
    client: Arc<C>,
    template: Arc<InstanceTemplate>,
    policy: RetryPolicy,
    pacing: Pacing,
}

impl<C: ControlPlane + 'static> Launcher<C> {
    pub fn new(client: Arc<C>, template: InstanceTemplate, policy: RetryPolicy, pacing: Pacing) -> Self {
        Self {
            client,
            template: Arc::new(template),
            policy,
            pacing,
        }
    }

    /// Launch indices `0..count` in the background.
    ///
    /// The returned task finishes once every worker has finished, so awaiting
    /// it after cancelling guarantees no create call is still in flight.
    pub fn spawn(
        self,
        count: usize,
        tx: mpsc::Sender<LaunchEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(count, tx, cancel))
    }

    async fn run(self, count: usize, tx: mpsc::Sender<LaunchEvent>, cancel: CancellationToken) {
        let semaphore = self
            .pacing
            .max_concurrent
            .map(|n| Arc::new(Semaphore::new(n)));
        let mut workers = JoinSet::new();

        for index in 0..count {
            if cancel.is_cancelled() {
                break;
            }
            workers.spawn(launch_worker(
                self.client.clone(),
                self.template.clone(),
                index,
                self.policy,
                semaphore.clone(),
                tx.clone(),
                cancel.clone(),
            ));

            if !self.pacing.delay.is_zero() && index + 1 < count {
                tokio::select! {
                    _ = tokio::time::sleep(self.pacing.delay) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        drop(tx);

        if cancel.is_cancelled() {
            info!(spawned = workers.len(), "Launch cancelled");
        } else {
            info!(count, "All start requests sent");
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Launch worker panicked");
            }
        }
        debug!("All launch workers finished");
    }
}

async fn launch_worker<C: ControlPlane>(
    client: Arc<C>,
    template: Arc<InstanceTemplate>,
    index: usize,
    policy: RetryPolicy,
    semaphore: Option<Arc<Semaphore>>,
    tx: mpsc::Sender<LaunchEvent>,
    cancel: CancellationToken,
) {
    let permit = match semaphore {
        Some(semaphore) => tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            _ = cancel.cancelled() => return,
        },
        None => None,
    };

    let request = template.request(index);
    let client = client.as_ref();
    let request = &request;
    let outcome = retry(&policy, &cancel, "create_instance", || {
        client.create_instance(request)
    })
    .await;

    let event = match outcome {
        RetryOutcome::Succeeded { value, attempts } => {
            let machine = Machine::from_instance(index, value);
            debug!(index, instance_id = %machine.instance_id, attempts, "Instance created");
            LaunchEvent::Launched(machine)
        }
        RetryOutcome::Exhausted { error, attempts } => {
            warn!(index, attempts, error = %error, "Giving up on instance launch");
            LaunchEvent::GaveUp {
                index,
                error: error.to_string(),
            }
        }
        RetryOutcome::Cancelled { attempts } => {
            debug!(index, attempts, "Launch cancelled");
            return;
        }
    };
    drop(permit);

    if tx.send(event).await.is_err() {
        debug!(index, "Launch result dropped; run already ended");
    }
}
