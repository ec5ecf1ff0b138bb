//! Resource cleanup
//!
//! End-of-run teardown, delete-on-callback, and the orphan cleanup command
//! all go through `classify`, so not-found is always treated as success.

use shakenfist_client::{ClientError, ControlPlane};
use tracing::{info, warn};

/// Kind of control-plane resource being cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Network,
    Namespace,
}

/// Result of a cleanup operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CleanupResult {
    /// Resource was successfully deleted
    Deleted,
    /// Resource was already deleted (not found)
    AlreadyDeleted,
    /// Cleanup failed with error
    Failed,
    /// Resource was skipped (dry run or never created)
    Skipped,
}

impl CleanupResult {
    /// Nothing is left behind
    pub fn is_success(self) -> bool {
        !matches!(self, CleanupResult::Failed)
    }
}

/// Map a delete call's result to a `CleanupResult`, logging failures
fn classify<T>(
    kind: ResourceKind,
    resource_id: &str,
    result: Result<T, ClientError>,
) -> (CleanupResult, Option<T>) {
    match result {
        Ok(value) => {
            info!(resource_type = %kind, resource_id = %resource_id, "Deleted");
            (CleanupResult::Deleted, Some(value))
        }
        Err(e) if e.is_not_found() => {
            info!(resource_type = %kind, resource_id = %resource_id, "Already deleted");
            (CleanupResult::AlreadyDeleted, None)
        }
        Err(e) => {
            warn!(
                resource_type = %kind,
                resource_id = %resource_id,
                error = %e,
                suggestion = e.suggestion().unwrap_or(""),
                "Cleanup failed"
            );
            (CleanupResult::Failed, None)
        }
    }
}

/// Delete one instance right after it phoned home
pub async fn delete_instance<C: ControlPlane>(admin: &C, instance_id: &str) -> CleanupResult {
    let (result, _) = classify(
        ResourceKind::Instance,
        instance_id,
        admin.delete_instance(instance_id).await,
    );
    result
}

/// Outcome of each end-of-run teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub instances: CleanupResult,
    /// Instances removed by the bulk delete
    pub instances_deleted: usize,
    pub network: CleanupResult,
    pub namespace: CleanupResult,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.instances.is_success() && self.network.is_success() && self.namespace.is_success()
    }
}

/// Remove everything the run created.
///
/// Every step is attempted even when an earlier one fails.
pub async fn teardown<C: ControlPlane>(
    admin: &C,
    namespace: &str,
    network_uuid: Option<&str>,
) -> TeardownReport {
    info!(%namespace, "Deleting all instances");
    let (instances, deleted) = classify(
        ResourceKind::Instance,
        namespace,
        admin.delete_all_instances(namespace).await,
    );
    let instances_deleted = deleted.map_or(0, |uuids| uuids.len());

    let network = match network_uuid {
        Some(uuid) => {
            classify(ResourceKind::Network, uuid, admin.delete_network(uuid).await).0
        }
        None => CleanupResult::Skipped,
    };

    let (namespace_result, _) = classify(
        ResourceKind::Namespace,
        namespace,
        admin.delete_namespace(namespace).await,
    );

    TeardownReport {
        instances,
        instances_deleted,
        network,
        namespace: namespace_result,
    }
}

/// Unwind a failed setup: the network (if created), then the namespace
pub async fn rollback<C: ControlPlane>(
    admin: &C,
    namespace: &str,
    network_uuid: Option<&str>,
) -> (CleanupResult, CleanupResult) {
    let network = match network_uuid {
        Some(uuid) => {
            classify(ResourceKind::Network, uuid, admin.delete_network(uuid).await).0
        }
        None => CleanupResult::Skipped,
    };
    let (namespace_result, _) = classify(
        ResourceKind::Namespace,
        namespace,
        admin.delete_namespace(namespace).await,
    );
    (network, namespace_result)
}

/// Outcome of `callcentre cleanup`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCleanupReport {
    pub namespace: String,
    pub instances: CleanupResult,
    pub deleted_instances: Vec<String>,
    pub networks: CleanupResult,
    pub deleted_networks: Vec<String>,
    pub namespace_result: CleanupResult,
}

/// Remove whatever a failed run left inside `namespace`.
///
/// Without `execute` nothing is deleted and every step reports `Skipped`.
pub async fn cleanup_namespace<C: ControlPlane>(
    admin: &C,
    namespace: &str,
    execute: bool,
) -> OrphanCleanupReport {
    if !execute {
        info!(%namespace, "Dry run: would delete all instances, all networks, then the namespace");
        return OrphanCleanupReport {
            namespace: namespace.to_string(),
            instances: CleanupResult::Skipped,
            deleted_instances: Vec::new(),
            networks: CleanupResult::Skipped,
            deleted_networks: Vec::new(),
            namespace_result: CleanupResult::Skipped,
        };
    }

    let (instances, deleted_instances) = classify(
        ResourceKind::Instance,
        namespace,
        admin.delete_all_instances(namespace).await,
    );
    let (networks, deleted_networks) = classify(
        ResourceKind::Network,
        namespace,
        admin.delete_all_networks(namespace).await,
    );
    let (namespace_result, _) = classify(
        ResourceKind::Namespace,
        namespace,
        admin.delete_namespace(namespace).await,
    );

    OrphanCleanupReport {
        namespace: namespace.to_string(),
        instances,
        deleted_instances: deleted_instances.unwrap_or_default(),
        networks,
        deleted_networks: deleted_networks.unwrap_or_default(),
        namespace_result,
    }
}
