//! Namespace, key and network setup for a run
//!
//! Every run gets a fresh namespace with a random name and key. Instances
//! and the network are created through a handle authenticated as that
//! namespace; deletes go through the admin handle.

use anyhow::{Context as _, Result};
use rand::RngCore;
use shakenfist_client::{ControlPlane, CreateNetwork};
use std::fmt;
use tracing::{info, instrument, warn};

use super::cleanup;
use crate::config::RunParameters;

/// Name of the key created in each run namespace
pub const KEY_NAME: &str = "loadtest";

/// Prefix of every run namespace
pub const NAMESPACE_PREFIX: &str = "loadtest-";

/// Random bytes in a namespace suffix
const NAMESPACE_SUFFIX_BYTES: usize = 4;

/// Random bytes in a namespace key
const KEY_BYTES: usize = 40;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// Whether `namespace` looks like one created by a run
pub fn is_run_namespace(namespace: &str) -> bool {
    namespace
        .strip_prefix(NAMESPACE_PREFIX)
        .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Generated namespace name and secret key
#[derive(Clone)]
pub struct RunNames {
    pub namespace: String,
    key: String,
}

impl RunNames {
    pub fn generate() -> Self {
        Self {
            namespace: format!("{NAMESPACE_PREFIX}{}", random_hex(NAMESPACE_SUFFIX_BYTES)),
            key: random_hex(KEY_BYTES),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for RunNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunNames")
            .field("namespace", &self.namespace)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Resources created for a run
#[derive(Debug)]
pub struct Provisioned<C> {
    pub namespace: String,
    pub network_uuid: String,
    /// Handle authenticated as the run namespace
    pub scoped: C,
}

/// Create the namespace, its key and the run network.
///
/// On failure the steps that succeeded are unwound (or left behind, with a
/// warning, when rollback is disabled).
#[instrument(skip_all, fields(namespace = %names.namespace))]
pub async fn provision<C: ControlPlane>(
    admin: &C,
    names: &RunNames,
    params: &RunParameters,
) -> Result<Provisioned<C>> {
    let namespace = names.namespace.as_str();

    info!("Creating load test namespace");
    admin
        .create_namespace(namespace)
        .await
        .with_context(|| format!("Failed to create namespace {namespace}"))?;

    let result = async {
        admin
            .create_namespace_key(namespace, KEY_NAME, names.key())
            .await
            .with_context(|| format!("Failed to create key for namespace {namespace}"))?;

        let scoped = admin.scoped(namespace, KEY_NAME, names.key());
        let network = scoped
            .create_network(&CreateNetwork {
                name: namespace.to_string(),
                netblock: params.netblock.clone(),
                provide_dhcp: true,
                provide_nat: true,
                namespace: None,
            })
            .await
            .with_context(|| format!("Failed to create network in namespace {namespace}"))?;
        info!(network_uuid = %network.uuid, netblock = %params.netblock, "Network created");

        Ok::<_, anyhow::Error>(Provisioned {
            namespace: namespace.to_string(),
            network_uuid: network.uuid,
            scoped,
        })
    }
    .await;

    if result.is_err() {
        unwind(admin, namespace, None, params.rollback_on_failure).await;
    }
    result
}

/// Undo a partial setup, or warn about what is left behind
pub async fn unwind<C: ControlPlane>(
    admin: &C,
    namespace: &str,
    network_uuid: Option<&str>,
    rollback: bool,
) {
    if !rollback {
        warn!(
            %namespace,
            "Leaving partially provisioned resources; remove them with `callcentre cleanup --namespace {namespace} --execute`"
        );
        return;
    }

    warn!(%namespace, "Setup failed, rolling back");
    let (network, namespace_result) = cleanup::rollback(admin, namespace, network_uuid).await;
    if !network.is_success() || !namespace_result.is_success() {
        warn!(
            %namespace,
            "Rollback incomplete; remove leftovers with `callcentre cleanup --namespace {namespace} --execute`"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeControlPlane, Op};

    fn params() -> RunParameters {
        RunParameters::new(2, 1, 512, "10.0.0.5")
    }

    #[test]
    fn test_generated_names() {
        let names = RunNames::generate();
        assert!(names.namespace.starts_with("loadtest-"));
        assert_eq!(names.namespace.len(), "loadtest-".len() + 8);
        assert!(is_run_namespace(&names.namespace));
        assert_eq!(names.key().len(), 80);
        assert!(names.key().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(RunNames::generate().key(), names.key());
    }

    #[test]
    fn test_debug_redacts_key() {
        let names = RunNames::generate();
        let debug = format!("{names:?}");
        assert!(debug.contains(&names.namespace));
        assert!(!debug.contains(names.key()));
    }

    #[test]
    fn test_is_run_namespace() {
        assert!(is_run_namespace("loadtest-0a1b2c3d"));
        assert!(!is_run_namespace("loadtest-"));
        assert!(!is_run_namespace("system"));
        assert!(!is_run_namespace("loadtest-prod!"));
    }

    #[tokio::test]
    async fn test_provision_creates_namespace_key_and_network() {
        let fake = FakeControlPlane::new();
        let names = RunNames::generate();

        let provisioned = provision(&fake, &names, &params()).await.unwrap();

        assert_eq!(provisioned.namespace, names.namespace);
        assert!(fake.namespace_exists(&names.namespace));
        assert_eq!(fake.key_for(&names.namespace).as_deref(), Some(names.key()));
        assert_eq!(fake.network_count(), 1);
        assert_eq!(provisioned.scoped.acting_namespace(), Some(names.namespace.as_str()));
    }

    #[tokio::test]
    async fn test_network_failure_rolls_back_namespace() {
        let fake = FakeControlPlane::new();
        fake.fail_op(Op::CreateNetwork);
        let names = RunNames::generate();

        let err = provision(&fake, &names, &params()).await.unwrap_err();

        assert!(err.to_string().contains("Failed to create network"));
        assert_eq!(fake.calls(Op::DeleteNamespace), 1);
        assert!(!fake.namespace_exists(&names.namespace));
    }

    #[tokio::test]
    async fn test_key_failure_rolls_back_namespace() {
        let fake = FakeControlPlane::new();
        fake.fail_op(Op::CreateNamespaceKey);

        provision(&fake, &RunNames::generate(), &params())
            .await
            .unwrap_err();

        assert_eq!(fake.calls(Op::CreateNetwork), 0);
        assert_eq!(fake.calls(Op::DeleteNamespace), 1);
    }

    #[tokio::test]
    async fn test_no_rollback_leaves_namespace() {
        let fake = FakeControlPlane::new();
        fake.fail_op(Op::CreateNetwork);
        let names = RunNames::generate();
        let mut params = params();
        params.rollback_on_failure = false;

        provision(&fake, &names, &params).await.unwrap_err();

        assert_eq!(fake.calls(Op::DeleteNamespace), 0);
        assert!(fake.namespace_exists(&names.namespace));
    }

    #[tokio::test]
    async fn test_namespace_failure_has_nothing_to_unwind() {
        let fake = FakeControlPlane::new();
        fake.fail_op(Op::CreateNamespace);

        let err = provision(&fake, &RunNames::generate(), &params())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Failed to create namespace"));
        assert_eq!(fake.calls(Op::DeleteNamespace), 0);
    }
}
