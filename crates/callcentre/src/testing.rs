//! In-process test double for the control plane.
//!
//! `FakeControlPlane` records every call, keeps a tiny model of namespaces,
//! networks and instances, and can be told to fail specific operations.
//! Handles returned by `scoped` share state with their parent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use shakenfist_client::{
    ClientError, ControlPlane, CreateInstance, CreateNetwork, Instance, Network, Result,
};
use tokio::sync::Semaphore;

/// Control-plane operations, for call counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    CreateNamespace,
    DeleteNamespace,
    CreateNamespaceKey,
    CreateNetwork,
    DeleteNetwork,
    DeleteAllNetworks,
    CreateInstance,
    DeleteInstance,
    DeleteAllInstances,
}

#[derive(Debug, Default)]
struct State {
    calls: HashMap<Op, usize>,
    failing: HashSet<Op>,
    not_found: HashSet<Op>,
    /// Remaining transient create failures
    create_failures: usize,
    create_gate: Option<Arc<Semaphore>>,
    namespaces: BTreeSet<String>,
    keys: BTreeMap<String, String>,
    networks: BTreeMap<String, String>,
    /// uuid -> (namespace, name)
    instances: BTreeMap<String, (String, String)>,
    create_requests: Vec<CreateInstance>,
    deleted_instances: Vec<String>,
    next_id: usize,
}

/// Recording, fault-injectable `ControlPlane`
#[derive(Debug, Clone, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<State>>,
    namespace: Option<String>,
}

fn injected(op: Op, status: u16) -> ClientError {
    ClientError::Api {
        method: "FAKE".to_string(),
        path: op.to_string(),
        status,
        message: format!("injected {op} failure"),
    }
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call and return an injected error, if any
    fn enter(&self, op: Op) -> Result<()> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        if state.not_found.contains(&op) {
            return Err(injected(op, 404));
        }
        if state.failing.contains(&op) {
            return Err(injected(op, 500));
        }
        Ok(())
    }

    /// Make every call to `op` fail with a 500
    pub fn fail_op(&self, op: Op) {
        self.lock().failing.insert(op);
    }

    /// Make every call to `op` fail with a 404
    pub fn not_found_op(&self, op: Op) {
        self.lock().not_found.insert(op);
    }

    /// Fail the next `n` create-instance calls, then succeed
    pub fn fail_creates(&self, n: usize) {
        self.lock().create_failures = n;
    }

    /// Block create-instance calls until permits are released on the gate
    pub fn gate_creates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().create_gate = Some(gate.clone());
        gate
    }

    /// Pretend `n` instances already exist in `namespace`
    pub fn seed_instances(&self, namespace: &str, n: usize) {
        let mut state = self.lock();
        for i in 0..n {
            state.next_id += 1;
            let uuid = format!("seed-{}", state.next_id);
            state
                .instances
                .insert(uuid, (namespace.to_string(), format!("seed-{i}")));
        }
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Bodies of every successful create-instance call, in order
    pub fn create_requests(&self) -> Vec<CreateInstance> {
        self.lock().create_requests.clone()
    }

    /// UUIDs passed to single-instance deletes, in order
    pub fn deleted_instances(&self) -> Vec<String> {
        self.lock().deleted_instances.clone()
    }

    pub fn live_instances(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.lock().namespaces.contains(namespace)
    }

    pub fn network_count(&self) -> usize {
        self.lock().networks.len()
    }

    pub fn key_for(&self, namespace: &str) -> Option<String> {
        self.lock().keys.get(namespace).cloned()
    }

    /// Namespace this handle acts in, if scoped
    pub fn acting_namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn uuid(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{:04}", state.next_id)
    }
}

impl ControlPlane for FakeControlPlane {
    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.enter(Op::CreateNamespace)?;
        self.lock().namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.enter(Op::DeleteNamespace)?;
        let mut state = self.lock();
        state.namespaces.remove(namespace);
        state.keys.remove(namespace);
        Ok(())
    }

    async fn create_namespace_key(&self, namespace: &str, _key_name: &str, key: &str) -> Result<()> {
        self.enter(Op::CreateNamespaceKey)?;
        self.lock().keys.insert(namespace.to_string(), key.to_string());
        Ok(())
    }

    async fn create_network(&self, req: &CreateNetwork) -> Result<Network> {
        self.enter(Op::CreateNetwork)?;
        let mut state = self.lock();
        let uuid = Self::uuid(&mut state, "net");
        let namespace = self
            .namespace
            .clone()
            .or_else(|| req.namespace.clone())
            .unwrap_or_default();
        state.networks.insert(uuid.clone(), namespace.clone());
        Ok(Network {
            uuid,
            name: Some(req.name.clone()),
            netblock: Some(req.netblock.clone()),
            namespace: Some(namespace),
            state: Some("created".to_string()),
        })
    }

    async fn delete_network(&self, network_uuid: &str) -> Result<()> {
        self.enter(Op::DeleteNetwork)?;
        self.lock().networks.remove(network_uuid);
        Ok(())
    }

    async fn delete_all_networks(&self, namespace: &str) -> Result<Vec<String>> {
        self.enter(Op::DeleteAllNetworks)?;
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .networks
            .iter()
            .filter(|(_, ns)| ns.as_str() == namespace)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in &doomed {
            state.networks.remove(uuid);
        }
        Ok(doomed)
    }

    async fn create_instance(&self, req: &CreateInstance) -> Result<Instance> {
        let gate = self.lock().create_gate.clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.enter(Op::CreateInstance)?;
        let mut state = self.lock();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(injected(Op::CreateInstance, 507));
        }

        let uuid = Self::uuid(&mut state, "inst");
        let namespace = self.namespace.clone().unwrap_or_default();
        state
            .instances
            .insert(uuid.clone(), (namespace, req.name.clone()));
        state.create_requests.push(req.clone());
        let node = format!("sf-{}", state.next_id % 3 + 1);
        Ok(Instance {
            uuid,
            name: Some(req.name.clone()),
            node: Some(node),
            console_port: None,
            state: Some("created".to_string()),
        })
    }

    async fn delete_instance(&self, instance_uuid: &str) -> Result<()> {
        self.enter(Op::DeleteInstance)?;
        let mut state = self.lock();
        state.deleted_instances.push(instance_uuid.to_string());
        state.instances.remove(instance_uuid);
        Ok(())
    }

    async fn delete_all_instances(&self, namespace: &str) -> Result<Vec<String>> {
        self.enter(Op::DeleteAllInstances)?;
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .instances
            .iter()
            .filter(|(_, (ns, _))| ns.as_str() == namespace)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in &doomed {
            state.instances.remove(uuid);
        }
        Ok(doomed)
    }

    fn scoped(&self, namespace: &str, _key_name: &str, _key: &str) -> Self {
        Self {
            state: self.state.clone(),
            namespace: Some(namespace.to_string()),
        }
    }
}
