//! Trait seam over the control-plane operations the load tester consumes.
//!
//! `Client` is the production implementation. Orchestration code is generic
//! over `ControlPlane` so it can run against an in-process fake.

use std::future::Future;

use crate::client::Client;
use crate::error::Result;
use crate::types::{CreateInstance, CreateNetwork, Instance, Network};

/// Control-plane operations used to provision and tear down a load test
pub trait ControlPlane: Send + Sync + Sized {
    /// Create an isolated namespace
    fn create_namespace(&self, namespace: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete a namespace (and its keys)
    fn delete_namespace(&self, namespace: &str) -> impl Future<Output = Result<()>> + Send;

    /// Add a named secret key to a namespace
    fn create_namespace_key(
        &self,
        namespace: &str,
        key_name: &str,
        key: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Create a network
    fn create_network(&self, req: &CreateNetwork) -> impl Future<Output = Result<Network>> + Send;

    /// Delete a single network
    fn delete_network(&self, network_uuid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete every network in a namespace
    fn delete_all_networks(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Create an instance
    fn create_instance(
        &self,
        req: &CreateInstance,
    ) -> impl Future<Output = Result<Instance>> + Send;

    /// Delete a single instance
    fn delete_instance(&self, instance_uuid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete every instance in a namespace
    fn delete_all_instances(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// A handle that authenticates as `namespace` using `key`
    fn scoped(&self, namespace: &str, key_name: &str, key: &str) -> Self;
}

impl ControlPlane for Client {
    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        Client::create_namespace(self, namespace).await
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        Client::delete_namespace(self, namespace).await
    }

    async fn create_namespace_key(&self, namespace: &str, key_name: &str, key: &str) -> Result<()> {
        Client::create_namespace_key(self, namespace, key_name, key).await
    }

    async fn create_network(&self, req: &CreateNetwork) -> Result<Network> {
        Client::create_network(self, req).await
    }

    async fn delete_network(&self, network_uuid: &str) -> Result<()> {
        Client::delete_network(self, network_uuid).await
    }

    async fn delete_all_networks(&self, namespace: &str) -> Result<Vec<String>> {
        Client::delete_all_networks(self, namespace).await
    }

    async fn create_instance(&self, req: &CreateInstance) -> Result<Instance> {
        Client::create_instance(self, req).await
    }

    async fn delete_instance(&self, instance_uuid: &str) -> Result<()> {
        Client::delete_instance(self, instance_uuid).await
    }

    async fn delete_all_instances(&self, namespace: &str) -> Result<Vec<String>> {
        Client::delete_all_instances(self, namespace).await
    }

    fn scoped(&self, namespace: &str, _key_name: &str, key: &str) -> Self {
        Client::scoped(self, namespace, key)
    }
}
