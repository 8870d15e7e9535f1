//! The cloud provider contract consumed by the node pool, service, and load
//! balancer controllers.
//!
//! Implementations manage the compute epochs backing node pools and the
//! external load balancers fronting public services. Every operation must be
//! safe to call repeatedly with the same target state; the controllers lean
//! on that for crash-resumability.

mod local;

pub use local::LocalCloudProvider;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::{
    CloudProviderConfig, Epoch, EpochStatus, LoadBalancer, LoadBalancerPort, NodePool, NodePoolSpec,
    Service,
};

/// Error from a cloud provider operation. Always retryable through the
/// controller queue.
#[derive(Error, Debug)]
#[error("cloud provider error: {0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result of (de)provisioning a load balancer.
#[derive(Clone, Debug, Default)]
pub struct LoadBalancerProvision {
    /// Service port -> externally reachable address. Empty while the
    /// provider is still provisioning.
    pub ports: BTreeMap<String, LoadBalancerPort>,

    /// Provider-assigned DNS name, if any.
    pub dns_name: Option<String>,

    /// If set, provisioning is still in flight and the controller should
    /// requeue after this duration rather than treat the result as final.
    pub requeue_after: Option<Duration>,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Whether the pool's spec has diverged from its current epoch in a way
    /// that requires replacing the backing compute rather than scaling it
    /// in place.
    async fn node_pool_needs_new_epoch(&self, node_pool: &NodePool) -> Result<bool, ProviderError>;

    /// Bring the given epoch's compute to the state its recorded spec
    /// demands. Idempotent.
    async fn ensure_node_pool_epoch(
        &self,
        node_pool: &NodePool,
        epoch: Epoch,
    ) -> Result<(), ProviderError>;

    /// Destroy the given epoch's compute. Idempotent; succeeds if the
    /// compute is already gone.
    async fn destroy_node_pool_epoch(
        &self,
        node_pool: &NodePool,
        epoch: Epoch,
    ) -> Result<(), ProviderError>;

    /// Live status of the given epoch. This is a real-world read, not a
    /// cache read: compute state changes outside the reconciliation loop.
    async fn node_pool_epoch_status(
        &self,
        node_pool: &NodePool,
        epoch: Epoch,
        spec: &NodePoolSpec,
    ) -> Result<EpochStatus, ProviderError>;

    /// Provider-specific bookkeeping annotations dependents need (e.g. an
    /// autoscaling group name for the load balancer controller).
    fn node_pool_annotations(&self, node_pool: &NodePool, epoch: Epoch)
        -> BTreeMap<String, String>;

    /// Provision (or converge) the load balancer for a service's public
    /// ports.
    async fn provision_load_balancer(
        &self,
        load_balancer: &LoadBalancer,
        service: &Service,
    ) -> Result<LoadBalancerProvision, ProviderError>;

    /// Tear down the load balancer's external resources. Returns a requeue
    /// hint while deprovisioning is still in flight, `None` once done.
    async fn deprovision_load_balancer(
        &self,
        load_balancer: &LoadBalancer,
    ) -> Result<Option<Duration>, ProviderError>;
}

/// Construct the provider selected by the config. Exhaustive by
/// construction: adding a provider variant will not compile until it is
/// handled here.
pub fn new_cloud_provider(config: &CloudProviderConfig) -> Arc<dyn CloudProvider> {
    match config {
        CloudProviderConfig::Local(local) => Arc::new(LocalCloudProvider::new(local.clone())),
    }
}
