//! Local (single-host, dev cluster) cloud provider.
//!
//! There is no real compute to manage: every node pool epoch is backed by
//! the one local node, so provisioning is immediate and epoch status always
//! reports the requested capacity. Load balancers resolve to the host IP.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::crd::{
    Epoch, EpochStatus, LoadBalancer, LoadBalancerPort, LocalCloudProviderConfig, NodePool,
    NodePoolSpec, NodePoolState, Service,
};

use super::{CloudProvider, LoadBalancerProvision, ProviderError};

/// Default address when the config does not name a host IP.
const DEFAULT_HOST_IP: &str = "127.0.0.1";

pub struct LocalCloudProvider {
    config: LocalCloudProviderConfig,
}

impl LocalCloudProvider {
    pub fn new(config: LocalCloudProviderConfig) -> Self {
        Self { config }
    }

    fn host_ip(&self) -> &str {
        self.config.ip.as_deref().unwrap_or(DEFAULT_HOST_IP)
    }
}

#[async_trait]
impl CloudProvider for LocalCloudProvider {
    async fn node_pool_needs_new_epoch(&self, node_pool: &NodePool) -> Result<bool, ProviderError> {
        let epochs = match &node_pool.status {
            Some(status) => &status.epochs,
            None => return Ok(true),
        };

        let current = match epochs.current() {
            Some(epoch) => epoch,
            None => return Ok(true),
        };

        // Instance count changes scale the epoch in place; an instance type
        // change replaces the backing compute and therefore the epoch.
        let info = epochs.get(current).ok_or_else(|| {
            ProviderError::new(format!(
                "{} has current epoch {} but no info for it",
                node_pool.description(),
                current
            ))
        })?;

        Ok(info.spec.instance_type != node_pool.spec.instance_type)
    }

    async fn ensure_node_pool_epoch(
        &self,
        node_pool: &NodePool,
        epoch: Epoch,
    ) -> Result<(), ProviderError> {
        // The local node backs every epoch; nothing to provision.
        debug!(node_pool = %node_pool.description(), epoch, "Ensured local node pool epoch");
        Ok(())
    }

    async fn destroy_node_pool_epoch(
        &self,
        node_pool: &NodePool,
        epoch: Epoch,
    ) -> Result<(), ProviderError> {
        debug!(node_pool = %node_pool.description(), epoch, "Destroyed local node pool epoch");
        Ok(())
    }

    async fn node_pool_epoch_status(
        &self,
        _node_pool: &NodePool,
        _epoch: Epoch,
        spec: &NodePoolSpec,
    ) -> Result<EpochStatus, ProviderError> {
        // Local capacity is available the moment it is asked for.
        Ok(EpochStatus {
            state: NodePoolState::Stable,
            num_instances: spec.num_instances,
        })
    }

    fn node_pool_annotations(
        &self,
        _node_pool: &NodePool,
        _epoch: Epoch,
    ) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn provision_load_balancer(
        &self,
        _load_balancer: &LoadBalancer,
        service: &Service,
    ) -> Result<LoadBalancerProvision, ProviderError> {
        let mut ports = BTreeMap::new();
        for port in &service.spec.ports {
            if port.public {
                ports.insert(
                    port.port.to_string(),
                    LoadBalancerPort {
                        address: format!("{}:{}", self.host_ip(), port.port),
                    },
                );
            }
        }

        Ok(LoadBalancerProvision {
            ports,
            dns_name: None,
            requeue_after: None,
        })
    }

    async fn deprovision_load_balancer(
        &self,
        load_balancer: &LoadBalancer,
    ) -> Result<Option<Duration>, ProviderError> {
        debug!(load_balancer = %load_balancer.description(), "Deprovisioned local load balancer");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EpochLog, NodePoolStatus, ServicePort, ServiceSpec};
    use kube::core::ObjectMeta;

    fn node_pool(instance_type: &str, status: Option<NodePoolStatus>) -> NodePool {
        let mut pool = NodePool::new(
            "pool",
            crate::crd::NodePoolSpec {
                instance_type: instance_type.to_string(),
                num_instances: 2,
            },
        );
        pool.metadata = ObjectMeta {
            name: Some("pool".to_string()),
            namespace: Some("ns".to_string()),
            ..Default::default()
        };
        pool.status = status;
        pool
    }

    #[tokio::test]
    async fn pool_without_epochs_needs_one() {
        let provider = LocalCloudProvider::new(LocalCloudProviderConfig::default());
        let pool = node_pool("local", None);
        assert!(provider.node_pool_needs_new_epoch(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn instance_type_change_needs_new_epoch() {
        let provider = LocalCloudProvider::new(LocalCloudProviderConfig::default());

        let mut epochs = EpochLog::new();
        epochs.append(crate::crd::NodePoolSpec {
            instance_type: "old".to_string(),
            num_instances: 2,
        });
        let status = NodePoolStatus {
            epochs,
            ..Default::default()
        };

        let pool = node_pool("new", Some(status.clone()));
        assert!(provider.node_pool_needs_new_epoch(&pool).await.unwrap());

        let pool = node_pool("old", Some(status));
        assert!(!provider.node_pool_needs_new_epoch(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn load_balancer_maps_public_ports_to_host_ip() {
        let provider = LocalCloudProvider::new(LocalCloudProviderConfig {
            ip: Some("192.168.1.10".to_string()),
        });

        let mut service = Service::new(
            "svc",
            ServiceSpec {
                definition: Default::default(),
                ports: vec![
                    ServicePort {
                        name: "http".to_string(),
                        port: 8080,
                        public: true,
                    },
                    ServicePort {
                        name: "internal".to_string(),
                        port: 9090,
                        public: false,
                    },
                ],
                num_instances: 1,
            },
        );
        service.metadata.namespace = Some("ns".to_string());

        let lb = LoadBalancer::new(
            "svc",
            crate::crd::LoadBalancerSpec {
                service: "svc".to_string(),
            },
        );

        let provision = provider.provision_load_balancer(&lb, &service).await.unwrap();
        assert_eq!(provision.ports.len(), 1);
        assert_eq!(provision.ports["8080"].address, "192.168.1.10:8080");
        assert!(provision.requeue_after.is_none());
    }
}
