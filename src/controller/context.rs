//! Shared context for the controllers.
//!
//! The Context struct holds shared state that is passed to every reconciler:
//! the Kubernetes client, the config store, and the event recorder identity.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::cloud::{new_cloud_provider, CloudProvider};
use crate::controller::config_store::ConfigStore;
use crate::controller::error::{Error, Result};
use crate::controller::lifecycle::LifecycleLocks;
use crate::crd::ConfigSpec;
use crate::health::HealthState;
use crate::mesh::{new_service_mesh, ServiceMesh};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "lattice-operator";

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Singleton config handle
    pub config: ConfigStore,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Per-system exclusivity for deploys and teardowns
    pub lifecycle_locks: LifecycleLocks,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: ConfigStore, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            config,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            lifecycle_locks: LifecycleLocks::default(),
        }
    }

    /// Snapshot the current config. Controllers only start after the
    /// initial-config barrier, so a missing config here is a bug.
    pub fn config_snapshot(&self) -> Result<ConfigSpec> {
        self.config
            .snapshot()
            .ok_or_else(|| Error::MissingField("config not yet observed".to_string()))
    }

    /// The cloud provider selected by the current config.
    pub fn cloud_provider(&self) -> Result<Arc<dyn CloudProvider>> {
        Ok(new_cloud_provider(&self.config_snapshot()?.cloud_provider))
    }

    /// The service mesh selected by the current config.
    pub fn service_mesh(&self) -> Result<Arc<dyn ServiceMesh>> {
        Ok(new_service_mesh(&self.config_snapshot()?.service_mesh))
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish<K>(
        &self,
        resource: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
