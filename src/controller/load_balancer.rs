//! Reconciliation loop for LoadBalancer.
//!
//! The external side lives entirely behind the cloud provider. The
//! controller holds a finalizer so deprovisioning always runs before the
//! object disappears, and reflects the provider's port map and DNS name
//! into the status and an annotation respectively.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::{
    LoadBalancer, LoadBalancerState, LoadBalancerStatus, Service, LOAD_BALANCER_DNS_NAME_ANNOTATION,
};

pub async fn reconcile(obj: Arc<LoadBalancer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling LoadBalancer");

    let api: Api<LoadBalancer> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return sync_deleted(&obj, &api, &ctx).await;
    }

    if super::ensure_finalizer(&api, &*obj).await? {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let service = services.get(&obj.spec.service).await?;

    let provider = ctx.cloud_provider()?;
    let provision = provider.provision_load_balancer(&obj, &service).await?;

    if let Some(ref dns_name) = provision.dns_name {
        if obj.annotations().get(LOAD_BALANCER_DNS_NAME_ANNOTATION) != Some(dns_name) {
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": { LOAD_BALANCER_DNS_NAME_ANNOTATION: dns_name }
                }
            });
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        }
    }

    let still_provisioning = provision.requeue_after;
    let status = LoadBalancerStatus {
        state: if still_provisioning.is_some() {
            LoadBalancerState::Provisioning
        } else {
            LoadBalancerState::Created
        },
        observed_generation: obj.metadata.generation,
        ports: provision.ports,
    };
    if obj.status.as_ref() != Some(&status) {
        debug!(name = %name, state = %status.state, "Updating load balancer status");
        super::patch_status(&api, &name, &status).await?;
    }

    match still_provisioning {
        Some(after) => Ok(Action::requeue(after)),
        None => Ok(Action::requeue(Duration::from_secs(300))),
    }
}

pub fn error_policy(obj: Arc<LoadBalancer>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("loadbalancer", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Load balancer not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

async fn sync_deleted(
    obj: &LoadBalancer,
    api: &Api<LoadBalancer>,
    ctx: &Context,
) -> Result<Action, Error> {
    let provider = ctx.cloud_provider()?;

    match provider.deprovision_load_balancer(obj).await? {
        Some(after) => {
            debug!(lb = %obj.description(), "Deprovisioning still in flight");
            Ok(Action::requeue(after))
        }
        None => {
            info!(lb = %obj.description(), "Deprovisioned, removing finalizer");
            super::remove_finalizer(api, obj).await?;
            Ok(Action::await_change())
        }
    }
}
