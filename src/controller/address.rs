//! Reconciliation loop for ServiceAddress.
//!
//! A service address materializes as exactly one owned Endpoint whose spec
//! the configured service mesh computes. The address state mirrors the
//! endpoint: it is Created once the DNS flush loop has picked the endpoint
//! up, Failed if the mesh rejects the address.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::{
    Endpoint, EndpointState, ServiceAddress, ServiceAddressState, ServiceAddressStatus,
};

pub async fn reconcile(obj: Arc<ServiceAddress>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling ServiceAddress");

    let api: Api<ServiceAddress> = Api::namespaced(ctx.client.clone(), &namespace);
    let endpoints: Api<Endpoint> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        // The endpoint is garbage collected through its owner reference.
        return Ok(Action::await_change());
    }

    let mesh = ctx.service_mesh()?;
    let spec = match mesh.endpoint_spec(&obj) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(address = %obj.description(), error = %e, "Mesh rejected address");
            let status = ServiceAddressStatus {
                state: ServiceAddressState::Failed,
                observed_generation: obj.metadata.generation,
            };
            if obj.status.as_ref() != Some(&status) {
                super::patch_status(&api, &name, &status).await?;
            }
            return Ok(Action::await_change());
        }
    };

    let endpoint = Endpoint {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: obj.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec,
        status: None,
    };
    let applied = endpoints
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&endpoint),
        )
        .await?;

    let endpoint_state = applied.status.map(|s| s.state).unwrap_or_default();
    let status = ServiceAddressStatus {
        state: match endpoint_state {
            EndpointState::Created => ServiceAddressState::Created,
            EndpointState::Pending => ServiceAddressState::Pending,
        },
        observed_generation: obj.metadata.generation,
    };
    if obj.status.as_ref() != Some(&status) {
        debug!(name = %name, state = %status.state, "Updating service address status");
        super::patch_status(&api, &name, &status).await?;
    }

    match status.state {
        ServiceAddressState::Created => Ok(Action::requeue(Duration::from_secs(300))),
        _ => Ok(Action::requeue(Duration::from_secs(15))),
    }
}

pub fn error_policy(obj: Arc<ServiceAddress>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("serviceaddress", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Service address not found (likely deleted)");
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
