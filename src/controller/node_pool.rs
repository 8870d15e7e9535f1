//! Reconciliation loop for NodePool.
//!
//! The pool's compute is managed as an epoch log (see `crd::node_pool`).
//! Each sync refreshes every epoch's live status from the cloud provider,
//! appends a new epoch when the provider says the spec diverged in a
//! replacing way, provisions the current epoch, and then tries to retire
//! every older epoch.
//!
//! The status carrying a new Pending epoch is persisted *before* the
//! provider is asked to provision it, so a crash between the two leaves a
//! record of the epoch rather than untracked compute.
//!
//! Retirement must never destroy capacity a service might still depend on;
//! the only source of truth consulted is the services' node pool
//! annotations, per [`service_running_on_epoch`].

use std::sync::Arc;
use std::time::Duration;

use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::cloud::CloudProvider;
use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::{
    Epoch, EpochInfo, EpochLog, NodePool, NodePoolState, NodePoolStatus, Service,
};

pub async fn reconcile(obj: Arc<NodePool>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling NodePool");

    let api: Api<NodePool> = Api::namespaced(ctx.client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let provider = ctx.cloud_provider()?;

    if obj.metadata.deletion_timestamp.is_some() {
        return sync_deleted(&obj, &api, &services, provider.as_ref()).await;
    }

    if super::ensure_finalizer(&api, &*obj).await? {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    sync_active(&obj, &api, &services, provider.as_ref()).await
}

pub fn error_policy(obj: Arc<NodePool>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("nodepool", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Node pool not found (likely deleted)");
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

async fn sync_active(
    pool: &NodePool,
    api: &Api<NodePool>,
    services: &Api<Service>,
    provider: &dyn CloudProvider,
) -> Result<Action, Error> {
    let name = pool.name_any();
    let mut last_written = pool.status.clone().unwrap_or_default();

    // Refresh the live status of every recorded epoch.
    let mut epochs = EpochLog::new();
    for epoch in last_written.epochs.epochs().collect::<Vec<_>>() {
        let info = last_written.epochs.get(epoch).ok_or_else(|| {
            Error::Contract(format!(
                "could not get info for {} epoch {}",
                pool.description(),
                epoch
            ))
        })?;
        let status = provider
            .node_pool_epoch_status(pool, epoch, &info.spec)
            .await?;
        epochs.set(
            epoch,
            EpochInfo {
                spec: info.spec.clone(),
                status,
            },
        );
    }

    let current = if provider.node_pool_needs_new_epoch(pool).await? {
        let epoch = epochs.append(pool.spec.clone());
        info!(name = %name, epoch, "Appending new node pool epoch");
        epoch
    } else {
        epochs.current().ok_or_else(|| {
            Error::Contract(format!(
                "provider reported {} does not need a new epoch, but it has no current epoch",
                pool.description()
            ))
        })?
    };

    // Persist before provisioning.
    update_status(api, &name, pool, &mut last_written, epochs.clone()).await?;

    provider.ensure_node_pool_epoch(pool, current).await?;
    update_annotations(api, pool, provider, current).await?;

    // Re-read the current epoch against the (possibly scaled) pool spec.
    let status = provider
        .node_pool_epoch_status(pool, current, &pool.spec)
        .await?;
    epochs.set(
        current,
        EpochInfo {
            spec: pool.spec.clone(),
            status,
        },
    );

    let all_services = services.list(&ListParams::default()).await?.items;
    retire_epochs(pool, &mut epochs, &all_services, provider, false).await?;

    update_status(api, &name, pool, &mut last_written, epochs.clone()).await?;

    if epochs.len() > 1 {
        // Old epochs are waiting on services to move; check back soon.
        Ok(Action::requeue(Duration::from_secs(15)))
    } else {
        Ok(Action::requeue(Duration::from_secs(60)))
    }
}

/// Deletion drains every epoch, current included. The finalizer is removed
/// only once the epoch log is empty.
async fn sync_deleted(
    pool: &NodePool,
    api: &Api<NodePool>,
    services: &Api<Service>,
    provider: &dyn CloudProvider,
) -> Result<Action, Error> {
    let name = pool.name_any();
    let mut last_written = pool.status.clone().unwrap_or_default();
    let mut epochs = last_written.epochs.clone();

    let all_services = services.list(&ListParams::default()).await?.items;
    retire_epochs(pool, &mut epochs, &all_services, provider, true).await?;

    update_status(api, &name, pool, &mut last_written, epochs.clone()).await?;

    if epochs.is_empty() {
        info!(name = %name, "All epochs retired, removing finalizer");
        super::remove_finalizer(api, pool).await?;
        return Ok(Action::await_change());
    }

    debug!(name = %name, remaining = epochs.len(), "Epochs still draining");
    Ok(Action::requeue(Duration::from_secs(15)))
}

/// Destroy and drop every retirable epoch. With `retire_current` false the
/// current epoch is never considered.
async fn retire_epochs(
    pool: &NodePool,
    epochs: &mut EpochLog,
    services: &[Service],
    provider: &dyn CloudProvider,
    retire_current: bool,
) -> Result<(), Error> {
    let namespace = pool
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;
    let name = pool.name_any();
    let current = epochs.current();

    for epoch in epochs.epochs().collect::<Vec<_>>() {
        if !retire_current && Some(epoch) == current {
            continue;
        }

        if service_running_on_epoch(&namespace, &name, epoch, services) {
            debug!(pool = %pool.description(), epoch, "Epoch still potentially in use");
            continue;
        }

        info!(pool = %pool.description(), epoch, "Retiring epoch");
        provider.destroy_node_pool_epoch(pool, epoch).await?;
        epochs.remove(epoch);
    }

    Ok(())
}

/// Whether any service could still be running on (or about to be assigned
/// to) the given epoch. Conservative by construction: any doubt counts as
/// running.
pub fn service_running_on_epoch(
    pool_namespace: &str,
    pool_name: &str,
    epoch: Epoch,
    services: &[Service],
) -> bool {
    for service in services {
        let annotation = match service.node_pool_annotation() {
            Ok(annotation) => annotation,
            Err(err) => {
                // A permanently malformed annotation must not wedge the
                // pool forever, so it does not block retirement.
                warn!(
                    service = %service.description(),
                    error = %err,
                    "Skipping service with malformed node pool annotation"
                );
                continue;
            }
        };

        // A deleting service that names the epoch is still draining from
        // it; one that doesn't will never acquire it.
        if service.deleted() {
            if annotation.contains_epoch(pool_namespace, pool_name, epoch) {
                return true;
            }
            continue;
        }

        // Not yet assigned anywhere: the service controller may be about
        // to assign it to this epoch.
        if annotation.is_empty() {
            return true;
        }

        if annotation.contains_epoch(pool_namespace, pool_name, epoch) {
            return true;
        }

        // Already on a strictly larger epoch of this pool: epochs are only
        // ever assigned upward, so the service will never come back to this
        // one, even while an update is pending.
        if annotation.contains_larger_epoch(pool_namespace, pool_name, epoch) {
            continue;
        }

        // The service controller hasn't processed the latest spec; it may
        // be about to assign the service to this epoch, wherever it sits
        // today.
        if !service.update_processed() {
            return true;
        }
    }

    false
}

/// State of the pool as a whole, derived from the epoch log.
pub fn pool_state(epochs: &EpochLog) -> NodePoolState {
    if epochs.is_empty() {
        return NodePoolState::Pending;
    }
    if epochs.len() > 1 {
        return NodePoolState::Updating;
    }
    epochs
        .current()
        .and_then(|e| epochs.get(e))
        .map(|info| info.status.state)
        .unwrap_or(NodePoolState::Pending)
}

async fn update_status(
    api: &Api<NodePool>,
    name: &str,
    pool: &NodePool,
    last_written: &mut NodePoolStatus,
    epochs: EpochLog,
) -> Result<(), Error> {
    let status = NodePoolStatus {
        state: pool_state(&epochs),
        observed_generation: pool.metadata.generation,
        epochs,
    };
    if *last_written != status {
        super::patch_status(api, name, &status).await?;
        *last_written = status;
    }
    Ok(())
}

async fn update_annotations(
    api: &Api<NodePool>,
    pool: &NodePool,
    provider: &dyn CloudProvider,
    epoch: Epoch,
) -> Result<(), Error> {
    let extra = provider.node_pool_annotations(pool, epoch);
    if extra.is_empty() {
        return Ok(());
    }

    let mut annotations = pool.annotations().clone();
    annotations.extend(extra);
    if &annotations == pool.annotations() {
        return Ok(());
    }

    let patch = serde_json::json!({
        "metadata": {
            "annotations": annotations
        }
    });
    api.patch(
        &pool.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
