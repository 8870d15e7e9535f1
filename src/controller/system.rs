//! Reconciliation loop for System.
//!
//! The system controller fans the declared definition tree out into
//! Service, NodePool, and lattice Job children inside the system's
//! namespace, and aggregates their statuses back up, classified by
//! priority: Degraded > Updating > Scaling > Stable.
//!
//! Child lookup is three-tiered to tolerate informer cache lag: the
//! system's own recorded status map first, then an uncached label-selector
//! list, and only then a create under a fresh UUID name. Moving a logical
//! path to a different child (a rename) is not supported; the path label
//! is converged, the child identity is not.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::{
    generated_name, path_label_value, system_namespace, Job, JobSpec, JobState, JobStatus,
    NodePool, NodePoolSpec, NodePoolState, NodePoolStatus, Service, ServiceSpec, ServiceState,
    ServiceStatus, System, SystemChildStatus, SystemState, SystemStatus, NODE_POOL_NAME_LABEL,
    NODE_POOL_PATH_LABEL, NODE_POOL_SERVICE_LABEL, PATH_LABEL, SYSTEM_LABEL,
};

pub async fn reconcile(obj: Arc<System>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = system_namespace(&name);

    debug!(name = %name, namespace = %namespace, "Reconciling System");

    let api: Api<System> = Api::all(ctx.client.clone());

    if obj.metadata.deletion_timestamp.is_some() {
        return sync_deleted(&obj, &api, &ctx, &namespace).await;
    }

    if super::ensure_finalizer(&api, &*obj).await? {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    ensure_namespace(&ctx, &name, &namespace).await?;

    let services = sync_services(&obj, &ctx, &namespace).await?;
    let node_pools = sync_node_pools(&obj, &ctx, &namespace).await?;
    let jobs = sync_jobs(&obj, &ctx, &namespace).await?;

    let status = SystemStatus {
        state: system_state(&services, &node_pools, &jobs),
        observed_generation: obj.metadata.generation,
        services,
        node_pools,
        jobs,
    };
    if obj.status.as_ref() != Some(&status) {
        debug!(name = %name, state = %status.state, "Updating system status");
        super::patch_status(&api, &name, &status).await?;
    }

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_reconcile("system", &name, started.elapsed().as_secs_f64());
        health_state.last_reconcile.store(
            Utc::now().timestamp().max(0) as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
        update_system_gauges(&api, health_state).await?;
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Refresh the per-state system gauges from a full list. Every state is
/// written, including zeros, so counts never go stale after transitions.
async fn update_system_gauges(
    api: &Api<System>,
    health_state: &crate::health::HealthState,
) -> Result<(), Error> {
    let mut counts: BTreeMap<SystemState, i64> = [
        SystemState::Pending,
        SystemState::Stable,
        SystemState::Scaling,
        SystemState::Updating,
        SystemState::Degraded,
    ]
    .into_iter()
    .map(|s| (s, 0))
    .collect();

    for system in api.list(&ListParams::default()).await?.items {
        let state = system.status.map(|s| s.state).unwrap_or_default();
        *counts.entry(state).or_insert(0) += 1;
    }

    for (state, count) in counts {
        health_state
            .metrics
            .set_systems_by_state(&state.to_string(), count);
    }
    Ok(())
}

pub fn error_policy(obj: Arc<System>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error("system", &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "System not found (likely deleted)");
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

/// Deletion deletes the system's namespace (children cascade through the
/// orchestrator's own garbage collection) and removes the finalizer only
/// once the namespace is fully gone.
async fn sync_deleted(
    obj: &System,
    api: &Api<System>,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());

    match namespaces.get(namespace).await {
        Ok(ns) => {
            if ns.metadata.deletion_timestamp.is_none() {
                info!(system = %obj.name_any(), namespace = %namespace, "Deleting system namespace");
                match namespaces.delete(namespace, &Default::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(Error::Kube(e)),
                }
            }
            // Still terminating; wait.
            Ok(Action::requeue(Duration::from_secs(15)))
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            super::remove_finalizer(api, obj).await?;
            Ok(Action::await_change())
        }
        Err(e) => Err(Error::Kube(e)),
    }
}

async fn ensure_namespace(ctx: &Context, system: &str, namespace: &str) -> Result<(), Error> {
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());

    let mut labels = BTreeMap::new();
    labels.insert(SYSTEM_LABEL.to_string(), system.to_string());

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    };

    match namespaces.create(&Default::default(), &ns).await {
        Ok(_) => {
            info!(namespace = %namespace, "Created system namespace");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

async fn sync_services(
    system: &System,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeMap<String, SystemChildStatus<ServiceStatus>>, Error> {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let recorded = system
        .status
        .as_ref()
        .map(|s| s.services.clone())
        .unwrap_or_default();

    let mut statuses = BTreeMap::new();
    let mut touched = BTreeSet::new();

    for (path, definition) in &system.spec.definition.services {
        let desired = ServiceSpec {
            definition: definition.clone(),
            ports: definition.ports.clone(),
            num_instances: definition.num_instances,
        };

        let child = match recorded.get(path) {
            Some(entry) => fetch_child(&api, &entry.name, system, path).await?,
            None => match find_by_path(&api, path).await? {
                Some(child) => child,
                None => {
                    let service = Service {
                        metadata: child_metadata(system, namespace, path),
                        spec: desired.clone(),
                        status: None,
                    };
                    info!(system = %system.name_any(), path = %path, "Creating service");
                    api.create(&Default::default(), &service).await?
                }
            },
        };
        let child = converge_child(&api, child, path, |c| {
            if c.spec != desired {
                Some(serde_json::json!({ "spec": desired }))
            } else {
                None
            }
        })
        .await?;

        touched.insert(child.name_any());
        statuses.insert(
            path.clone(),
            SystemChildStatus {
                name: child.name_any(),
                generation: child.metadata.generation.unwrap_or(0),
                status: child.status.unwrap_or_default(),
            },
        );
    }

    // Remove children for paths no longer declared.
    let all = api.list(&ListParams::default()).await?;
    for child in all.items {
        if !touched.contains(&child.name_any()) {
            info!(service = %child.description(), "Deleting extraneous service");
            delete_ignoring_missing(&api, &child.name_any()).await?;
        }
    }

    Ok(statuses)
}

async fn sync_node_pools(
    system: &System,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeMap<String, SystemChildStatus<NodePoolStatus>>, Error> {
    let api: Api<NodePool> = Api::namespaced(ctx.client.clone(), namespace);
    let recorded = system
        .status
        .as_ref()
        .map(|s| s.node_pools.clone())
        .unwrap_or_default();

    let mut statuses = BTreeMap::new();
    let mut touched = BTreeSet::new();

    for (key, definition) in &system.spec.definition.node_pools {
        // Keys are `path:name`; paths never contain a colon.
        let (path, pool_name) = key.split_once(':').ok_or_else(|| {
            Error::Validation(format!("malformed node pool key {key:?} (want path:name)"))
        })?;

        let desired = NodePoolSpec {
            instance_type: definition.instance_type.clone(),
            num_instances: definition.num_instances,
        };

        let child = match recorded.get(key) {
            Some(entry) => fetch_child(&api, &entry.name, system, key).await?,
            None => {
                let selector = format!(
                    "{}={},{}={}",
                    NODE_POOL_PATH_LABEL,
                    path_label_value(path),
                    NODE_POOL_NAME_LABEL,
                    pool_name
                );
                let found = api.list(&ListParams::default().labels(&selector)).await?;
                match found.items.into_iter().next() {
                    Some(child) => child,
                    None => {
                        let mut metadata = child_metadata(system, namespace, path);
                        let labels = metadata.labels.get_or_insert_with(Default::default);
                        labels.insert(
                            NODE_POOL_PATH_LABEL.to_string(),
                            path_label_value(path),
                        );
                        labels.insert(NODE_POOL_NAME_LABEL.to_string(), pool_name.to_string());

                        let pool = NodePool {
                            metadata,
                            spec: desired.clone(),
                            status: None,
                        };
                        info!(system = %system.name_any(), key = %key, "Creating shared node pool");
                        api.create(&Default::default(), &pool).await?
                    }
                }
            }
        };
        let child = converge_child(&api, child, path, |c| {
            if c.spec != desired {
                Some(serde_json::json!({ "spec": desired }))
            } else {
                None
            }
        })
        .await?;

        touched.insert(child.name_any());
        statuses.insert(
            key.clone(),
            SystemChildStatus {
                name: child.name_any(),
                generation: child.metadata.generation.unwrap_or(0),
                status: child.status.unwrap_or_default(),
            },
        );
    }

    // Delete extraneous shared pools. Service-dedicated pools are the
    // service controller's to clean up.
    let all = api.list(&ListParams::default()).await?;
    for child in all.items {
        if child.labels().contains_key(NODE_POOL_SERVICE_LABEL) {
            continue;
        }
        if !touched.contains(&child.name_any()) {
            info!(pool = %child.description(), "Deleting extraneous node pool");
            delete_ignoring_missing(&api, &child.name_any()).await?;
        }
    }

    Ok(statuses)
}

async fn sync_jobs(
    system: &System,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeMap<String, SystemChildStatus<JobStatus>>, Error> {
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let recorded = system
        .status
        .as_ref()
        .map(|s| s.jobs.clone())
        .unwrap_or_default();

    let mut statuses = BTreeMap::new();
    let mut touched = BTreeSet::new();

    for (path, definition) in &system.spec.definition.jobs {
        let desired = JobSpec {
            definition: definition.clone(),
        };

        let child = match recorded.get(path) {
            Some(entry) => fetch_child(&api, &entry.name, system, path).await?,
            None => match find_by_path(&api, path).await? {
                Some(child) => child,
                None => {
                    let job = Job {
                        metadata: child_metadata(system, namespace, path),
                        spec: desired.clone(),
                        status: None,
                    };
                    info!(system = %system.name_any(), path = %path, "Creating job");
                    api.create(&Default::default(), &job).await?
                }
            },
        };
        let child = converge_child(&api, child, path, |c| {
            if c.spec != desired {
                Some(serde_json::json!({ "spec": desired }))
            } else {
                None
            }
        })
        .await?;

        touched.insert(child.name_any());
        statuses.insert(
            path.clone(),
            SystemChildStatus {
                name: child.name_any(),
                generation: child.metadata.generation.unwrap_or(0),
                status: child.status.unwrap_or_default(),
            },
        );
    }

    let all = api.list(&ListParams::default()).await?;
    for child in all.items {
        if !touched.contains(&child.name_any()) {
            info!(job = %child.name_any(), "Deleting extraneous job");
            delete_ignoring_missing(&api, &child.name_any()).await?;
        }
    }

    Ok(statuses)
}

/// Metadata for a freshly created system child: UUID name, path and system
/// labels, controller owner reference back to the (cluster-scoped) system.
fn child_metadata(system: &System, namespace: &str, path: &str) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert(PATH_LABEL.to_string(), path_label_value(path));
    labels.insert(SYSTEM_LABEL.to_string(), system.name_any());

    ObjectMeta {
        name: Some(generated_name()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: system.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Re-fetch a child recorded in the system status. A recorded child that is
/// genuinely missing signals a consistency bug, not a recoverable
/// condition.
async fn fetch_child<K>(api: &Api<K>, name: &str, system: &System, path: &str) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(child) => Ok(child),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::Contract(format!(
            "system {} records child {} for {} but it does not exist",
            system.name_any(),
            name,
            path
        ))),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Uncached lookup by path label.
async fn find_by_path<K>(api: &Api<K>, path: &str) -> Result<Option<K>, Error>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let selector = format!("{}={}", PATH_LABEL, path_label_value(path));
    let found = api.list(&ListParams::default().labels(&selector)).await?;
    Ok(found.items.into_iter().next())
}

/// Converge a child's spec (via the caller-supplied diff) and its path
/// label. The label fix covers a previously failed partial relabel; the
/// child's identity (name) is never changed.
async fn converge_child<K, F>(api: &Api<K>, child: K, path: &str, spec_patch: F) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    F: FnOnce(&K) -> Option<serde_json::Value>,
{
    let mut patches = Vec::new();

    if let Some(patch) = spec_patch(&child) {
        patches.push(patch);
    }

    let expected = path_label_value(path);
    if child.labels().get(PATH_LABEL) != Some(&expected) {
        patches.push(serde_json::json!({
            "metadata": { "labels": { PATH_LABEL: expected } }
        }));
    }

    if patches.is_empty() {
        return Ok(child);
    }

    let mut latest = child;
    for patch in patches {
        latest = api
            .patch(
                &latest.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
    }
    Ok(latest)
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Aggregate child statuses into the system state, by priority:
/// Degraded > Updating > Scaling > Stable. A child whose recorded
/// generation is ahead of its own observed generation counts as Updating.
pub fn system_state(
    services: &BTreeMap<String, SystemChildStatus<ServiceStatus>>,
    node_pools: &BTreeMap<String, SystemChildStatus<NodePoolStatus>>,
    jobs: &BTreeMap<String, SystemChildStatus<JobStatus>>,
) -> SystemState {
    let mut state = SystemState::Stable;

    let mut raise = |candidate: SystemState| {
        if candidate > state {
            state = candidate;
        }
    };

    for child in services.values() {
        if child.status.observed_generation.unwrap_or(0) < child.generation {
            raise(SystemState::Updating);
        }
        match child.status.state {
            ServiceState::Failed => raise(SystemState::Degraded),
            ServiceState::Updating | ServiceState::Deleting => raise(SystemState::Updating),
            ServiceState::Pending | ServiceState::Scaling => raise(SystemState::Scaling),
            ServiceState::Stable => {}
        }
    }

    for child in node_pools.values() {
        if child.status.observed_generation.unwrap_or(0) < child.generation {
            raise(SystemState::Updating);
        }
        match child.status.state {
            NodePoolState::Failed => raise(SystemState::Degraded),
            NodePoolState::Updating | NodePoolState::Deleting => raise(SystemState::Updating),
            NodePoolState::Pending | NodePoolState::Scaling => raise(SystemState::Scaling),
            NodePoolState::Stable => {}
        }
    }

    for child in jobs.values() {
        if child.status.observed_generation.unwrap_or(0) < child.generation {
            raise(SystemState::Updating);
        }
        match child.status.state {
            JobState::Deleting => raise(SystemState::Updating),
            JobState::Pending => raise(SystemState::Scaling),
            JobState::Stable => {}
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_child(state: ServiceState, generation: i64, observed: i64) -> (String, SystemChildStatus<ServiceStatus>) {
        (
            format!("/svc-{state:?}-{generation}-{observed}"),
            SystemChildStatus {
                name: "child".to_string(),
                generation,
                status: ServiceStatus {
                    state,
                    observed_generation: Some(observed),
                    ..Default::default()
                },
            },
        )
    }

    fn services(
        children: Vec<(String, SystemChildStatus<ServiceStatus>)>,
    ) -> BTreeMap<String, SystemChildStatus<ServiceStatus>> {
        children.into_iter().collect()
    }

    #[test]
    fn empty_system_is_stable() {
        assert_eq!(
            system_state(&BTreeMap::new(), &BTreeMap::new(), &BTreeMap::new()),
            SystemState::Stable
        );
    }

    #[test]
    fn degraded_dominates_everything() {
        let svcs = services(vec![
            service_child(ServiceState::Failed, 1, 1),
            service_child(ServiceState::Updating, 1, 1),
            service_child(ServiceState::Scaling, 1, 1),
        ]);
        assert_eq!(
            system_state(&svcs, &BTreeMap::new(), &BTreeMap::new()),
            SystemState::Degraded
        );
    }

    #[test]
    fn updating_beats_scaling() {
        let svcs = services(vec![
            service_child(ServiceState::Updating, 1, 1),
            service_child(ServiceState::Scaling, 1, 1),
        ]);
        assert_eq!(
            system_state(&svcs, &BTreeMap::new(), &BTreeMap::new()),
            SystemState::Updating
        );
    }

    #[test]
    fn lagging_generation_counts_as_updating() {
        // Child reports Stable but has not yet observed its latest spec.
        let svcs = services(vec![service_child(ServiceState::Stable, 5, 4)]);
        assert_eq!(
            system_state(&svcs, &BTreeMap::new(), &BTreeMap::new()),
            SystemState::Updating
        );
    }

    #[test]
    fn all_stable_children_mean_stable() {
        let svcs = services(vec![
            service_child(ServiceState::Stable, 2, 2),
            service_child(ServiceState::Stable, 1, 1),
        ]);
        assert_eq!(
            system_state(&svcs, &BTreeMap::new(), &BTreeMap::new()),
            SystemState::Stable
        );
    }

    #[test]
    fn updating_node_pool_raises_system_state() {
        let pools: BTreeMap<String, SystemChildStatus<NodePoolStatus>> = [(
            "/a:pool".to_string(),
            SystemChildStatus {
                name: "p".to_string(),
                generation: 1,
                status: NodePoolStatus {
                    state: NodePoolState::Updating,
                    observed_generation: Some(1),
                    ..Default::default()
                },
            },
        )]
        .into_iter()
        .collect();
        assert_eq!(
            system_state(&BTreeMap::new(), &pools, &BTreeMap::new()),
            SystemState::Updating
        );
    }
}
