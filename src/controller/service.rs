//! Reconciliation loop for Service.
//!
//! Each sync resolves the node pool the service should run on, records the
//! pool and epoch in the service's node pool annotation, converges the
//! backing Deployment, ensures the ServiceAddress (and, for public ports, a
//! LoadBalancer), and derives the service state from deployment readiness.
//!
//! The annotation write is ordered before the status write carrying the new
//! observed generation: the node pool controller treats an unprocessed
//! update as "this service may land on any epoch", so observing the latest
//! generation implies the annotation is current.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::{
    path_label_value, ComponentDefinition, FailureInfo, LoadBalancer, LoadBalancerSpec, NodePool,
    NodePoolAnnotationValue, NodePoolSelector, NodePoolSpec, NodePoolState, Service,
    ServiceAddress, ServiceAddressSpec, ServicePublicPort, ServiceState, ServiceStatus,
    MAIN_COMPONENT, NODE_POOL_ANNOTATION, NODE_POOL_NAME_LABEL, NODE_POOL_PATH_LABEL,
    NODE_POOL_SERVICE_LABEL, PATH_LABEL,
};

/// Label selecting a service's pods.
pub const POD_SERVICE_LABEL: &str = "service.lattice.dev/name";

/// Pod annotation carrying the mesh's service-port -> sidecar-port map.
pub const MESH_PORTS_ANNOTATION: &str = "service.lattice.dev/mesh-ports";

pub async fn reconcile(obj: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling Service");

    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return sync_deleted(&obj, &api).await;
    }

    if super::ensure_finalizer(&api, &*obj).await? {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Resolve the node pool. A shared pool that hasn't been created yet is
    // a wait, not an error.
    let pool = match resolve_node_pool(&obj, &ctx, &namespace).await? {
        Some(pool) => pool,
        None => {
            debug!(name = %name, "Waiting for shared node pool");
            return Ok(Action::requeue(Duration::from_secs(15)));
        }
    };

    let current_epoch = match pool.status.as_ref().and_then(|s| s.epochs.current()) {
        Some(epoch) => epoch,
        None => {
            debug!(name = %name, pool = %pool.description(), "Waiting for node pool epoch");
            return Ok(Action::requeue(Duration::from_secs(15)));
        }
    };
    let pool_stable = pool
        .status
        .as_ref()
        .and_then(|s| s.epochs.current().and_then(|e| s.epochs.get(e)))
        .is_some_and(|info| info.status.state == NodePoolState::Stable);

    if !pool_stable {
        // The deployment is only moved once the target capacity exists.
        debug!(name = %name, pool = %pool.description(), "Waiting for node pool to stabilize");
        return Ok(Action::requeue(Duration::from_secs(15)));
    }

    let deployment = apply_deployment(&obj, &ctx, &namespace).await?;
    let observation = observe_deployment(&obj, deployment.as_ref());

    // Record the (pool, epoch) assignment. While the rollout is still in
    // flight the previous assignment is kept alongside the new one.
    let annotation = node_pool_annotation(&obj, &pool, current_epoch, observation.stable())?;
    update_annotation(&api, &obj, &annotation).await?;

    apply_address(&obj, &ctx, &namespace).await?;
    let public_ports = apply_load_balancer(&obj, &ctx, &namespace).await?;

    let status = next_status(&obj, &observation, public_ports);
    if obj.status.as_ref() != Some(&status) {
        debug!(name = %name, state = %status.state, "Updating service status");
        super::patch_status(&api, &name, &status).await?;
    }

    match status.state {
        ServiceState::Stable => Ok(Action::requeue(Duration::from_secs(60))),
        _ => Ok(Action::requeue(Duration::from_secs(15))),
    }
}

pub fn error_policy(obj: Arc<Service>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("service", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Service not found (likely deleted)");
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

/// Deletion first drains the node pool annotation so the pool controller
/// stops counting this service, then removes the finalizer. Owned resources
/// (deployment, address, load balancer, dedicated pool) follow through
/// garbage collection.
async fn sync_deleted(obj: &Service, api: &Api<Service>) -> Result<Action, Error> {
    let name = obj.name_any();

    if obj.annotations().contains_key(NODE_POOL_ANNOTATION) {
        info!(name = %name, "Draining node pool annotation");
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { NODE_POOL_ANNOTATION: null }
            }
        });
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    super::remove_finalizer(api, obj).await?;
    Ok(Action::await_change())
}

/// Resolve (and for dedicated pools, create or resize) the node pool the
/// service runs on. Returns `None` when a shared pool is not created yet.
async fn resolve_node_pool(
    service: &Service,
    ctx: &Context,
    namespace: &str,
) -> Result<Option<NodePool>, Error> {
    let pools: Api<NodePool> = Api::namespaced(ctx.client.clone(), namespace);

    match &service.spec.definition.node_pool {
        Some(NodePoolSelector::Shared { path, name }) => {
            let selector = format!(
                "{}={},{}={}",
                NODE_POOL_PATH_LABEL,
                path_label_value(path),
                NODE_POOL_NAME_LABEL,
                name
            );
            let found = pools
                .list(&kube::api::ListParams::default().labels(&selector))
                .await?;
            Ok(found.items.into_iter().next())
        }
        Some(NodePoolSelector::Dedicated {
            instance_type,
            num_instances,
        }) => ensure_dedicated_pool(&pools, service, instance_type, *num_instances)
            .await
            .map(Some),
        None => {
            let instance_type = service.spec.definition.instance_type.clone().ok_or_else(|| {
                Error::Validation(format!(
                    "{} specifies neither a node pool nor an instance type",
                    service.description()
                ))
            })?;
            ensure_dedicated_pool(&pools, service, &instance_type, service.spec.num_instances)
                .await
                .map(Some)
        }
    }
}

/// Get or create the pool dedicated to this service, named after it, and
/// converge its spec.
async fn ensure_dedicated_pool(
    pools: &Api<NodePool>,
    service: &Service,
    instance_type: &str,
    num_instances: i32,
) -> Result<NodePool, Error> {
    let name = service.name_any();
    let desired_spec = NodePoolSpec {
        instance_type: instance_type.to_string(),
        num_instances,
    };

    match pools.get(&name).await {
        Ok(pool) => {
            if pool.spec != desired_spec {
                info!(pool = %pool.description(), "Resizing dedicated node pool");
                let patch = serde_json::json!({ "spec": desired_spec });
                let updated = pools
                    .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                return Ok(updated);
            }
            Ok(pool)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            let mut labels = BTreeMap::new();
            labels.insert(NODE_POOL_SERVICE_LABEL.to_string(), name.clone());

            let pool = NodePool {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: service.namespace(),
                    labels: Some(labels),
                    owner_references: service.controller_owner_ref(&()).map(|r| vec![r]),
                    ..Default::default()
                },
                spec: desired_spec,
                status: None,
            };
            info!(service = %service.description(), "Creating dedicated node pool");
            match pools.create(&Default::default(), &pool).await {
                Ok(pool) => Ok(pool),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(pools.get(&name).await?),
                Err(e) => Err(Error::Kube(e)),
            }
        }
        Err(e) => Err(Error::Kube(e)),
    }
}

/// The annotation value to record: just the current assignment once the
/// rollout is stable, the union with the previous assignment while
/// instances may still straddle epochs.
pub fn node_pool_annotation(
    service: &Service,
    pool: &NodePool,
    epoch: crate::crd::Epoch,
    rollout_stable: bool,
) -> Result<NodePoolAnnotationValue, Error> {
    let namespace = pool
        .namespace()
        .ok_or_else(|| Error::MissingField("node pool namespace".to_string()))?;

    let mut annotation = if rollout_stable {
        NodePoolAnnotationValue::default()
    } else {
        service.node_pool_annotation()?
    };
    annotation.add(&namespace, &pool.name_any(), epoch);
    Ok(annotation)
}

async fn update_annotation(
    api: &Api<Service>,
    service: &Service,
    annotation: &NodePoolAnnotationValue,
) -> Result<(), Error> {
    if &service.node_pool_annotation()? == annotation {
        return Ok(());
    }

    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                NODE_POOL_ANNOTATION: serde_json::to_string(annotation)?
            }
        }
    });
    api.patch(
        &service.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// The image the service's main container runs. By the time a service
/// reaches this controller the lifecycle controller has rolled built
/// artifacts into the definition, so every component must be a concrete
/// image.
fn main_image(service: &Service) -> Result<String, Error> {
    match service.spec.definition.components.get(MAIN_COMPONENT) {
        Some(ComponentDefinition::DockerImage { image }) => Ok(image.clone()),
        Some(ComponentDefinition::GitRepository { .. }) => Err(Error::Validation(format!(
            "{} main component has no built artifact",
            service.description()
        ))),
        None => Err(Error::Validation(format!(
            "{} has no main component",
            service.description()
        ))),
    }
}

/// Server-side apply the backing deployment and return its live state.
async fn apply_deployment(
    service: &Service,
    ctx: &Context,
    namespace: &str,
) -> Result<Option<Deployment>, Error> {
    let name = service.name_any();
    let mesh = ctx.service_mesh()?;

    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(POD_SERVICE_LABEL.to_string(), name.clone());

    let mut pod_annotations = mesh.service_annotations(service);
    pod_annotations.insert(
        MESH_PORTS_ANNOTATION.to_string(),
        serde_json::to_string(&mesh.service_ports(service))?,
    );

    let ports: Vec<ContainerPort> = service
        .spec
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.port,
            ..Default::default()
        })
        .collect();

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(pod_labels.clone()),
            owner_references: service.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(service.spec.num_instances),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: MAIN_COMPONENT.to_string(),
                        image: Some(main_image(service)?),
                        ports: if ports.is_empty() { None } else { Some(ports) },
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let applied = api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&deployment),
        )
        .await?;
    Ok(Some(applied))
}

async fn apply_address(service: &Service, ctx: &Context, namespace: &str) -> Result<(), Error> {
    let name = service.name_any();
    let path = service
        .labels()
        .get(PATH_LABEL)
        .cloned()
        .ok_or_else(|| Error::MissingField(format!("{} path label", service.description())))?;

    let address = ServiceAddress {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: service.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: ServiceAddressSpec {
            service: name.clone(),
            path,
        },
        status: None,
    };

    let api: Api<ServiceAddress> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&address),
    )
    .await?;
    Ok(())
}

/// Ensure (or remove) the load balancer for the service's public ports and
/// return the externally reachable addresses observed so far.
async fn apply_load_balancer(
    service: &Service,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeMap<String, ServicePublicPort>, Error> {
    let name = service.name_any();
    let api: Api<LoadBalancer> = Api::namespaced(ctx.client.clone(), namespace);
    let has_public_ports = service.spec.ports.iter().any(|p| p.public);

    if !has_public_ports {
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(Error::Kube(e)),
        }
        return Ok(BTreeMap::new());
    }

    let load_balancer = LoadBalancer {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: service.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: LoadBalancerSpec {
            service: name.clone(),
        },
        status: None,
    };
    let applied = api
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&load_balancer),
        )
        .await?;

    let ports = applied
        .status
        .map(|s| {
            s.ports
                .into_iter()
                .map(|(port, lb)| (port, ServicePublicPort { address: lb.address }))
                .collect()
        })
        .unwrap_or_default();
    Ok(ports)
}

/// What one sync observed about the backing deployment.
#[derive(Clone, Debug, Default)]
pub struct DeploymentObservation {
    /// The deployment controller has seen the latest deployment spec.
    pub update_processed: bool,
    pub desired: i32,
    pub updated: i32,
    pub available: i32,
    pub total: i32,
    pub failure: Option<FailureInfo>,
}

impl DeploymentObservation {
    pub fn stale(&self) -> i32 {
        (self.total - self.updated).max(0)
    }

    /// Fully rolled out: every instance is updated and available.
    pub fn stable(&self) -> bool {
        self.update_processed
            && self.failure.is_none()
            && self.updated == self.desired
            && self.available == self.desired
            && self.total == self.desired
    }
}

fn observe_deployment(service: &Service, deployment: Option<&Deployment>) -> DeploymentObservation {
    let desired = service.spec.num_instances;
    let deployment = match deployment {
        Some(d) => d,
        None => {
            return DeploymentObservation {
                desired,
                ..Default::default()
            }
        }
    };

    let status = deployment.status.clone().unwrap_or_default();
    let update_processed =
        status.observed_generation.unwrap_or(0) >= deployment.metadata.generation.unwrap_or(0);

    let failure = status.conditions.as_ref().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| {
                (c.type_ == "ReplicaFailure" && c.status == "True")
                    || (c.type_ == "Progressing"
                        && c.status == "False"
                        && c.reason.as_deref() == Some("ProgressDeadlineExceeded"))
            })
            .map(|c| {
                if c.reason.as_deref() == Some("ProgressDeadlineExceeded") {
                    FailureInfo::user("timed out")
                } else {
                    FailureInfo::internal(c.message.clone().unwrap_or_default())
                }
            })
    });

    DeploymentObservation {
        update_processed,
        desired,
        updated: status.updated_replicas.unwrap_or(0),
        available: status.available_replicas.unwrap_or(0),
        total: status.replicas.unwrap_or(0),
        failure,
    }
}

/// Derive the service status from the deployment observation and load
/// balancer ports.
pub fn next_status(
    service: &Service,
    observation: &DeploymentObservation,
    public_ports: BTreeMap<String, ServicePublicPort>,
) -> ServiceStatus {
    let (state, failure_info) = if !observation.update_processed {
        (ServiceState::Updating, None)
    } else if let Some(failure) = &observation.failure {
        (ServiceState::Failed, Some(failure.clone()))
    } else if observation.stale() > 0 {
        (ServiceState::Updating, None)
    } else if observation.available != observation.desired {
        (ServiceState::Scaling, None)
    } else {
        (ServiceState::Stable, None)
    };

    ServiceStatus {
        state,
        observed_generation: service.metadata.generation,
        public_ports,
        updated_instances: observation.updated,
        stale_instances: observation.stale(),
        failure_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ServiceSpec;

    fn service(desired: i32) -> Service {
        let mut service = Service::new(
            "svc",
            ServiceSpec {
                definition: Default::default(),
                ports: vec![],
                num_instances: desired,
            },
        );
        service.metadata.namespace = Some("ns".to_string());
        service.metadata.generation = Some(3);
        service
    }

    fn observation(updated: i32, available: i32, total: i32) -> DeploymentObservation {
        DeploymentObservation {
            update_processed: true,
            desired: 3,
            updated,
            available,
            total,
            failure: None,
        }
    }

    #[test]
    fn fully_rolled_out_is_stable() {
        let status = next_status(&service(3), &observation(3, 3, 3), BTreeMap::new());
        assert_eq!(status.state, ServiceState::Stable);
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.stale_instances, 0);
    }

    #[test]
    fn stale_instances_mean_updating() {
        let status = next_status(&service(3), &observation(2, 3, 3), BTreeMap::new());
        assert_eq!(status.state, ServiceState::Updating);
        assert_eq!(status.stale_instances, 1);
    }

    #[test]
    fn short_of_available_means_scaling() {
        let status = next_status(&service(3), &observation(3, 2, 3), BTreeMap::new());
        assert_eq!(status.state, ServiceState::Scaling);
    }

    #[test]
    fn unprocessed_update_means_updating() {
        let mut obs = observation(3, 3, 3);
        obs.update_processed = false;
        let status = next_status(&service(3), &obs, BTreeMap::new());
        assert_eq!(status.state, ServiceState::Updating);
    }

    #[test]
    fn deployment_failure_surfaces_as_failed() {
        let mut obs = observation(3, 3, 3);
        obs.failure = Some(FailureInfo::user("timed out"));
        let status = next_status(&service(3), &obs, BTreeMap::new());
        assert_eq!(status.state, ServiceState::Failed);
        assert_eq!(status.failure_info.unwrap().message, "timed out");
    }

    #[test]
    fn stable_rollout_replaces_annotation() {
        let mut svc = service(1);
        svc.annotations_mut().insert(
            NODE_POOL_ANNOTATION.to_string(),
            serde_json::to_string(&NodePoolAnnotationValue::single("ns", "pool", 1)).unwrap(),
        );
        let mut pool = NodePool::new(
            "pool",
            NodePoolSpec {
                instance_type: "local".to_string(),
                num_instances: 1,
            },
        );
        pool.metadata.namespace = Some("ns".to_string());

        let annotation = node_pool_annotation(&svc, &pool, 2, true).unwrap();
        assert!(annotation.contains_epoch("ns", "pool", 2));
        assert!(!annotation.contains_epoch("ns", "pool", 1));

        // Mid-rollout the old epoch must be kept.
        let straddling = node_pool_annotation(&svc, &pool, 2, false).unwrap();
        assert!(straddling.contains_epoch("ns", "pool", 1));
        assert!(straddling.contains_epoch("ns", "pool", 2));
    }
}
