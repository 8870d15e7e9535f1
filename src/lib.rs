//! lattice-operator library crate
//!
//! This module exports the CRD definitions, the reconcilers, the cloud
//! provider and service mesh seams, and the wiring that runs everything.

pub mod api;
pub mod bootstrap;
pub mod cloud;
pub mod controller;
pub mod crd;
pub mod dns;
pub mod health;
pub mod leader_election;
pub mod mesh;

pub use health::HealthState;

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job as BatchJob;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, info};

use controller::config_store::ConfigStore;
use controller::context::Context;
use controller::error::Error;
use crd::{
    system_for_namespace, Build, ComponentBuild, Config, Deploy, Endpoint, Job, JobRun,
    LoadBalancer, NodePool, Service, ServiceAddress, ServiceBuild, System, Teardown,
    INTERNAL_NAMESPACE, SERVICE_BUILD_BUILD_LABEL,
};

/// Create the default watcher configuration for all controllers.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

type ControllerError = kube::runtime::controller::Error<Error, watcher::Error>;

/// Log one reconcile outcome. Not-found errors after deletion are routine
/// and logged at debug.
fn log_result<K>(name: &'static str, result: Result<(ObjectRef<K>, Action), ControllerError>)
where
    K: Resource,
    K::DynamicType: Debug,
{
    match result {
        Ok((obj, _action)) => {
            debug!(controller = name, object = ?obj, "Reconciled");
        }
        Err(e) => {
            let is_not_found = match &e {
                kube::runtime::controller::Error::ObjectNotFound(_) => true,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!(controller = name, "Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!(controller = name, "Reconciliation error: {:?}", e);
            }
        }
    }
}

/// Run every lattice controller until the process shuts down.
///
/// The config controller starts first and everything else blocks on the
/// initial-config barrier, so no reconciler ever observes an unset config.
pub async fn run_controllers(client: Client, health_state: Option<Arc<HealthState>>) {
    let config_store = ConfigStore::new();
    let ctx = Arc::new(Context::new(
        client.clone(),
        config_store.clone(),
        health_state.clone(),
    ));
    let wc = default_watcher_config();

    let mut controllers: Vec<BoxFuture<'static, ()>> = Vec::new();

    // Config first: it feeds the barrier the rest of the startup waits on.
    let configs: Api<Config> = Api::namespaced(client.clone(), INTERNAL_NAMESPACE);
    controllers.push(
        Controller::new(configs, wc.clone())
            .run(
                controller::config::reconcile,
                controller::config::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("config", result) })
            .boxed(),
    );

    let barrier = {
        let config_store = config_store.clone();
        async move {
            info!("Waiting for initial config");
            config_store.initial_config().await;
            info!("Initial config observed, starting controllers");
        }
    };

    // System: fans out over namespaced children, which map back by their
    // namespace.
    let systems: Api<System> = Api::all(client.clone());
    let system_mapper = |namespace: Option<String>| {
        namespace
            .as_deref()
            .and_then(system_for_namespace)
            .map(|s| ObjectRef::<System>::new(s))
    };
    controllers.push(
        Controller::new(systems, wc.clone())
            .watches(Api::<Service>::all(client.clone()), wc.clone(), move |s| {
                system_mapper(s.namespace())
            })
            .watches(Api::<NodePool>::all(client.clone()), wc.clone(), move |p| {
                system_mapper(p.namespace())
            })
            .watches(Api::<Job>::all(client.clone()), wc.clone(), move |j| {
                system_mapper(j.namespace())
            })
            .run(
                controller::system::reconcile,
                controller::system::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("system", result) })
            .boxed(),
    );

    // Service: owns its deployment, address, load balancer, and dedicated
    // node pool.
    controllers.push(
        Controller::new(Api::<Service>::all(client.clone()), wc.clone())
            .owns(Api::<Deployment>::all(client.clone()), wc.clone())
            .owns(Api::<ServiceAddress>::all(client.clone()), wc.clone())
            .owns(Api::<LoadBalancer>::all(client.clone()), wc.clone())
            .owns(Api::<NodePool>::all(client.clone()), wc.clone())
            .run(
                controller::service::reconcile,
                controller::service::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("service", result) })
            .boxed(),
    );

    // NodePool: a service's annotation names the pools whose epochs it
    // blocks, so annotation changes requeue exactly those pools.
    controllers.push(
        Controller::new(Api::<NodePool>::all(client.clone()), wc.clone())
            .watches(
                Api::<Service>::all(client.clone()),
                wc.clone(),
                |service: Service| {
                    let value = service.node_pool_annotation().unwrap_or_default();
                    value
                        .0
                        .into_keys()
                        .filter_map(|key| {
                            let (namespace, name) = key.split_once('/')?;
                            Some(ObjectRef::<NodePool>::new(name).within(namespace))
                        })
                        .collect::<Vec<_>>()
                },
            )
            .run(
                controller::node_pool::reconcile,
                controller::node_pool::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("nodepool", result) })
            .boxed(),
    );

    // Build chain: Build -> ServiceBuild -> ComponentBuild -> batch Job.
    controllers.push(
        Controller::new(Api::<Build>::all(client.clone()), wc.clone())
            .watches(
                Api::<ServiceBuild>::all(client.clone()),
                wc.clone(),
                |sb: ServiceBuild| {
                    let namespace = sb.namespace()?;
                    let build = sb.labels().get(SERVICE_BUILD_BUILD_LABEL)?.clone();
                    Some(ObjectRef::<Build>::new(&build).within(&namespace))
                },
            )
            .run(
                controller::build::reconcile,
                controller::build::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("build", result) })
            .boxed(),
    );
    controllers.push(
        Controller::new(Api::<ServiceBuild>::all(client.clone()), wc.clone())
            .owns(Api::<ComponentBuild>::all(client.clone()), wc.clone())
            .run(
                controller::service_build::reconcile,
                controller::service_build::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("servicebuild", result) })
            .boxed(),
    );
    controllers.push(
        Controller::new(Api::<ComponentBuild>::all(client.clone()), wc.clone())
            .owns(Api::<BatchJob>::all(client.clone()), wc.clone())
            .run(
                controller::component_build::reconcile,
                controller::component_build::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("componentbuild", result) })
            .boxed(),
    );

    // Lifecycle workflows poll the system and their build on requeue.
    controllers.push(
        Controller::new(Api::<Deploy>::all(client.clone()), wc.clone())
            .run(
                controller::lifecycle::reconcile_deploy,
                controller::lifecycle::deploy_error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("deploy", result) })
            .boxed(),
    );
    controllers.push(
        Controller::new(Api::<Teardown>::all(client.clone()), wc.clone())
            .run(
                controller::lifecycle::reconcile_teardown,
                controller::lifecycle::teardown_error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("teardown", result) })
            .boxed(),
    );

    // Jobs and their invocations.
    controllers.push(
        Controller::new(Api::<Job>::all(client.clone()), wc.clone())
            .run(
                controller::job::reconcile_job,
                controller::job::job_error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("job", result) })
            .boxed(),
    );
    controllers.push(
        Controller::new(Api::<JobRun>::all(client.clone()), wc.clone())
            .owns(Api::<BatchJob>::all(client.clone()), wc.clone())
            .run(
                controller::job::reconcile_job_run,
                controller::job::job_run_error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("jobrun", result) })
            .boxed(),
    );

    // Addressing.
    controllers.push(
        Controller::new(Api::<ServiceAddress>::all(client.clone()), wc.clone())
            .owns(Api::<Endpoint>::all(client.clone()), wc.clone())
            .run(
                controller::address::reconcile,
                controller::address::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("serviceaddress", result) })
            .boxed(),
    );
    controllers.push(
        Controller::new(Api::<LoadBalancer>::all(client.clone()), wc.clone())
            .run(
                controller::load_balancer::reconcile,
                controller::load_balancer::error_policy,
                ctx.clone(),
            )
            .for_each(|result| async move { log_result("loadbalancer", result) })
            .boxed(),
    );

    // The DNS flush loop serves endpoint records for the local provider.
    let flusher = dns::DnsFlusher::new(client.clone(), config_store.clone(), Default::default());
    controllers.push(flusher.run().boxed());

    // Start the config controller immediately; gate the rest on the
    // barrier.
    let config_controller = controllers.remove(0);
    let rest = async move {
        barrier.await;
        if let Some(ref state) = health_state {
            state.set_ready(true).await;
        }
        futures::future::join_all(controllers).await;
    };

    futures::future::join(config_controller, rest).await;
    error!("Controller streams ended unexpectedly");
}
