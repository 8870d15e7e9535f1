//! Reconciliation loops for Deploy and Teardown.
//!
//! Both are one-shot workflows scoped to a single system, and at most one
//! of either kind may be actively mutating a system at a time. Exclusivity
//! is an in-process lock table keyed by system name; the table is safe
//! because leader election guarantees a single active operator.
//!
//! A deploy waits for its build to succeed, then rolls the built definition
//! onto the system spec (git components replaced with the built images) and
//! waits for the system to settle. A teardown rolls the empty definition on
//! and waits the same way.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::Error;
use crate::crd::{
    system_for_namespace, Build, BuildState, BuildStatus, ComponentDefinition, Deploy, DeployState,
    DeployStatus, System, SystemDefinition, SystemState, Teardown, TeardownState, TeardownStatus,
};

/// Who holds a system's lifecycle lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOwner {
    pub kind: LockKind,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Deploy,
    Teardown,
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LockKind::Deploy => write!(f, "deploy {}", self.name),
            LockKind::Teardown => write!(f, "teardown {}", self.name),
        }
    }
}

/// In-process lock table granting one Deploy or Teardown exclusive access
/// to a system. Acquisition is idempotent for the holder, which lets a
/// restarted operator re-acquire on behalf of an already-Accepted workflow.
#[derive(Clone, Default)]
pub struct LifecycleLocks {
    table: Arc<Mutex<BTreeMap<String, LockOwner>>>,
}

impl LifecycleLocks {
    /// Try to take the lock for `system`. Returns the current owner on
    /// conflict.
    pub fn acquire(&self, system: &str, owner: LockOwner) -> Result<(), LockOwner> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        match table.get(system) {
            Some(held) if *held != owner => Err(held.clone()),
            _ => {
                table.insert(system.to_string(), owner);
                Ok(())
            }
        }
    }

    /// Release the lock for `system` if `owner` holds it. Releasing a lock
    /// held by someone else (or by nobody) is a no-op.
    pub fn release(&self, system: &str, owner: &LockOwner) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.get(system) == Some(owner) {
            table.remove(system);
        }
    }
}

pub async fn reconcile_deploy(obj: Arc<Deploy>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;
    let system = system_name(&namespace)?;

    debug!(name = %name, system = %system, "Reconciling Deploy");

    let api: Api<Deploy> = Api::namespaced(ctx.client.clone(), &namespace);
    let builds: Api<Build> = Api::namespaced(ctx.client.clone(), &namespace);
    let systems: Api<System> = Api::all(ctx.client.clone());

    let owner = LockOwner {
        kind: LockKind::Deploy,
        name: name.clone(),
    };

    if obj.metadata.deletion_timestamp.is_some() {
        ctx.lifecycle_locks.release(&system, &owner);
        return Ok(Action::await_change());
    }

    let observed = obj.status.clone().unwrap_or_default();
    match observed.state {
        DeployState::Pending => {
            let build_name = match resolve_build(&obj, &builds).await? {
                Ok(build_name) => build_name,
                Err(message) => {
                    let status = terminal_deploy_status(&observed, &obj, DeployState::Failed, message);
                    super::patch_status(&api, &name, &status).await?;
                    return Ok(Action::await_change());
                }
            };

            if let Err(held_by) = ctx.lifecycle_locks.acquire(&system, owner) {
                debug!(name = %name, held_by = %held_by, "System busy, deploy waiting");
                let status = DeployStatus {
                    state: DeployState::Pending,
                    observed_generation: obj.metadata.generation,
                    build_name: Some(build_name),
                    message: Some(format!("waiting for {held_by} to finish")),
                    ..observed
                };
                if obj.status.as_ref() != Some(&status) {
                    super::patch_status(&api, &name, &status).await?;
                }
                return Ok(Action::requeue(Duration::from_secs(15)));
            }

            info!(name = %name, system = %system, build = %build_name, "Deploy accepted");
            ctx.publish_normal_event(
                &*obj,
                "Accepted",
                "Deploy",
                Some(format!("deploying build {build_name}")),
            )
            .await;
            let status = DeployStatus {
                state: DeployState::Accepted,
                observed_generation: obj.metadata.generation,
                build_name: Some(build_name),
                message: None,
                start_timestamp: observed.start_timestamp.or_else(|| Some(Utc::now())),
                completion_timestamp: None,
            };
            super::patch_status(&api, &name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }

        DeployState::Accepted => {
            // The operator may have restarted since acceptance.
            if let Err(held_by) = ctx.lifecycle_locks.acquire(&system, owner.clone()) {
                return Err(Error::Contract(format!(
                    "{} was accepted but the system lock is held by {}",
                    obj.description(),
                    held_by
                )));
            }

            let build_name = observed
                .build_name
                .clone()
                .ok_or_else(|| Error::MissingField("status.buildName".to_string()))?;
            let build = match builds.get(&build_name).await {
                Ok(build) => build,
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    ctx.lifecycle_locks.release(&system, &owner);
                    let status = terminal_deploy_status(
                        &observed,
                        &obj,
                        DeployState::Failed,
                        format!("build {build_name} no longer exists"),
                    );
                    super::patch_status(&api, &name, &status).await?;
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(Error::Kube(e)),
            };

            let build_status = build.status.clone().unwrap_or_default();
            match build_status.state {
                BuildState::Failed => {
                    ctx.lifecycle_locks.release(&system, &owner);
                    ctx.publish_warning_event(
                        &*obj,
                        "BuildFailed",
                        "Deploy",
                        Some(format!("build {build_name} failed")),
                    )
                    .await;
                    let status = terminal_deploy_status(
                        &observed,
                        &obj,
                        DeployState::Failed,
                        format!("build {build_name} failed"),
                    );
                    super::patch_status(&api, &name, &status).await?;
                    Ok(Action::await_change())
                }
                BuildState::Succeeded => {
                    let definition = built_definition(&build.spec.definition, &build_status)?;
                    let patch = serde_json::json!({ "spec": { "definition": definition } });
                    systems
                        .patch(
                            &system,
                            &PatchParams::apply(FIELD_MANAGER),
                            &Patch::Merge(&patch),
                        )
                        .await?;

                    info!(name = %name, system = %system, "Rolled built definition onto system");
                    let status = DeployStatus {
                        state: DeployState::InProgress,
                        observed_generation: obj.metadata.generation,
                        message: None,
                        ..observed
                    };
                    super::patch_status(&api, &name, &status).await?;
                    Ok(Action::requeue(Duration::from_secs(5)))
                }
                BuildState::Pending | BuildState::Running => {
                    Ok(Action::requeue(Duration::from_secs(15)))
                }
            }
        }

        DeployState::InProgress => {
            if let Err(held_by) = ctx.lifecycle_locks.acquire(&system, owner.clone()) {
                return Err(Error::Contract(format!(
                    "{} is in progress but the system lock is held by {}",
                    obj.description(),
                    held_by
                )));
            }

            match system_settled(&systems, &system).await? {
                Settled::Stable => {
                    ctx.lifecycle_locks.release(&system, &owner);
                    info!(name = %name, system = %system, "Deploy succeeded");
                    let status = terminal_deploy_status(
                        &observed,
                        &obj,
                        DeployState::Succeeded,
                        String::new(),
                    );
                    super::patch_status(&api, &name, &status).await?;
                    Ok(Action::await_change())
                }
                Settled::Degraded => {
                    ctx.lifecycle_locks.release(&system, &owner);
                    let status = terminal_deploy_status(
                        &observed,
                        &obj,
                        DeployState::Failed,
                        format!("system {system} degraded during deploy"),
                    );
                    super::patch_status(&api, &name, &status).await?;
                    Ok(Action::await_change())
                }
                Settled::InFlight => Ok(Action::requeue(Duration::from_secs(15))),
            }
        }

        DeployState::Succeeded | DeployState::Failed => {
            ctx.lifecycle_locks.release(&system, &owner);
            Ok(Action::await_change())
        }
    }
}

pub fn deploy_error_policy(obj: Arc<Deploy>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("deploy", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Deploy not found (likely deleted)");
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

pub async fn reconcile_teardown(obj: Arc<Teardown>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;
    let system = system_name(&namespace)?;

    debug!(name = %name, system = %system, "Reconciling Teardown");

    let api: Api<Teardown> = Api::namespaced(ctx.client.clone(), &namespace);
    let systems: Api<System> = Api::all(ctx.client.clone());

    let owner = LockOwner {
        kind: LockKind::Teardown,
        name: name.clone(),
    };

    if obj.metadata.deletion_timestamp.is_some() {
        ctx.lifecycle_locks.release(&system, &owner);
        return Ok(Action::await_change());
    }

    let observed = obj.status.clone().unwrap_or_default();
    match observed.state {
        TeardownState::Pending => {
            if let Err(held_by) = ctx.lifecycle_locks.acquire(&system, owner) {
                debug!(name = %name, held_by = %held_by, "System busy, teardown waiting");
                let status = TeardownStatus {
                    state: TeardownState::Pending,
                    observed_generation: obj.metadata.generation,
                    message: Some(format!("waiting for {held_by} to finish")),
                    ..observed
                };
                if obj.status.as_ref() != Some(&status) {
                    super::patch_status(&api, &name, &status).await?;
                }
                return Ok(Action::requeue(Duration::from_secs(15)));
            }

            let patch = serde_json::json!({ "spec": { "definition": SystemDefinition::default() } });
            systems
                .patch(
                    &system,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await?;

            info!(name = %name, system = %system, "Teardown started, cleared system definition");
            ctx.publish_normal_event(
                &*obj,
                "Accepted",
                "Teardown",
                Some(format!("tearing down system {system}")),
            )
            .await;
            let status = TeardownStatus {
                state: TeardownState::InProgress,
                observed_generation: obj.metadata.generation,
                message: None,
                start_timestamp: observed.start_timestamp.or_else(|| Some(Utc::now())),
                completion_timestamp: None,
            };
            super::patch_status(&api, &name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }

        TeardownState::InProgress => {
            if let Err(held_by) = ctx.lifecycle_locks.acquire(&system, owner.clone()) {
                return Err(Error::Contract(format!(
                    "{} is in progress but the system lock is held by {}",
                    obj.description(),
                    held_by
                )));
            }

            match system_settled(&systems, &system).await? {
                Settled::Stable => {
                    ctx.lifecycle_locks.release(&system, &owner);
                    info!(name = %name, system = %system, "Teardown succeeded");
                    let status = TeardownStatus {
                        state: TeardownState::Succeeded,
                        observed_generation: obj.metadata.generation,
                        message: None,
                        start_timestamp: observed.start_timestamp,
                        completion_timestamp: Some(Utc::now()),
                    };
                    super::patch_status(&api, &name, &status).await?;
                    Ok(Action::await_change())
                }
                Settled::Degraded => {
                    ctx.lifecycle_locks.release(&system, &owner);
                    let status = TeardownStatus {
                        state: TeardownState::Failed,
                        observed_generation: obj.metadata.generation,
                        message: Some(format!("system {system} degraded during teardown")),
                        start_timestamp: observed.start_timestamp,
                        completion_timestamp: Some(Utc::now()),
                    };
                    super::patch_status(&api, &name, &status).await?;
                    Ok(Action::await_change())
                }
                Settled::InFlight => Ok(Action::requeue(Duration::from_secs(15))),
            }
        }

        TeardownState::Succeeded | TeardownState::Failed => {
            ctx.lifecycle_locks.release(&system, &owner);
            Ok(Action::await_change())
        }
    }
}

pub fn teardown_error_policy(obj: Arc<Teardown>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("teardown", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Teardown not found (likely deleted)");
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

fn system_name(namespace: &str) -> Result<String, Error> {
    system_for_namespace(namespace)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Validation(format!(
                "namespace {namespace} does not belong to a system"
            ))
        })
}

/// Resolve the deploy's target build name. `Err(message)` is a user error
/// that fails the deploy; it does not bubble up as a reconcile error.
async fn resolve_build(
    obj: &Deploy,
    builds: &Api<Build>,
) -> Result<Result<String, String>, Error> {
    match (&obj.spec.build, &obj.spec.version) {
        (Some(_), Some(_)) => Ok(Err(
            "exactly one of build and version must be set, got both".to_string()
        )),
        (None, None) => Ok(Err(
            "exactly one of build and version must be set, got neither".to_string(),
        )),
        (Some(build_name), None) => match builds.get(build_name).await {
            Ok(_) => Ok(Ok(build_name.clone())),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Ok(Err(format!("build {build_name} does not exist")))
            }
            Err(e) => Err(Error::Kube(e)),
        },
        (None, Some(version)) => {
            let all = builds.list(&ListParams::default()).await?;
            let mut matching: Vec<Build> = all
                .items
                .into_iter()
                .filter(|b| b.spec.version.as_deref() == Some(version))
                .collect();
            // Prefer the most recently created build for the version.
            matching.sort_by(|a, b| {
                a.metadata
                    .creation_timestamp
                    .cmp(&b.metadata.creation_timestamp)
            });
            match matching.pop() {
                Some(build) => Ok(Ok(build.name_any())),
                None => Ok(Err(format!("no build exists for version {version}"))),
            }
        }
    }
}

fn terminal_deploy_status(
    observed: &DeployStatus,
    obj: &Deploy,
    state: DeployState,
    message: String,
) -> DeployStatus {
    DeployStatus {
        state,
        observed_generation: obj.metadata.generation,
        build_name: observed.build_name.clone(),
        message: if message.is_empty() { None } else { Some(message) },
        start_timestamp: observed.start_timestamp,
        completion_timestamp: Some(Utc::now()),
    }
}

enum Settled {
    Stable,
    Degraded,
    InFlight,
}

/// Whether the system has observed its latest spec and settled.
async fn system_settled(systems: &Api<System>, system: &str) -> Result<Settled, Error> {
    let current = systems.get(system).await?;
    let status = current.status.clone().unwrap_or_default();

    let observed = status.observed_generation.unwrap_or(0);
    if observed < current.metadata.generation.unwrap_or(0) {
        return Ok(Settled::InFlight);
    }

    Ok(match status.state {
        SystemState::Stable => Settled::Stable,
        SystemState::Degraded => Settled::Degraded,
        _ => Settled::InFlight,
    })
}

/// Rewrite a built definition so every git-built component carries the image
/// its component build produced. Docker-image components pass through.
pub fn built_definition(
    definition: &SystemDefinition,
    build: &BuildStatus,
) -> Result<SystemDefinition, Error> {
    let mut result = definition.clone();

    for (path, service) in &mut result.services {
        for (component, component_definition) in &mut service.components {
            if !matches!(component_definition, ComponentDefinition::GitRepository { .. }) {
                continue;
            }

            let service_build = build.service_builds.get(path).ok_or_else(|| {
                Error::Contract(format!("build has no service build recorded for {path}"))
            })?;
            let service_build_status =
                build.service_build_statuses.get(service_build).ok_or_else(|| {
                    Error::Contract(format!(
                        "build has no status recorded for service build {service_build}"
                    ))
                })?;
            let component_build = service_build_status
                .component_builds
                .get(component)
                .ok_or_else(|| {
                    Error::Contract(format!(
                        "service build {service_build} has no component build for {component}"
                    ))
                })?;
            let artifacts = service_build_status
                .component_build_statuses
                .get(component_build)
                .and_then(|s| s.artifacts.clone())
                .ok_or_else(|| {
                    Error::Contract(format!(
                        "component build {component_build} succeeded without artifacts"
                    ))
                })?;

            *component_definition = ComponentDefinition::DockerImage {
                image: artifacts.docker_image_fqn,
            };
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ComponentBuildArtifacts, ComponentBuildState, ComponentBuildStatus, ServiceBuildState,
        ServiceBuildStatus, ServiceDefinition,
    };

    fn deploy_owner(name: &str) -> LockOwner {
        LockOwner {
            kind: LockKind::Deploy,
            name: name.to_string(),
        }
    }

    #[test]
    fn lock_is_exclusive_per_system() {
        let locks = LifecycleLocks::default();
        assert!(locks.acquire("petflix", deploy_owner("d1")).is_ok());
        assert_eq!(
            locks.acquire("petflix", deploy_owner("d2")),
            Err(deploy_owner("d1"))
        );
        // A different system is unaffected.
        assert!(locks.acquire("other", deploy_owner("d2")).is_ok());
    }

    #[test]
    fn lock_reacquire_by_holder_is_idempotent() {
        let locks = LifecycleLocks::default();
        assert!(locks.acquire("petflix", deploy_owner("d1")).is_ok());
        assert!(locks.acquire("petflix", deploy_owner("d1")).is_ok());
    }

    #[test]
    fn release_only_affects_the_holder() {
        let locks = LifecycleLocks::default();
        assert!(locks.acquire("petflix", deploy_owner("d1")).is_ok());
        locks.release("petflix", &deploy_owner("d2"));
        assert_eq!(
            locks.acquire("petflix", deploy_owner("d2")),
            Err(deploy_owner("d1"))
        );
        locks.release("petflix", &deploy_owner("d1"));
        assert!(locks.acquire("petflix", deploy_owner("d2")).is_ok());
    }

    fn git_component() -> ComponentDefinition {
        ComponentDefinition::GitRepository {
            url: "https://example.com/repo.git".to_string(),
            commit: "abc123".to_string(),
            base_image: None,
            command: None,
        }
    }

    fn built(fqn: &str) -> ComponentBuildStatus {
        ComponentBuildStatus {
            state: ComponentBuildState::Succeeded,
            artifacts: Some(ComponentBuildArtifacts {
                docker_image_fqn: fqn.to_string(),
            }),
            ..Default::default()
        }
    }

    fn one_service_definition(component: ComponentDefinition) -> SystemDefinition {
        SystemDefinition {
            services: BTreeMap::from([(
                "/api".to_string(),
                ServiceDefinition {
                    components: BTreeMap::from([("main".to_string(), component)]),
                    num_instances: 2,
                    ..Default::default()
                },
            )]),
            ..Default::default()
        }
    }

    fn build_status_for(fqn: &str) -> BuildStatus {
        BuildStatus {
            state: BuildState::Succeeded,
            service_builds: BTreeMap::from([("/api".to_string(), "sb-1".to_string())]),
            service_build_statuses: BTreeMap::from([(
                "sb-1".to_string(),
                ServiceBuildStatus {
                    state: ServiceBuildState::Succeeded,
                    component_builds: BTreeMap::from([("main".to_string(), "cb-1".to_string())]),
                    component_build_statuses: BTreeMap::from([("cb-1".to_string(), built(fqn))]),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn git_components_are_replaced_with_built_images() {
        let definition = one_service_definition(git_component());
        let result = built_definition(&definition, &build_status_for("registry/app:sha")).unwrap();
        assert_eq!(
            result.services["/api"].components["main"],
            ComponentDefinition::DockerImage {
                image: "registry/app:sha".to_string()
            }
        );
    }

    #[test]
    fn docker_image_components_pass_through() {
        let definition = one_service_definition(ComponentDefinition::DockerImage {
            image: "prebuilt:1".to_string(),
        });
        // No build records needed for a definition with no git components.
        let result = built_definition(&definition, &BuildStatus::default()).unwrap();
        assert_eq!(result, definition);
    }

    #[test]
    fn missing_artifacts_are_a_hard_error() {
        let definition = one_service_definition(git_component());
        let mut status = build_status_for("registry/app:sha");
        status
            .service_build_statuses
            .get_mut("sb-1")
            .unwrap()
            .component_build_statuses
            .get_mut("cb-1")
            .unwrap()
            .artifacts = None;

        let err = built_definition(&definition, &status).unwrap_err();
        assert!(matches!(err, Error::Contract(_)));
    }
}
