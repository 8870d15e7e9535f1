//! Reconciliation loop for Build (system build).
//!
//! The same fan-out/fan-in shape as the service build controller, one level
//! up: one ServiceBuild per service path in the system definition. Service
//! builds are referenced by name in the build status rather than owned, so
//! a finished build keeps pointing at the exact artifacts it produced.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::ListParams;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::crd::{
    generated_name, path_label_value, Build, BuildState, BuildStatus, ServiceBuild,
    ServiceBuildSpec, ServiceBuildState, ServiceBuildStatus, SERVICE_BUILD_BUILD_LABEL,
    SERVICE_BUILD_PATH_LABEL,
};

pub async fn reconcile(obj: Arc<Build>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling Build");

    let api: Api<Build> = Api::namespaced(ctx.client.clone(), &namespace);
    let service_builds: Api<ServiceBuild> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let observed = obj.status.clone().unwrap_or_default();
    if observed.state.is_terminal() {
        return Ok(Action::await_change());
    }

    let mut builds: BTreeMap<String, String> = observed.service_builds.clone();
    for path in obj.spec.definition.services.keys() {
        if builds.contains_key(path) {
            continue;
        }
        let build_name = find_or_create_service_build(&service_builds, &obj, path).await?;
        builds.insert(path.clone(), build_name);
    }

    let mut statuses: BTreeMap<String, ServiceBuildStatus> = BTreeMap::new();
    for (path, build_name) in &builds {
        let build = match service_builds.get(build_name).await {
            Ok(build) => build,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::Contract(format!(
                    "{} references service build {} for path {} but it does not exist",
                    obj.description(),
                    build_name,
                    path
                )));
            }
            Err(e) => return Err(Error::Kube(e)),
        };
        statuses.insert(build_name.clone(), build.status.unwrap_or_default());
    }

    let status = next_status(&observed, obj.metadata.generation, builds, statuses);
    if obj.status.as_ref() != Some(&status) {
        debug!(name = %name, state = %status.state, "Updating build status");
        super::patch_status(&api, &name, &status).await?;
    }

    if status.state.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(30)))
    }
}

pub fn error_policy(obj: Arc<Build>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("build", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Build not found (likely deleted)");
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

async fn find_or_create_service_build(
    api: &Api<ServiceBuild>,
    parent: &Build,
    path: &str,
) -> Result<String, Error> {
    let selector = format!(
        "{}={},{}={}",
        SERVICE_BUILD_BUILD_LABEL,
        parent.name_any(),
        SERVICE_BUILD_PATH_LABEL,
        path_label_value(path)
    );
    let existing = api.list(&ListParams::default().labels(&selector)).await?;
    if let Some(found) = existing.items.first() {
        return Ok(found.name_any());
    }

    let definition = parent
        .spec
        .definition
        .services
        .get(path)
        .ok_or_else(|| Error::MissingField(format!("service {path}")))?
        .clone();

    let mut labels = BTreeMap::new();
    labels.insert(SERVICE_BUILD_BUILD_LABEL.to_string(), parent.name_any());
    labels.insert(
        SERVICE_BUILD_PATH_LABEL.to_string(),
        path_label_value(path),
    );

    let build = ServiceBuild {
        metadata: ObjectMeta {
            name: Some(generated_name()),
            namespace: parent.namespace(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ServiceBuildSpec { definition },
        status: None,
    };

    info!(parent = %parent.description(), path = %path, "Creating service build");
    let created = api.create(&Default::default(), &build).await?;
    Ok(created.name_any())
}

/// Aggregate service build statuses into the build status.
pub fn next_status(
    observed: &BuildStatus,
    generation: Option<i64>,
    service_builds: BTreeMap<String, String>,
    service_build_statuses: BTreeMap<String, ServiceBuildStatus>,
) -> BuildStatus {
    let states: Vec<ServiceBuildState> = service_build_statuses
        .values()
        .map(|s| s.state)
        .collect();

    // Vacuously succeeded: a definition with no services has nothing to
    // build.
    let state = if states.iter().any(|s| *s == ServiceBuildState::Failed) {
        BuildState::Failed
    } else if states.iter().any(|s| *s == ServiceBuildState::Running) {
        BuildState::Running
    } else if states.iter().all(|s| *s == ServiceBuildState::Succeeded) {
        BuildState::Succeeded
    } else {
        BuildState::Pending
    };

    let mut status = BuildStatus {
        state,
        observed_generation: generation,
        service_builds,
        service_build_statuses,
        start_timestamp: observed.start_timestamp,
        completion_timestamp: observed.completion_timestamp,
    };

    if status.start_timestamp.is_none() && state != BuildState::Pending {
        status.start_timestamp = Some(Utc::now());
    }
    if status.completion_timestamp.is_none() && state.is_terminal() {
        status.completion_timestamp = Some(Utc::now());
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(states: Vec<ServiceBuildState>) -> BuildState {
        let mut builds = BTreeMap::new();
        let mut statuses = BTreeMap::new();
        for (i, state) in states.into_iter().enumerate() {
            let name = format!("sb-{i}");
            builds.insert(format!("/svc-{i}"), name.clone());
            statuses.insert(
                name,
                ServiceBuildStatus {
                    state,
                    ..Default::default()
                },
            );
        }
        next_status(&Default::default(), Some(1), builds, statuses).state
    }

    #[test]
    fn empty_definition_build_succeeds_immediately() {
        assert_eq!(aggregate(vec![]), BuildState::Succeeded);
    }

    #[test]
    fn pending_children_leave_the_build_pending() {
        assert_eq!(
            aggregate(vec![
                ServiceBuildState::Pending,
                ServiceBuildState::Succeeded
            ]),
            BuildState::Pending
        );
    }

    #[test]
    fn failed_dominates() {
        assert_eq!(
            aggregate(vec![ServiceBuildState::Failed, ServiceBuildState::Running]),
            BuildState::Failed
        );
    }

    #[test]
    fn running_dominates_pending() {
        assert_eq!(
            aggregate(vec![ServiceBuildState::Pending, ServiceBuildState::Running]),
            BuildState::Running
        );
    }

    #[test]
    fn all_succeeded_is_succeeded() {
        assert_eq!(
            aggregate(vec![
                ServiceBuildState::Succeeded,
                ServiceBuildState::Succeeded
            ]),
            BuildState::Succeeded
        );
    }
}
