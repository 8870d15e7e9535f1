//! Reconciliation loop for ServiceBuild.
//!
//! Fan-out/fan-in only: one ComponentBuild per declared component, statuses
//! aggregated back into the service build status. Component builds are
//! looked up by recorded name first, then by label with an uncached list,
//! and only created when genuinely absent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::ListParams;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::crd::{
    generated_name, ComponentBuild, ComponentBuildSpec, ComponentBuildState, ComponentBuildStatus,
    ServiceBuild, ServiceBuildState, ServiceBuildStatus, COMPONENT_BUILD_COMPONENT_LABEL,
    COMPONENT_BUILD_SERVICE_BUILD_LABEL,
};

pub async fn reconcile(obj: Arc<ServiceBuild>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling ServiceBuild");

    let api: Api<ServiceBuild> = Api::namespaced(ctx.client.clone(), &namespace);
    let component_builds: Api<ComponentBuild> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        // Component builds are garbage collected through owner references
        // (or reaped as orphans by the component build controller).
        return Ok(Action::await_change());
    }

    let observed = obj.status.clone().unwrap_or_default();
    if observed.state.is_terminal() {
        return Ok(Action::await_change());
    }

    // Ensure one component build per declared component.
    let mut builds: BTreeMap<String, String> = observed.component_builds.clone();
    for component in obj.spec.definition.components.keys() {
        if builds.contains_key(component) {
            continue;
        }
        let build_name =
            find_or_create_component_build(&component_builds, &obj, component).await?;
        builds.insert(component.clone(), build_name);
    }

    // Collect child statuses. A recorded name that no longer resolves is a
    // consistency bug, not a recoverable condition.
    let mut statuses: BTreeMap<String, ComponentBuildStatus> = BTreeMap::new();
    for (component, build_name) in &builds {
        let build = match component_builds.get(build_name).await {
            Ok(build) => build,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::Contract(format!(
                    "{} references component build {} for component {} but it does not exist",
                    obj.description(),
                    build_name,
                    component
                )));
            }
            Err(e) => return Err(Error::Kube(e)),
        };
        statuses.insert(build_name.clone(), build.status.unwrap_or_default());
    }

    let status = next_status(&observed, obj.metadata.generation, builds, statuses);
    if obj.status.as_ref() != Some(&status) {
        debug!(name = %name, state = %status.state, "Updating service build status");
        super::patch_status(&api, &name, &status).await?;
    }

    if status.state.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(30)))
    }
}

pub fn error_policy(obj: Arc<ServiceBuild>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("servicebuild", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Service build not found (likely deleted)");
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

/// Look a component build up by label with an uncached list; create it only
/// when genuinely absent. The quorum read is what makes the create safe
/// against informer cache lag.
async fn find_or_create_component_build(
    api: &Api<ComponentBuild>,
    parent: &ServiceBuild,
    component: &str,
) -> Result<String, Error> {
    let selector = format!(
        "{}={},{}={}",
        COMPONENT_BUILD_SERVICE_BUILD_LABEL,
        parent.name_any(),
        COMPONENT_BUILD_COMPONENT_LABEL,
        component
    );
    let existing = api.list(&ListParams::default().labels(&selector)).await?;
    if let Some(found) = existing.items.first() {
        return Ok(found.name_any());
    }

    let definition = parent
        .spec
        .definition
        .components
        .get(component)
        .ok_or_else(|| Error::MissingField(format!("component {component}")))?
        .clone();

    let mut labels = BTreeMap::new();
    labels.insert(
        COMPONENT_BUILD_SERVICE_BUILD_LABEL.to_string(),
        parent.name_any(),
    );
    labels.insert(
        COMPONENT_BUILD_COMPONENT_LABEL.to_string(),
        component.to_string(),
    );

    let build = ComponentBuild {
        metadata: ObjectMeta {
            name: Some(generated_name()),
            namespace: parent.namespace(),
            labels: Some(labels),
            owner_references: parent.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: ComponentBuildSpec { definition },
        status: None,
    };

    info!(
        parent = %parent.description(),
        component = %component,
        "Creating component build"
    );
    let created = api.create(&Default::default(), &build).await?;
    Ok(created.name_any())
}

/// Aggregate component build statuses into the service build status.
pub fn next_status(
    observed: &ServiceBuildStatus,
    generation: Option<i64>,
    component_builds: BTreeMap<String, String>,
    component_build_statuses: BTreeMap<String, ComponentBuildStatus>,
) -> ServiceBuildStatus {
    let states: Vec<ComponentBuildState> = component_build_statuses
        .values()
        .map(|s| s.state)
        .collect();

    // Vacuously succeeded: a definition with no components has nothing to
    // build.
    let state = if states.iter().any(|s| *s == ComponentBuildState::Failed) {
        ServiceBuildState::Failed
    } else if states.iter().any(|s| *s == ComponentBuildState::Running) {
        ServiceBuildState::Running
    } else if states.iter().all(|s| *s == ComponentBuildState::Succeeded) {
        ServiceBuildState::Succeeded
    } else {
        ServiceBuildState::Pending
    };

    let mut status = ServiceBuildStatus {
        state,
        observed_generation: generation,
        component_builds,
        component_build_statuses,
        start_timestamp: observed.start_timestamp,
        completion_timestamp: observed.completion_timestamp,
    };

    if status.start_timestamp.is_none() && state != ServiceBuildState::Pending {
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

    fn child(state: ComponentBuildState) -> ComponentBuildStatus {
        ComponentBuildStatus {
            state,
            ..Default::default()
        }
    }

    fn aggregate(states: Vec<ComponentBuildState>) -> ServiceBuildState {
        let mut builds = BTreeMap::new();
        let mut statuses = BTreeMap::new();
        for (i, state) in states.into_iter().enumerate() {
            let name = format!("cb-{i}");
            builds.insert(format!("component-{i}"), name.clone());
            statuses.insert(name, child(state));
        }
        next_status(&Default::default(), Some(1), builds, statuses).state
    }

    #[test]
    fn any_failed_wins() {
        assert_eq!(
            aggregate(vec![
                ComponentBuildState::Succeeded,
                ComponentBuildState::Failed,
                ComponentBuildState::Running,
            ]),
            ServiceBuildState::Failed
        );
    }

    #[test]
    fn any_running_beats_pending_and_succeeded() {
        assert_eq!(
            aggregate(vec![
                ComponentBuildState::Succeeded,
                ComponentBuildState::Running,
            ]),
            ServiceBuildState::Running
        );
    }

    #[test]
    fn all_succeeded_is_succeeded() {
        assert_eq!(
            aggregate(vec![
                ComponentBuildState::Succeeded,
                ComponentBuildState::Succeeded,
            ]),
            ServiceBuildState::Succeeded
        );
    }

    #[test]
    fn queued_children_leave_the_build_pending() {
        assert_eq!(
            aggregate(vec![
                ComponentBuildState::Queued,
                ComponentBuildState::JobNotCreated,
            ]),
            ServiceBuildState::Pending
        );
    }

    #[test]
    fn no_components_means_vacuously_succeeded() {
        assert_eq!(aggregate(vec![]), ServiceBuildState::Succeeded);
    }

    #[test]
    fn timestamps_are_written_once() {
        let first = next_status(
            &Default::default(),
            Some(1),
            BTreeMap::from([("main".to_string(), "cb".to_string())]),
            BTreeMap::from([("cb".to_string(), child(ComponentBuildState::Running))]),
        );
        let started = first.start_timestamp;
        assert!(started.is_some());
        assert!(first.completion_timestamp.is_none());

        let second = next_status(
            &first,
            Some(1),
            first.component_builds.clone(),
            BTreeMap::from([("cb".to_string(), child(ComponentBuildState::Succeeded))]),
        );
        assert_eq!(second.start_timestamp, started);
        assert!(second.completion_timestamp.is_some());
    }
}
