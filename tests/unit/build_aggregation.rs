//! Fan-in aggregation through the build chain.

use std::collections::BTreeMap;

use lattice_operator::controller::{build, service_build};
use lattice_operator::crd::{
    BuildState, BuildStatus, ComponentBuildState, ComponentBuildStatus, ServiceBuildState,
    ServiceBuildStatus,
};

fn service_build_status(state: ServiceBuildState) -> ServiceBuildStatus {
    ServiceBuildStatus {
        state,
        ..Default::default()
    }
}

fn aggregate_build(states: Vec<ServiceBuildState>) -> BuildState {
    let mut builds = BTreeMap::new();
    let mut statuses = BTreeMap::new();
    for (i, state) in states.into_iter().enumerate() {
        let name = format!("sb-{i}");
        builds.insert(format!("/svc-{i}"), name.clone());
        statuses.insert(name, service_build_status(state));
    }
    build::next_status(&BuildStatus::default(), Some(1), builds, statuses).state
}

fn aggregate_service_build(states: Vec<ComponentBuildState>) -> ServiceBuildState {
    let mut builds = BTreeMap::new();
    let mut statuses = BTreeMap::new();
    for (i, state) in states.into_iter().enumerate() {
        let name = format!("cb-{i}");
        builds.insert(format!("component-{i}"), name.clone());
        statuses.insert(
            name,
            ComponentBuildStatus {
                state,
                ..Default::default()
            },
        );
    }
    service_build::next_status(&ServiceBuildStatus::default(), Some(1), builds, statuses).state
}

#[test]
fn one_failure_fails_the_whole_build() {
    assert_eq!(
        aggregate_build(vec![
            ServiceBuildState::Succeeded,
            ServiceBuildState::Failed,
            ServiceBuildState::Running,
        ]),
        BuildState::Failed
    );
}

#[test]
fn a_running_child_keeps_the_build_running() {
    assert_eq!(
        aggregate_build(vec![
            ServiceBuildState::Succeeded,
            ServiceBuildState::Running,
        ]),
        BuildState::Running
    );
}

#[test]
fn pending_children_keep_the_build_pending() {
    assert_eq!(
        aggregate_build(vec![
            ServiceBuildState::Succeeded,
            ServiceBuildState::Pending,
        ]),
        BuildState::Pending
    );
}

#[test]
fn all_succeeded_children_succeed_the_build() {
    assert_eq!(
        aggregate_build(vec![
            ServiceBuildState::Succeeded,
            ServiceBuildState::Succeeded,
        ]),
        BuildState::Succeeded
    );
}

#[test]
fn a_build_of_nothing_succeeds_immediately() {
    // A system with no services has nothing to build; the build must not
    // hang in Pending forever.
    assert_eq!(aggregate_build(vec![]), BuildState::Succeeded);
    assert_eq!(
        aggregate_service_build(vec![]),
        ServiceBuildState::Succeeded
    );
}

#[test]
fn status_computation_is_idempotent() {
    let builds = BTreeMap::from([("/svc".to_string(), "sb-0".to_string())]);
    let statuses = BTreeMap::from([(
        "sb-0".to_string(),
        service_build_status(ServiceBuildState::Running),
    )]);

    let once = build::next_status(&BuildStatus::default(), Some(1), builds.clone(), statuses.clone());
    let twice = build::next_status(&once, Some(1), builds, statuses);
    assert_eq!(once, twice);
}

#[test]
fn component_failures_propagate_up_one_level() {
    assert_eq!(
        aggregate_service_build(vec![
            ComponentBuildState::Succeeded,
            ComponentBuildState::Failed,
        ]),
        ServiceBuildState::Failed
    );
}

#[test]
fn queued_components_are_pending_not_running() {
    assert_eq!(
        aggregate_service_build(vec![
            ComponentBuildState::Queued,
            ComponentBuildState::JobNotCreated,
        ]),
        ServiceBuildState::Pending
    );
}
