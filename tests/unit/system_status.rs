//! System state aggregation across child kinds.

use std::collections::BTreeMap;

use lattice_operator::controller::system::system_state;
use lattice_operator::crd::{
    JobState, JobStatus, NodePoolState, NodePoolStatus, ServiceState, ServiceStatus,
    SystemChildStatus, SystemState,
};

fn service(state: ServiceState) -> SystemChildStatus<ServiceStatus> {
    SystemChildStatus {
        name: "svc".to_string(),
        generation: 1,
        status: ServiceStatus {
            state,
            observed_generation: Some(1),
            ..Default::default()
        },
    }
}

fn pool(state: NodePoolState) -> SystemChildStatus<NodePoolStatus> {
    SystemChildStatus {
        name: "pool".to_string(),
        generation: 1,
        status: NodePoolStatus {
            state,
            observed_generation: Some(1),
            ..Default::default()
        },
    }
}

fn job(state: JobState) -> SystemChildStatus<JobStatus> {
    SystemChildStatus {
        name: "job".to_string(),
        generation: 1,
        status: JobStatus {
            state,
            observed_generation: Some(1),
        },
    }
}

fn aggregate(
    services: Vec<SystemChildStatus<ServiceStatus>>,
    pools: Vec<SystemChildStatus<NodePoolStatus>>,
    jobs: Vec<SystemChildStatus<JobStatus>>,
) -> SystemState {
    let services: BTreeMap<_, _> = services
        .into_iter()
        .enumerate()
        .map(|(i, s)| (format!("/s{i}"), s))
        .collect();
    let pools: BTreeMap<_, _> = pools
        .into_iter()
        .enumerate()
        .map(|(i, p)| (format!("/p{i}:pool"), p))
        .collect();
    let jobs: BTreeMap<_, _> = jobs
        .into_iter()
        .enumerate()
        .map(|(i, j)| (format!("/j{i}"), j))
        .collect();
    system_state(&services, &pools, &jobs)
}

#[test]
fn priority_is_degraded_over_updating_over_scaling_over_stable() {
    assert_eq!(
        aggregate(
            vec![
                service(ServiceState::Failed),
                service(ServiceState::Updating),
                service(ServiceState::Scaling),
                service(ServiceState::Stable),
            ],
            vec![],
            vec![],
        ),
        SystemState::Degraded
    );
    assert_eq!(
        aggregate(
            vec![service(ServiceState::Updating), service(ServiceState::Scaling)],
            vec![],
            vec![],
        ),
        SystemState::Updating
    );
    assert_eq!(
        aggregate(
            vec![service(ServiceState::Scaling), service(ServiceState::Stable)],
            vec![],
            vec![],
        ),
        SystemState::Scaling
    );
    assert_eq!(
        aggregate(vec![service(ServiceState::Stable)], vec![], vec![]),
        SystemState::Stable
    );
}

#[test]
fn a_failed_node_pool_degrades_the_system() {
    assert_eq!(
        aggregate(
            vec![service(ServiceState::Stable)],
            vec![pool(NodePoolState::Failed)],
            vec![],
        ),
        SystemState::Degraded
    );
}

#[test]
fn a_pending_job_means_scaling() {
    assert_eq!(
        aggregate(vec![], vec![], vec![job(JobState::Pending)]),
        SystemState::Scaling
    );
}

#[test]
fn a_child_that_has_not_observed_its_spec_means_updating() {
    let mut lagging = service(ServiceState::Stable);
    lagging.generation = 4;
    lagging.status.observed_generation = Some(3);
    assert_eq!(
        aggregate(vec![lagging], vec![], vec![]),
        SystemState::Updating
    );
}

#[test]
fn an_empty_system_is_stable() {
    assert_eq!(aggregate(vec![], vec![], vec![]), SystemState::Stable);
}
