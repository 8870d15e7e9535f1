//! External API type mappings.

use lattice_operator::api::types;
use lattice_operator::crd;

#[test]
fn every_system_state_has_an_external_counterpart() {
    let all = [
        crd::SystemState::Pending,
        crd::SystemState::Stable,
        crd::SystemState::Scaling,
        crd::SystemState::Updating,
        crd::SystemState::Degraded,
    ];
    for state in all {
        // From is exhaustive; this is a smoke check that the mapping is
        // identity-shaped.
        let external = types::SystemState::from(state);
        assert_eq!(format!("{external:?}"), format!("{state:?}"));
    }
}

#[test]
fn deploy_states_serialize_snake_case() {
    assert_eq!(
        serde_json::to_string(&types::DeployState::InProgress).unwrap(),
        r#""in_progress""#
    );
    assert_eq!(
        serde_json::to_string(&types::TeardownState::Succeeded).unwrap(),
        r#""succeeded""#
    );
}

#[test]
fn system_summary_counts_children() {
    use std::collections::BTreeMap;

    let system = crd::System {
        metadata: kube::core::ObjectMeta {
            name: Some("petflix".to_string()),
            ..Default::default()
        },
        spec: crd::SystemSpec {
            definition: Default::default(),
        },
        status: Some(crd::SystemStatus {
            state: crd::SystemState::Stable,
            services: BTreeMap::from([(
                "/api".to_string(),
                crd::SystemChildStatus {
                    name: "svc".to_string(),
                    generation: 1,
                    status: crd::ServiceStatus::default(),
                },
            )]),
            ..Default::default()
        }),
    };

    let summary = types::SystemSummary::from(&system);
    assert_eq!(summary.name, "petflix");
    assert_eq!(summary.state, types::SystemState::Stable);
    assert_eq!(summary.services, 1);
    assert_eq!(summary.jobs, 0);
}
