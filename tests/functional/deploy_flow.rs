//! A deploy rolling a built definition onto a system, and the lifecycle
//! lock serializing it against a competing teardown.

use std::collections::BTreeMap;

use lattice_operator::controller::lifecycle::{
    built_definition, LifecycleLocks, LockKind, LockOwner,
};
use lattice_operator::crd::{
    BuildStatus, ComponentBuildArtifacts, ComponentBuildState, ComponentBuildStatus,
    ComponentDefinition, ServiceBuildState, ServiceBuildStatus, ServiceDefinition,
    SystemDefinition, MAIN_COMPONENT,
};

fn git_component() -> ComponentDefinition {
    ComponentDefinition::GitRepository {
        url: "https://github.com/shop/api".to_string(),
        commit: "4f2a9c1".to_string(),
        base_image: None,
        command: None,
    }
}

fn definition() -> SystemDefinition {
    let mut services = BTreeMap::new();
    services.insert(
        "/api".to_string(),
        ServiceDefinition {
            components: BTreeMap::from([(MAIN_COMPONENT.to_string(), git_component())]),
            num_instances: 2,
            ..Default::default()
        },
    );
    services.insert(
        "/cache".to_string(),
        ServiceDefinition {
            components: BTreeMap::from([(
                MAIN_COMPONENT.to_string(),
                ComponentDefinition::DockerImage {
                    image: "valkey/valkey:8".to_string(),
                },
            )]),
            num_instances: 1,
            ..Default::default()
        },
    );
    SystemDefinition {
        services,
        ..Default::default()
    }
}

fn succeeded_build() -> BuildStatus {
    let component_status = ComponentBuildStatus {
        state: ComponentBuildState::Succeeded,
        artifacts: Some(ComponentBuildArtifacts {
            docker_image_fqn: "registry.lattice.local/shop/api:4f2a9c1".to_string(),
        }),
        ..Default::default()
    };
    let service_status = ServiceBuildStatus {
        state: ServiceBuildState::Succeeded,
        component_builds: BTreeMap::from([(MAIN_COMPONENT.to_string(), "cb-api".to_string())]),
        component_build_statuses: BTreeMap::from([("cb-api".to_string(), component_status)]),
        ..Default::default()
    };
    BuildStatus {
        service_builds: BTreeMap::from([("/api".to_string(), "sb-api".to_string())]),
        service_build_statuses: BTreeMap::from([("sb-api".to_string(), service_status)]),
        ..Default::default()
    }
}

#[test]
fn a_succeeded_build_rewrites_git_components_only() {
    let built = built_definition(&definition(), &succeeded_build()).unwrap();

    let api_main = &built.services["/api"].components[MAIN_COMPONENT];
    assert_eq!(
        *api_main,
        ComponentDefinition::DockerImage {
            image: "registry.lattice.local/shop/api:4f2a9c1".to_string(),
        }
    );

    // The prebuilt image is untouched.
    let cache_main = &built.services["/cache"].components[MAIN_COMPONENT];
    assert_eq!(
        *cache_main,
        ComponentDefinition::DockerImage {
            image: "valkey/valkey:8".to_string(),
        }
    );
}

#[test]
fn a_build_missing_a_service_entry_is_a_contract_violation() {
    let mut build = succeeded_build();
    build.service_builds.clear();

    assert!(built_definition(&definition(), &build).is_err());
}

#[test]
fn a_teardown_waits_for_the_running_deploy() {
    let locks = LifecycleLocks::default();
    let deploy = LockOwner {
        kind: LockKind::Deploy,
        name: "deploy-1".to_string(),
    };
    let teardown = LockOwner {
        kind: LockKind::Teardown,
        name: "teardown-1".to_string(),
    };

    // The deploy takes the lock; the teardown is told who holds it and
    // stays Pending.
    locks.acquire("shop", deploy.clone()).unwrap();
    let holder = locks.acquire("shop", teardown.clone()).unwrap_err();
    assert_eq!(holder, deploy);

    // A restarted operator re-acquires for the same deploy without error.
    locks.acquire("shop", deploy.clone()).unwrap();

    // Deploys against other systems are unaffected.
    locks
        .acquire(
            "blog",
            LockOwner {
                kind: LockKind::Deploy,
                name: "deploy-2".to_string(),
            },
        )
        .unwrap();

    // Once the deploy reaches a terminal state and releases, the teardown
    // gets its turn.
    locks.release("shop", &deploy);
    locks.acquire("shop", teardown.clone()).unwrap();

    // A late release from the finished deploy must not steal the lock
    // back from the teardown.
    locks.release("shop", &deploy);
    assert_eq!(locks.acquire("shop", deploy).unwrap_err(), teardown);
}
