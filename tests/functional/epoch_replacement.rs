//! A full node pool epoch replacement, step by step.
//!
//! The scenario: a pool changes instance type, a new epoch is appended,
//! the service straddles both epochs while its deployment rolls over, and
//! only once the rollout stabilizes may the old epoch be retired.

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use lattice_operator::controller::node_pool::{pool_state, service_running_on_epoch};
use lattice_operator::controller::service::node_pool_annotation;
use lattice_operator::crd::{
    EpochInfo, EpochLog, EpochStatus, NodePool, NodePoolSpec, NodePoolState, Service, ServiceSpec,
    ServiceStatus, NODE_POOL_ANNOTATION,
};

const NS: &str = "lattice-shop";
const POOL: &str = "pool-a";

fn pool() -> NodePool {
    NodePool {
        metadata: ObjectMeta {
            name: Some(POOL.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        spec: NodePoolSpec {
            instance_type: "t2.small".to_string(),
            num_instances: 3,
        },
        status: None,
    }
}

fn service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("api".to_string()),
            namespace: Some(NS.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: ServiceSpec {
            definition: Default::default(),
            ports: Vec::new(),
            num_instances: 3,
        },
        status: Some(ServiceStatus {
            observed_generation: Some(1),
            ..Default::default()
        }),
    }
}

fn with_annotation(mut service: Service, raw: String) -> Service {
    let mut annotations = BTreeMap::new();
    annotations.insert(NODE_POOL_ANNOTATION.to_string(), raw);
    service.metadata.annotations = Some(annotations);
    service
}

fn stable_epoch(spec: &NodePoolSpec) -> EpochInfo {
    EpochInfo {
        spec: spec.clone(),
        status: EpochStatus {
            state: NodePoolState::Stable,
            num_instances: spec.num_instances,
        },
    }
}

#[test]
fn epoch_replacement_retires_the_old_epoch_only_after_the_rollout() {
    let pool = pool();
    let mut epochs = EpochLog::new();

    // A fresh pool has no epochs and reads Pending.
    assert_eq!(pool_state(&epochs), NodePoolState::Pending);

    // First epoch comes up and stabilizes.
    let e1 = epochs.append(pool.spec.clone());
    assert_eq!(e1, 1);
    epochs.set(e1, stable_epoch(&pool.spec));
    assert_eq!(pool_state(&epochs), NodePoolState::Stable);

    // The service lands on epoch 1 with a stable rollout.
    let annotation = node_pool_annotation(&service(), &pool, e1, true).unwrap();
    let service_on_e1 = with_annotation(
        service(),
        serde_json::to_string(&annotation).unwrap(),
    );
    assert!(service_running_on_epoch(NS, POOL, e1, &[service_on_e1.clone()]));

    // Instance type change: a second epoch is appended, the pool reads
    // Updating while both exist.
    let new_spec = NodePoolSpec {
        instance_type: "t2.large".to_string(),
        num_instances: 3,
    };
    let e2 = epochs.append(new_spec.clone());
    assert_eq!(e2, 2);
    assert_eq!(pool_state(&epochs), NodePoolState::Updating);

    // Mid-rollout the service straddles both epochs; epoch 1 cannot be
    // retired.
    let straddling = node_pool_annotation(&service_on_e1, &pool, e2, false).unwrap();
    let service_straddling = with_annotation(
        service(),
        serde_json::to_string(&straddling).unwrap(),
    );
    assert!(service_running_on_epoch(NS, POOL, e1, &[service_straddling.clone()]));
    assert!(service_running_on_epoch(NS, POOL, e2, &[service_straddling.clone()]));

    // The rollout stabilizes: the annotation collapses to epoch 2 alone
    // and epoch 1 becomes retirable.
    let settled = node_pool_annotation(&service_straddling, &pool, e2, true).unwrap();
    let service_on_e2 = with_annotation(service(), serde_json::to_string(&settled).unwrap());
    assert!(!service_running_on_epoch(NS, POOL, e1, &[service_on_e2.clone()]));
    assert!(service_running_on_epoch(NS, POOL, e2, &[service_on_e2]));

    // Retire epoch 1; the pool settles on epoch 2.
    epochs.remove(e1);
    epochs.set(e2, stable_epoch(&new_spec));
    assert_eq!(pool_state(&epochs), NodePoolState::Stable);
    assert_eq!(epochs.current(), Some(e2));

    // Epoch numbers are never reused.
    assert_eq!(epochs.next_epoch(), 3);
}

#[test]
fn a_pending_update_does_not_hold_back_epochs_the_service_is_past() {
    let pool = pool();
    let mut epochs = EpochLog::new();
    let e1 = epochs.append(pool.spec.clone());
    let e2 = epochs.append(pool.spec.clone());

    // The service sits on epoch 2 and its spec changed, but epochs are
    // only assigned upward: whatever the pending update does, it cannot
    // land the service back on epoch 1, so epoch 1 stays retirable. The
    // epoch it actually occupies remains blocked.
    let annotation = node_pool_annotation(&service(), &pool, e2, true).unwrap();
    let mut stale = with_annotation(service(), serde_json::to_string(&annotation).unwrap());
    stale.metadata.generation = Some(2);

    assert!(!service_running_on_epoch(NS, POOL, e1, &[stale.clone()]));
    assert!(service_running_on_epoch(NS, POOL, e2, &[stale]));
}
