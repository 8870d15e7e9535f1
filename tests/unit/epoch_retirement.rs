//! The epoch retirement truth table.
//!
//! An epoch may only be retired once no service can still be running on it.
//! These tests pin down each branch of that decision, plus a property test
//! over arbitrary annotation shapes.

use lattice_operator::controller::node_pool::service_running_on_epoch;
use lattice_operator::crd::Service;
use proptest::prelude::*;

use crate::{service_on, service_with_annotation};

const NS: &str = "lattice-petflix";
const POOL: &str = "pool-a";

fn blocked(epoch: u64, services: &[Service]) -> bool {
    service_running_on_epoch(NS, POOL, epoch, services)
}

#[test]
fn no_services_means_retirable() {
    assert!(!blocked(1, &[]));
}

#[test]
fn service_on_the_epoch_blocks_retirement() {
    let services = vec![service_on(NS, POOL, &[2])];
    assert!(blocked(2, &services));
}

#[test]
fn service_on_a_strictly_larger_epoch_does_not_block() {
    let services = vec![service_on(NS, POOL, &[3])];
    assert!(!blocked(2, &services));
}

#[test]
fn service_straddling_both_epochs_blocks_the_older_one() {
    let services = vec![service_on(NS, POOL, &[2, 3])];
    assert!(blocked(2, &services));
    assert!(blocked(3, &services));
}

#[test]
fn service_on_a_different_pool_does_not_block() {
    let services = vec![service_on(NS, "pool-b", &[2])];
    assert!(!blocked(2, &services));
}

#[test]
fn unassigned_service_blocks_every_epoch() {
    // An empty annotation means the service controller has not yet chosen
    // a pool; the service could land anywhere.
    let services = vec![service_on(NS, POOL, &[])];
    assert!(blocked(1, &services));
    assert!(blocked(7, &services));
}

#[test]
fn larger_epoch_exemption_survives_a_pending_update() {
    // Epochs are only assigned upward, so a service already past this
    // epoch will never come back to it, even while the service controller
    // has not observed the latest spec. Epochs the service is not past
    // stay blocked until the update lands.
    let mut service = service_on(NS, POOL, &[3]);
    service.metadata.generation = Some(2);
    assert!(!blocked(2, &[service.clone()]));
    assert!(blocked(3, &[service.clone()]));
    assert!(blocked(4, &[service]));
}

#[test]
fn deleting_service_blocks_only_epochs_it_names() {
    let mut service = service_on(NS, POOL, &[2]);
    service.metadata.deletion_timestamp =
        Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
    assert!(blocked(2, &[service.clone()]));
    assert!(!blocked(1, &[service.clone()]));
    assert!(!blocked(3, &[service]));
}

#[test]
fn malformed_annotation_does_not_wedge_the_pool() {
    let services = vec![service_with_annotation("{not json")];
    assert!(!blocked(1, &services));
}

proptest! {
    /// An up-to-date, live service blocks exactly the epochs its
    /// annotation names, never more.
    #[test]
    fn assigned_service_blocks_exactly_its_epochs(
        assigned in proptest::collection::btree_set(1u64..20, 1..4),
        probe in 1u64..20,
    ) {
        let epochs: Vec<u64> = assigned.iter().copied().collect();
        let services = vec![service_on(NS, POOL, &epochs)];
        prop_assert_eq!(blocked(probe, &services), assigned.contains(&probe));
    }

    /// Retirement of the current epoch is always blocked while some
    /// service still straddles into it.
    #[test]
    fn straddling_always_blocks_the_lower_epoch(lower in 1u64..10) {
        let services = vec![service_on(NS, POOL, &[lower, lower + 1])];
        prop_assert!(blocked(lower, &services));
    }
}
