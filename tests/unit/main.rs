// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the pure decision logic of the lattice controllers.
//!
//! Everything here runs without a Kubernetes cluster: epoch retirement
//! rules, status aggregation, DNS rendering, and the external API mappings
//! are all plain functions over plain values.
//!
//! ```bash
//! cargo test --test unit
//! ```

mod api_mapping;
mod build_aggregation;
mod dns_rendering;
mod epoch_retirement;
mod system_status;

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use lattice_operator::crd::{
    NodePoolAnnotationValue, Service, ServiceSpec, ServiceStatus, NODE_POOL_ANNOTATION,
};

/// A service assigned to the given pool epochs, with its latest spec
/// observed and no deletion in progress.
pub fn service_on(pool_namespace: &str, pool_name: &str, epochs: &[u64]) -> Service {
    let mut value = NodePoolAnnotationValue::default();
    for &epoch in epochs {
        value.add(pool_namespace, pool_name, epoch);
    }
    service_with_annotation(&serde_json::to_string(&value).unwrap())
}

/// A service carrying a raw node pool annotation value.
pub fn service_with_annotation(raw: &str) -> Service {
    let mut annotations = BTreeMap::new();
    annotations.insert(NODE_POOL_ANNOTATION.to_string(), raw.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some("svc".to_string()),
            namespace: Some("lattice-petflix".to_string()),
            annotations: Some(annotations),
            generation: Some(1),
            ..Default::default()
        },
        spec: ServiceSpec {
            definition: Default::default(),
            ports: Vec::new(),
            num_instances: 1,
        },
        status: Some(ServiceStatus {
            observed_generation: Some(1),
            ..Default::default()
        }),
    }
}
