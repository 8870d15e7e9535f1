//! The service mesh contract consumed by the service and address
//! controllers.
//!
//! The mesh decides how a service's pods are decorated (annotations and
//! sidecar listener ports) and what a service address resolves to.

mod envoy;

pub use envoy::EnvoyServiceMesh;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::crd::{EndpointSpec, Service, ServiceAddress, ServiceMeshConfig};

#[derive(Error, Debug)]
#[error("service mesh error: {0}")]
pub struct MeshError(pub String);

impl MeshError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub trait ServiceMesh: Send + Sync {
    /// Pod template annotations the mesh needs on a service's deployment.
    fn service_annotations(&self, service: &Service) -> BTreeMap<String, String>;

    /// Service port -> sidecar listener port. Deterministic for a given
    /// spec so repeated reconciles produce identical deployments.
    fn service_ports(&self, service: &Service) -> BTreeMap<i32, i32>;

    /// The spec of the Endpoint backing a service address.
    fn endpoint_spec(&self, address: &ServiceAddress) -> Result<EndpointSpec, MeshError>;

    /// Port the sidecar's egress listener binds.
    fn egress_port(&self) -> i32;
}

/// Construct the mesh selected by the config. Exhaustive by construction,
/// like `cloud::new_cloud_provider`.
pub fn new_service_mesh(config: &ServiceMeshConfig) -> Arc<dyn ServiceMesh> {
    match config {
        ServiceMeshConfig::Envoy(envoy) => Arc::new(EnvoyServiceMesh::new(envoy.clone())),
    }
}
