//! Envoy sidecar service mesh.
//!
//! Sidecar listener ports are assigned deterministically: service ports in
//! ascending order get consecutive ports starting one past the egress port.
//! Service addresses resolve to the first address of the redirect CIDR
//! block; the sidecar intercepts traffic to that block and routes it by
//! listener port.

use std::collections::BTreeMap;

use crate::crd::{EndpointSpec, EnvoyConfig, Service, ServiceAddress};

use super::{MeshError, ServiceMesh};

/// Annotation carrying the sidecar's egress port.
pub const EGRESS_PORT_ANNOTATION: &str = "envoy.lattice.dev/egress-port";

/// Annotation carrying the xDS API port the sidecar connects to.
pub const XDS_API_PORT_ANNOTATION: &str = "envoy.lattice.dev/xds-api-port";

pub struct EnvoyServiceMesh {
    config: EnvoyConfig,
}

impl EnvoyServiceMesh {
    pub fn new(config: EnvoyConfig) -> Self {
        Self { config }
    }

    /// First address of the redirect CIDR block, e.g. "172.16.0.0/16" ->
    /// "172.16.0.0".
    fn redirect_ip(&self) -> Result<String, MeshError> {
        let block = &self.config.redirect_cidr_block;
        let ip = block.split('/').next().unwrap_or_default();
        if ip.is_empty() || ip.parse::<std::net::IpAddr>().is_err() {
            return Err(MeshError::new(format!(
                "invalid redirect CIDR block {block:?}"
            )));
        }
        Ok(ip.to_string())
    }
}

impl ServiceMesh for EnvoyServiceMesh {
    fn service_annotations(&self, _service: &Service) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            EGRESS_PORT_ANNOTATION.to_string(),
            self.config.egress_port.to_string(),
        );
        annotations.insert(
            XDS_API_PORT_ANNOTATION.to_string(),
            self.config.xds_api_port.to_string(),
        );
        annotations
    }

    fn service_ports(&self, service: &Service) -> BTreeMap<i32, i32> {
        let mut service_ports: Vec<i32> = service.spec.ports.iter().map(|p| p.port).collect();
        service_ports.sort_unstable();
        service_ports.dedup();

        service_ports
            .into_iter()
            .enumerate()
            .map(|(i, port)| (port, self.config.egress_port + 1 + i as i32))
            .collect()
    }

    fn endpoint_spec(&self, address: &ServiceAddress) -> Result<EndpointSpec, MeshError> {
        Ok(EndpointSpec {
            ip: Some(self.redirect_ip()?),
            external_name: None,
            path: address.spec.path.clone(),
        })
    }

    fn egress_port(&self) -> i32 {
        self.config.egress_port
    }
}
