//! LoadBalancer Custom Resource Definition.
//!
//! A `LoadBalancer` is paired 1:1 with a Service that exposes public ports.
//! The load balancer controller provisions it through the cloud provider;
//! the resulting port map lands in status and the provider's DNS name in an
//! annotation, since the status schema only models ports.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation stashing the provider-assigned DNS name.
pub const LOAD_BALANCER_DNS_NAME_ANNOTATION: &str = "loadbalancer.lattice.dev/dns-name";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "LoadBalancer",
    plural = "loadbalancers",
    status = "LoadBalancerStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".spec.service"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Name of the lattice Service this load balancer fronts.
    pub service: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub state: LoadBalancerState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Service port -> externally reachable address.
    #[serde(default)]
    pub ports: BTreeMap<String, LoadBalancerPort>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    pub address: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LoadBalancerState {
    #[default]
    Pending,
    Provisioning,
    Created,
    Failed,
}

impl fmt::Display for LoadBalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerState::Pending => write!(f, "Pending"),
            LoadBalancerState::Provisioning => write!(f, "Provisioning"),
            LoadBalancerState::Created => write!(f, "Created"),
            LoadBalancerState::Failed => write!(f, "Failed"),
        }
    }
}

impl LoadBalancer {
    pub fn description(&self) -> String {
        format!(
            "load balancer {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
