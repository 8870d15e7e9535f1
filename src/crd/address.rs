//! ServiceAddress and Endpoint Custom Resource Definitions.
//!
//! A `ServiceAddress` is the internal address record for one service; the
//! address controller materializes it as a single owned `Endpoint` whose
//! spec is computed by the configured service mesh. Endpoints are what the
//! DNS flush loop renders into dnsmasq configuration.

use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "ServiceAddress",
    plural = "serviceaddresses",
    status = "ServiceAddressStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".spec.service"}"#,
    printcolumn = r#"{"name":"Path", "type":"string", "jsonPath":".spec.path"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAddressSpec {
    /// Name of the lattice Service this address belongs to.
    pub service: String,

    /// Logical path of the service, used for DNS naming.
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAddressStatus {
    #[serde(default)]
    pub state: ServiceAddressState,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ServiceAddressState {
    #[default]
    Pending,
    Created,
    Failed,
}

impl fmt::Display for ServiceAddressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAddressState::Pending => write!(f, "Pending"),
            ServiceAddressState::Created => write!(f, "Created"),
            ServiceAddressState::Failed => write!(f, "Failed"),
        }
    }
}

impl ServiceAddress {
    pub fn description(&self) -> String {
        format!(
            "service address {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Endpoint",
    plural = "endpoints",
    status = "EndpointStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"IP", "type":"string", "jsonPath":".spec.ip"}"#,
    printcolumn = r#"{"name":"ExternalName", "type":"string", "jsonPath":".spec.externalName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Address as a host record. Exactly one of `ip` and `external_name`
    /// is set.
    #[serde(default)]
    pub ip: Option<String>,

    /// Address as a CNAME to an external target.
    #[serde(default)]
    pub external_name: Option<String>,

    /// Logical path of the addressed service.
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    #[serde(default)]
    pub state: EndpointState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EndpointState {
    #[default]
    Pending,
    Created,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Pending => write!(f, "Pending"),
            EndpointState::Created => write!(f, "Created"),
        }
    }
}
