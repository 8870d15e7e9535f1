//! Config Custom Resource Definition.
//!
//! The singleton operator configuration. Controllers block their first sync
//! until it has been observed (see `controller::config_store`), since every
//! provider and mesh handle derives from it.
//!
//! Provider and mesh selection are tagged enums so that adding a provider
//! forces exhaustive handling at compile time; there is no "unsupported
//! provider" runtime error path.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton Config object.
pub const CONFIG_NAME: &str = "lattice-config";

/// Namespace holding the operator's own resources, including the Config.
pub const INTERNAL_NAMESPACE: &str = "lattice-internal";

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Config",
    plural = "configs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    pub cloud_provider: CloudProviderConfig,
    pub service_mesh: ServiceMeshConfig,

    /// Interval in seconds between DNS flushes (local provider only).
    #[serde(default = "default_dns_flush_interval")]
    pub dns_flush_interval_secs: u64,

    /// How component build jobs are run.
    #[serde(default)]
    pub component_builder: ComponentBuilderConfig,
}

/// Configuration for the build executor jobs created by the component
/// build controller.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuilderConfig {
    /// Image of the build executor.
    #[serde(default = "default_builder_image")]
    pub image: String,

    /// Registry built artifacts are pushed to.
    #[serde(default)]
    pub docker_registry: Option<String>,
}

impl Default for ComponentBuilderConfig {
    fn default() -> Self {
        Self {
            image: default_builder_image(),
            docker_registry: None,
        }
    }
}

fn default_builder_image() -> String {
    "lattice/component-builder:latest".to_string()
}

fn default_dns_flush_interval() -> u64 {
    5
}

/// Cloud provider selection. New providers add a variant here and an arm in
/// `cloud::new_cloud_provider`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CloudProviderConfig {
    Local(LocalCloudProviderConfig),
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalCloudProviderConfig {
    /// Host IP services are reachable on from outside the cluster.
    #[serde(default)]
    pub ip: Option<String>,
}

/// Service mesh selection.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ServiceMeshConfig {
    Envoy(EnvoyConfig),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfig {
    /// Sidecar image.
    #[serde(default = "default_envoy_image")]
    pub image: String,

    /// Port the sidecar's xDS client connects to.
    #[serde(default = "default_xds_api_port")]
    pub xds_api_port: i32,

    /// Base port for egress listeners; service ports are offset from it.
    #[serde(default = "default_egress_port")]
    pub egress_port: i32,

    /// CIDR block egress traffic is redirected into. The mesh answers DNS
    /// for service addresses with the first address in this block.
    #[serde(default = "default_redirect_cidr_block")]
    pub redirect_cidr_block: String,
}

impl Default for EnvoyConfig {
    fn default() -> Self {
        Self {
            image: default_envoy_image(),
            xds_api_port: default_xds_api_port(),
            egress_port: default_egress_port(),
            redirect_cidr_block: default_redirect_cidr_block(),
        }
    }
}

fn default_envoy_image() -> String {
    "envoyproxy/envoy:v1.30-latest".to_string()
}

fn default_xds_api_port() -> i32 {
    8080
}

fn default_egress_port() -> i32 {
    9001
}

fn default_redirect_cidr_block() -> String {
    "172.16.0.0/16".to_string()
}
