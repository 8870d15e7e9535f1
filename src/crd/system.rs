//! System Custom Resource Definition.
//!
//! A `System` is the top-level declared unit: a definition tree of services,
//! shared node pools, and jobs. The system controller materializes one child
//! resource per leaf inside the system's namespace and aggregates their
//! statuses back into the system status, classified by priority:
//! `Degraded` > `Updating` > `Scaling` > `Stable`.
//!
//! `System` is cluster-scoped; its children live in the namespace
//! `lattice-<system-name>`, which the system controller creates and whose
//! deletion drives system teardown.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::definition::SystemDefinition;
use super::job::JobStatus;
use super::node_pool::NodePoolStatus;
use super::service::ServiceStatus;

/// Prefix for system namespaces.
pub const SYSTEM_NAMESPACE_PREFIX: &str = "lattice-";

/// Namespace holding a system's children.
pub fn system_namespace(system_name: &str) -> String {
    format!("{}{}", SYSTEM_NAMESPACE_PREFIX, system_name)
}

/// Inverse of [`system_namespace`]. The operator's own namespace shares the
/// prefix but holds no system.
pub fn system_for_namespace(namespace: &str) -> Option<&str> {
    if namespace == super::config::INTERNAL_NAMESPACE {
        return None;
    }
    namespace.strip_prefix(SYSTEM_NAMESPACE_PREFIX)
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "System",
    plural = "systems",
    status = "SystemStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SystemSpec {
    /// The resolved definition tree, flattened and keyed by logical path.
    pub definition: SystemDefinition,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    #[serde(default)]
    pub state: SystemState,

    /// Last spec generation this status reflects.
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Per-path status of the system's services.
    #[serde(default)]
    pub services: BTreeMap<String, SystemChildStatus<ServiceStatus>>,

    /// Per-`path:name` status of the system's shared node pools.
    #[serde(default)]
    pub node_pools: BTreeMap<String, SystemChildStatus<NodePoolStatus>>,

    /// Per-path status of the system's jobs.
    #[serde(default)]
    pub jobs: BTreeMap<String, SystemChildStatus<JobStatus>>,
}

/// Recorded status of one controller-created child, together with the
/// child's generated name and the spec generation the child's own status
/// was observed at.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemChildStatus<S> {
    /// The child's generated (UUID) name.
    pub name: String,

    /// The child's `metadata.generation` when this entry was recorded.
    pub generation: i64,

    /// The child's own status.
    pub status: S,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
pub enum SystemState {
    #[default]
    Pending,
    Stable,
    Scaling,
    Updating,
    Degraded,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemState::Pending => write!(f, "Pending"),
            SystemState::Stable => write!(f, "Stable"),
            SystemState::Scaling => write!(f, "Scaling"),
            SystemState::Updating => write!(f, "Updating"),
            SystemState::Degraded => write!(f, "Degraded"),
        }
    }
}
