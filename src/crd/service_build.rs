//! ServiceBuild Custom Resource Definition.
//!
//! A `ServiceBuild` fans one service definition out into component builds
//! (one per declared component) and aggregates their terminal states. It has
//! no external side effects beyond creating component builds and writing its
//! own status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::component_build::ComponentBuildStatus;
use super::definition::ServiceDefinition;

/// Label tying a service build to the build that created it.
pub const SERVICE_BUILD_BUILD_LABEL: &str = "servicebuild.lattice.dev/build";

/// Label carrying the encoded service path within the parent build.
pub const SERVICE_BUILD_PATH_LABEL: &str = "servicebuild.lattice.dev/path";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "ServiceBuild",
    plural = "servicebuilds",
    status = "ServiceBuildStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBuildSpec {
    /// The service definition whose components are being built.
    pub definition: ServiceDefinition,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBuildStatus {
    #[serde(default)]
    pub state: ServiceBuildState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Component name -> generated ComponentBuild name.
    #[serde(default)]
    pub component_builds: BTreeMap<String, String>,

    /// ComponentBuild name -> its last observed status. Every name in
    /// `component_builds` must have an entry here; a missing entry signals
    /// an inconsistent write ordering bug.
    #[serde(default)]
    pub component_build_statuses: BTreeMap<String, ComponentBuildStatus>,

    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ServiceBuildState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ServiceBuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceBuildState::Succeeded | ServiceBuildState::Failed
        )
    }
}

impl fmt::Display for ServiceBuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceBuildState::Pending => write!(f, "Pending"),
            ServiceBuildState::Running => write!(f, "Running"),
            ServiceBuildState::Succeeded => write!(f, "Succeeded"),
            ServiceBuildState::Failed => write!(f, "Failed"),
        }
    }
}

impl ServiceBuild {
    pub fn description(&self) -> String {
        format!(
            "service build {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
