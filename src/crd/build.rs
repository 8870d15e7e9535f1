//! Build (system build) Custom Resource Definition.
//!
//! A `Build` builds every service of a system definition by fanning out one
//! `ServiceBuild` per service path and aggregating their states. Service
//! builds are referenced by name in the build's status, not owned.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::definition::SystemDefinition;
use super::service_build::ServiceBuildStatus;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Build",
    plural = "builds",
    status = "BuildStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// The system definition being built.
    pub definition: SystemDefinition,

    /// Optional version tag this build corresponds to.
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub state: BuildState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Service path -> ServiceBuild name.
    #[serde(default)]
    pub service_builds: BTreeMap<String, String>,

    /// ServiceBuild name -> its last observed status. Every name in
    /// `service_builds` must have an entry here.
    #[serde(default)]
    pub service_build_statuses: BTreeMap<String, ServiceBuildStatus>,

    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BuildState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Succeeded | BuildState::Failed)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Pending => write!(f, "Pending"),
            BuildState::Running => write!(f, "Running"),
            BuildState::Succeeded => write!(f, "Succeeded"),
            BuildState::Failed => write!(f, "Failed"),
        }
    }
}

impl Build {
    pub fn description(&self) -> String {
        format!(
            "build {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
