//! Deploy and Teardown Custom Resource Definitions.
//!
//! One-shot workflow records. A `Deploy` rolls a build (or a version, which
//! first resolves to a build) onto its system; a `Teardown` removes every
//! workload from the system. Both move Pending -> Accepted -> InProgress ->
//! Succeeded | Failed and are never re-run: re-deploying means creating a
//! new Deploy.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Deploy",
    plural = "deploys",
    status = "DeployStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Build", "type":"string", "jsonPath":".status.buildName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploySpec {
    /// Name of an existing Build to deploy. Exactly one of `build` and
    /// `version` must be set.
    #[serde(default)]
    pub build: Option<String>,

    /// Version to deploy; resolved to (or built as) a Build first.
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatus {
    #[serde(default)]
    pub state: DeployState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// The build this deploy resolved to.
    #[serde(default)]
    pub build_name: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DeployState {
    #[default]
    Pending,
    Accepted,
    InProgress,
    Succeeded,
    Failed,
}

impl DeployState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Succeeded | DeployState::Failed)
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployState::Pending => write!(f, "Pending"),
            DeployState::Accepted => write!(f, "Accepted"),
            DeployState::InProgress => write!(f, "InProgress"),
            DeployState::Succeeded => write!(f, "Succeeded"),
            DeployState::Failed => write!(f, "Failed"),
        }
    }
}

impl Deploy {
    pub fn description(&self) -> String {
        format!(
            "deploy {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Teardown",
    plural = "teardowns",
    status = "TeardownStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct TeardownSpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeardownStatus {
    #[serde(default)]
    pub state: TeardownState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TeardownState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl TeardownState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TeardownState::Succeeded | TeardownState::Failed)
    }
}

impl fmt::Display for TeardownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownState::Pending => write!(f, "Pending"),
            TeardownState::InProgress => write!(f, "InProgress"),
            TeardownState::Succeeded => write!(f, "Succeeded"),
            TeardownState::Failed => write!(f, "Failed"),
        }
    }
}

impl Teardown {
    pub fn description(&self) -> String {
        format!(
            "teardown {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
