//! Job and JobRun Custom Resource Definitions.
//!
//! A lattice `Job` is the declared unit; a `JobRun` is one invocation of it,
//! optionally overriding command and environment. The job controller creates
//! a single batch job per `JobRun` (lazily, like a component build's job)
//! and reflects its terminal state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::FailureInfo;
use super::definition::JobDefinition;

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Job",
    plural = "jobs",
    status = "JobStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// The job's leaf of the system definition tree.
    pub definition: JobDefinition,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub state: JobState,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum JobState {
    #[default]
    Pending,
    Stable,
    Deleting,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Stable => write!(f, "Stable"),
            JobState::Deleting => write!(f, "Deleting"),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "JobRun",
    plural = "jobruns",
    status = "JobRunStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Job", "type":"string", "jsonPath":".spec.job"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JobRunSpec {
    /// Name of the lattice `Job` being invoked.
    pub job: String,

    /// Command override; the job definition's command when absent.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Environment override, merged over the job definition's environment.
    #[serde(default)]
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobRunStatus {
    #[serde(default)]
    pub state: JobRunState,

    #[serde(default)]
    pub failure_info: Option<FailureInfo>,

    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum JobRunState {
    /// No backing batch job has been created yet.
    #[default]
    JobNotCreated,
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobRunState::Succeeded | JobRunState::Failed)
    }
}

impl fmt::Display for JobRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRunState::JobNotCreated => write!(f, "JobNotCreated"),
            JobRunState::Queued => write!(f, "Queued"),
            JobRunState::Running => write!(f, "Running"),
            JobRunState::Succeeded => write!(f, "Succeeded"),
            JobRunState::Failed => write!(f, "Failed"),
        }
    }
}

impl JobRun {
    pub fn description(&self) -> String {
        format!(
            "job run {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
