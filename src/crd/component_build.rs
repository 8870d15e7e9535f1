//! ComponentBuild Custom Resource Definition.
//!
//! A `ComponentBuild` drives one build unit: it owns a single batch `Job`
//! (created lazily) that compiles/packages one component. The build executor
//! running inside the job annotates the job with the content-addressed
//! artifact it produced; a "succeeded" job without that annotation is a
//! contract violation, not a retryable condition.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::FailureInfo;
use super::definition::ComponentDefinition;

/// Annotation (on the backing batch job) carrying the built image reference.
pub const DOCKER_IMAGE_FQN_ANNOTATION: &str = "componentbuild.lattice.dev/docker-image-fqn";

/// Annotation (on the backing batch job) carrying structured failure info.
pub const BUILD_FAILURE_INFO_ANNOTATION: &str = "componentbuild.lattice.dev/failure-info";

/// Label tying a component build to the service build that created it.
pub const COMPONENT_BUILD_SERVICE_BUILD_LABEL: &str = "componentbuild.lattice.dev/service-build";

/// Label carrying the component name within the parent service build.
pub const COMPONENT_BUILD_COMPONENT_LABEL: &str = "componentbuild.lattice.dev/component";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "ComponentBuild",
    plural = "componentbuilds",
    status = "ComponentBuildStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Started", "type":"date", "jsonPath":".status.startTimestamp"}"#,
    printcolumn = r#"{"name":"Completed", "type":"date", "jsonPath":".status.completionTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildSpec {
    /// What to build.
    pub definition: ComponentDefinition,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildStatus {
    #[serde(default)]
    pub state: ComponentBuildState,

    /// Artifacts produced by a successful build.
    #[serde(default)]
    pub artifacts: Option<ComponentBuildArtifacts>,

    #[serde(default)]
    pub failure_info: Option<FailureInfo>,

    /// Set exactly once, by the first sync observing the build running.
    #[serde(default)]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// Set exactly once, by the first sync observing a terminal state.
    #[serde(default)]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildArtifacts {
    /// Fully-qualified reference of the built image.
    pub docker_image_fqn: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ComponentBuildState {
    /// No backing job has been created yet.
    #[default]
    JobNotCreated,
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl ComponentBuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComponentBuildState::Succeeded | ComponentBuildState::Failed
        )
    }
}

impl fmt::Display for ComponentBuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentBuildState::JobNotCreated => write!(f, "JobNotCreated"),
            ComponentBuildState::Queued => write!(f, "Queued"),
            ComponentBuildState::Running => write!(f, "Running"),
            ComponentBuildState::Succeeded => write!(f, "Succeeded"),
            ComponentBuildState::Failed => write!(f, "Failed"),
        }
    }
}

impl ComponentBuild {
    pub fn description(&self) -> String {
        format!(
            "component build {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
