//! Externally published types.
//!
//! These are decoupled from the CRD status types on purpose: the CRDs can
//! evolve with the controllers while the external vocabulary stays stable.
//! Every mapping is an exhaustive match so a new internal state cannot ship
//! without deciding how it is presented.

use serde::{Deserialize, Serialize};

use crate::crd;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Pending,
    Stable,
    Scaling,
    Updating,
    Degraded,
}

impl From<crd::SystemState> for SystemState {
    fn from(state: crd::SystemState) -> Self {
        match state {
            crd::SystemState::Pending => SystemState::Pending,
            crd::SystemState::Stable => SystemState::Stable,
            crd::SystemState::Scaling => SystemState::Scaling,
            crd::SystemState::Updating => SystemState::Updating,
            crd::SystemState::Degraded => SystemState::Degraded,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Scaling,
    Updating,
    Stable,
    Failed,
    Deleting,
}

impl From<crd::ServiceState> for ServiceState {
    fn from(state: crd::ServiceState) -> Self {
        match state {
            crd::ServiceState::Pending => ServiceState::Pending,
            crd::ServiceState::Scaling => ServiceState::Scaling,
            crd::ServiceState::Updating => ServiceState::Updating,
            crd::ServiceState::Stable => ServiceState::Stable,
            crd::ServiceState::Failed => ServiceState::Failed,
            crd::ServiceState::Deleting => ServiceState::Deleting,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl From<crd::BuildState> for BuildState {
    fn from(state: crd::BuildState) -> Self {
        match state {
            crd::BuildState::Pending => BuildState::Pending,
            crd::BuildState::Running => BuildState::Running,
            crd::BuildState::Succeeded => BuildState::Succeeded,
            crd::BuildState::Failed => BuildState::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Pending,
    Accepted,
    InProgress,
    Succeeded,
    Failed,
}

impl From<crd::DeployState> for DeployState {
    fn from(state: crd::DeployState) -> Self {
        match state {
            crd::DeployState::Pending => DeployState::Pending,
            crd::DeployState::Accepted => DeployState::Accepted,
            crd::DeployState::InProgress => DeployState::InProgress,
            crd::DeployState::Succeeded => DeployState::Succeeded,
            crd::DeployState::Failed => DeployState::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl From<crd::TeardownState> for TeardownState {
    fn from(state: crd::TeardownState) -> Self {
        match state {
            crd::TeardownState::Pending => TeardownState::Pending,
            crd::TeardownState::InProgress => TeardownState::InProgress,
            crd::TeardownState::Succeeded => TeardownState::Succeeded,
            crd::TeardownState::Failed => TeardownState::Failed,
        }
    }
}

/// Summary of one system, as shown to users.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemSummary {
    pub name: String,
    pub state: SystemState,
    pub services: usize,
    pub jobs: usize,
}

impl From<&crd::System> for SystemSummary {
    fn from(system: &crd::System) -> Self {
        let status = system.status.clone().unwrap_or_default();
        Self {
            name: kube::ResourceExt::name_any(system),
            state: status.state.into(),
            services: status.services.len(),
            jobs: status.jobs.len(),
        }
    }
}
