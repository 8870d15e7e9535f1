//! The declarative definition of a system.
//!
//! The definition is produced by an external resolver and stored on the
//! `System` spec as a flattened, path-keyed map: each entry maps a logical
//! tree path (`/products/api`) to the leaf declared at that path. The system
//! controller fans these out into `Service`, `NodePool`, and `Job` children;
//! the build controllers fan service definitions out into component builds.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A resolved system definition, keyed by logical path.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemDefinition {
    /// Services declared in the system, keyed by path.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,

    /// System-shared node pools, keyed by `path:name`.
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolDefinition>,

    /// Jobs declared in the system, keyed by path.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
}

/// A single service leaf of the definition tree.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Components to build for this service, keyed by component name.
    /// The `main` component's artifact becomes the service container image.
    #[serde(default)]
    pub components: BTreeMap<String, ComponentDefinition>,

    /// Desired number of service instances.
    pub num_instances: i32,

    /// Where the service's instances run. `None` means a dedicated node
    /// pool sized to the service.
    #[serde(default)]
    pub node_pool: Option<NodePoolSelector>,

    /// Instance type for the dedicated node pool (ignored for shared pools).
    #[serde(default)]
    pub instance_type: Option<String>,

    /// Ports exposed by the service.
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Which node pool a service runs on.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum NodePoolSelector {
    /// A pool dedicated to this service, created and sized by the service
    /// controller.
    Dedicated {
        instance_type: String,
        num_instances: i32,
    },
    /// A system-shared pool declared elsewhere in the definition tree,
    /// addressed by its declaration path and name.
    Shared { path: String, name: String },
}

/// A port exposed by a service.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    /// Whether the port is reachable from outside the system through a
    /// load balancer.
    #[serde(default)]
    pub public: bool,
}

/// A shared node pool leaf of the definition tree.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolDefinition {
    pub instance_type: String,
    pub num_instances: i32,
}

/// A job leaf of the definition tree.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    /// Components to build for this job, keyed by component name.
    #[serde(default)]
    pub components: BTreeMap<String, ComponentDefinition>,

    /// Default command run by invocations of the job.
    #[serde(default)]
    pub command: Vec<String>,

    /// Default environment for invocations of the job.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// How a single component's artifact is produced.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ComponentDefinition {
    /// Build from a git repository at a specific commit.
    GitRepository {
        url: String,
        commit: String,
        #[serde(default)]
        base_image: Option<String>,
        #[serde(default)]
        command: Option<String>,
    },
    /// Use a prebuilt image as-is.
    DockerImage { image: String },
}

impl Default for ComponentDefinition {
    fn default() -> Self {
        ComponentDefinition::DockerImage {
            image: String::new(),
        }
    }
}

/// Name of the component whose artifact backs the service's main container.
pub const MAIN_COMPONENT: &str = "main";
