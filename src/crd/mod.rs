//! Custom Resource Definitions for the lattice control plane.
//!
//! - `System`: top-level declared system, fans out services, node pools, and jobs
//! - `Build` / `ServiceBuild` / `ComponentBuild`: the build aggregation chain
//! - `NodePool`: epoch-managed compute pools
//! - `Service`: a running workload wired to a node pool
//! - `Deploy` / `Teardown`: one-shot lifecycle workflows
//! - `Job` / `JobRun`: declared jobs and their invocations
//! - `ServiceAddress` / `Endpoint` / `LoadBalancer`: addressing and external wiring
//! - `Config`: the singleton operator configuration

mod address;
mod build;
mod common;
mod component_build;
mod config;
mod definition;
mod job;
mod lifecycle;
mod load_balancer;
mod node_pool;
mod service;
mod service_build;
mod system;

pub use address::*;
pub use build::*;
pub use common::*;
pub use component_build::*;
pub use config::*;
pub use definition::*;
pub use job::*;
pub use lifecycle::*;
pub use load_balancer::*;
pub use node_pool::*;
pub use service::*;
pub use service_build::*;
pub use system::*;

/// API group for all lattice CRDs
pub const GROUP: &str = "lattice.dev";

/// API version for all lattice CRDs
pub const API_VERSION: &str = "lattice.dev/v1";
