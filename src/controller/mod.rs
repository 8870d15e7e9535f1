//! Reconcilers for the lattice control plane.
//!
//! One module per controlled resource, sharing the [`context::Context`],
//! the error taxonomy in [`error`], and the finalizer helpers below. Every
//! reconciler follows the same shape: handle deletion, ensure the
//! finalizer, converge children, then write status only when it changed.

pub mod address;
pub mod build;
pub mod component_build;
pub mod config;
pub mod config_store;
pub mod context;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod load_balancer;
pub mod node_pool;
pub mod owner;
pub mod service;
pub mod service_build;
pub mod system;

use kube::{
    api::{Patch, PatchParams},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use context::FIELD_MANAGER;
use error::Result;

/// Finalizer shared by all lattice controllers. Each controller only ever
/// adds or removes this one token and leaves foreign finalizers alone.
pub const FINALIZER: &str = "lattice.dev/controller";

/// Ensure the lattice finalizer is present. Returns true if it was added,
/// in which case the caller should requeue and work against the fresh
/// object.
pub async fn ensure_finalizer<K>(api: &Api<K>, obj: &K) -> Result<bool>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    if obj.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(false);
    }

    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(true)
}

/// Remove the lattice finalizer, leaving any foreign finalizers in place.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }

    let finalizers: Vec<&String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Write a resource's status subresource with a merge patch.
///
/// Callers are expected to deep-compare against the observed status first
/// and skip the write when nothing changed; the level-triggered loops
/// otherwise ping-pong on their own status updates.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
