//! Service Custom Resource Definition.
//!
//! A `Service` is one long-running workload of a system. The service
//! controller annotates it with the node pool (namespace/name/epoch) its
//! instances currently run on; that annotation is the sole source of truth
//! the node pool controller consults when deciding whether an epoch can be
//! retired.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::FailureInfo;
use super::definition::{ServiceDefinition, ServicePort};
use super::node_pool::Epoch;

/// Annotation holding the JSON-encoded [`NodePoolAnnotationValue`].
pub const NODE_POOL_ANNOTATION: &str = "service.lattice.dev/node-pool";

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Service",
    plural = "services",
    status = "ServiceStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.numInstances"}"#,
    printcolumn = r#"{"name":"Updated", "type":"integer", "jsonPath":".status.updatedInstances"}"#,
    printcolumn = r#"{"name":"Stale", "type":"integer", "jsonPath":".status.staleInstances"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// The service's leaf of the system definition tree.
    pub definition: ServiceDefinition,

    /// Ports exposed by the service (copied out of the definition by the
    /// system controller).
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Desired instance count.
    pub num_instances: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default)]
    pub state: ServiceState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Externally reachable addresses for the service's public ports,
    /// keyed by port number.
    #[serde(default)]
    pub public_ports: BTreeMap<String, ServicePublicPort>,

    /// Instances running the latest spec.
    #[serde(default)]
    pub updated_instances: i32,

    /// Instances still running an older spec.
    #[serde(default)]
    pub stale_instances: i32,

    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePublicPort {
    pub address: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ServiceState {
    #[default]
    Pending,
    Scaling,
    Updating,
    Stable,
    Failed,
    Deleting,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "Pending"),
            ServiceState::Scaling => write!(f, "Scaling"),
            ServiceState::Updating => write!(f, "Updating"),
            ServiceState::Stable => write!(f, "Stable"),
            ServiceState::Failed => write!(f, "Failed"),
            ServiceState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// The value of the node pool annotation: for each pool (keyed by
/// `namespace/name`), the epochs the service may currently be running on.
///
/// A service is usually on a single epoch of a single pool, but during a
/// pool replacement it can briefly straddle two epochs.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NodePoolAnnotationValue(pub BTreeMap<String, Vec<Epoch>>);

impl NodePoolAnnotationValue {
    /// The annotation value naming a single `(pool, epoch)` assignment.
    pub fn single(namespace: &str, name: &str, epoch: Epoch) -> Self {
        let mut map = BTreeMap::new();
        map.insert(pool_key(namespace, name), vec![epoch]);
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record that the service may be running on this epoch. Epoch lists
    /// stay sorted and deduplicated.
    pub fn add(&mut self, namespace: &str, name: &str, epoch: Epoch) {
        let epochs = self.0.entry(pool_key(namespace, name)).or_default();
        if !epochs.contains(&epoch) {
            epochs.push(epoch);
            epochs.sort_unstable();
        }
    }

    /// Whether the annotation names exactly this epoch of this pool.
    pub fn contains_epoch(&self, namespace: &str, name: &str, epoch: Epoch) -> bool {
        self.0
            .get(&pool_key(namespace, name))
            .is_some_and(|epochs| epochs.contains(&epoch))
    }

    /// Whether the annotation names a strictly larger epoch of this pool.
    /// A service on a larger epoch has moved past the smaller one and will
    /// never return to it.
    pub fn contains_larger_epoch(&self, namespace: &str, name: &str, epoch: Epoch) -> bool {
        self.0
            .get(&pool_key(namespace, name))
            .is_some_and(|epochs| epochs.iter().any(|e| *e > epoch))
    }
}

fn pool_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl Service {
    /// Parse the node pool annotation. A missing annotation parses as the
    /// empty value (not yet assigned); a malformed one is an error the
    /// caller decides how to treat.
    pub fn node_pool_annotation(&self) -> Result<NodePoolAnnotationValue, serde_json::Error> {
        match self.annotations().get(NODE_POOL_ANNOTATION) {
            None => Ok(NodePoolAnnotationValue::default()),
            Some(raw) => serde_json::from_str(raw),
        }
    }

    /// Whether the service controller has observed the latest spec.
    ///
    /// This is the explicit barrier epoch retirement relies on: while false,
    /// the service controller may still be about to assign the service to
    /// any epoch.
    pub fn update_processed(&self) -> bool {
        let observed = self
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0);
        self.metadata.generation.unwrap_or(0) <= observed
    }

    /// Whether the service has been soft-deleted.
    pub fn deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn description(&self) -> String {
        format!(
            "service {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_annotation_contains_its_epoch() {
        let value = NodePoolAnnotationValue::single("ns", "pool", 3);
        assert!(value.contains_epoch("ns", "pool", 3));
        assert!(!value.contains_epoch("ns", "pool", 2));
        assert!(!value.contains_epoch("ns", "other", 3));
        assert!(!value.is_empty());
    }

    #[test]
    fn larger_epoch_detection() {
        let value = NodePoolAnnotationValue::single("ns", "pool", 3);
        assert!(value.contains_larger_epoch("ns", "pool", 2));
        assert!(!value.contains_larger_epoch("ns", "pool", 3));
        assert!(!value.contains_larger_epoch("ns", "other", 1));
    }

    #[test]
    fn add_keeps_epochs_sorted_and_deduplicated() {
        let mut value = NodePoolAnnotationValue::single("ns", "pool", 3);
        value.add("ns", "pool", 2);
        value.add("ns", "pool", 3);
        assert_eq!(value.0["ns/pool"], vec![2, 3]);
    }

    #[test]
    fn annotation_round_trips_through_json() {
        let value = NodePoolAnnotationValue::single("ns", "pool", 7);
        let raw = serde_json::to_string(&value).unwrap();
        let parsed: NodePoolAnnotationValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, value);
    }
}
