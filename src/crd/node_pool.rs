//! NodePool Custom Resource Definition.
//!
//! A node pool does not have a single spec/status pair for its compute.
//! Instead its status carries an [`EpochLog`]: an append-only, ordered log
//! of epochs, each a (spec, status) pair describing one generation of the
//! backing compute. The highest-numbered epoch is "current"; older epochs
//! are historical and pending retirement. Epoch numbers are monotonically
//! increasing and never reused.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A node pool epoch number. Starts at 1, never reused.
pub type Epoch = u64;

/// Label naming the service a service-dedicated node pool belongs to.
pub const NODE_POOL_SERVICE_LABEL: &str = "nodepool.lattice.dev/service";

/// Label carrying the encoded declaration path of a system-shared node pool.
pub const NODE_POOL_PATH_LABEL: &str = "nodepool.lattice.dev/path";

/// Label carrying the logical name of a system-shared node pool.
pub const NODE_POOL_NAME_LABEL: &str = "nodepool.lattice.dev/name";

#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "NodePool",
    plural = "nodepools",
    status = "NodePoolStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"InstanceType", "type":"string", "jsonPath":".spec.instanceType"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.numInstances"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub instance_type: String,
    pub num_instances: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    #[serde(default)]
    pub state: NodePoolState,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// The epoch log. See module docs.
    #[serde(default)]
    pub epochs: EpochLog,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum NodePoolState {
    #[default]
    Pending,
    Scaling,
    Updating,
    Stable,
    Failed,
    Deleting,
}

impl fmt::Display for NodePoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePoolState::Pending => write!(f, "Pending"),
            NodePoolState::Scaling => write!(f, "Scaling"),
            NodePoolState::Updating => write!(f, "Updating"),
            NodePoolState::Stable => write!(f, "Stable"),
            NodePoolState::Failed => write!(f, "Failed"),
            NodePoolState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// One generation of a node pool's backing compute.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EpochInfo {
    /// The spec this epoch was provisioned with.
    pub spec: NodePoolSpec,
    /// Live status as last observed from the cloud provider.
    pub status: EpochStatus,
}

impl Default for NodePoolSpec {
    fn default() -> Self {
        Self {
            instance_type: String::new(),
            num_instances: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EpochStatus {
    #[serde(default)]
    pub state: NodePoolState,
    /// Instances currently running in this epoch.
    #[serde(default)]
    pub num_instances: i32,
}

/// Append-only ordered log of node pool epochs.
///
/// The current epoch is the highest-numbered entry. Retired epochs are
/// removed from the log; numbers are never reused because the next epoch
/// is always one past the highest ever recorded in the log.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct EpochLog(BTreeMap<Epoch, EpochInfo>);

impl EpochLog {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// All epochs in ascending order.
    pub fn epochs(&self) -> impl Iterator<Item = Epoch> + '_ {
        self.0.keys().copied()
    }

    pub fn get(&self, epoch: Epoch) -> Option<&EpochInfo> {
        self.0.get(&epoch)
    }

    /// The current (highest-numbered) epoch, if any.
    pub fn current(&self) -> Option<Epoch> {
        self.0.keys().next_back().copied()
    }

    /// The number the next appended epoch will receive.
    pub fn next_epoch(&self) -> Epoch {
        self.current().map_or(1, |e| e + 1)
    }

    /// Append a new pending epoch with the given spec, returning its number.
    pub fn append(&mut self, spec: NodePoolSpec) -> Epoch {
        let epoch = self.next_epoch();
        self.0.insert(
            epoch,
            EpochInfo {
                spec,
                status: EpochStatus {
                    state: NodePoolState::Pending,
                    num_instances: 0,
                },
            },
        );
        epoch
    }

    /// Record the observed (spec, status) for an epoch.
    pub fn set(&mut self, epoch: Epoch, info: EpochInfo) {
        self.0.insert(epoch, info);
    }

    /// Drop a retired epoch from the log.
    pub fn remove(&mut self, epoch: Epoch) {
        self.0.remove(&epoch);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl NodePool {
    /// The service this pool is dedicated to, if it is service-dedicated.
    pub fn dedicated_service(&self) -> Option<String> {
        self.labels().get(NODE_POOL_SERVICE_LABEL).cloned()
    }

    /// The `(path, name)` address of this pool, if it is system-shared.
    pub fn shared_address(&self) -> Option<(String, String)> {
        let path = self.labels().get(NODE_POOL_PATH_LABEL)?;
        let name = self.labels().get(NODE_POOL_NAME_LABEL)?;
        Some((path.clone(), name.clone()))
    }

    /// Human-readable description for log and error messages.
    pub fn description(&self) -> String {
        format!(
            "node pool {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(instances: i32) -> NodePoolSpec {
        NodePoolSpec {
            instance_type: "t2.small".to_string(),
            num_instances: instances,
        }
    }

    #[test]
    fn empty_log_has_no_current() {
        let log = EpochLog::new();
        assert_eq!(log.current(), None);
        assert_eq!(log.next_epoch(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn append_is_monotonic() {
        let mut log = EpochLog::new();
        assert_eq!(log.append(spec(1)), 1);
        assert_eq!(log.append(spec(2)), 2);
        assert_eq!(log.current(), Some(2));
        assert_eq!(log.next_epoch(), 3);
    }

    #[test]
    fn epoch_numbers_are_never_reused_while_newer_survive() {
        let mut log = EpochLog::new();
        log.append(spec(1));
        log.append(spec(2));
        log.remove(1);
        assert_eq!(log.current(), Some(2));
        assert_eq!(log.append(spec(3)), 3);
    }

    #[test]
    fn appended_epoch_starts_pending() {
        let mut log = EpochLog::new();
        let e = log.append(spec(3));
        let info = log.get(e).unwrap();
        assert_eq!(info.status.state, NodePoolState::Pending);
        assert_eq!(info.status.num_instances, 0);
        assert_eq!(info.spec.num_instances, 3);
    }
}
