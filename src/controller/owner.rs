//! Owner reference helpers.
//!
//! Child lookups label-query the cluster and then verify controller
//! ownership by uid, so a stray resource carrying our labels is surfaced
//! instead of silently adopted.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

/// The controller owner reference of a resource, if any.
pub fn controller_of<K>(resource: &K) -> Option<&OwnerReference>
where
    K: Resource,
{
    resource
        .meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `child` is controlled by `owner` (matched by uid).
pub fn controlled_by<K, O>(child: &K, owner: &O) -> bool
where
    K: Resource,
    O: Resource<DynamicType = ()>,
{
    let owner_uid = match &owner.meta().uid {
        Some(uid) => uid,
        None => return false,
    };
    controller_of(child).is_some_and(|r| &r.uid == owner_uid)
}

/// Whether a resource has no owner references at all. Orphaned shared
/// resources are garbage collected by their controllers.
pub fn orphaned<K>(resource: &K) -> bool
where
    K: Resource,
{
    resource
        .meta()
        .owner_references
        .as_ref()
        .is_none_or(|refs| refs.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ComponentBuild, ComponentBuildSpec, System, SystemSpec};

    fn component_build() -> ComponentBuild {
        ComponentBuild::new(
            "b",
            ComponentBuildSpec {
                definition: Default::default(),
            },
        )
    }

    #[test]
    fn no_owner_references_means_orphaned() {
        let build = component_build();
        assert!(orphaned(&build));
        assert!(controller_of(&build).is_none());
    }

    #[test]
    fn controlled_by_matches_uid() {
        let mut owner = System::new(
            "sys",
            SystemSpec {
                definition: Default::default(),
            },
        );
        owner.metadata.uid = Some("uid-1".to_string());

        let mut child = component_build();
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "lattice.dev/v1".to_string(),
            kind: "System".to_string(),
            name: "sys".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);

        assert!(controlled_by(&child, &owner));
        assert!(!orphaned(&child));

        owner.metadata.uid = Some("uid-2".to_string());
        assert!(!controlled_by(&child, &owner));
    }
}
