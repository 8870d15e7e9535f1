//! Shared types and helpers used across the lattice CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// User-visible failure information recorded on a resource's status.
///
/// `internal` distinguishes operator-side failures (bugs, provider errors)
/// from failures caused by the user's own definition or build.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub internal: bool,
}

impl FailureInfo {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            internal: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            internal: true,
        }
    }
}

/// Generate a fresh unique name for a controller-created child resource.
///
/// Child identity is a UUID rather than anything derived from the logical
/// path, so that create races collide instead of silently adopting.
pub fn generated_name() -> String {
    format!("lattice-{}", uuid::Uuid::new_v4())
}

/// Encode a logical tree path (`/a/b/c`) as a label-safe value (`a.b.c`).
pub fn path_label_value(path: &str) -> String {
    path.trim_matches('/').replace('/', ".")
}

/// Label carrying the encoded logical path of a system child.
pub const PATH_LABEL: &str = "lattice.dev/path";

/// Label carrying the owning system's name on all system children.
pub const SYSTEM_LABEL: &str = "lattice.dev/system";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_label_value_strips_and_encodes() {
        assert_eq!(path_label_value("/a/b/c"), "a.b.c");
        assert_eq!(path_label_value("/root"), "root");
        assert_eq!(path_label_value("/"), "");
    }

    #[test]
    fn generated_names_are_unique() {
        assert_ne!(generated_name(), generated_name());
    }
}
