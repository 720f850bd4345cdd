//! Resource collection identifiers.

use kube::core::ApiResource;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(group, version, resource)` triple naming a resource collection.
///
/// The empty group is the core group, so `("", "v1", "pods")` addresses
/// `/api/v1/pods` while `("apps", "v1", "deployments")` addresses
/// `/apis/apps/v1/deployments`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// A core-group identifier (empty group).
    pub fn core(version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new("", version, resource)
    }

    /// The `group/version` string, or the bare version for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Derive `(group, version)` from a wire-level `group/version` string:
    /// one slash splits, no slash means the core group.
    pub fn split_api_version(api_version: &str) -> (String, String) {
        match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        }
    }

    /// The dynamic-API descriptor for this collection. The kind is left
    /// empty; list and watch URLs only need the group, version and plural.
    pub(crate) fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: String::new(),
            plural: self.resource.clone(),
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_api_version_with_group() {
        let (group, version) = Gvr::split_api_version("apps/v1");
        assert_eq!(group, "apps");
        assert_eq!(version, "v1");
    }

    #[test]
    fn split_api_version_core_group() {
        let (group, version) = Gvr::split_api_version("v1");
        assert_eq!(group, "");
        assert_eq!(version, "v1");
    }

    #[test]
    fn api_version_round_trip() {
        assert_eq!(Gvr::core("v1", "pods").api_version(), "v1");
        assert_eq!(
            Gvr::new("apps", "v1", "deployments").api_version(),
            "apps/v1"
        );
    }

    #[test]
    fn display_includes_resource() {
        assert_eq!(Gvr::core("v1", "pods").to_string(), "v1/pods");
        assert_eq!(
            Gvr::new("apps", "v1", "deployments").to_string(),
            "apps/v1/deployments"
        );
    }
}
