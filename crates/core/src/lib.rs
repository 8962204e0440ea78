//! Tether core types: kind descriptors, identities, tri-state fields and sync configuration.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod config;
mod duration;
mod field;
mod identity;
mod meta;

pub use config::{ProviderConfig, SyncOptions, WaitTuning, DEFAULT_FIELD_MANAGER, MAX_CONSECUTIVE_FETCH_FAILURES};
pub use duration::{parse_signed_duration, DurationError, Timeout, UNBOUNDED_WAIT_CEILING};
pub use field::Field;
pub use identity::{InvalidImportIdentifier, ResourceIdentity};
pub use meta::{DynamicManifest, Manifest, ObjectMeta};

/// Paths the server owns for every kind. Never sent on apply, always taken from the server.
pub const DEFAULT_COMPUTED_PATHS: &[&str] = &[
    "metadata.uid",
    "metadata.resourceVersion",
    "metadata.generation",
    "metadata.creationTimestamp",
    "metadata.managedFields",
    "status",
];

/// Descriptor for one served, namespaced resource kind.
///
/// An orchestrator is parameterized by exactly one of these for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Lowercase plural used in URL paths, e.g. `deployments`.
    pub plural: String,
    /// Kind-specific server-only paths, in addition to [`DEFAULT_COMPUTED_PATHS`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub computed_paths: Vec<String>,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            computed_paths: Vec::new(),
        }
    }

    /// Declare an extra server-only path (dotted form, e.g. `spec.clusterIP`).
    pub fn with_computed(mut self, path: &str) -> Self {
        self.computed_paths.push(path.to_string());
        self
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// All computed paths for this kind, defaults first.
    pub fn all_computed_paths(&self) -> impl Iterator<Item = &str> {
        DEFAULT_COMPUTED_PATHS.iter().copied().chain(self.computed_paths.iter().map(String::as_str))
    }
}

/// Split a GVK key (`v1/Kind` or `group/v1/Kind`) into `(group, version, kind)`.
pub fn parse_gvk_key(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Some((String::new(), (*version).to_string(), (*kind).to_string()))
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Some(((*group).to_string(), (*version).to_string(), (*kind).to_string()))
        }
        _ => None,
    }
}

/// Field-ownership identity used for server-side apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldManager {
    pub name: String,
    pub force_conflicts: bool,
}

impl FieldManager {
    pub fn new(name: &str) -> Self { Self { name: name.to_string(), force_conflicts: false } }

    pub fn forced(mut self) -> Self {
        self.force_conflicts = true;
        self
    }
}

/// One post-mutation condition: a path into the server object, an optional
/// expected value and a timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitSpec {
    #[serde(alias = "jsonpath")]
    pub path: String,
    /// Unset means "any non-empty value".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub timeout: Timeout,
}

impl WaitSpec {
    pub fn exists(path: &str) -> Self {
        Self { path: path.to_string(), value: None, timeout: Timeout::default() }
    }

    pub fn equals(path: &str, value: &str) -> Self {
        Self { path: path.to_string(), value: Some(value.to_string()), timeout: Timeout::default() }
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }
}

pub mod prelude {
    pub use super::{
        DynamicManifest, Field, FieldManager, Manifest, ObjectMeta, ProviderConfig, ResourceIdentity, ResourceKind,
        SyncOptions, Timeout, WaitSpec,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_and_gvk_key_handle_core_group() {
        let cm = ResourceKind::new("", "v1", "ConfigMap", "configmaps");
        assert_eq!(cm.api_version(), "v1");
        assert_eq!(cm.gvk_key(), "v1/ConfigMap");
        let dep = ResourceKind::new("apps", "v1", "Deployment", "deployments");
        assert_eq!(dep.api_version(), "apps/v1");
        assert_eq!(dep.gvk_key(), "apps/v1/Deployment");
    }

    #[test]
    fn computed_paths_include_defaults_and_kind_extras() {
        let svc = ResourceKind::new("", "v1", "Service", "services").with_computed("spec.clusterIP");
        let all: Vec<&str> = svc.all_computed_paths().collect();
        assert!(all.contains(&"status"));
        assert!(all.contains(&"metadata.uid"));
        assert_eq!(all.last(), Some(&"spec.clusterIP"));
    }

    #[test]
    fn parse_gvk_key_variants() {
        assert_eq!(parse_gvk_key("v1/ConfigMap"), Some((String::new(), "v1".into(), "ConfigMap".into())));
        assert_eq!(parse_gvk_key("apps/v1/Deployment"), Some(("apps".into(), "v1".into(), "Deployment".into())));
        assert!(parse_gvk_key("invalid").is_none());
        assert!(parse_gvk_key("").is_none());
        assert!(parse_gvk_key("a/b/c/d").is_none());
        assert!(parse_gvk_key("/v1/Kind").is_none());
    }

    #[test]
    fn wait_spec_deserializes_with_default_timeout() {
        let w: WaitSpec = serde_json::from_value(serde_json::json!({ "jsonpath": "{.status.phase}", "value": "Ready" })).unwrap();
        assert_eq!(w.path, "{.status.phase}");
        assert_eq!(w.value.as_deref(), Some("Ready"));
        assert_eq!(w.timeout, Timeout::Bounded(std::time::Duration::from_secs(30)));

        let w: WaitSpec = serde_json::from_value(serde_json::json!({ "path": "status.ip", "timeout": "0" })).unwrap();
        assert_eq!(w.value, None);
        assert_eq!(w.timeout, Timeout::Immediate);
    }
}
