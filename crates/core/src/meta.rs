use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::Field;

/// Object metadata shared by every kind.
///
/// `name` and `namespace` address the object; `uid`, `resource_version`,
/// `generation` and `creation_timestamp` are server-owned and only ever
/// populated by a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub labels: Field<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub annotations: Field<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub uid: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub resource_version: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub generation: Field<i64>,
    #[serde(default, skip_serializing_if = "Field::is_absent")]
    pub creation_timestamp: Field<String>,
    /// Any other metadata (`finalizers`, `ownerReferences`, ...), passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Json>,
}

impl ObjectMeta {
    pub fn named(namespace: &str, name: &str) -> Self {
        Self { name: name.to_string(), namespace: namespace.to_string(), ..Default::default() }
    }
}

/// A typed desired-state document for one kind.
pub trait Manifest: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn metadata(&self) -> &ObjectMeta;
}

/// Manifest for kinds without a dedicated Rust type: typed metadata plus an
/// untyped body (`spec`, `data`, ...). `apiVersion`/`kind` may appear in the
/// body but are always overwritten by the engine on encode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicManifest {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub body: serde_json::Map<String, Json>,
}

impl DynamicManifest {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { metadata: ObjectMeta::named(namespace, name), body: serde_json::Map::new() }
    }

    pub fn with(mut self, key: &str, value: Json) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }
}

impl Manifest for DynamicManifest {
    fn metadata(&self) -> &ObjectMeta { &self.metadata }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_serializes_only_what_is_set() {
        let m = ObjectMeta::named("ns", "a");
        assert_eq!(serde_json::to_value(&m).unwrap(), json!({ "name": "a", "namespace": "ns" }));
    }

    #[test]
    fn dynamic_manifest_keeps_body_keys() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "a", "namespace": "ns", "generation": 4 },
            "data": { "k": "v" }
        });
        let m: DynamicManifest = serde_json::from_value(v).unwrap();
        assert_eq!(m.metadata.generation, Field::Set(4));
        assert_eq!(m.body.get("data"), Some(&json!({ "k": "v" })));
        assert!(m.body.contains_key("apiVersion"));
        assert!(!m.body.contains_key("metadata"));
    }

    #[test]
    fn unknown_metadata_is_preserved() {
        let v = json!({ "name": "a", "namespace": "ns", "finalizers": ["x"] });
        let m: ObjectMeta = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(m.extra.get("finalizers"), Some(&json!(["x"])));
        assert_eq!(serde_json::to_value(&m).unwrap(), v);
    }
}
