//! Desired state <-> wire JSON.

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value as Json};
use tether_core::{parse_gvk_key, DynamicManifest, Manifest, ResourceIdentity, ResourceKind};
use tracing::debug;

fn max_yaml_bytes() -> usize {
    std::env::var("TETHER_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("TETHER_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("serializing desired state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("desired state must serialize to a JSON object")]
    NotAnObject,
    #[error("desired state is missing {0}")]
    MissingIdentity(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedResponse {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("response lacks metadata.name")]
    MissingName,
    #[error("response does not match the {kind} document shape: {reason}")]
    Shape { kind: String, reason: String },
}

/// The full object as last returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState(Json);

impl ServerState {
    pub fn as_json(&self) -> &Json { &self.0 }

    pub fn into_json(self) -> Json { self.0 }

    pub fn resource_version(&self) -> Option<&str> { self.0.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) }

    pub fn generation(&self) -> Option<i64> { self.0.pointer("/metadata/generation").and_then(|v| v.as_i64()) }
}

/// Serialize `desired` into an apply payload.
///
/// Absent fields are never emitted; computed paths are pruned; `apiVersion`,
/// `kind`, `metadata.name` and `metadata.namespace` always come from the
/// engine, not the caller.
pub fn encode<K: Manifest>(kind: &ResourceKind, id: &ResourceIdentity, desired: &K) -> Result<Vec<u8>, EncodeError> {
    let doc = to_document(kind, id, desired)?;
    Ok(serde_json::to_vec(&doc)?)
}

/// Like [`encode`] but stops at the JSON tree.
pub fn to_document<K: Manifest>(kind: &ResourceKind, id: &ResourceIdentity, desired: &K) -> Result<Json, EncodeError> {
    if id.name.is_empty() {
        return Err(EncodeError::MissingIdentity("metadata.name"));
    }
    if id.namespace.is_empty() {
        return Err(EncodeError::MissingIdentity("metadata.namespace"));
    }
    let mut v = serde_json::to_value(desired)?;
    if !v.is_object() {
        return Err(EncodeError::NotAnObject);
    }
    for path in kind.all_computed_paths() {
        if remove_dotted(&mut v, path) {
            debug!(path, "codec: dropped server-owned field from payload");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.insert("apiVersion".into(), Json::String(kind.api_version()));
        obj.insert("kind".into(), Json::String(kind.kind.clone()));
    }
    ensure_metadata(&mut v, &id.name, &id.namespace);
    Ok(v)
}

/// Parse a server response body.
pub fn decode(bytes: &[u8]) -> Result<ServerState, MalformedResponse> {
    let v: Json = serde_json::from_slice(bytes).map_err(|e| MalformedResponse::InvalidJson(e.to_string()))?;
    if !v.is_object() {
        return Err(MalformedResponse::NotAnObject);
    }
    match v.pointer("/metadata/name").and_then(|n| n.as_str()) {
        Some(n) if !n.is_empty() => Ok(ServerState(v)),
        _ => Err(MalformedResponse::MissingName),
    }
}

/// Read a merged document back into the caller's type.
pub fn materialize<K: Manifest>(kind: &ResourceKind, merged: &Json) -> Result<K, MalformedResponse> {
    serde_json::from_value(merged.clone())
        .map_err(|e| MalformedResponse::Shape { kind: kind.gvk_key(), reason: e.to_string() })
}

/// Remove a dotted path; returns whether anything was removed.
pub fn remove_dotted(v: &mut Json, path: &str) -> bool {
    let (parent, last) = match path.rsplit_once('.') {
        Some((p, l)) => (Some(p), l),
        None => (None, path),
    };
    let target = match parent {
        Some(p) => p.split('.').try_fold(&mut *v, |cur, seg| cur.as_object_mut()?.get_mut(seg)),
        None => Some(v),
    };
    target.and_then(|t| t.as_object_mut()).map(|o| o.remove(last).is_some()).unwrap_or(false)
}

fn ensure_metadata(v: &mut Json, name: &str, ns: &str) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert(Json::Object(Map::new()));
    if !meta.is_object() {
        *meta = Json::Object(Map::new());
    }
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(name.to_string()));
        obj.insert("namespace".into(), Json::String(ns.to_string()));
    }
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail early once past max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a YAML manifest file into its GVK key and an untyped manifest.
///
/// `ns_override` wins over `metadata.namespace` when given.
pub fn manifest_from_yaml(yaml: &str, ns_override: Option<&str>) -> Result<(String, DynamicManifest)> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
    }
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?;
    json.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("YAML missing metadata.name"))?;
    let gvk_key = format!("{}/{}", api_version, kind);
    if parse_gvk_key(&gvk_key).is_none() {
        return Err(anyhow!("YAML has malformed apiVersion {:?}", api_version));
    }
    let mut manifest: DynamicManifest = serde_json::from_value(json.clone()).context("reading manifest metadata")?;
    if let Some(ns) = ns_override {
        manifest.metadata.namespace = ns.to_string();
    }
    if manifest.metadata.namespace.is_empty() {
        return Err(anyhow!("YAML missing metadata.namespace (pass --ns)"));
    }
    Ok((gvk_key, manifest))
}
