//! In-memory API server with server-side-apply semantics.
//!
//! Ownership is tracked per leaf path (dotted, arrays are atomic). A leaf whose
//! value would change and which is owned by another manager is a conflict
//! unless the apply is forced, in which case ownership moves to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Map, Value as Json};
use tether_core::{FieldManager, ResourceIdentity};
use tracing::debug;

use crate::{ClientError, ResourceClient};

type Key = (String, String, String);
type GetHook = Box<dyn FnMut(usize, &mut Json) + Send>;

const CREATION_TIMESTAMP: &str = "2024-01-01T00:00:00Z";

#[derive(Default)]
struct Stored {
    body: Json,
    owners: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Stored>,
    next_uid: u64,
    next_rv: u64,
    apply_calls: usize,
    get_calls: usize,
    fail_gets: u32,
    fail_applies: u32,
    corrupt_responses: bool,
    known_fields: Option<BTreeSet<String>>,
    defaults: Vec<(String, Json)>,
    omitted: Vec<String>,
    get_hook: Option<GetHook>,
}

/// In-memory [`ResourceClient`].
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
    latency: Option<Duration>,
}

fn key(id: &ResourceIdentity) -> Key { (id.kind.plural.clone(), id.namespace.clone(), id.name.clone()) }

fn id_label(id: &ResourceIdentity) -> String { format!("{} \"{}/{}\"", id.kind.plural, id.namespace, id.name) }

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    /// Delay every response, to exercise cancellation of in-flight calls.
    pub fn with_latency(mut self, d: Duration) -> Self {
        self.latency = Some(d);
        self
    }

    /// Enable strict validation: top-level payload keys other than
    /// `apiVersion`, `kind`, `metadata` must be listed here.
    pub fn with_known_fields(self, fields: &[&str]) -> Self {
        self.lock().known_fields = Some(fields.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Populate `path` with `value` on create when the payload leaves it out.
    pub fn with_default(self, path: &str, value: Json) -> Self {
        self.lock().defaults.push((path.to_string(), value));
        self
    }

    /// Drop `path` from every response body (the stored object keeps it).
    pub fn omitting(self, path: &str) -> Self {
        self.lock().omitted.push(path.to_string());
        self
    }

    /// Called with the 1-based get count and the stored body before each get responds.
    pub fn on_get(&self, hook: impl FnMut(usize, &mut Json) + Send + 'static) {
        self.lock().get_hook = Some(Box::new(hook));
    }

    pub fn fail_next_gets(&self, n: u32) { self.lock().fail_gets = n; }

    pub fn fail_next_applies(&self, n: u32) { self.lock().fail_applies = n; }

    /// Respond with bytes that are not JSON.
    pub fn corrupt_responses(&self, on: bool) { self.lock().corrupt_responses = on; }

    pub fn apply_calls(&self) -> usize { self.lock().apply_calls }

    pub fn get_calls(&self) -> usize { self.lock().get_calls }

    pub fn object(&self, id: &ResourceIdentity) -> Option<Json> { self.lock().objects.get(&key(id)).map(|s| s.body.clone()) }

    /// Field owner by dotted leaf path, e.g. `spec.replicas -> "tether"`.
    pub fn owners(&self, id: &ResourceIdentity) -> BTreeMap<String, String> {
        self.lock().objects.get(&key(id)).map(|s| s.owners.clone()).unwrap_or_default()
    }

    /// Write a field as some other actor would (a controller filling `status`).
    pub fn set_field(&self, id: &ResourceIdentity, path: &str, value: Json) {
        let mut st = self.lock();
        let rv = bump(&mut st.next_rv);
        if let Some(stored) = st.objects.get_mut(&key(id)) {
            set_path(&mut stored.body, path, value);
            set_path(&mut stored.body, "metadata.resourceVersion", json!(rv.to_string()));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    async fn delay(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    fn respond(st: &State, body: &Json) -> Vec<u8> {
        if st.corrupt_responses {
            return b"<html>502 bad gateway</html>".to_vec();
        }
        let mut out = body.clone();
        for p in st.omitted.iter() {
            remove_path(&mut out, p);
        }
        serde_json::to_vec(&out).unwrap_or_default()
    }

    fn apply_locked(st: &mut State, id: &ResourceIdentity, payload: &[u8], manager: &FieldManager) -> Result<Vec<u8>, ClientError> {
        st.apply_calls += 1;
        if st.fail_applies > 0 {
            st.fail_applies -= 1;
            return Err(ClientError::Transport("connection reset by peer (injected)".into()));
        }
        let patch: Json = serde_json::from_slice(payload)
            .map_err(|e| ClientError::Rejected { code: 400, message: format!("invalid JSON body: {}", e) })?;
        let patch_obj = patch
            .as_object()
            .ok_or_else(|| ClientError::Rejected { code: 400, message: "apply body must be an object".into() })?;
        let meta_name = patch.pointer("/metadata/name").and_then(|v| v.as_str());
        if meta_name != Some(id.name.as_str()) {
            return Err(ClientError::Rejected { code: 400, message: "metadata.name does not match the request URL".into() });
        }
        if let Some(known) = st.known_fields.as_ref() {
            for k in patch_obj.keys() {
                if !matches!(k.as_str(), "apiVersion" | "kind" | "metadata") && !known.contains(k) {
                    return Err(ClientError::Rejected {
                        code: 400,
                        message: format!("strict decoding error: unknown field \"{}\"", k),
                    });
                }
            }
        }

        let mut leaves = Vec::new();
        collect_leaves(&patch, "", &mut leaves);
        leaves.retain(|(p, _)| !matches!(p.as_str(), "apiVersion" | "kind" | "metadata.name" | "metadata.namespace"));

        let k = key(id);
        let created = !st.objects.contains_key(&k);
        if let Some(existing) = st.objects.get(&k) {
            let conflicts: Vec<String> = leaves
                .iter()
                .filter_map(|(path, value)| {
                    let owner = existing.owners.get(path)?;
                    if owner == &manager.name || get_path(&existing.body, path) == Some(*value) {
                        return None;
                    }
                    Some(format!("conflict with \"{}\": .{}", owner, path))
                })
                .collect();
            if !conflicts.is_empty() && !manager.force_conflicts {
                return Err(ClientError::Conflict(format!(
                    "Apply failed with {} conflict{}: {}",
                    conflicts.len(),
                    if conflicts.len() == 1 { "" } else { "s" },
                    conflicts.join(", ")
                )));
            }
        }

        // Leaves already holding the same value under another owner stay with that owner.
        let leaf_paths: Vec<String> = leaves
            .iter()
            .filter(|(path, value)| match st.objects.get(&k) {
                Some(existing) if !manager.force_conflicts => match existing.owners.get(path) {
                    Some(owner) => owner == &manager.name || get_path(&existing.body, path) != Some(*value),
                    None => true,
                },
                _ => true,
            })
            .map(|(p, _)| p.clone())
            .collect();
        let stored = st.objects.entry(k).or_default();
        let before = stored.body.clone();
        if created {
            stored.body = json!({});
        }
        merge_into(&mut stored.body, &patch);
        for p in leaf_paths {
            stored.owners.insert(p, manager.name.clone());
        }
        let defaults = st.defaults.clone();
        let stored = st.objects.get_mut(&key(id)).ok_or_else(|| ClientError::Transport("object vanished".into()))?;
        if created {
            for (path, value) in defaults {
                if get_path(&stored.body, &path).is_none() {
                    set_path(&mut stored.body, &path, value);
                }
            }
        }
        let content_changed = created || strip_bookkeeping(&before) != strip_bookkeeping(&stored.body);
        let ownership = managed_fields(&stored.owners);
        set_path(&mut stored.body, "metadata.managedFields", ownership);

        if created {
            st.next_uid += 1;
            let uid = format!("00000000-0000-0000-0000-{:012}", st.next_uid);
            let rv = bump(&mut st.next_rv);
            let stored = st.objects.get_mut(&key(id)).ok_or_else(|| ClientError::Transport("object vanished".into()))?;
            set_path(&mut stored.body, "metadata.uid", json!(uid));
            set_path(&mut stored.body, "metadata.creationTimestamp", json!(CREATION_TIMESTAMP));
            set_path(&mut stored.body, "metadata.generation", json!(1));
            set_path(&mut stored.body, "metadata.resourceVersion", json!(rv.to_string()));
        } else if content_changed {
            let rv = bump(&mut st.next_rv);
            let stored = st.objects.get_mut(&key(id)).ok_or_else(|| ClientError::Transport("object vanished".into()))?;
            let generation = get_path(&stored.body, "metadata.generation").and_then(|g| g.as_i64()).unwrap_or(0);
            set_path(&mut stored.body, "metadata.generation", json!(generation + 1));
            set_path(&mut stored.body, "metadata.resourceVersion", json!(rv.to_string()));
        }
        debug!(object = %id, manager = %manager.name, created, content_changed, "mock: apply");
        let body = st.objects.get(&key(id)).map(|s| s.body.clone()).unwrap_or(Json::Null);
        Ok(Self::respond(st, &body))
    }
}

#[async_trait::async_trait]
impl ResourceClient for MockCluster {
    async fn apply(&self, target: &ResourceIdentity, payload: &[u8], manager: &FieldManager) -> Result<Vec<u8>, ClientError> {
        self.delay().await;
        let mut st = self.lock();
        Self::apply_locked(&mut st, target, payload, manager)
    }

    async fn get(&self, target: &ResourceIdentity) -> Result<Vec<u8>, ClientError> {
        self.delay().await;
        let mut st = self.lock();
        st.get_calls += 1;
        let n = st.get_calls;
        if st.fail_gets > 0 {
            st.fail_gets -= 1;
            return Err(ClientError::Transport("connection reset by peer (injected)".into()));
        }
        let mut hook = st.get_hook.take();
        let body = match st.objects.get_mut(&key(target)) {
            Some(stored) => {
                if let Some(h) = hook.as_mut() {
                    h(n, &mut stored.body);
                }
                Some(stored.body.clone())
            }
            None => None,
        };
        st.get_hook = hook;
        match body {
            Some(b) => Ok(Self::respond(&st, &b)),
            None => Err(ClientError::NotFound(format!("{} not found", id_label(target)))),
        }
    }

    async fn delete(&self, target: &ResourceIdentity) -> Result<(), ClientError> {
        self.delay().await;
        match self.lock().objects.remove(&key(target)) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(format!("{} not found", id_label(target)))),
        }
    }
}

fn bump(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn strip_bookkeeping(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
    }
    v
}

fn managed_fields(owners: &BTreeMap<String, String>) -> Json {
    let mut by_manager: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (path, manager) in owners.iter() {
        by_manager.entry(manager.as_str()).or_default().push(path.as_str());
    }
    Json::Array(
        by_manager
            .into_iter()
            .map(|(m, paths)| json!({ "manager": m, "operation": "Apply", "fields": paths }))
            .collect(),
    )
}

fn collect_leaves<'a>(v: &'a Json, base: &str, out: &mut Vec<(String, &'a Json)>) {
    match v {
        Json::Object(map) if !map.is_empty() => {
            for (k, vv) in map.iter() {
                let path = if base.is_empty() { k.clone() } else { format!("{}.{}", base, k) };
                collect_leaves(vv, &path, out);
            }
        }
        _ => {
            if !base.is_empty() {
                out.push((base.to_string(), v));
            }
        }
    }
}

fn merge_into(dst: &mut Json, src: &Json) {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => {
            for (k, sv) in s.iter() {
                match d.get_mut(k) {
                    Some(dv) if dv.is_object() && sv.is_object() => merge_into(dv, sv),
                    _ => {
                        d.insert(k.clone(), sv.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

fn get_path<'a>(v: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(v, |cur, seg| cur.as_object()?.get(seg))
}

fn set_path(v: &mut Json, path: &str, value: Json) {
    let segs: Vec<&str> = path.split('.').collect();
    let mut cur = v;
    for seg in &segs[..segs.len() - 1] {
        if !cur.is_object() {
            *cur = Json::Object(Map::new());
        }
        let Some(obj) = cur.as_object_mut() else { return };
        cur = obj.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
    }
    if !cur.is_object() {
        *cur = Json::Object(Map::new());
    }
    if let (Some(obj), Some(last)) = (cur.as_object_mut(), segs.last()) {
        obj.insert(last.to_string(), value);
    }
}

fn remove_path(v: &mut Json, path: &str) {
    let Some((parent, last)) = path.rsplit_once('.') else {
        if let Some(obj) = v.as_object_mut() {
            obj.remove(path);
        }
        return;
    };
    let parent_obj = parent.split('.').try_fold(&mut *v, |cur, seg| cur.as_object_mut()?.get_mut(seg));
    if let Some(obj) = parent_obj.and_then(|p| p.as_object_mut()) {
        obj.remove(last);
    }
}
