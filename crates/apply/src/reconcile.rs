//! Merge the server's authoritative object back into local state.

use serde_json::Value as Json;

use crate::codec::ServerState;

/// Drop `metadata.managedFields`; ownership bookkeeping is not caller state.
pub fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Merge `server` over `local`.
///
/// Every key the server returned wins (objects present on both sides merge
/// recursively; arrays and scalars are replaced whole). Keys only present
/// locally are kept: the caller set them and the server said nothing.
pub fn merge(local: &Json, server: &Json) -> Json {
    match (local, server) {
        (Json::Object(l), Json::Object(s)) => {
            let mut out = l.clone();
            for (k, sv) in s.iter() {
                let merged = match out.get(k) {
                    Some(lv) if lv.is_object() && sv.is_object() => merge(lv, sv),
                    _ => sv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Json::Object(out)
        }
        (_, s) => s.clone(),
    }
}

/// Local document after a mutation or read: `local` with `server` merged over it.
pub fn reconcile(local: &Json, server: &ServerState) -> Json {
    let mut authoritative = server.as_json().clone();
    strip_managed_fields(&mut authoritative);
    merge(local, &authoritative)
}
