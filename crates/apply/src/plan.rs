//! What a re-apply changes relative to the payload this manager last sent.
//!
//! Under server-side apply a manager owns exactly the leaves of its last
//! payload. Sending a new payload sets new leaves, changes owned ones, and
//! releases any leaf it no longer mentions; the server deletes a released
//! leaf unless another manager still owns it.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value as Json;

/// Server bookkeeping that never reflects caller intent.
const BOOKKEEPING: &[&str] = &[
    "metadata.managedFields",
    "metadata.resourceVersion",
    "metadata.generation",
    "metadata.creationTimestamp",
    "metadata.uid",
];

/// Dotted leaf paths, sorted. Arrays count as a single leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangePlan {
    pub set: Vec<String>,
    pub changed: Vec<String>,
    pub released: Vec<String>,
}

impl ChangePlan {
    pub fn between(previous: &Json, next: &Json) -> Self {
        let mut plan = ChangePlan::default();
        walk("", Some(previous), Some(next), &mut plan);
        plan.set.sort();
        plan.changed.sort();
        plan.released.sort();
        plan
    }

    pub fn is_empty(&self) -> bool { self.set.is_empty() && self.changed.is_empty() && self.released.is_empty() }
}

impl fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} ~{} -{}", self.set.len(), self.changed.len(), self.released.len())
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() { key.to_string() } else { format!("{}.{}", prefix, key) }
}

fn walk(path: &str, prev: Option<&Json>, next: Option<&Json>, plan: &mut ChangePlan) {
    if BOOKKEEPING.contains(&path) {
        return;
    }
    match (prev, next) {
        (Some(Json::Object(p)), Some(Json::Object(n))) => {
            let keys: BTreeSet<&String> = p.keys().chain(n.keys()).collect();
            for k in keys {
                walk(&join(path, k), p.get(k), n.get(k), plan);
            }
        }
        (None, Some(Json::Object(n))) => {
            for (k, v) in n.iter() {
                walk(&join(path, k), None, Some(v), plan);
            }
        }
        (Some(Json::Object(p)), None) => {
            for (k, v) in p.iter() {
                walk(&join(path, k), Some(v), None, plan);
            }
        }
        (None, Some(_)) => plan.set.push(path.to_string()),
        (Some(_), None) => plan.released.push(path.to_string()),
        (Some(p), Some(n)) => {
            if p != n {
                plan.changed.push(path.to_string());
            }
        }
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_leaves_by_dotted_path() {
        let previous = json!({
            "metadata": { "name": "a", "labels": { "tier": "web", "team": "core" } },
            "spec": { "replicas": 1, "paused": false, "ports": [80] }
        });
        let next = json!({
            "metadata": { "name": "a", "labels": { "tier": "web" } },
            "spec": { "replicas": 3, "ports": [80, 443], "strategy": { "type": "Recreate" } }
        });
        let plan = ChangePlan::between(&previous, &next);
        assert_eq!(plan.set, vec!["spec.strategy.type"]);
        assert_eq!(plan.changed, vec!["spec.ports", "spec.replicas"]);
        assert_eq!(plan.released, vec!["metadata.labels.team", "spec.paused"]);
        assert_eq!(plan.to_string(), "+1 ~2 -2");
    }

    #[test]
    fn bookkeeping_is_not_a_change() {
        let previous = json!({ "metadata": { "name": "a", "resourceVersion": "1", "generation": 1 } });
        let next = json!({ "metadata": { "name": "a", "resourceVersion": "7", "uid": "u-1", "managedFields": [{}] } });
        assert!(ChangePlan::between(&previous, &next).is_empty());
    }

    #[test]
    fn whole_subtree_appearing_lists_each_leaf() {
        let plan = ChangePlan::between(&json!({}), &json!({ "status": { "ready": 1, "phase": "Up" } }));
        assert_eq!(plan.set, vec!["status.phase", "status.ready"]);
        assert!(plan.changed.is_empty() && plan.released.is_empty());
    }
}
