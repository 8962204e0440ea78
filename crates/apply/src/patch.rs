//! Server-side apply of one encoded object.

use std::time::Instant;

use metrics::{counter, histogram};
use tether_core::{FieldManager, ResourceIdentity};
use tether_kubehub::{ClientError, ResourceClient};
use tracing::{info, warn};

use crate::codec::{decode, MalformedResponse, ServerState};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The round trip failed; whether the server acted depends on the variant.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The server answered, but not with a readable object. The mutation may
    /// have taken effect.
    #[error("apply response unreadable: {0}")]
    Malformed(#[from] MalformedResponse),
}

/// Issues create-or-merge applies for one field manager at a time.
pub struct PatchClient<'a> {
    client: &'a dyn ResourceClient,
}

impl<'a> PatchClient<'a> {
    pub fn new(client: &'a dyn ResourceClient) -> Self { Self { client } }

    /// Apply `payload` to `target` under `manager`.
    ///
    /// Fields in the payload become owned by `manager.name`; fields absent
    /// from it are left alone. A field owned by another manager fails with
    /// [`ClientError::Conflict`] unless `manager.force_conflicts` is set.
    /// There is no existence check: the same call creates or updates.
    pub async fn apply(&self, target: &ResourceIdentity, payload: &[u8], manager: &FieldManager) -> Result<ServerState, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let body = match self.client.apply(target, payload, manager).await {
            Ok(b) => b,
            Err(ClientError::Conflict(msg)) => {
                counter!("apply_conflict", 1u64);
                warn!(object = %target, manager = %manager.name, conflict = %msg, "apply: field ownership conflict");
                return Err(ClientError::Conflict(msg).into());
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(e.into());
            }
        };
        let state = decode(&body).map_err(|e| {
            counter!("apply_err", 1u64);
            e
        })?;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        info!(
            object = %target,
            manager = %manager.name,
            force = manager.force_conflicts,
            rv = %state.resource_version().unwrap_or("-"),
            took_ms = %t0.elapsed().as_millis(),
            "apply: ok"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::ResourceKind;
    use tether_kubehub::MockCluster;

    fn id() -> ResourceIdentity {
        ResourceIdentity::new(ResourceKind::new("apps", "v1", "Deployment", "deployments"), "ns", "a")
    }

    fn payload(replicas: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "a", "namespace": "ns" },
            "spec": { "replicas": replicas }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn conflict_without_force_then_transfer_with_force() {
        let cluster = MockCluster::new();
        let pc = PatchClient::new(&cluster);
        pc.apply(&id(), &payload(1), &FieldManager::new("kubectl")).await.unwrap();

        let err = pc.apply(&id(), &payload(2), &FieldManager::new("tether")).await.unwrap_err();
        assert!(matches!(err, ApplyError::Client(ClientError::Conflict(_))), "got {:?}", err);
        assert_eq!(cluster.owners(&id()).get("spec.replicas").map(String::as_str), Some("kubectl"));

        let state = pc.apply(&id(), &payload(2), &FieldManager::new("tether").forced()).await.unwrap();
        assert_eq!(state.as_json().pointer("/spec/replicas"), Some(&json!(2)));
        assert_eq!(cluster.owners(&id()).get("spec.replicas").map(String::as_str), Some("tether"));
    }

    #[tokio::test]
    async fn same_payload_twice_is_idempotent() {
        let cluster = MockCluster::new();
        let pc = PatchClient::new(&cluster);
        let m = FieldManager::new("tether");
        let first = pc.apply(&id(), &payload(3), &m).await.unwrap();
        let second = pc.apply(&id(), &payload(3), &m).await.unwrap();
        assert!(crate::ChangePlan::between(first.as_json(), second.as_json()).is_empty());
        assert_eq!(first.resource_version(), second.resource_version());
    }

    #[tokio::test]
    async fn unreadable_response_is_malformed_not_transport() {
        let cluster = MockCluster::new();
        cluster.corrupt_responses(true);
        let err = PatchClient::new(&cluster).apply(&id(), &payload(1), &FieldManager::new("tether")).await.unwrap_err();
        assert!(matches!(err, ApplyError::Malformed(MalformedResponse::InvalidJson(_))));
        // The object exists server-side regardless.
        assert!(cluster.object(&id()).is_some());
    }
}
