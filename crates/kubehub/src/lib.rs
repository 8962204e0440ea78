//! Tether kubehub: the transport seam between the sync engine and an API server.
//!
//! [`ResourceClient`] is the only surface the engine talks to. [`KubeClient`]
//! speaks to a real cluster through kube; [`MockCluster`] is an in-memory
//! server with server-side-apply field ownership for tests and offline demos.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{DeleteParams, GetParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, Request},
    discovery::{Discovery, Scope},
    Client, Resource,
};
use serde_json::Value as Json;
use tether_core::{FieldManager, ResourceIdentity, ResourceKind};
use tracing::debug;

mod mock;

pub use mock::MockCluster;

/// Failure of a single round trip against the API server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Another field manager owns a field in the payload with a different value.
    #[error("field ownership conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The server refused the request outright (validation, authorization, ...).
    #[error("rejected by server ({code}): {message}")]
    Rejected { code: u16, message: String },
    /// The request could not be built locally; nothing was sent.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Network failure or server-side error; no effect is confirmed.
    #[error("transport: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
                ClientError::Transport(format!("{} ({}): {}", ae.reason, ae.code, ae.message))
            }
            kube::Error::Api(ae) => ClientError::Rejected { code: ae.code, message: ae.message },
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// One object-addressed round trip per call. Bodies are raw JSON bytes so the
/// caller owns decoding (and decoding failures).
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Server-side apply with strict field validation: creates the object if
    /// absent, merges otherwise. Returns the object as stored.
    async fn apply(&self, target: &ResourceIdentity, payload: &[u8], manager: &FieldManager) -> Result<Vec<u8>, ClientError>;

    async fn get(&self, target: &ResourceIdentity) -> Result<Vec<u8>, ClientError>;

    async fn delete(&self, target: &ResourceIdentity) -> Result<(), ClientError>;
}

/// Build a kube client from the ambient kubeconfig / in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig")
}

pub fn api_resource(kind: &ResourceKind) -> ApiResource {
    ApiResource {
        group: kind.group.clone(),
        version: kind.version.clone(),
        api_version: kind.api_version(),
        kind: kind.kind.clone(),
        plural: kind.plural.clone(),
    }
}

/// [`ResourceClient`] backed by a live API server.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    fn request(target: &ResourceIdentity) -> Request {
        let ar = api_resource(&target.kind);
        Request::new(DynamicObject::url_path(&ar, Some(&target.namespace)))
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn apply(&self, target: &ResourceIdentity, payload: &[u8], manager: &FieldManager) -> Result<Vec<u8>, ClientError> {
        let body: Json = serde_json::from_slice(payload).map_err(|e| ClientError::Invalid(format!("payload is not JSON: {}", e)))?;
        let mut pp = PatchParams::apply(&manager.name).validation_strict();
        if manager.force_conflicts {
            pp = pp.force();
        }
        let req = Self::request(target)
            .patch(&target.name, &pp, &Patch::Apply(&body))
            .map_err(|e| ClientError::Invalid(e.to_string()))?;
        debug!(object = %target, manager = %manager.name, force = manager.force_conflicts, "kube: apply");
        let text = self.client.request_text(req).await?;
        Ok(text.into_bytes())
    }

    async fn get(&self, target: &ResourceIdentity) -> Result<Vec<u8>, ClientError> {
        let req = Self::request(target)
            .get(&target.name, &GetParams::default())
            .map_err(|e| ClientError::Invalid(e.to_string()))?;
        let text = self.client.request_text(req).await?;
        Ok(text.into_bytes())
    }

    async fn delete(&self, target: &ResourceIdentity) -> Result<(), ClientError> {
        let req = Self::request(target)
            .delete(&target.name, &DeleteParams::default())
            .map_err(|e| ClientError::Invalid(e.to_string()))?;
        let _ = self.client.request_text(req).await?;
        Ok(())
    }
}

/// Resolve a GVK key (`v1/ConfigMap`, `apps/v1/Deployment`) to a kind
/// descriptor via discovery. Cluster-scoped kinds are refused.
pub async fn discover_kind(client: Client, gvk_key: &str) -> Result<ResourceKind> {
    let (group, version, kind) =
        tether_core::parse_gvk_key(gvk_key).ok_or_else(|| anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", gvk_key))?;
    let gvk = GroupVersionKind { group, version, kind };
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                if !matches!(caps.scope, Scope::Namespaced) {
                    return Err(anyhow!("{} is cluster-scoped; only namespaced kinds are supported", gvk_key));
                }
                return Ok(ResourceKind::new(&ar.group, &ar.version, &ar.kind, &ar.plural));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_uses_descriptor_plural() {
        let ar = api_resource(&ResourceKind::new("apps", "v1", "Deployment", "deployments"));
        assert_eq!(ar.api_version, "apps/v1");
        assert_eq!(ar.plural, "deployments");
        let url = DynamicObject::url_path(&ar, Some("ns"));
        assert_eq!(url, "/apis/apps/v1/namespaces/ns/deployments");
    }

    #[test]
    fn core_group_urls_use_api_prefix() {
        let ar = api_resource(&ResourceKind::new("", "v1", "ConfigMap", "configmaps"));
        assert_eq!(DynamicObject::url_path(&ar, Some("ns")), "/api/v1/namespaces/ns/configmaps");
    }

    #[test]
    fn kube_api_errors_map_by_status() {
        let api = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: format!("m{}", code),
                reason: "r".into(),
                code,
            })
        };
        assert_eq!(ClientError::from(api(409)), ClientError::Conflict("m409".into()));
        assert!(ClientError::from(api(404)).is_not_found());
        assert!(matches!(ClientError::from(api(422)), ClientError::Rejected { code: 422, .. }));
        assert!(matches!(ClientError::from(api(503)), ClientError::Transport(_)));
    }
}
