use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde_json::{json, Value as Json};
use tether_apply::{codec, decode, materialize, reconcile, ChangePlan, PatchClient, ServerState};
use tether_core::{Manifest, ProviderConfig, ResourceIdentity, ResourceKind, SyncOptions};
use tether_kubehub::ResourceClient;
use tether_wait::WaitEngine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Desired, Diagnostic, Operation, Outcome, SyncError, Tracked};

/// Synchronizes objects of one kind with the API server.
///
/// Holds no per-object state: every call takes what the caller recorded and
/// returns what should be recorded next. Cheap to share across tasks.
pub struct Orchestrator<K> {
    kind: ResourceKind,
    client: Arc<dyn ResourceClient>,
    config: ProviderConfig,
    waits: WaitEngine,
    _manifest: PhantomData<fn() -> K>,
}

impl<K> Clone for Orchestrator<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            waits: self.waits,
            _manifest: PhantomData,
        }
    }
}

impl<K: Manifest> Orchestrator<K> {
    pub fn new(kind: ResourceKind, client: Arc<dyn ResourceClient>, config: ProviderConfig) -> Self {
        let waits = WaitEngine::new(config.wait);
        Self { kind, client, config, waits, _manifest: PhantomData }
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }

    pub fn config(&self) -> &ProviderConfig { &self.config }

    /// Apply `desired` as a new object, then run its wait conditions.
    pub async fn create(&self, desired: Desired<K>, cancel: &CancellationToken) -> Outcome<Tracked<K>> {
        let op = Operation::Create;
        let t0 = Instant::now();
        if let Err(e) = self.online() {
            return self.fail(op, &self.subject_of(&desired.manifest), e);
        }
        let identity = match self.identity_of(&desired.manifest) {
            Ok(id) => id,
            Err(e) => return self.fail(op, &self.subject_of(&desired.manifest), e),
        };
        let doc = match codec::to_document(&self.kind, &identity, &desired.manifest) {
            Ok(d) => d,
            Err(e) => return self.fail(op, &identity.to_string(), e.into()),
        };
        let out = self.apply_and_track(op, identity, doc, desired.options, cancel).await;
        self.finish(op, t0, &out);
        out
    }

    /// Refresh `tracked` from the server. A missing object yields no value
    /// and no diagnostics: it was removed out of band.
    pub async fn read(&self, tracked: &Tracked<K>, cancel: &CancellationToken) -> Outcome<Tracked<K>> {
        let op = Operation::Read;
        let t0 = Instant::now();
        let subject = tracked.identity.to_string();
        if let Err(e) = self.online() {
            return self.fail(op, &subject, e);
        }
        let state = match self.fetch(&tracked.identity, cancel).await {
            Ok(s) => s,
            Err(SyncError::NotFound(_)) => {
                info!(object = %subject, "read: object is gone; dropping from state");
                counter!("sync_gone", 1u64);
                return Outcome::empty();
            }
            Err(e) => return self.fail(op, &subject, e),
        };
        let out = match self.track(tracked.identity.clone(), tracked.applied.clone(), &state, tracked.options.clone()) {
            Ok(t) => Outcome::ok(t),
            Err(e) => self.fail(op, &subject, e),
        };
        self.finish(op, t0, &out);
        out
    }

    /// Apply `desired` over the object recorded in `prior`. Changing
    /// namespace or name is refused.
    pub async fn update(&self, prior: &Tracked<K>, desired: Desired<K>, cancel: &CancellationToken) -> Outcome<Tracked<K>> {
        let op = Operation::Update;
        let t0 = Instant::now();
        let subject = prior.identity.to_string();
        if let Err(e) = self.online() {
            return self.fail(op, &subject, e);
        }
        let identity = match self.identity_of(&desired.manifest) {
            Ok(id) => id,
            Err(e) => return self.fail(op, &subject, e),
        };
        if !identity.same_object(&prior.identity) {
            let e = SyncError::IdentityChanged { from: prior.identity.composite_id(), to: identity.composite_id() };
            return self.fail(op, &subject, e);
        }
        let doc = match codec::to_document(&self.kind, &identity, &desired.manifest) {
            Ok(d) => d,
            Err(e) => return self.fail(op, &subject, e.into()),
        };
        let plan = ChangePlan::between(&prior.applied, &doc);
        debug!(object = %subject, plan = %plan, set = ?plan.set, changed = ?plan.changed, "update: planned changes");
        if !plan.released.is_empty() {
            info!(object = %subject, released = ?plan.released, "update: releasing fields no longer set");
        }
        let out = self.apply_and_track(op, identity, doc, desired.options, cancel).await;
        self.finish(op, t0, &out);
        out
    }

    /// Delete the recorded object. Already gone counts as success.
    pub async fn delete(&self, tracked: &Tracked<K>, cancel: &CancellationToken) -> Outcome<()> {
        let op = Operation::Delete;
        let t0 = Instant::now();
        let subject = tracked.identity.to_string();
        if let Err(e) = self.online() {
            return self.fail(op, &subject, e);
        }
        let out = match cancelable(cancel, self.client.delete(&tracked.identity)).await {
            Ok(Ok(())) => Outcome::ok(()),
            Ok(Err(e)) if e.is_not_found() => {
                debug!(object = %subject, "delete: already gone");
                Outcome::ok(())
            }
            Ok(Err(e)) => self.fail(op, &subject, e.into()),
            Err(e) => self.fail(op, &subject, e),
        };
        self.finish(op, t0, &out);
        out
    }

    /// Adopt an existing object by its `<namespace>/<name>` id.
    pub async fn import(&self, composite_id: &str, cancel: &CancellationToken) -> Outcome<Tracked<K>> {
        let op = Operation::Import;
        let t0 = Instant::now();
        let identity = match ResourceIdentity::parse_import(&self.kind, composite_id) {
            Ok(id) => id,
            Err(e) => return self.fail(op, &format!("{} {:?}", self.kind.gvk_key(), composite_id), e.into()),
        };
        let subject = identity.to_string();
        if let Err(e) = self.online() {
            return self.fail(op, &subject, e);
        }
        let state = match self.fetch(&identity, cancel).await {
            Ok(s) => s,
            Err(e) => return self.fail(op, &subject, e),
        };
        let seed = json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.kind,
            "metadata": { "name": identity.name, "namespace": identity.namespace },
        });
        let out = match self.track(identity, seed, &state, SyncOptions::default()) {
            Ok(t) => Outcome::ok(t),
            Err(e) => self.fail(op, &subject, e),
        };
        self.finish(op, t0, &out);
        out
    }

    async fn apply_and_track(
        &self,
        op: Operation,
        identity: ResourceIdentity,
        doc: Json,
        options: SyncOptions,
        cancel: &CancellationToken,
    ) -> Outcome<Tracked<K>> {
        let subject = identity.to_string();
        let manager = self.config.resolve_manager(&options);
        let payload = match serde_json::to_vec(&doc) {
            Ok(p) => p,
            Err(e) => return self.fail(op, &subject, SyncError::Encode(e.to_string())),
        };
        let patch = PatchClient::new(self.client.as_ref());
        let state = match cancelable(cancel, patch.apply(&identity, &payload, &manager)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return self.fail(op, &subject, e.into()),
            Err(e) => return self.fail(op, &subject, e),
        };
        let mut tracked = match self.track(identity, doc, &state, options) {
            Ok(t) => t,
            Err(e) => return self.fail(op, &subject, e),
        };
        let mut out = Outcome::empty();
        if !tracked.options.wait_for.is_empty() {
            match self.waits.wait_all(self.client.as_ref(), &tracked.identity, &tracked.options.wait_for, cancel).await {
                Ok(Some(latest)) => self.refresh(op, &mut tracked, &latest, &mut out.diagnostics),
                Ok(None) => {}
                Err(failure) => {
                    if let Some(latest) = failure.last_observed.as_ref() {
                        self.refresh(op, &mut tracked, latest, &mut out.diagnostics);
                    }
                    let e = SyncError::from_wait(&failure);
                    warn!(object = %subject, error = %e, "wait: condition not met; keeping applied state");
                    out.diagnostics.push(Diagnostic::new(op, &subject, e));
                }
            }
        }
        out.value = Some(tracked);
        out
    }

    /// Fold a later server state into `tracked`. On a shape mismatch the
    /// earlier state is kept and the mismatch is reported.
    fn refresh(&self, op: Operation, tracked: &mut Tracked<K>, latest: &ServerState, diags: &mut Vec<Diagnostic>) {
        match self.track(tracked.identity.clone(), tracked.applied.clone(), latest, tracked.options.clone()) {
            Ok(t) => *tracked = t,
            Err(e) => diags.push(Diagnostic::new(op, &tracked.identity.to_string(), e)),
        }
    }

    /// Server state over the caller's applied payload. Only the payload's
    /// values outlive server silence.
    fn track(&self, identity: ResourceIdentity, applied: Json, state: &ServerState, options: SyncOptions) -> Result<Tracked<K>, SyncError> {
        let document = reconcile(&applied, state);
        let manifest: K = materialize(&self.kind, &document)?;
        Ok(Tracked { id: identity.composite_id(), identity, manifest, document, applied, options })
    }

    async fn fetch(&self, identity: &ResourceIdentity, cancel: &CancellationToken) -> Result<ServerState, SyncError> {
        let body = cancelable(cancel, self.client.get(identity)).await??;
        Ok(decode(&body)?)
    }

    fn online(&self) -> Result<(), SyncError> {
        if self.config.offline { Err(SyncError::Offline) } else { Ok(()) }
    }

    fn identity_of(&self, manifest: &K) -> Result<ResourceIdentity, SyncError> {
        ResourceIdentity::from_meta(&self.kind, manifest.metadata())
            .ok_or_else(|| SyncError::Encode("metadata.name and metadata.namespace are required".into()))
    }

    fn subject_of(&self, manifest: &K) -> String {
        let m = manifest.metadata();
        format!("{} {}/{}", self.kind.gvk_key(), m.namespace, m.name)
    }

    fn fail<T>(&self, op: Operation, subject: &str, e: SyncError) -> Outcome<T> {
        counter!("sync_errors", 1u64, "op" => op.as_str());
        warn!(op = %op, object = %subject, error = %e, "sync: failed");
        Outcome::failed(Diagnostic::new(op, subject, e))
    }

    fn finish<T>(&self, op: Operation, t0: Instant, out: &Outcome<T>) {
        if out.value.is_some() {
            counter!("sync_ok", 1u64, "op" => op.as_str());
            info!(op = %op, kind = %self.kind.gvk_key(), warnings = out.warnings().count(), took_ms = %t0.elapsed().as_millis(), "sync: ok");
        }
    }
}

/// Race `fut` against `cancel`. Dropping the losing request future abandons
/// the round trip; the server may or may not have acted on it.
async fn cancelable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Canceled),
        v = fut => Ok(v),
    }
}
