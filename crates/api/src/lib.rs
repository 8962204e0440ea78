//! Tether public API: the per-kind sync orchestrator and its result types.
//!
//! Frontends (the CLI, an infrastructure-as-code host) drive an
//! [`Orchestrator`] through five lifecycle operations and get back an
//! [`Outcome`]: an optional value plus diagnostics. Failures never panic and
//! never escape as bare errors; they arrive as [`Diagnostic`]s.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tether_apply::{ApplyError, EncodeError, MalformedResponse};
use tether_core::{InvalidImportIdentifier, Manifest, ResourceIdentity, SyncOptions};
use tether_kubehub::ClientError;
use tether_wait::{WaitFailure, WaitPhase};

mod orchestrator;

pub use orchestrator::Orchestrator;
pub use tether_core::prelude;

/// Lifecycle entry points, used to label diagnostics and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Import,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Import => "import",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Everything that can go wrong during a sync operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("provider is offline; no request was sent")]
    Offline,
    #[error("encoding desired state: {0}")]
    Encode(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected by server ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("{0}")]
    FieldConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The server answered a mutation with something unreadable. Whether the
    /// mutation took effect is unknown.
    #[error("unreadable server response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    InvalidImportIdentifier(#[from] InvalidImportIdentifier),
    #[error("namespace/name cannot change from {from:?} to {to:?}; replace the resource instead")]
    IdentityChanged { from: String, to: String },
    #[error("canceled before the server confirmed the request")]
    Canceled,
    #[error("{0}")]
    WaitTimedOut(String),
    #[error("{0}")]
    WaitCanceled(String),
    #[error("{0}")]
    WaitFailed(String),
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            SyncError::WaitTimedOut(_) | SyncError::WaitFailed(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            SyncError::Offline => "Provider is offline",
            SyncError::Encode(_) => "Invalid desired state",
            SyncError::Transport(_) => "API request failed",
            SyncError::Rejected { .. } => "Request rejected by the API server",
            SyncError::FieldConflict(_) => "Field ownership conflict",
            SyncError::NotFound(_) => "Resource not found",
            SyncError::MalformedResponse(_) => "Unexpected API server response",
            SyncError::InvalidImportIdentifier(_) => "Invalid import identifier",
            SyncError::IdentityChanged { .. } => "Resource identity cannot change",
            SyncError::Canceled => "Operation canceled",
            SyncError::WaitTimedOut(_) => "Wait condition not met in time",
            SyncError::WaitCanceled(_) => "Wait canceled",
            SyncError::WaitFailed(_) => "Wait condition could not be checked",
        }
    }

    /// Convert a wait that did not succeed. The mutation itself already did.
    pub fn from_wait(failure: &WaitFailure) -> Self {
        let msg = failure.error.to_string();
        match failure.phase() {
            WaitPhase::TimedOut => SyncError::WaitTimedOut(msg),
            WaitPhase::Canceled => SyncError::WaitCanceled(msg),
            _ => SyncError::WaitFailed(msg),
        }
    }
}

impl From<ClientError> for SyncError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Conflict(m) => SyncError::FieldConflict(m),
            ClientError::NotFound(m) => SyncError::NotFound(m),
            ClientError::Rejected { code, message } => SyncError::Rejected { code, message },
            ClientError::Invalid(m) => SyncError::Encode(m),
            ClientError::Transport(m) => SyncError::Transport(m),
        }
    }
}

impl From<ApplyError> for SyncError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Client(c) => c.into(),
            ApplyError::Malformed(m) => m.into(),
        }
    }
}

impl From<MalformedResponse> for SyncError {
    fn from(e: MalformedResponse) -> Self { SyncError::MalformedResponse(e.to_string()) }
}

impl From<EncodeError> for SyncError {
    fn from(e: EncodeError) -> Self { SyncError::Encode(e.to_string()) }
}

/// A user-facing report attached to an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    /// Operation, identity and underlying cause.
    pub detail: String,
    pub cause: SyncError,
}

impl Diagnostic {
    pub fn new(op: Operation, subject: &str, cause: SyncError) -> Self {
        let mut detail = format!("{} {}: {}", op, subject, cause);
        if matches!(cause, SyncError::FieldConflict(_)) {
            detail.push_str(" (set force_conflicts to take ownership of the conflicting fields)");
        }
        Self { severity: cause.severity(), summary: cause.summary().to_string(), detail, cause }
    }

    pub fn is_error(&self) -> bool { self.severity == Severity::Error }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", sev, self.summary, self.detail)
    }
}

/// Result of one lifecycle operation.
///
/// `value` is `None` when the operation produced nothing to record: a local
/// or server failure before any confirmed effect, or a read of an object that
/// no longer exists.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: Option<T>,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self { Self { value: Some(value), diagnostics: Vec::new() } }

    pub fn empty() -> Self { Self { value: None, diagnostics: Vec::new() } }

    pub fn failed(diagnostic: Diagnostic) -> Self { Self { value: None, diagnostics: vec![diagnostic] } }

    pub fn has_errors(&self) -> bool { self.diagnostics.iter().any(Diagnostic::is_error) }

    /// First error-severity cause, if any.
    pub fn error(&self) -> Option<&SyncError> { self.diagnostics.iter().find(|d| d.is_error()).map(|d| &d.cause) }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Warning)
    }
}

/// Desired state for one object, plus its sync settings.
#[derive(Debug, Clone)]
pub struct Desired<K> {
    pub manifest: K,
    pub options: SyncOptions,
}

impl<K: Manifest> Desired<K> {
    pub fn new(manifest: K) -> Self { Self { manifest, options: SyncOptions::default() } }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }
}

/// What the caller records after a successful operation.
#[derive(Debug, Clone, Serialize)]
pub struct Tracked<K> {
    /// Composite id, `<namespace>/<name>`.
    pub id: String,
    #[serde(skip)]
    pub identity: ResourceIdentity,
    pub manifest: K,
    /// Merged document: caller's explicit values overlaid with everything
    /// the server returned.
    pub document: Json,
    /// The payload last sent for this object. Later reads merge over this,
    /// never over `document`, so fields the server drops disappear locally.
    #[serde(skip)]
    pub applied: Json,
    #[serde(skip)]
    pub options: SyncOptions,
}

impl<K> Tracked<K> {
    pub fn resource_version(&self) -> Option<&str> {
        self.document.pointer("/metadata/resourceVersion").and_then(|v| v.as_str())
    }

    pub fn generation(&self) -> Option<i64> { self.document.pointer("/metadata/generation").and_then(|v| v.as_i64()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wait::WaitError;

    #[test]
    fn client_errors_map_onto_the_taxonomy() {
        assert_eq!(SyncError::from(ClientError::Conflict("c".into())), SyncError::FieldConflict("c".into()));
        assert_eq!(SyncError::from(ClientError::NotFound("n".into())), SyncError::NotFound("n".into()));
        assert_eq!(
            SyncError::from(ClientError::Rejected { code: 422, message: "bad".into() }),
            SyncError::Rejected { code: 422, message: "bad".into() }
        );
        assert!(matches!(SyncError::from(ClientError::Transport("t".into())), SyncError::Transport(_)));
        assert!(matches!(
            SyncError::from(ApplyError::Malformed(MalformedResponse::MissingName)),
            SyncError::MalformedResponse(_)
        ));
    }

    #[test]
    fn wait_outcomes_have_the_right_severity() {
        let failure = |error| WaitFailure { error, last_observed: None };
        let timed_out = SyncError::from_wait(&failure(WaitError::TimedOut {
            condition: "status.phase".into(),
            timeout: tether_core::Timeout::Immediate,
            last_value: None,
        }));
        assert_eq!(timed_out.severity(), Severity::Warning);
        let canceled = SyncError::from_wait(&failure(WaitError::Canceled { condition: "x".into() }));
        assert!(matches!(canceled, SyncError::WaitCanceled(_)));
        assert_eq!(canceled.severity(), Severity::Error);
        let failed = SyncError::from_wait(&failure(WaitError::FetchFailed { condition: "x".into(), failures: 3, cause: "boom".into() }));
        assert!(matches!(failed, SyncError::WaitFailed(_)));
        assert_eq!(failed.severity(), Severity::Warning);
    }

    #[test]
    fn diagnostic_detail_names_operation_and_subject() {
        let d = Diagnostic::new(Operation::Update, "apps/v1/Deployment ns/a", SyncError::FieldConflict("conflict with \"kubectl\": .spec.replicas".into()));
        assert!(d.is_error());
        assert_eq!(d.summary, "Field ownership conflict");
        assert!(d.detail.starts_with("update apps/v1/Deployment ns/a: "));
        assert!(d.detail.contains("kubectl"));
        assert!(d.detail.contains("force_conflicts"));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["severity"], "error");
    }

    #[test]
    fn outcome_reports_first_error() {
        let mut o: Outcome<()> = Outcome::ok(());
        assert!(!o.has_errors());
        o.diagnostics.push(Diagnostic::new(Operation::Create, "x", SyncError::WaitTimedOut("slow".into())));
        assert!(!o.has_errors());
        assert_eq!(o.warnings().count(), 1);
        o.diagnostics.push(Diagnostic::new(Operation::Create, "x", SyncError::Canceled));
        assert_eq!(o.error(), Some(&SyncError::Canceled));
    }
}
