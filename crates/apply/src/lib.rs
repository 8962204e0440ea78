//! Tether apply: encode desired state, server-side apply it, and merge the
//! server's answer back into local state.

#![forbid(unsafe_code)]

pub mod codec;
pub mod patch;
pub mod plan;
pub mod reconcile;

pub use codec::{decode, encode, manifest_from_yaml, materialize, EncodeError, MalformedResponse, ServerState};
pub use patch::{ApplyError, PatchClient};
pub use plan::ChangePlan;
pub use reconcile::{merge, reconcile};
