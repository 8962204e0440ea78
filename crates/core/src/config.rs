use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{FieldManager, WaitSpec};

pub const DEFAULT_FIELD_MANAGER: &str = "tether";

/// Consecutive fetch failures tolerated while polling a wait condition; the
/// next failure after this many in a row ends the wait.
pub const MAX_CONSECUTIVE_FETCH_FAILURES: u32 = 3;

/// Polling cadence for wait conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitTuning {
    /// First sleep between polls; doubles after each unmet poll.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for WaitTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
            max_consecutive_failures: MAX_CONSECUTIVE_FETCH_FAILURES,
        }
    }
}

/// Provider-wide defaults, handed to every orchestrator at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub field_manager: String,
    pub force_conflicts: bool,
    /// Never contact the API server; every operation fails locally.
    pub offline: bool,
    pub wait: WaitTuning,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            force_conflicts: false,
            offline: false,
            wait: WaitTuning::default(),
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric millisecond setting");
            None
        }
    }
}

impl ProviderConfig {
    /// Defaults overridden by `TETHER_FIELD_MANAGER`, `TETHER_FORCE_CONFLICTS`,
    /// `TETHER_OFFLINE`, `TETHER_WAIT_POLL_MS` and `TETHER_WAIT_MAX_POLL_MS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(name) = std::env::var("TETHER_FIELD_MANAGER") {
            if !name.trim().is_empty() { cfg.field_manager = name.trim().to_string(); }
        }
        if let Some(force) = env_flag("TETHER_FORCE_CONFLICTS") { cfg.force_conflicts = force; }
        if let Some(offline) = env_flag("TETHER_OFFLINE") { cfg.offline = offline; }
        if let Some(d) = env_millis("TETHER_WAIT_POLL_MS") { cfg.wait.poll_interval = d; }
        if let Some(d) = env_millis("TETHER_WAIT_MAX_POLL_MS") { cfg.wait.max_poll_interval = d; }
        if cfg.wait.max_poll_interval < cfg.wait.poll_interval {
            cfg.wait.max_poll_interval = cfg.wait.poll_interval;
        }
        cfg
    }

    /// Field manager for one call: per-resource override first, provider default otherwise.
    pub fn resolve_manager(&self, opts: &SyncOptions) -> FieldManager {
        let name = opts
            .field_manager
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.field_manager);
        FieldManager { name: name.to_string(), force_conflicts: opts.force_conflicts.unwrap_or(self.force_conflicts) }
    }
}

/// Per-resource synchronization settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_conflicts: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<WaitSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_resource_settings_override_defaults() {
        let cfg = ProviderConfig::default();
        let m = cfg.resolve_manager(&SyncOptions::default());
        assert_eq!(m, FieldManager { name: "tether".into(), force_conflicts: false });

        let opts = SyncOptions { field_manager: Some("ci".into()), force_conflicts: Some(true), ..Default::default() };
        let m = cfg.resolve_manager(&opts);
        assert_eq!(m, FieldManager { name: "ci".into(), force_conflicts: true });
    }

    #[test]
    fn blank_override_falls_back_to_default() {
        let cfg = ProviderConfig { field_manager: "ops".into(), force_conflicts: true, ..Default::default() };
        let opts = SyncOptions { field_manager: Some("  ".into()), ..Default::default() };
        assert_eq!(cfg.resolve_manager(&opts), FieldManager { name: "ops".into(), force_conflicts: true });
    }

    #[test]
    fn default_failure_budget_is_three() {
        assert_eq!(WaitTuning::default().max_consecutive_failures, 3);
    }
}
