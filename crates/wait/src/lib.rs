//! Tether wait: poll a server object until a path condition holds.
//!
//! One condition runs `Idle -> Polling -> {Satisfied | TimedOut | Errored}`,
//! with `Canceled` reachable from any wait. Every outcome carries the last
//! server state observed, so a caller can still record progress when the
//! condition is not met.

#![forbid(unsafe_code)]

use std::time::Duration;

use metrics::{counter, histogram};
use tether_apply::{decode, ServerState};
use tether_core::{ResourceIdentity, Timeout, WaitSpec, WaitTuning, UNBOUNDED_WAIT_CEILING};
use tether_kubehub::ResourceClient;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod path;

pub use path::{is_non_empty, render, PathError, PathExpr, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    Idle,
    Polling,
    Satisfied,
    TimedOut,
    Errored,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("invalid wait path: {0}")]
    Path(#[from] PathError),
    #[error("timed out after {timeout} waiting for {condition} (last value: {})", last_value.as_deref().unwrap_or("<unresolved>"))]
    TimedOut { condition: String, timeout: Timeout, last_value: Option<String> },
    #[error("wait for {condition} canceled")]
    Canceled { condition: String },
    #[error("gave up waiting for {condition} after {failures} consecutive fetch failure(s): {cause}")]
    FetchFailed { condition: String, failures: u32, cause: String },
}

impl WaitError {
    pub fn phase(&self) -> WaitPhase {
        match self {
            WaitError::TimedOut { .. } => WaitPhase::TimedOut,
            WaitError::Canceled { .. } => WaitPhase::Canceled,
            WaitError::Path(_) | WaitError::FetchFailed { .. } => WaitPhase::Errored,
        }
    }
}

/// A condition that was met.
#[derive(Debug, Clone)]
pub struct Satisfied {
    pub state: ServerState,
    pub value: String,
    pub polls: u32,
}

/// A condition that was not met, with whatever the server last showed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct WaitFailure {
    pub error: WaitError,
    pub last_observed: Option<ServerState>,
}

impl WaitFailure {
    pub fn phase(&self) -> WaitPhase { self.error.phase() }
}

fn describe(spec: &WaitSpec) -> String {
    match spec.value.as_deref() {
        Some(v) => format!("{} == {:?}", spec.path, v),
        None => format!("{} to be set", spec.path),
    }
}

async fn fetch(client: &dyn ResourceClient, target: &ResourceIdentity) -> Result<ServerState, String> {
    let body = client.get(target).await.map_err(|e| e.to_string())?;
    decode(&body).map_err(|e| e.to_string())
}

/// Polls wait conditions with exponential backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitEngine {
    tuning: WaitTuning,
}

impl WaitEngine {
    pub fn new(tuning: WaitTuning) -> Self { Self { tuning } }

    pub fn tuning(&self) -> &WaitTuning { &self.tuning }

    /// Poll `target` until `spec` holds, its timeout passes, fetching fails
    /// too often in a row, or `cancel` fires.
    ///
    /// An invalid path fails before the first fetch. `Timeout::Immediate`
    /// fetches exactly once and never sleeps.
    pub async fn wait(
        &self,
        client: &dyn ResourceClient,
        target: &ResourceIdentity,
        spec: &WaitSpec,
        cancel: &CancellationToken,
    ) -> Result<Satisfied, WaitFailure> {
        let condition = describe(spec);
        let expr = PathExpr::parse(&spec.path).map_err(|e| WaitFailure { error: e.into(), last_observed: None })?;
        let t0 = Instant::now();
        let deadline = t0
            .checked_add(spec.timeout.budget())
            .unwrap_or_else(|| t0 + UNBOUNDED_WAIT_CEILING);
        let mut delay = self.tuning.poll_interval;
        let mut polls = 0u32;
        let mut failures = 0u32;
        let mut last_cause: Option<String> = None;
        let mut last_observed: Option<ServerState> = None;
        let mut last_value: Option<String> = None;
        debug!(object = %target, condition = %condition, timeout = %spec.timeout, phase = ?WaitPhase::Idle, "wait: start");

        let canceled = |last_observed: Option<ServerState>| {
            counter!("wait_canceled", 1u64);
            info!(object = %target, condition = %condition, "wait: canceled");
            WaitFailure { error: WaitError::Canceled { condition: condition.clone() }, last_observed }
        };
        let timed_out = |polls: u32, last_value: Option<String>, last_observed: Option<ServerState>| {
            counter!("wait_timed_out", 1u64);
            info!(object = %target, condition = %condition, polls, phase = ?WaitPhase::TimedOut, "wait: timed out");
            WaitFailure {
                error: WaitError::TimedOut { condition: condition.clone(), timeout: spec.timeout, last_value },
                last_observed,
            }
        };
        // A zero budget still gets its one fetch.
        let fetch_bounded = !matches!(spec.timeout, Timeout::Immediate);

        loop {
            polls += 1;
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(canceled(last_observed)),
                r = fetch(client, target) => r,
                _ = tokio::time::sleep_until(deadline), if fetch_bounded => {
                    debug!(object = %target, condition = %condition, polls, "wait: fetch outlived the deadline");
                    return Err(timed_out(polls, last_value, last_observed));
                }
            };
            match fetched {
                Ok(state) => {
                    failures = 0;
                    last_cause = None;
                    let value = expr.evaluate(state.as_json());
                    let met = match (&spec.value, &value) {
                        (Some(want), Some(got)) => want == got,
                        (None, Some(got)) => is_non_empty(got),
                        (_, None) => false,
                    };
                    if met {
                        counter!("wait_satisfied", 1u64);
                        histogram!("wait_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
                        info!(object = %target, condition = %condition, polls, took_ms = %t0.elapsed().as_millis(), phase = ?WaitPhase::Satisfied, "wait: satisfied");
                        return Ok(Satisfied { state, value: value.unwrap_or_default(), polls });
                    }
                    debug!(object = %target, condition = %condition, value = ?value, polls, phase = ?WaitPhase::Polling, "wait: not yet");
                    last_value = value;
                    last_observed = Some(state);
                }
                Err(cause) => {
                    failures += 1;
                    warn!(object = %target, condition = %condition, failures, error = %cause, "wait: fetch failed");
                    if failures >= self.tuning.max_consecutive_failures {
                        counter!("wait_failed", 1u64);
                        return Err(WaitFailure {
                            error: WaitError::FetchFailed { condition: condition.clone(), failures, cause },
                            last_observed,
                        });
                    }
                    last_cause = Some(cause);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if let (Timeout::Immediate, Some(cause)) = (spec.timeout, last_cause) {
                    counter!("wait_failed", 1u64);
                    return Err(WaitFailure {
                        error: WaitError::FetchFailed { condition: condition.clone(), failures, cause },
                        last_observed,
                    });
                }
                return Err(timed_out(polls, last_value, last_observed));
            }
            let nap = delay.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(canceled(last_observed)),
                _ = tokio::time::sleep(nap) => {}
            }
            delay = next_delay(delay, self.tuning.max_poll_interval);
        }
    }

    /// Run `specs` one after another, each with its own timeout. Returns the
    /// state observed by the last satisfied condition, or `None` for no specs.
    pub async fn wait_all(
        &self,
        client: &dyn ResourceClient,
        target: &ResourceIdentity,
        specs: &[WaitSpec],
        cancel: &CancellationToken,
    ) -> Result<Option<ServerState>, WaitFailure> {
        let mut last = None;
        for spec in specs.iter() {
            match self.wait(client, target, spec, cancel).await {
                Ok(s) => last = Some(s.state),
                Err(mut f) => {
                    if f.last_observed.is_none() {
                        f.last_observed = last;
                    }
                    return Err(f);
                }
            }
        }
        Ok(last)
    }
}

fn next_delay(cur: Duration, max: Duration) -> Duration { cur.saturating_mul(2).min(max) }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tether_core::{FieldManager, ResourceKind};
    use tether_kubehub::MockCluster;

    fn id() -> ResourceIdentity {
        ResourceIdentity::new(ResourceKind::new("apps", "v1", "Deployment", "deployments"), "ns", "a")
    }

    async fn seeded() -> MockCluster {
        let cluster = MockCluster::new();
        seed(&cluster).await;
        cluster
    }

    async fn seed(cluster: &MockCluster) {
        let body = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "a", "namespace": "ns" },
            "spec": { "replicas": 1 }
        });
        cluster
            .apply(&id(), &serde_json::to_vec(&body).unwrap(), &FieldManager::new("tether"))
            .await
            .unwrap();
    }

    fn engine() -> WaitEngine { WaitEngine::new(WaitTuning::default()) }

    #[tokio::test(start_paused = true)]
    async fn satisfied_once_value_appears() {
        let cluster = seeded().await;
        cluster.on_get(|n, body| {
            if n >= 3 {
                body["status"] = json!({ "phase": "Ready" });
            }
        });
        let spec = WaitSpec::equals("{.status.phase}", "Ready");
        let t0 = Instant::now();
        let ok = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(ok.polls, 3);
        assert_eq!(ok.value, "Ready");
        // 500ms then 1s of backoff before the third poll.
        let took = t0.elapsed();
        assert!(took >= Duration::from_millis(1500) && took < Duration::from_millis(1600), "{:?}", took);
    }

    #[tokio::test(start_paused = true)]
    async fn unset_value_waits_for_non_empty() {
        let cluster = seeded().await;
        cluster.on_get(|n, body| {
            body["status"] = if n >= 2 { json!({ "ip": "10.0.0.7" }) } else { json!({ "ip": "" }) };
        });
        let ok = engine().wait(&cluster, &id(), &WaitSpec::exists("status.ip"), &CancellationToken::new()).await.unwrap();
        assert_eq!(ok.polls, 2);
        assert_eq!(ok.value, "10.0.0.7");
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_timeout_fetches_exactly_once() {
        let cluster = seeded().await;
        let spec = WaitSpec::equals("status.phase", "Ready").with_timeout(Timeout::Immediate);
        let t0 = Instant::now();
        let err = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.phase(), WaitPhase::TimedOut);
        assert_eq!(cluster.get_calls(), 1);
        assert_eq!(t0.elapsed(), Duration::ZERO);
        assert!(err.last_observed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_timeout_can_still_be_satisfied() {
        let cluster = seeded().await;
        let spec = WaitSpec::equals("spec.replicas", "1").with_timeout(Timeout::Immediate);
        let ok = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(ok.polls, 1);
        assert_eq!(cluster.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_timeout_with_failed_fetch_is_an_error() {
        let cluster = seeded().await;
        cluster.fail_next_gets(1);
        let spec = WaitSpec::exists("status.phase").with_timeout(Timeout::Immediate);
        let err = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.phase(), WaitPhase::Errored);
        assert_eq!(cluster.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_timeout_stops_at_the_deadline() {
        let cluster = seeded().await;
        let spec = WaitSpec::equals("status.phase", "Ready").with_timeout(Timeout::Bounded(Duration::from_secs(5)));
        let t0 = Instant::now();
        let err = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.error, WaitError::TimedOut { last_value: None, .. }));
        let took = t0.elapsed();
        assert!(took >= Duration::from_secs(5) && took < Duration::from_millis(5100), "{:?}", took);
        // Polls at 0, 0.5, 1.5, 3.5 and 5 seconds.
        assert_eq!(cluster.get_calls(), 5);
        assert!(err.to_string().contains("timed out after 5s"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_cannot_outlive_the_deadline() {
        let cluster = MockCluster::new().with_latency(Duration::from_secs(20));
        seed(&cluster).await;
        let spec = WaitSpec::equals("status.phase", "Ready").with_timeout(Timeout::Bounded(Duration::from_secs(5)));
        let t0 = Instant::now();
        let err = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.phase(), WaitPhase::TimedOut);
        let took = t0.elapsed();
        assert!(took >= Duration::from_secs(5) && took < Duration::from_millis(5100), "{:?}", took);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_still_completes_under_immediate_timeout() {
        let cluster = MockCluster::new().with_latency(Duration::from_secs(2));
        seed(&cluster).await;
        let spec = WaitSpec::equals("spec.replicas", "1").with_timeout(Timeout::Immediate);
        let t0 = Instant::now();
        let ok = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(ok.polls, 1);
        assert!(t0.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_timeout_is_capped_not_overflowed() {
        let cluster = seeded().await;
        cluster.on_get(|n, body| {
            if n >= 2 {
                body["status"] = json!({ "phase": "Ready" });
            }
        });
        let spec = WaitSpec::equals("status.phase", "Ready").with_timeout(Timeout::Bounded(Duration::MAX));
        let ok = engine().wait(&cluster, &id(), &spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(ok.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_tolerated() {
        let cluster = seeded().await;
        cluster.fail_next_gets(2);
        cluster.on_get(|_, body| body["status"] = json!({ "phase": "Ready" }));
        let ok = engine()
            .wait(&cluster, &id(), &WaitSpec::equals("status.phase", "Ready"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ok.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn third_consecutive_failure_escalates() {
        let cluster = seeded().await;
        cluster.fail_next_gets(3);
        let err = engine()
            .wait(&cluster, &id(), &WaitSpec::exists("status.phase"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.error, WaitError::FetchFailed { failures: 3, .. }), "{:?}", err.error);
        assert_eq!(cluster.get_calls(), 3);
        assert!(err.last_observed.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_object_counts_as_fetch_failure() {
        let cluster = MockCluster::new();
        let err = engine()
            .wait(&cluster, &id(), &WaitSpec::exists("status.phase"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), WaitPhase::Errored);
        assert!(err.to_string().contains("not found"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_path_fails_before_fetching() {
        let cluster = seeded().await;
        let err = engine()
            .wait(&cluster, &id(), &WaitSpec::exists("spec.*"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.error, WaitError::Path(PathError::Unsupported { .. })));
        assert_eq!(cluster.get_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_sleep_reports_canceled() {
        let cluster = seeded().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let spec = WaitSpec::equals("status.phase", "Ready").with_timeout(Timeout::Unbounded);
        let err = engine().wait(&cluster, &id(), &spec, &cancel).await.unwrap_err();
        assert_eq!(err.phase(), WaitPhase::Canceled);
        assert!(err.last_observed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_all_runs_in_order_and_returns_last_state() {
        let cluster = seeded().await;
        cluster.on_get(|n, body| {
            body["status"] = json!({ "phase": if n >= 2 { "Ready" } else { "Pending" }, "observedGeneration": 1 });
        });
        let specs = vec![WaitSpec::exists("status.observedGeneration"), WaitSpec::equals("status.phase", "Ready")];
        let last = engine().wait_all(&cluster, &id(), &specs, &CancellationToken::new()).await.unwrap().unwrap();
        assert_eq!(last.as_json().pointer("/status/phase"), Some(&json!("Ready")));
        assert_eq!(cluster.get_calls(), 2);

        let none = engine().wait_all(&cluster, &id(), &[], &CancellationToken::new()).await.unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(5);
        let mut d = Duration::from_millis(500);
        let mut seen = Vec::new();
        for _ in 0..5 {
            d = next_delay(d, max);
            seen.push(d.as_millis());
        }
        assert_eq!(seen, vec![1000, 2000, 4000, 5000, 5000]);
    }
}
