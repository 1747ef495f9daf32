//! Background health probing and the cached per-backend status.
//!
//! Reads never wait on a probe: the router consults the cache only. Each
//! backend gets its own probe task on a fixed interval; the router may also
//! request an out-of-band probe after repeated search failures.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use retrieval_core::config::HealthConfig;
use retrieval_core::error::BackendError;
use retrieval_core::traits::VectorBackend;
use retrieval_core::types::{BackendId, BackendStatus, HealthState};

/// Classified result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend answered and reported this state.
    Reported(HealthState),
    /// The backend positively reported an outage.
    Outage(String),
    /// Timeout, panic or an unclassified error.
    Ambiguous(String),
}

impl ProbeOutcome {
    pub fn from_result(result: Result<HealthState, BackendError>) -> Self {
        match result {
            Ok(HealthState::Unknown) => Self::Ambiguous("probe reported unknown state".into()),
            Ok(state) => Self::Reported(state),
            Err(e) if e.is_explicit_outage() => Self::Outage(e.to_string()),
            Err(e) => Self::Ambiguous(e.to_string()),
        }
    }
}

/// Applies one probe outcome to `status`.
///
/// Ambiguous failures leave the backend Degraded until `threshold` consecutive
/// failures force it to Unreachable.
pub fn apply_probe(status: &mut BackendStatus, outcome: ProbeOutcome, threshold: u32, now: DateTime<Utc>) {
    status.last_checked_at = Some(now);
    match outcome {
        ProbeOutcome::Reported(state @ (HealthState::Healthy | HealthState::Degraded)) => {
            status.state = state;
            status.consecutive_failures = 0;
            status.last_error = None;
        }
        ProbeOutcome::Reported(_) => {
            status.consecutive_failures += 1;
            status.state = HealthState::Unreachable;
            status.last_error = Some("probe reported unreachable".into());
        }
        ProbeOutcome::Outage(err) => {
            status.consecutive_failures += 1;
            status.state = HealthState::Unreachable;
            status.last_error = Some(err);
        }
        ProbeOutcome::Ambiguous(err) => {
            status.consecutive_failures += 1;
            status.state = if status.consecutive_failures >= threshold { HealthState::Unreachable } else { HealthState::Degraded };
            status.last_error = Some(err);
        }
    }
}

struct Shared {
    statuses: RwLock<HashMap<BackendId, BackendStatus>>,
    search_streaks: Mutex<HashMap<BackendId, u32>>,
    in_flight: Mutex<HashSet<BackendId>>,
    config: HealthConfig,
}

impl Shared {
    async fn probe(&self, backend: &dyn VectorBackend, timeout: Duration) -> BackendStatus {
        let call = AssertUnwindSafe(backend.health_check(timeout)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Err(_) => ProbeOutcome::Ambiguous(format!("probe exceeded {timeout:?}")),
            Ok(Err(_)) => ProbeOutcome::Ambiguous("probe panicked".into()),
            Ok(Ok(result)) => ProbeOutcome::from_result(result),
        };
        let id = backend.id();
        let mut statuses = self.statuses.write();
        let status = statuses.entry(id.clone()).or_insert_with(|| BackendStatus::unknown(id.clone()));
        let before = status.state;
        apply_probe(status, outcome, self.config.failure_threshold, Utc::now());
        if status.state == before {
            debug!(backend = %id, state = %status.state, "health probe");
        } else {
            info!(backend = %id, from = %before, to = %status.state, error = ?status.last_error, "backend health changed");
        }
        status.clone()
    }
}

/// Owns probe scheduling and the status cache.
pub struct HealthMonitor {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                statuses: RwLock::new(HashMap::new()),
                search_streaks: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                config,
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Adds `id` to the cache as Unknown if it is not tracked yet.
    pub fn register(&self, id: &BackendId) {
        self.shared.statuses.write().entry(id.clone()).or_insert_with(|| BackendStatus::unknown(id.clone()));
    }

    pub fn status(&self, id: &BackendId) -> BackendStatus {
        self.shared.statuses.read().get(id).cloned().unwrap_or_else(|| BackendStatus::unknown(id.clone()))
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        let mut all: Vec<_> = self.shared.statuses.read().values().cloned().collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }

    /// Probes `backend` now and returns the updated status.
    pub async fn probe_now(&self, backend: &dyn VectorBackend, timeout: Duration) -> BackendStatus {
        self.shared.probe(backend, timeout).await
    }

    /// Fire-and-forget probe on the runtime. At most one spawned probe per
    /// backend is in flight.
    pub fn spawn_probe(&self, backend: Arc<dyn VectorBackend>, timeout: Duration) {
        if !self.shared.in_flight.lock().insert(backend.id().clone()) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.probe(backend.as_ref(), timeout).await;
            shared.in_flight.lock().remove(backend.id());
        });
    }

    /// Starts one periodic probe task per backend. The first probe runs
    /// immediately.
    pub fn start(&self, backends: Vec<(Arc<dyn VectorBackend>, Duration)>) {
        let interval = self.shared.config.interval();
        let mut tasks = self.tasks.lock();
        for (backend, timeout) in backends {
            self.register(backend.id());
            let shared = self.shared.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => { shared.probe(backend.as_ref(), timeout).await; }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() { break; }
                        }
                    }
                }
                debug!(backend = %backend.id(), "health probe task stopped");
            }));
        }
        info!(tasks = tasks.len(), interval_secs = interval.as_secs(), "health monitor started");
    }

    pub fn is_running(&self) -> bool { self.tasks.lock().iter().any(|t| !t.is_finished()) }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.tasks.lock().clear();
    }

    /// Records a failed search. Search failures only feed the consecutive
    /// failure counter; the backend becomes Unreachable once the counter
    /// reaches the failure threshold.
    ///
    /// Returns true when an immediate probe should run: the search failure
    /// streak reached its limit, or this failure just made the backend
    /// Unreachable.
    pub fn record_search_failure(&self, id: &BackendId, err: &BackendError) -> bool {
        let became_unreachable = {
            let mut statuses = self.shared.statuses.write();
            let status = statuses.entry(id.clone()).or_insert_with(|| BackendStatus::unknown(id.clone()));
            status.consecutive_failures += 1;
            status.last_error = Some(err.to_string());
            let crossed = status.consecutive_failures >= self.shared.config.failure_threshold && status.state != HealthState::Unreachable;
            if crossed {
                warn!(backend = %id, failures = status.consecutive_failures, error = %err, "marking backend unreachable after repeated search failures");
                status.state = HealthState::Unreachable;
            }
            crossed
        };
        let mut streaks = self.shared.search_streaks.lock();
        let streak = streaks.entry(id.clone()).or_insert(0);
        *streak += 1;
        if *streak >= self.shared.config.search_failures_before_probe.max(1) || became_unreachable {
            *streak = 0;
            return true;
        }
        false
    }

    /// True when `id` is cached Unreachable, no periodic probe task is
    /// running and its last probe is older than the probe interval. The
    /// router then asks for a probe so a recovered backend is noticed.
    pub fn recheck_due(&self, id: &BackendId) -> bool {
        if self.is_running() {
            return false;
        }
        let statuses = self.shared.statuses.read();
        let Some(status) = statuses.get(id) else { return false };
        if status.state != HealthState::Unreachable {
            return false;
        }
        let interval = chrono::Duration::from_std(self.shared.config.interval()).unwrap_or_else(|_| chrono::Duration::zero());
        status.last_checked_at.map_or(true, |at| Utc::now() - at >= interval)
    }

    pub fn record_search_success(&self, id: &BackendId) {
        self.shared.search_streaks.lock().remove(id);
        if let Some(status) = self.shared.statuses.write().get_mut(id) {
            status.consecutive_failures = 0;
            status.last_error = None;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) { let _ = self.shutdown.send(true); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(id: &str) -> BackendStatus {
        let mut s = BackendStatus::unknown(BackendId::from(id));
        apply_probe(&mut s, ProbeOutcome::Reported(HealthState::Healthy), 3, Utc::now());
        s
    }

    #[test]
    fn ambiguous_failures_degrade_then_force_unreachable() {
        let mut s = healthy("remote");
        assert_eq!(s.state, HealthState::Healthy);
        apply_probe(&mut s, ProbeOutcome::Ambiguous("timeout".into()), 3, Utc::now());
        assert_eq!((s.state, s.consecutive_failures), (HealthState::Degraded, 1));
        apply_probe(&mut s, ProbeOutcome::Outage("refused".into()), 3, Utc::now());
        assert_eq!((s.state, s.consecutive_failures), (HealthState::Unreachable, 2));
        apply_probe(&mut s, ProbeOutcome::Ambiguous("timeout".into()), 3, Utc::now());
        assert_eq!((s.state, s.consecutive_failures), (HealthState::Unreachable, 3));
    }

    #[test]
    fn three_ambiguous_probes_reach_unreachable() {
        let mut s = healthy("remote");
        for expected in [HealthState::Degraded, HealthState::Degraded, HealthState::Unreachable] {
            apply_probe(&mut s, ProbeOutcome::Ambiguous("timeout".into()), 3, Utc::now());
            assert_eq!(s.state, expected);
        }
    }

    #[test]
    fn any_state_reachable_from_any_state() {
        let mut s = BackendStatus::unknown(BackendId::from("local"));
        apply_probe(&mut s, ProbeOutcome::Outage("missing".into()), 3, Utc::now());
        assert_eq!(s.state, HealthState::Unreachable);
        apply_probe(&mut s, ProbeOutcome::Reported(HealthState::Degraded), 3, Utc::now());
        assert_eq!((s.state, s.consecutive_failures), (HealthState::Degraded, 0));
        apply_probe(&mut s, ProbeOutcome::Reported(HealthState::Healthy), 3, Utc::now());
        assert_eq!(s.state, HealthState::Healthy);
        assert!(s.last_error.is_none());
        assert!(s.last_checked_at.is_some());
    }

    #[test]
    fn outcome_classification() {
        assert_eq!(ProbeOutcome::from_result(Ok(HealthState::Degraded)), ProbeOutcome::Reported(HealthState::Degraded));
        assert!(matches!(ProbeOutcome::from_result(Err(BackendError::Unreachable("x".into()))), ProbeOutcome::Outage(_)));
        assert!(matches!(ProbeOutcome::from_result(Err(BackendError::Timeout(Duration::from_secs(1)))), ProbeOutcome::Ambiguous(_)));
        assert!(matches!(ProbeOutcome::from_result(Ok(HealthState::Unknown)), ProbeOutcome::Ambiguous(_)));
    }

    #[test]
    fn second_search_failure_requests_probe() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let id = BackendId::from("remote");
        monitor.register(&id);
        let err = BackendError::Timeout(Duration::from_secs(8));
        assert!(!monitor.record_search_failure(&id, &err));
        assert!(monitor.record_search_failure(&id, &err));
        assert_eq!(monitor.status(&id).state, HealthState::Unknown);
        assert!(monitor.record_search_failure(&id, &err), "crossing the threshold asks for a probe");
        assert_eq!(monitor.status(&id).state, HealthState::Unreachable, "third failure crosses the threshold");

        monitor.record_search_success(&id);
        assert_eq!(monitor.status(&id).consecutive_failures, 0);
    }

    #[test]
    fn one_refused_search_does_not_quarantine() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let id = BackendId::from("remote");
        monitor.register(&id);
        let refused = BackendError::Unreachable("connection refused".into());
        assert!(!monitor.record_search_failure(&id, &refused));
        let s = monitor.status(&id);
        assert_eq!((s.state, s.consecutive_failures), (HealthState::Unknown, 1));
        assert!(!monitor.recheck_due(&id));

        monitor.record_search_failure(&id, &refused);
        monitor.record_search_failure(&id, &refused);
        assert_eq!(monitor.status(&id).state, HealthState::Unreachable);
        assert!(monitor.recheck_due(&id), "never probed since it went down");
    }
}
