//! Circuit breaker over arbitrary string keys (channel names, provider
//! ids): `voice-switch::circuit_breaker` generalized from a `Uuid`-keyed
//! per-carrier breaker to a `String`-keyed one, since this gateway trips
//! breakers per channel ("sms", "voice") rather than per carrier (spec §4.4
//! C4's hard blocker: "circuit breaker open on the chosen channel").

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::store::fraud_control::CircuitBreakerSnapshot;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    total_requests: AtomicU64,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    last_failure: RwLock<Option<Instant>>,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failure_threshold,
            success_threshold,
            timeout,
            last_failure: RwLock::new(None),
            opened_at: RwLock::new(None),
        }
    }

    /// Whether a new attempt is allowed right now. An `Open` breaker whose
    /// timeout has elapsed transitions to `HalfOpen` as a side effect.
    pub async fn allow_request(&self) -> bool {
        let current = *self.state.read().await;
        match current {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .read()
                    .await
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.timeout {
                    let mut state = self.state.write().await;
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        self.success_count.store(0, Ordering::SeqCst);
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        let current = *self.state.read().await;
        match current {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.success_threshold {
                    let mut state = self.state.write().await;
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        *self.last_failure.write().await = Some(Instant::now());
        let current = *self.state.read().await;
        match current {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    let mut state = self.state.write().await;
                    *state = CircuitState::Open;
                    *self.opened_at.write().await = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                let mut state = self.state.write().await;
                *state = CircuitState::Open;
                *self.opened_at.write().await = Some(Instant::now());
                self.failure_count.store(self.failure_threshold, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        self.failure_count.load(Ordering::SeqCst) as f64 / total as f64
    }

    async fn snapshot(&self, key: &str) -> CircuitBreakerSnapshot {
        let state = *self.state.read().await;
        CircuitBreakerSnapshot {
            key: key.to_string(),
            state: match state {
                CircuitState::Closed => "closed",
                CircuitState::Open => "open",
                CircuitState::HalfOpen => "half_open",
            }
            .to_string(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            opened_at: if state == CircuitState::Open {
                Some(chrono::Utc::now())
            } else {
                None
            },
        }
    }

    pub async fn reset(&self) {
        *self.state.write().await = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
    }
}

/// One breaker per key, created lazily on first touch. Optionally backed by
/// the store so state changes survive a restart (spec §4.4/§9: breakers are
/// process-wide singletons whose lifecycle is persisted, not re-learned).
pub struct CircuitBreakerManager {
    breakers: DashMap<String, CircuitBreaker>,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    store: RwLock<Option<Arc<Store>>>,
}

impl CircuitBreakerManager {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            success_threshold,
            timeout,
            store: RwLock::new(None),
        }
    }

    /// Wire in the store after construction (it in turn depends on nothing
    /// circuit-breaker-shaped, so this is set once during startup wiring).
    pub async fn attach_store(&self, store: Arc<Store>) {
        *self.store.write().await = Some(store);
    }

    async fn persist(&self, key: &str) {
        let Some(store) = self.store.read().await.clone() else {
            return;
        };
        let snapshot = self.get_or_create(key).snapshot(key).await;
        if let Err(err) = store.circuit_breakers().upsert(&snapshot).await {
            tracing::warn!(key, error = %err, "failed to persist circuit breaker snapshot");
        }
    }

    fn get_or_create(&self, key: &str) -> dashmap::mapref::one::Ref<'_, String, CircuitBreaker> {
        if !self.breakers.contains_key(key) {
            self.breakers.insert(
                key.to_string(),
                CircuitBreaker::new(self.failure_threshold, self.success_threshold, self.timeout),
            );
        }
        self.breakers.get(key).expect("just inserted")
    }

    pub async fn is_available(&self, key: &str) -> bool {
        let was_open = self.get_or_create(key).get_state().await == CircuitState::Open;
        let allowed = self.get_or_create(key).allow_request().await;
        if was_open && self.get_or_create(key).get_state().await == CircuitState::HalfOpen {
            self.persist(key).await;
        }
        allowed
    }

    pub async fn record_success(&self, key: &str) {
        self.get_or_create(key).record_success().await;
        self.persist(key).await;
    }

    pub async fn record_failure(&self, key: &str) {
        self.get_or_create(key).record_failure().await;
        self.persist(key).await;
    }

    pub async fn get_state(&self, key: &str) -> CircuitState {
        self.get_or_create(key).get_state().await
    }

    pub async fn get_open_keys(&self) -> Vec<String> {
        let mut open = Vec::new();
        for entry in self.breakers.iter() {
            if entry.value().get_state().await == CircuitState::Open {
                open.push(entry.key().clone());
            }
        }
        open
    }

    /// Restore persisted snapshots on startup (spec §4.4: breakers survive a
    /// restart rather than re-learning an outage from zero).
    pub async fn restore(&self, key: &str, failures: u32, successes: u32, was_open: bool) {
        let breaker = self.get_or_create(key);
        breaker.failure_count.store(failures, Ordering::SeqCst);
        breaker.success_count.store(successes, Ordering::SeqCst);
        if was_open {
            *breaker.state.write().await = CircuitState::Open;
            *breaker.opened_at.write().await = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_millis(50));
        assert!(cb.allow_request().await);
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitState::Open);
        assert!(!cb.allow_request().await);
    }

    #[tokio::test]
    async fn half_open_recovers_to_closed() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(10));
        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request().await);
        assert_eq!(cb.get_state().await, CircuitState::HalfOpen);
        cb.record_success().await;
        cb.record_success().await;
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn manager_tracks_keys_independently() {
        let mgr = CircuitBreakerManager::new(1, 1, Duration::from_secs(60));
        mgr.record_failure("sms").await;
        assert_eq!(mgr.get_state("sms").await, CircuitState::Open);
        assert_eq!(mgr.get_state("voice").await, CircuitState::Closed);
    }
}
