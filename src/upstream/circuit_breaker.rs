use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// One breaker per `"{service}-{instance}"` key. Keys are registered up front
/// from the static topology, so the map never grows with request traffic.
/// Counters are cumulative: `successes` only ever grows and `failures` is
/// cleared only when a half-open trial succeeds.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<CircuitState>>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    failures: u64,
    successes: u64,
    last_failure: Option<Instant>,
    /// A half-open trial is running; everyone else is rejected until it ends.
    trial_in_flight: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

impl CircuitState {
    fn failure_percent(&self) -> f64 {
        let total = self.failures + self.successes;
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64 * 100.0
    }
}

/// Point-in-time copy of one breaker, for the admin API and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub status: CircuitStatus,
    pub failures: u64,
    pub successes: u64,
    pub since_last_failure: Option<Duration>,
}

/// Error from [`CircuitBreakerRegistry::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    Open,
    /// The operation ran and failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open => write!(f, "circuit breaker open"),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Build a registry with every key known up front.
    pub fn with_keys<I, S>(config: CircuitBreakerConfig, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new(config);
        for key in keys {
            registry.register(key);
        }
        registry
    }

    pub fn register(&self, key: impl Into<String>) {
        self.breakers
            .entry(key.into())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::default())));
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker for `key`.
    ///
    /// While the circuit is open the operation is not invoked and
    /// `BreakerError::Open` is returned. Once the open timeout has elapsed,
    /// the next call becomes the half-open trial and runs live.
    pub async fn execute<T, E, F, Fut>(&self, key: &str, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(key);
        let mut permit = match self.try_acquire(key, &breaker) {
            Some(p) => p,
            None => {
                metrics::counter!(
                    "gateway_circuit_breaker_rejected_total",
                    "key" => key.to_owned(),
                )
                .increment(1);
                return Err(BreakerError::Open);
            }
        };

        let result = operation().await;
        permit.completed = true;

        let trial = permit.trial;
        let mut state = lock(&breaker);
        if trial {
            state.trial_in_flight = false;
        }
        match result {
            Ok(v) => {
                self.on_success(key, &mut state, trial);
                Ok(v)
            }
            Err(e) => {
                self.on_failure(key, &mut state, trial);
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Current state of `key`, or `None` if the key was never registered.
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let breaker = self.breakers.get(key)?.value().clone();
        let state = lock(&breaker);
        Some(CircuitSnapshot {
            status: state.status,
            failures: state.failures,
            successes: state.successes,
            since_last_failure: state.last_failure.map(|at| at.elapsed()),
        })
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(entry) = self.breakers.get(key) {
            return entry.value().clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::default())))
            .clone()
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.config.open_timeout_ms)
    }

    fn try_acquire(&self, key: &str, breaker: &Arc<Mutex<CircuitState>>) -> Option<Permit> {
        let mut state = lock(breaker);
        match state.status {
            CircuitStatus::Closed => Some(Permit::new(breaker, false)),
            CircuitStatus::Open => {
                let expired = state
                    .last_failure
                    .map(|at| at.elapsed() > self.open_timeout())
                    .unwrap_or(true);
                if !expired {
                    return None;
                }
                state.status = CircuitStatus::HalfOpen;
                state.trial_in_flight = true;
                record_transition(key, CircuitStatus::HalfOpen);
                tracing::info!("circuit_breaker: half-open, key={}, probing recovery", key);
                Some(Permit::new(breaker, true))
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    return None;
                }
                state.trial_in_flight = true;
                Some(Permit::new(breaker, true))
            }
        }
    }

    /// Only the half-open trial itself may close the circuit; a call admitted
    /// earlier while closed just adds to the counters.
    fn on_success(&self, key: &str, state: &mut CircuitState, trial: bool) {
        state.successes += 1;
        if trial && state.status == CircuitStatus::HalfOpen {
            state.failures = 0;
            state.status = CircuitStatus::Closed;
            record_transition(key, CircuitStatus::Closed);
            tracing::info!("circuit_breaker: closed, key={}, trial succeeded", key);
        }
    }

    fn on_failure(&self, key: &str, state: &mut CircuitState, trial: bool) {
        state.failures += 1;
        state.last_failure = Some(Instant::now());
        let evaluate = match state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::HalfOpen => trial,
            CircuitStatus::Open => false,
        };
        if !evaluate {
            return;
        }
        let percent = state.failure_percent();
        if percent >= self.config.failure_threshold_percent {
            state.status = CircuitStatus::Open;
            record_transition(key, CircuitStatus::Open);
            tracing::warn!(
                "circuit_breaker: opened, key={}, failures={}, successes={}, failure_percent={:.1}",
                key,
                state.failures,
                state.successes,
                percent
            );
        }
    }
}

/// Tracks one admitted call. If the call's future is dropped before it
/// completes, a half-open trial slot is released so the breaker cannot
/// wedge in `HalfOpen`.
struct Permit {
    breaker: Arc<Mutex<CircuitState>>,
    trial: bool,
    completed: bool,
}

impl Permit {
    fn new(breaker: &Arc<Mutex<CircuitState>>, trial: bool) -> Self {
        Self {
            breaker: breaker.clone(),
            trial,
            completed: false,
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.trial && !self.completed {
            lock(&self.breaker).trial_in_flight = false;
        }
    }
}

fn lock(breaker: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
    breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record_transition(key: &str, to: CircuitStatus) {
    metrics::counter!(
        "gateway_circuit_breaker_transitions_total",
        "key" => key.to_owned(),
        "to" => to.as_str(),
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: f64, open_timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold_percent: threshold,
            open_timeout_ms,
            count_client_errors: false,
        }
    }

    async fn succeed(reg: &CircuitBreakerRegistry, key: &str) -> Result<(), BreakerError<&'static str>> {
        reg.execute(key, || async { Ok::<(), &'static str>(()) }).await
    }

    async fn fail(reg: &CircuitBreakerRegistry, key: &str) -> Result<(), BreakerError<&'static str>> {
        reg.execute(key, || async { Err::<(), _>("boom") }).await
    }

    fn status(reg: &CircuitBreakerRegistry, key: &str) -> CircuitStatus {
        reg.snapshot(key).unwrap().status
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let reg = CircuitBreakerRegistry::with_keys(config(50.0, 1000), ["svc-a"]);
        assert_eq!(status(&reg, "svc-a"), CircuitStatus::Closed);
        assert!(succeed(&reg, "svc-a").await.is_ok());
        let snap = reg.snapshot("svc-a").unwrap();
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 0);
        assert!(snap.since_last_failure.is_none());
    }

    #[tokio::test]
    async fn test_exact_threshold_boundary_opens() {
        // 1 success + 1 failure = 50%, and the comparison is `>=`.
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        succeed(&reg, "k").await.unwrap();
        assert!(matches!(fail(&reg, "k").await, Err(BreakerError::Inner("boom"))));
        assert_eq!(status(&reg, "k"), CircuitStatus::Open);
    }

    #[tokio::test]
    async fn test_below_threshold_stays_closed() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        succeed(&reg, "k").await.unwrap();
        succeed(&reg, "k").await.unwrap();
        let _ = fail(&reg, "k").await;
        // 1 / 3 = 33%.
        assert_eq!(status(&reg, "k"), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_single_failure_opens() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        let _ = fail(&reg, "k").await;
        assert_eq!(status(&reg, "k"), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking_operation() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        let _ = fail(&reg, "k").await;

        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let res = reg
                .execute("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), &'static str>(())
                })
                .await;
            assert!(matches!(res, Err(BreakerError::Open)));
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        // Exactly at the timeout is still open; the transition needs `>`.
        assert!(matches!(succeed(&reg, "k").await, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_and_resets_failures() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        let _ = fail(&reg, "k").await;
        let _ = fail(&reg, "k").await; // rejected, not counted
        assert_eq!(reg.snapshot("k").unwrap().failures, 1);

        tokio::time::advance(Duration::from_millis(1001)).await;

        let calls = AtomicU32::new(0);
        let res = reg
            .execute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, &'static str>(7)
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snap = reg.snapshot("k").unwrap();
        assert_eq!(snap.status, CircuitStatus::Closed);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        let _ = fail(&reg, "k").await;
        tokio::time::advance(Duration::from_millis(1001)).await;

        let calls = AtomicU32::new(0);
        let res = reg
            .execute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("still down")
            })
            .await;
        assert!(matches!(res, Err(BreakerError::Inner("still down"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snap = reg.snapshot("k").unwrap();
        assert_eq!(snap.status, CircuitStatus::Open);
        assert_eq!(snap.failures, 2);

        // The timer restarted from the failed trial.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(matches!(succeed(&reg, "k").await, Err(BreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let reg = Arc::new(CircuitBreakerRegistry::new(config(50.0, 100)));
        let _ = fail(&reg, "k").await;
        tokio::time::advance(Duration::from_millis(101)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = tokio::spawn({
            let reg = reg.clone();
            async move {
                reg.execute("k", || async move {
                    let _ = release_rx.await;
                    Ok::<(), &'static str>(())
                })
                .await
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(status(&reg, "k"), CircuitStatus::HalfOpen);

        // A concurrent caller is turned away while the trial runs.
        assert!(matches!(succeed(&reg, "k").await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(status(&reg, "k"), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 100));
        let _ = fail(&reg, "k").await;
        tokio::time::advance(Duration::from_millis(101)).await;

        {
            let fut = reg.execute("k", || std::future::pending::<Result<(), &'static str>>());
            let _ = tokio::time::timeout(Duration::from_millis(10), fut).await;
        }
        assert_eq!(status(&reg, "k"), CircuitStatus::HalfOpen);
        assert!(succeed(&reg, "k").await.is_ok());
        assert_eq!(status(&reg, "k"), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let reg = CircuitBreakerRegistry::with_keys(config(50.0, 60_000), ["svc-a", "svc-b"]);
        let _ = fail(&reg, "svc-b").await;
        assert_eq!(status(&reg, "svc-b"), CircuitStatus::Open);
        assert_eq!(status(&reg, "svc-a"), CircuitStatus::Closed);
        assert!(succeed(&reg, "svc-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_key_created_lazily() {
        let reg = CircuitBreakerRegistry::new(config(50.0, 1000));
        assert!(reg.snapshot("new").is_none());
        assert!(reg.is_empty());
        succeed(&reg, "new").await.unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_breaker_error_display() {
        assert_eq!(BreakerError::<&str>::Open.to_string(), "circuit breaker open");
        assert_eq!(BreakerError::Inner("x").to_string(), "x");
    }
}
