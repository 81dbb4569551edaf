use std::time::{Duration, Instant};

/// Clock injection point so tests can step time deterministically.
type Clock = Box<dyn Fn() -> Instant + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; reject requests until the cooldown elapses.
    Open,
    /// Probing with a single request.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

struct Inner {
    state: CircuitState,
    failures: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    clock: Clock,
}

/// Circuit breaker gating the poll loop.
///
/// Transitions:
///
///   closed    -> (threshold consecutive failures) -> open
///   open      -> (cooldown elapsed)               -> half-open
///   half-open -> (probe succeeds)                 -> closed
///   half-open -> (probe fails)                    -> open (doubled cooldown)
pub struct CircuitBreaker {
    threshold: u32,
    initial_cooldown: Duration,
    max_cooldown: Duration,
    inner: std::sync::Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, max_cooldown: Duration) -> Self {
        Self::with_clock(threshold, cooldown, max_cooldown, Box::new(Instant::now))
    }

    pub fn with_clock(
        threshold: u32,
        cooldown: Duration,
        max_cooldown: Duration,
        clock: Clock,
    ) -> Self {
        let threshold = threshold.max(1);
        let cooldown = cooldown.max(Duration::from_secs(1));
        let max_cooldown = max_cooldown.max(cooldown);
        Self {
            threshold,
            initial_cooldown: cooldown,
            max_cooldown,
            inner: std::sync::Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                cooldown,
                opened_at: None,
                clock,
            }),
        }
    }

    /// Whether a request should be attempted. Open returns false until the
    /// cooldown has elapsed, then flips to half-open and admits one probe;
    /// further calls while half-open are rejected until an outcome is
    /// recorded.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let now = (inner.clock)();
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Reset failures and cooldown; close the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.failures = 0;
        inner.cooldown = self.initial_cooldown;
        inner.state = CircuitState::Closed;
    }

    /// Count a failure. Reaching the threshold opens the circuit; a failed
    /// half-open probe reopens it with a doubled (capped) cooldown.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.failures >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some((inner.clock)());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some((inner.clock)());
                inner.cooldown = (inner.cooldown * 2).min(self.max_cooldown);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    /// Current cooldown, used for poll-loop sleep decisions.
    pub fn cooldown(&self) -> Duration {
        self.inner.lock().expect("breaker mutex poisoned").cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A breaker with a manually-stepped clock.
    fn stepped(threshold: u32, cooldown_secs: u64, max_secs: u64) -> (CircuitBreaker, Arc<AtomicU64>) {
        let offset = Arc::new(AtomicU64::new(0));
        let base = Instant::now();
        let clock_offset = Arc::clone(&offset);
        let cb = CircuitBreaker::with_clock(
            threshold,
            Duration::from_secs(cooldown_secs),
            Duration::from_secs(max_secs),
            Box::new(move || base + Duration::from_secs(clock_offset.load(Ordering::SeqCst))),
        );
        (cb, offset)
    }

    #[test]
    fn closed_allows_and_counts_failures() {
        let (cb, _) = stepped(3, 30, 300);
        assert!(cb.allow());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_blocks_until_cooldown_then_probes_once() {
        let (cb, clock) = stepped(1, 30, 300);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        clock.store(29, Ordering::SeqCst);
        assert!(!cb.allow());

        clock.store(30, Ordering::SeqCst);
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Only one probe per cycle.
        assert!(!cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn half_open_success_closes_and_resets_cooldown() {
        let (cb, clock) = stepped(1, 30, 300);
        cb.record_failure();
        clock.store(30, Ordering::SeqCst);
        assert!(cb.allow());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.cooldown(), Duration::from_secs(30));
        assert!(cb.allow());
    }

    #[test]
    fn half_open_failure_doubles_cooldown_capped() {
        let (cb, clock) = stepped(1, 30, 100);
        cb.record_failure();

        clock.store(30, Ordering::SeqCst);
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.cooldown(), Duration::from_secs(60));

        clock.store(90, Ordering::SeqCst);
        assert!(cb.allow());
        cb.record_failure();
        // 120 capped to 100.
        assert_eq!(cb.cooldown(), Duration::from_secs(100));
    }

    #[test]
    fn success_resets_from_any_state() {
        let (cb, _) = stepped(2, 30, 300);
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn constructor_floors_degenerate_values() {
        let cb = CircuitBreaker::new(0, Duration::ZERO, Duration::ZERO);
        assert!(cb.allow());
        cb.record_failure();
        // threshold floored to 1
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.cooldown() >= Duration::from_secs(1));
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
