//! Per-instance circuit breaker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::RwLock;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("circuit is open"))]
    Open,
    #[snafu(display("half-open probe slot already in use"))]
    HalfOpenExhausted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_size` (or this many consecutive) before opening.
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
    /// Size of the rolling call-count window used by `failure_threshold`.
    pub window_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
            window_calls: 20,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    #[must_use]
    pub fn with_open_duration(mut self, d: Duration) -> Self {
        self.open_duration = d;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Timestamps of failures within the rolling window.
    failures: VecDeque<Instant>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_failures: 0,
            opened_at: None,
            half_open_in_flight: false,
        }
    }
}

/// Permit returned by [`CircuitBreaker::allow`]; the caller must report the
/// call's outcome by consuming it via `success()` or `failure()`.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    is_probe: bool,
}

impl<'a> Permit<'a> {
    pub async fn success(self) {
        self.breaker.record_success(self.is_probe).await;
    }

    pub async fn failure(self) {
        self.breaker.record_failure(self.is_probe).await;
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Non-consuming peek used by provider-selection filtering: true unless
    /// the breaker is OPEN and `open_duration` has not yet elapsed, or it is
    /// HALF_OPEN with a probe already in flight.
    pub async fn would_allow(&self) -> bool {
        let inner = self.inner.read().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.open_duration),
            CircuitState::HalfOpen => !inner.half_open_in_flight,
        }
    }

    /// Requests a permit to make a call. CLOSED always allows; OPEN allows
    /// only once `open_duration` has elapsed (transitioning to HALF_OPEN);
    /// HALF_OPEN allows exactly one in-flight probe.
    pub async fn allow(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                is_probe: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.open_duration);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        is_probe: true,
                    })
                } else {
                    Err(Error::Open)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight {
                    Err(Error::HalfOpenExhausted)
                } else {
                    inner.half_open_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        is_probe: true,
                    })
                }
            }
        }
    }

    async fn record_success(&self, is_probe: bool) {
        let mut inner = self.inner.write().await;
        if is_probe {
            inner.half_open_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self, is_probe: bool) {
        let mut inner = self.inner.write().await;
        if is_probe {
            inner.half_open_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => {
                let now = Instant::now();
                inner.consecutive_failures += 1;
                inner.failures.push_back(now);
                let window = self.config.window_size;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                while inner.failures.len() > self.config.window_calls {
                    inner.failures.pop_front();
                }
                let threshold = self.config.failure_threshold;
                if inner.consecutive_failures >= threshold
                    || inner.failures.len() as u32 >= threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_closed_and_allows() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.allow().await.unwrap().success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let breaker = CircuitBreaker::new(config);
        for _ in 0..3 {
            breaker.allow().await.unwrap().failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(breaker.allow().await.is_err());
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout_then_closes() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_open_duration(Duration::from_millis(10));
        let breaker = CircuitBreaker::new(config);
        breaker.allow().await.unwrap().failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let permit = breaker.allow().await.unwrap();
        permit.success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_open_duration(Duration::from_millis(10));
        let breaker = CircuitBreaker::new(config);
        breaker.allow().await.unwrap().failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let permit = breaker.allow().await.unwrap();
        permit.failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_allows_only_one_probe() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_open_duration(Duration::from_millis(10));
        let breaker = CircuitBreaker::new(config);
        breaker.allow().await.unwrap().failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _first = breaker.allow().await.unwrap();
        assert!(breaker.allow().await.is_err());
    }

    #[test]
    fn config_serde_round_trips() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(7);
        let json = serde_json::to_string(&config).unwrap();
        let back: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.failure_threshold, 7);
    }
}
