//! Engine configuration: a plain struct with fluent builders. No file or
//! environment loading ships here — callers construct
//! an `EngineConfig` programmatically and pass it to `Engine::new`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::Strategy as BalancerStrategy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bounded worker pool size (default 5-10).
    pub max_concurrent_tasks: usize,
    /// Default per-call provider timeout.
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,
    /// How long the engine waits for a provider instance to become
    /// available before failing a task with `ProviderUnavailable`.
    #[serde(with = "duration_millis")]
    pub provider_wait_timeout: Duration,
    /// Grace period given to a cancelled task's in-flight provider call.
    #[serde(with = "duration_millis")]
    pub cancellation_grace_period: Duration,
    pub default_retry_policy: RetryPolicy,
    pub default_circuit_breaker: CircuitBreakerConfig,
    pub load_balancer_strategy: BalancerStrategy,
    /// How long metrics snapshots are retained before pruning.
    #[serde(with = "duration_millis")]
    pub metrics_retention: Duration,
    /// Interval between provider health-check sweeps.
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            task_timeout: Duration::from_secs(300),
            provider_wait_timeout: Duration::from_secs(30),
            cancellation_grace_period: Duration::from_secs(10),
            default_retry_policy: RetryPolicy::default(),
            default_circuit_breaker: CircuitBreakerConfig::default(),
            load_balancer_strategy: BalancerStrategy::default(),
            metrics_retention: Duration::from_secs(24 * 60 * 60),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n.max(1);
        self
    }

    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_provider_wait_timeout(mut self, timeout: Duration) -> Self {
        self.provider_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cancellation_grace_period(mut self, grace: Duration) -> Self {
        self.cancellation_grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_default_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_circuit_breaker = config;
        self
    }

    #[must_use]
    pub fn with_load_balancer_strategy(mut self, strategy: BalancerStrategy) -> Self {
        self.load_balancer_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_metrics_retention(mut self, retention: Duration) -> Self {
        self.metrics_retention = retention;
        self
    }

    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
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

    #[test]
    fn default_has_sane_bounds() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent_tasks >= 5);
        assert_eq!(config.task_timeout, Duration::from_secs(300));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = EngineConfig::new()
            .with_max_concurrent_tasks(20)
            .with_task_timeout(Duration::from_secs(60));
        assert_eq!(config.max_concurrent_tasks, 20);
        assert_eq!(config.task_timeout, Duration::from_secs(60));
    }

    #[test]
    fn zero_concurrency_clamped_to_one() {
        let config = EngineConfig::new().with_max_concurrent_tasks(0);
        assert_eq!(config.max_concurrent_tasks, 1);
    }

    #[test]
    fn serde_round_trips() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_concurrent_tasks, config.max_concurrent_tasks);
    }
}
