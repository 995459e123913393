//! Provider contract and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreaker;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("provider {provider_id} failed to initialize: {reason}"))]
    ProviderInitFailed { provider_id: String, reason: String },

    #[snafu(display("provider {provider_id} is not registered"))]
    ProviderNotFound { provider_id: String },

    #[snafu(display("no healthy provider instance for {protocol_id}/{method}"))]
    NoInstanceAvailable { protocol_id: String, method: String },

    #[snafu(display("provider {provider_id} returned an error: {message}"))]
    ProviderError { provider_id: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

// A provider's self-reported health (via `health_check`) is advisory input;
// the registry tracks its own authoritative `ProviderStatus` separately and
// only updates it from these results on its periodic sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: ProviderStatus,
    pub details: Option<String>,
}

impl Default for ProviderStatus {
    fn default() -> Self {
        ProviderStatus::Unknown
    }
}

/// Each implementation satisfies this contract; `handle` is the sole hot path.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    fn supported_methods(&self) -> Vec<String>;
    async fn health_check(&self) -> HealthCheckResult;
    async fn handle(&self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Default)]
pub struct InstanceMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    pub active_requests: u64,
}

impl InstanceMetrics {
    pub fn record(&mut self, duration_ms: f64, success: bool) {
        self.request_count += 1;
        if !success {
            self.error_count += 1;
        }
        // exponential moving average, alpha = 0.2
        if self.request_count == 1 {
            self.avg_response_time_ms = duration_ms;
        } else {
            self.avg_response_time_ms = 0.8 * self.avg_response_time_ms + 0.2 * duration_ms;
        }
    }

    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

pub struct ProviderInstance {
    pub provider_id: String,
    pub protocol_id: String,
    pub capabilities: Vec<String>,
    pub tags: HashMap<String, String>,
    pub priority: f64,
    pub provider: Arc<dyn Provider>,
    pub breaker: CircuitBreaker,
    pub status: RwLock<ProviderStatus>,
    pub metrics: RwLock<InstanceMetrics>,
}

impl ProviderInstance {
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        protocol_id: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            protocol_id: protocol_id.into(),
            capabilities: Vec::new(),
            tags: HashMap::new(),
            priority: 1.0,
            provider,
            breaker: CircuitBreaker::new(Default::default()),
            status: RwLock::new(ProviderStatus::Unknown),
            metrics: RwLock::new(InstanceMetrics::default()),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    async fn supports(&self, method: &str) -> bool {
        self.provider.supported_methods().iter().any(|m| m == method)
    }

    async fn is_selectable(&self) -> bool {
        matches!(
            *self.status.read().await,
            ProviderStatus::Healthy | ProviderStatus::Degraded
        )
    }
}

/// Stores `(provider_id, protocol_id, instance)` tuples and tracks status,
/// deferring selection among candidates to the load balancer.
#[derive(Default)]
pub struct ProviderRegistry {
    instances: RwLock<Vec<Arc<ProviderInstance>>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, instance: ProviderInstance) -> Result<()> {
        instance.provider.initialize().await?;
        *instance.status.write().await = ProviderStatus::Healthy;
        self.instances.write().await.push(Arc::new(instance));
        Ok(())
    }

    pub async fn instances_for_protocol(&self, protocol_id: &str) -> Vec<Arc<ProviderInstance>> {
        self.instances
            .read()
            .await
            .iter()
            .filter(|i| i.protocol_id == protocol_id)
            .cloned()
            .collect()
    }

    /// Candidate set for a call: protocol matches, method supported, status
    /// selectable, circuit breaker permits, capabilities satisfied. The load
    /// balancer picks among these; this only filters.
    pub async fn candidates(
        &self,
        protocol_id: &str,
        method: &str,
        required_capabilities: &[String],
    ) -> Vec<Arc<ProviderInstance>> {
        let mut out = Vec::new();
        for instance in self.instances.read().await.iter() {
            if instance.protocol_id != protocol_id {
                continue;
            }
            if !instance.supports(method).await {
                continue;
            }
            if !instance.is_selectable().await {
                continue;
            }
            if !instance.breaker.would_allow().await {
                continue;
            }
            if !required_capabilities
                .iter()
                .all(|c| instance.capabilities.iter().any(|ic| ic == c))
            {
                continue;
            }
            out.push(instance.clone());
        }
        out
    }

    pub async fn set_status(&self, provider_id: &str, status: ProviderStatus) -> Result<()> {
        let instances = self.instances.read().await;
        let instance = instances
            .iter()
            .find(|i| i.provider_id == provider_id)
            .ok_or_else(|| Error::ProviderNotFound {
                provider_id: provider_id.to_string(),
            })?;
        *instance.status.write().await = status;
        Ok(())
    }

    /// Runs every registered instance's `health_check` and updates its
    /// tracked status; intended to be driven by a periodic background loop,
    /// independent of the request path.
    pub async fn run_health_checks(&self) {
        for instance in self.instances.read().await.iter() {
            let result = instance.provider.health_check().await;
            *instance.status.write().await = result.status;
        }
    }

    pub async fn shutdown_all(&self) -> Result<()> {
        for instance in self.instances.read().await.iter() {
            instance.provider.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct EchoProvider {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Provider for EchoProvider {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        fn supported_methods(&self) -> Vec<String> {
            vec!["echo/echo".to_string()]
        }
        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult {
                status: ProviderStatus::Healthy,
                details: None,
            }
        }
        async fn handle(&self, _method: &str, params: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(params)
        }
    }

    #[tokio::test]
    async fn register_and_select_candidate() {
        let registry = ProviderRegistry::new();
        let provider = Arc::new(EchoProvider {
            calls: AtomicU64::new(0),
        });
        let instance = ProviderInstance::new("p1", "echo/v1", provider);
        registry.register(instance).await.unwrap();

        let candidates = registry.candidates("echo/v1", "echo/echo", &[]).await;
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn unhealthy_instance_is_not_a_candidate() {
        let registry = ProviderRegistry::new();
        let provider = Arc::new(EchoProvider {
            calls: AtomicU64::new(0),
        });
        let instance = ProviderInstance::new("p1", "echo/v1", provider);
        registry.register(instance).await.unwrap();
        registry.set_status("p1", ProviderStatus::Unhealthy).await.unwrap();

        let candidates = registry.candidates("echo/v1", "echo/echo", &[]).await;
        assert!(candidates.is_empty());
    }
}
