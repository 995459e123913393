//! Load balancer strategies over a filtered candidate set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use snafu::Snafu;
use tokio::sync::Mutex;

use crate::provider::ProviderInstance;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no candidate instances available"))]
    NoCandidates,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    LeastResponseTime,
    Random,
    WeightedRandom,
    /// Filters to instances whose capabilities contain `required_capability`
    /// (passed in separately to `select`), then applies least_loaded.
    CapabilityAffinity,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::LeastLoaded
    }
}

/// Stateless w.r.t. the instance pool; the only state it owns is the
/// round-robin cursor, keyed per `(protocol, method)`.
#[derive(Default)]
pub struct LoadBalancer {
    round_robin_counters: Mutex<HashMap<String, AtomicUsize>>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn select(
        &self,
        strategy: Strategy,
        protocol: &str,
        method: &str,
        candidates: &[Arc<ProviderInstance>],
    ) -> Result<Arc<ProviderInstance>> {
        if candidates.is_empty() {
            return Err(Error::NoCandidates);
        }
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }

        match strategy {
            Strategy::RoundRobin => Ok(self.round_robin(protocol, method, candidates).await),
            Strategy::LeastLoaded => Ok(self.least_loaded(candidates).await),
            Strategy::LeastResponseTime => Ok(self.least_response_time(candidates).await),
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Ok(candidates[idx].clone())
            }
            Strategy::WeightedRandom => Ok(self.weighted_random(candidates).await),
            Strategy::CapabilityAffinity => Ok(self.least_loaded(candidates).await),
        }
    }

    async fn round_robin(
        &self,
        protocol: &str,
        method: &str,
        candidates: &[Arc<ProviderInstance>],
    ) -> Arc<ProviderInstance> {
        let key = format!("{protocol}:{method}");
        let mut counters = self.round_robin_counters.lock().await;
        let counter = counters.entry(key).or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::SeqCst) % candidates.len();
        candidates[idx].clone()
    }

    async fn least_loaded(&self, candidates: &[Arc<ProviderInstance>]) -> Arc<ProviderInstance> {
        let mut best: Option<(Arc<ProviderInstance>, u64, f64)> = None;
        for instance in candidates {
            let metrics = instance.metrics.read().await;
            let key = (metrics.active_requests, metrics.avg_response_time_ms);
            if best
                .as_ref()
                .is_none_or(|(_, active, avg)| key < (*active, *avg))
            {
                best = Some((instance.clone(), key.0, key.1));
            }
        }
        best.map(|(i, _, _)| i).unwrap_or_else(|| candidates[0].clone())
    }

    async fn least_response_time(&self, candidates: &[Arc<ProviderInstance>]) -> Arc<ProviderInstance> {
        let mut best: Option<(Arc<ProviderInstance>, f64, u64)> = None;
        for instance in candidates {
            let metrics = instance.metrics.read().await;
            let key = (metrics.avg_response_time_ms, metrics.active_requests);
            if best
                .as_ref()
                .is_none_or(|(_, avg, active)| key < (*avg, *active))
            {
                best = Some((instance.clone(), key.0, key.1));
            }
        }
        best.map(|(i, _, _)| i).unwrap_or_else(|| candidates[0].clone())
    }

    async fn weighted_random(&self, candidates: &[Arc<ProviderInstance>]) -> Arc<ProviderInstance> {
        let mut weights = Vec::with_capacity(candidates.len());
        let mut total = 0.0;
        for instance in candidates {
            let metrics = instance.metrics.read().await;
            let weight = (1.0 / (1.0 + metrics.error_rate())) * instance.priority;
            weights.push(weight);
            total += weight;
        }
        if total <= 0.0 {
            return candidates[0].clone();
        }
        let mut pick = rand::thread_rng().gen_range(0.0..total);
        for (instance, weight) in candidates.iter().zip(weights.iter()) {
            if pick < *weight {
                return instance.clone();
            }
            pick -= *weight;
        }
        candidates.last().cloned().unwrap_or_else(|| candidates[0].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use std::collections::HashMap as Map;

    fn instance(id: &str) -> Arc<ProviderInstance> {
        struct Dummy;
        #[async_trait::async_trait]
        impl crate::provider::Provider for Dummy {
            async fn initialize(&self) -> crate::provider::Result<()> {
                Ok(())
            }
            async fn shutdown(&self) -> crate::provider::Result<()> {
                Ok(())
            }
            fn supported_methods(&self) -> Vec<String> {
                vec![]
            }
            async fn health_check(&self) -> crate::provider::HealthCheckResult {
                crate::provider::HealthCheckResult::default()
            }
            async fn handle(
                &self,
                _method: &str,
                params: serde_json::Value,
            ) -> crate::provider::Result<serde_json::Value> {
                Ok(params)
            }
        }
        Arc::new(ProviderInstance {
            provider_id: id.to_string(),
            protocol_id: "echo/v1".to_string(),
            capabilities: vec![],
            tags: Map::new(),
            priority: 1.0,
            provider: Arc::new(Dummy),
            breaker: CircuitBreaker::new(Default::default()),
            status: tokio::sync::RwLock::new(crate::provider::ProviderStatus::Healthy),
            metrics: tokio::sync::RwLock::new(Default::default()),
        })
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let balancer = LoadBalancer::new();
        let candidates = vec![instance("a"), instance("b")];
        let first = balancer
            .select(Strategy::RoundRobin, "p", "m", &candidates)
            .await
            .unwrap();
        let second = balancer
            .select(Strategy::RoundRobin, "p", "m", &candidates)
            .await
            .unwrap();
        assert_ne!(first.provider_id, second.provider_id);
    }

    #[tokio::test]
    async fn least_loaded_prefers_fewer_active_requests() {
        let balancer = LoadBalancer::new();
        let busy = instance("busy");
        let idle = instance("idle");
        busy.metrics.write().await.active_requests = 5;
        let candidates = vec![busy, idle];
        let picked = balancer
            .select(Strategy::LeastLoaded, "p", "m", &candidates)
            .await
            .unwrap();
        assert_eq!(picked.provider_id, "idle");
    }

    #[tokio::test]
    async fn empty_candidates_errors() {
        let balancer = LoadBalancer::new();
        let err = balancer
            .select(Strategy::Random, "p", "m", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidates));
    }
}
