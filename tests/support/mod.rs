//! Shared fixtures for the end-to-end scenario tests: a permissive protocol
//! spec and scripted providers standing in for the concrete providers the
//! crate deliberately does not ship.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gleitzeit::config::EngineConfig;
use gleitzeit::engine::Engine;
use gleitzeit::manager::WorkflowManager;
use gleitzeit::persistence::InMemoryPersistence;
use gleitzeit::protocol::{MethodSpec, ProtocolRegistry, ProtocolSpec};
use gleitzeit::provider::{HealthCheckResult, Provider, ProviderRegistry, ProviderStatus};
use gleitzeit::workflow::{Workflow, WorkflowStatus};
use uuid::Uuid;

/// A permissive protocol named `{name}/v1` with a single `scripted/run`
/// method: no required parameters, unknown keys allowed, so scenario tests
/// can pass whatever shape of params they need.
pub fn scripted_protocol_named(name: &str) -> ProtocolSpec {
    let mut methods = HashMap::new();
    methods.insert(
        "scripted/run".to_string(),
        MethodSpec {
            params_schema: HashMap::new(),
            returns_schema: None,
        },
    );
    ProtocolSpec {
        name: name.to_string(),
        version: "v1".to_string(),
        description: String::new(),
        methods,
        additional_properties: true,
    }
}

/// The default `scripted/v1` protocol every harness registers up front.
pub fn scripted_protocol() -> ProtocolSpec {
    scripted_protocol_named("scripted")
}

/// Echoes back whatever params it is called with, failing its first
/// `fail_count` calls with a retryable provider error.
pub struct ScriptedProvider {
    calls: AtomicU64,
    fail_count: u64,
}

impl ScriptedProvider {
    #[must_use]
    pub fn always_fails() -> Self {
        Self {
            calls: AtomicU64::new(0),
            fail_count: u64::MAX,
        }
    }

    #[must_use]
    pub fn always_succeeds() -> Self {
        Self {
            calls: AtomicU64::new(0),
            fail_count: 0,
        }
    }

    #[must_use]
    pub fn fails_then_succeeds(fail_count: u64) -> Self {
        Self {
            calls: AtomicU64::new(0),
            fail_count,
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn initialize(&self) -> gleitzeit::provider::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> gleitzeit::provider::Result<()> {
        Ok(())
    }

    fn supported_methods(&self) -> Vec<String> {
        vec!["scripted/run".to_string()]
    }

    async fn health_check(&self) -> HealthCheckResult {
        HealthCheckResult {
            status: ProviderStatus::Healthy,
            details: None,
        }
    }

    async fn handle(&self, _method: &str, params: serde_json::Value) -> gleitzeit::provider::Result<serde_json::Value> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_count {
            return Err(gleitzeit::provider::Error::ProviderError {
                provider_id: "scripted".to_string(),
                message: format!("scripted failure on attempt {attempt}"),
            });
        }
        Ok(params)
    }
}

/// An `Engine` plus `WorkflowManager`, wired to one `scripted/v1` protocol,
/// with the worker loop already running in the background. Callers register
/// provider instances on `engine.providers` before submitting workflows.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub manager: WorkflowManager,
}

pub async fn harness(config: EngineConfig) -> Harness {
    let protocols = ProtocolRegistry::new();
    protocols.register(scripted_protocol()).await.unwrap();

    let persistence = Arc::new(InMemoryPersistence::new());
    let engine = Engine::new(config, protocols, ProviderRegistry::new(), persistence);

    tokio::spawn(engine.clone().run());
    let manager = WorkflowManager::new(engine.clone());
    Harness { engine, manager }
}

/// Polls `manager.status(id)` until the workflow reaches a terminal status
/// or `budget` elapses.
pub async fn wait_for_terminal(manager: &WorkflowManager, id: Uuid, budget: Duration) -> Workflow {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let workflow = manager.status(id).await.unwrap();
        if workflow.status != WorkflowStatus::Queued && workflow.status != WorkflowStatus::Running {
            return workflow;
        }
        if tokio::time::Instant::now() >= deadline {
            return workflow;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
