//! # Gleitzeit - Distributed Workflow Orchestration Engine
//!
//! Gleitzeit executes DAG-shaped workflows against a registry of pluggable
//! providers, with durable persistence, circuit breakers, retry policies,
//! and load balancing between provider instances.
//!
//! ## Core Modules
//!
//! - [`engine`] - The worker-pool execution loop: dequeues ready tasks,
//!   resolves parameters, dispatches to providers, handles retries and
//!   crash recovery
//! - [`manager`] - Submission-time DAG validation and workflow templates,
//!   layered above [`engine`]
//! - [`batch`] - Directory-of-files fan-out built on top of [`manager`]
//! - [`provider`] - The provider contract and registry
//! - [`protocol`] - Protocol/method schemas and parameter validation
//! - [`balancer`] - Load balancing strategies over candidate provider
//!   instances
//! - [`circuit_breaker`] - Per-instance circuit breaker
//! - [`retry`] - Backoff policies for retryable task failures
//! - [`queue`] - Priority-ordered, dependency-aware ready queue
//! - [`resolver`] - `${ref.path}` parameter substitution against prior
//!   task results
//! - [`workflow`] - Task/Workflow/Template data model
//! - [`persistence`] - Pluggable durable storage (in-memory, `redb`, SQL)
//! - [`config`] - Engine configuration
//!
//! ## Example usage
//!
//! ```rust,no_run
//! use gleitzeit::config::EngineConfig;
//! use gleitzeit::engine::Engine;
//! use gleitzeit::manager::WorkflowManager;
//! use gleitzeit::persistence::InMemoryPersistence;
//! use gleitzeit::protocol::ProtocolRegistry;
//! use gleitzeit::provider::ProviderRegistry;
//! use gleitzeit::workflow::{Task, Workflow};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let protocols = ProtocolRegistry::new();
//! let providers = ProviderRegistry::new();
//! let persistence = Arc::new(InMemoryPersistence::new());
//! let engine = Engine::new(EngineConfig::default(), protocols, providers, persistence);
//!
//! tokio::spawn(engine.clone().run());
//!
//! let manager = WorkflowManager::new(engine);
//! let workflow_id = Uuid::new_v4();
//! let task = Task::new(workflow_id, "only", "echo/v1", "echo/echo", serde_json::json!({}));
//! let mut workflow = Workflow::new("hello", vec![task]);
//! workflow.id = workflow_id;
//!
//! let id = manager.submit(workflow).await?;
//! let status = manager.status(id).await?;
//! println!("workflow status: {:?}", status.status);
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod persistence;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod workflow;
