//! Persistence contract: durable store for tasks, workflows, results, and
//! metrics. Implementations are pluggable; the engine
//! depends only on this trait.

mod memory;
mod redb_backend;
mod sqlite;

pub use memory::InMemoryPersistence;
pub use redb_backend::RedbPersistence;
pub use sqlite::SqlitePersistence;

use async_trait::async_trait;
use serde_json::Value;
use snafu::Snafu;

use crate::workflow::{TaskStatus, Workflow, WorkflowStatus};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("task {id} not found"))]
    TaskNotFound { id: String },

    #[snafu(display("workflow {id} not found"))]
    WorkflowNotFound { id: String },

    #[snafu(display("database error: {source}"))]
    Database { source: sqlx::Error },

    #[snafu(display("embedded store error: {message}"))]
    Storage { message: String },

    #[snafu(display("serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("lock for {resource_id} is held by another owner"))]
    LockHeld { resource_id: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A persisted row for one task, independent of the in-memory `Task` type so
/// the wire/storage shape can evolve without touching the engine's domain
/// type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub workflow_id: String,
    pub name: String,
    pub protocol: String,
    pub method: String,
    pub params: Value,
    pub dependencies: Vec<String>,
    pub priority: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub instance_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub active: u64,
    pub req_count: u64,
    pub err_count: u64,
    pub avg_rt_ms: f64,
}

/// Required operations, all atomic w.r.t. the entity being written.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn upsert_task(&self, task: &TaskRecord) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>>;
    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()>;
    async fn set_task_result(
        &self,
        id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<()>;
    async fn list_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<TaskRecord>>;
    async fn count_tasks_by_status(
        &self,
        workflow_id: &str,
        status: TaskStatus,
    ) -> Result<u64>;

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()>;
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<()>;
    async fn update_workflow_progress(
        &self,
        id: &str,
        completed_ids: &[String],
        failed_ids: &[String],
        results: &std::collections::HashMap<String, Value>,
    ) -> Result<()>;

    /// Workflows currently recorded as RUNNING; used by the engine's startup
    /// recovery sweep.
    async fn list_running_workflows(&self) -> Result<Vec<Workflow>>;

    async fn append_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let _ = snapshot;
        Ok(())
    }

    async fn prune_metrics_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let _ = cutoff;
        Ok(())
    }

    /// Distributed lock, required only for multi-instance deployments.
    async fn acquire_lock(&self, resource_id: &str, owner: &str, ttl_secs: i64) -> Result<bool> {
        let _ = (resource_id, owner, ttl_secs);
        Ok(true)
    }

    async fn extend_lock(&self, resource_id: &str, owner: &str, ttl_secs: i64) -> Result<bool> {
        let _ = (resource_id, owner, ttl_secs);
        Ok(true)
    }

    async fn release_lock(&self, resource_id: &str, owner: &str) -> Result<()> {
        let _ = (resource_id, owner);
        Ok(())
    }

    async fn lock_owner(&self, resource_id: &str) -> Result<Option<String>> {
        let _ = resource_id;
        Ok(None)
    }
}
