//! In-memory persistence backend: tests and ephemeral single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::workflow::{TaskStatus, Workflow, WorkflowStatus};

use super::{Error, PersistenceProvider, Result, TaskRecord};

#[derive(Default)]
pub struct InMemoryPersistence {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceProvider for InMemoryPersistence {
    async fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let task = tasks.get_mut(id).ok_or_else(|| Error::TaskNotFound {
            id: id.to_string(),
        })?;
        task.status = status;
        if started_at.is_some() {
            task.started_at = started_at;
        }
        if completed_at.is_some() {
            task.completed_at = completed_at;
        }
        Ok(())
    }

    async fn set_task_result(
        &self,
        id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let task = tasks.get_mut(id).ok_or_else(|| Error::TaskNotFound {
            id: id.to_string(),
        })?;
        task.result = result;
        task.error = error;
        Ok(())
    }

    async fn list_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn count_tasks_by_status(&self, workflow_id: &str, status: TaskStatus) -> Result<u64> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|t| t.workflow_id == workflow_id && t.status == status)
            .count() as u64)
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.workflows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(workflow.id.to_string(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<()> {
        let mut workflows = self
            .workflows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| Error::WorkflowNotFound { id: id.to_string() })?;
        workflow.status = status;
        if status.is_terminal() {
            workflow.completed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn update_workflow_progress(
        &self,
        id: &str,
        completed_ids: &[String],
        failed_ids: &[String],
        results: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut workflows = self
            .workflows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| Error::WorkflowNotFound { id: id.to_string() })?;
        for cid in completed_ids {
            if let Ok(uuid) = uuid::Uuid::parse_str(cid) {
                workflow.completed_tasks.insert(uuid);
            }
        }
        for fid in failed_ids {
            if let Ok(uuid) = uuid::Uuid::parse_str(fid) {
                workflow.failed_tasks.insert(uuid);
            }
        }
        for (task_id, value) in results {
            if let Ok(uuid) = uuid::Uuid::parse_str(task_id) {
                workflow.task_results.insert(uuid, value.clone());
            }
        }
        Ok(())
    }

    async fn list_running_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|w| w.status == WorkflowStatus::Running)
            .cloned()
            .collect())
    }
}
