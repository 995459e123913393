//! Embedded-file persistence backend (redb): a dependency-light durable
//! alternative to SQLite that needs no external server process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::workflow::{Task, Workflow, WorkflowStatus};

use super::{Error, PersistenceProvider, Result, TaskRecord};

const TASKS: TableDefinition<&str, &str> = TableDefinition::new("tasks");
const WORKFLOWS: TableDefinition<&str, &str> = TableDefinition::new("workflows");

pub struct RedbPersistence {
    db: Arc<Mutex<Database>>,
}

impl RedbPersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        {
            let tx = db.begin_write().map_err(|e| Error::Storage {
                message: e.to_string(),
            })?;
            {
                let _ = tx.open_table(TASKS).map_err(|e| Error::Storage {
                    message: e.to_string(),
                })?;
                let _ = tx.open_table(WORKFLOWS).map_err(|e| Error::Storage {
                    message: e.to_string(),
                })?;
            }
            tx.commit().map_err(|e| Error::Storage {
                message: e.to_string(),
            })?;
        }
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    #[must_use]
    pub fn in_memory_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("gleitzeit-{}.redb", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl PersistenceProvider for RedbPersistence {
    async fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        let json = serde_json::to_string(task).map_err(|source| Error::Serialization { source })?;
        let db = self.db.lock().await;
        let tx = db.begin_write().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        {
            let mut table = tx.open_table(TASKS).map_err(|e| Error::Storage {
                message: e.to_string(),
            })?;
            table
                .insert(task.id.as_str(), json.as_str())
                .map_err(|e| Error::Storage {
                    message: e.to_string(),
                })?;
        }
        tx.commit().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        let tx = db.begin_read().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let table = tx.open_table(TASKS).map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        match table.get(id).map_err(|e| Error::Storage {
            message: e.to_string(),
        })? {
            Some(value) => {
                let record: TaskRecord = serde_json::from_str(value.value())
                    .map_err(|source| Error::Serialization { source })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: crate::workflow::TaskStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut record = self
            .get_task(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        record.status = status;
        if started_at.is_some() {
            record.started_at = started_at;
        }
        if completed_at.is_some() {
            record.completed_at = completed_at;
        }
        self.upsert_task(&record).await
    }

    async fn set_task_result(
        &self,
        id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<()> {
        let mut record = self
            .get_task(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        record.result = result;
        record.error = error;
        self.upsert_task(&record).await
    }

    async fn list_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().await;
        let tx = db.begin_read().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let table = tx.open_table(TASKS).map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| Error::Storage {
            message: e.to_string(),
        })? {
            let (_, value) = entry.map_err(|e| Error::Storage {
                message: e.to_string(),
            })?;
            let record: TaskRecord = serde_json::from_str(value.value())
                .map_err(|source| Error::Serialization { source })?;
            if record.workflow_id == workflow_id {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn count_tasks_by_status(
        &self,
        workflow_id: &str,
        status: crate::workflow::TaskStatus,
    ) -> Result<u64> {
        let tasks = self.list_tasks_by_workflow(workflow_id).await?;
        Ok(tasks.iter().filter(|t| t.status == status).count() as u64)
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let json =
            serde_json::to_string(workflow).map_err(|source| Error::Serialization { source })?;
        let db = self.db.lock().await;
        let tx = db.begin_write().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        {
            let mut table = tx.open_table(WORKFLOWS).map_err(|e| Error::Storage {
                message: e.to_string(),
            })?;
            table
                .insert(workflow.id.to_string().as_str(), json.as_str())
                .map_err(|e| Error::Storage {
                    message: e.to_string(),
                })?;
        }
        tx.commit().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        drop(db);
        for task in &workflow.tasks {
            self.upsert_task(&crate::persistence::TaskRecord::from(task)).await?;
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let db = self.db.lock().await;
        let tx = db.begin_read().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let table = tx.open_table(WORKFLOWS).map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let value = table.get(id).map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let Some(value) = value else {
            return Ok(None);
        };
        let workflow: Workflow = serde_json::from_str(value.value())
            .map_err(|source| Error::Serialization { source })?;
        drop(tx);
        drop(db);
        Ok(Some(workflow))
    }

    async fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<()> {
        let mut workflow = self
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound { id: id.to_string() })?;
        workflow.status = status;
        if status.is_terminal() {
            workflow.completed_at = Some(chrono::Utc::now());
        }
        self.upsert_workflow(&workflow).await
    }

    async fn update_workflow_progress(
        &self,
        id: &str,
        completed_ids: &[String],
        failed_ids: &[String],
        results: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut workflow = self
            .get_workflow(id)
            .await?
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
        self.upsert_workflow(&workflow).await
    }

    async fn list_running_workflows(&self) -> Result<Vec<Workflow>> {
        let db = self.db.lock().await;
        let tx = db.begin_read().map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let table = tx.open_table(WORKFLOWS).map_err(|e| Error::Storage {
            message: e.to_string(),
        })?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| Error::Storage {
            message: e.to_string(),
        })? {
            let (_, value) = entry.map_err(|e| Error::Storage {
                message: e.to_string(),
            })?;
            let workflow: Workflow = serde_json::from_str(value.value())
                .map_err(|source| Error::Serialization { source })?;
            if workflow.status == WorkflowStatus::Running {
                out.push(workflow);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TaskStatus;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let path = RedbPersistence::in_memory_path();
        let store = RedbPersistence::open(&path).unwrap();
        let wf_id = uuid::Uuid::new_v4();
        let task = Task::new(wf_id, "A", "echo/v1", "echo/echo", serde_json::json!({}));
        let record = crate::persistence::TaskRecord::from(&task);
        store.upsert_task(&record).await.unwrap();
        let fetched = store.get_task(&task.id.to_string()).await.unwrap().unwrap();
        assert_eq!(fetched.name, "A");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn workflow_status_filters() {
        let path = RedbPersistence::in_memory_path();
        let store = RedbPersistence::open(&path).unwrap();
        let mut workflow = Workflow::new("w", vec![]);
        workflow.status = WorkflowStatus::Running;
        store.upsert_workflow(&workflow).await.unwrap();
        let running = store.list_running_workflows().await.unwrap();
        assert_eq!(running.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn set_status_updates_task() {
        let path = RedbPersistence::in_memory_path();
        let store = RedbPersistence::open(&path).unwrap();
        let wf_id = uuid::Uuid::new_v4();
        let task = Task::new(wf_id, "A", "echo/v1", "echo/echo", serde_json::json!({}));
        let record = crate::persistence::TaskRecord::from(&task);
        store.upsert_task(&record).await.unwrap();
        store
            .set_task_status(&task.id.to_string(), TaskStatus::Completed, None, None)
            .await
            .unwrap();
        let fetched = store.get_task(&task.id.to_string()).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        let _ = std::fs::remove_file(&path);
    }
}
