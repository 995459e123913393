//! SQLite persistence backend: a durable single-node store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use snafu::ResultExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::workflow::{ErrorStrategy, Task, TaskStatus, Workflow, WorkflowStatus};

use super::{DatabaseSnafu, Error, PersistenceProvider, Result, TaskRecord};

const SCHEMA: &str = include_str!("./sql/schema_sqlite.sql");

pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context(DatabaseSnafu)?;
        let store = Self::with_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        Ok(())
    }

    fn task_status_str(status: TaskStatus) -> &'static str {
        match status {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    fn task_status_from_str(s: &str) -> TaskStatus {
        match s {
            "RUNNING" => TaskStatus::Running,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            "CANCELLED" => TaskStatus::Cancelled,
            _ => TaskStatus::Queued,
        }
    }

    fn workflow_status_str(status: WorkflowStatus) -> &'static str {
        match status {
            WorkflowStatus::Queued => "QUEUED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }

    fn workflow_status_from_str(s: &str) -> WorkflowStatus {
        match s {
            "RUNNING" => WorkflowStatus::Running,
            "COMPLETED" => WorkflowStatus::Completed,
            "FAILED" => WorkflowStatus::Failed,
            "CANCELLED" => WorkflowStatus::Cancelled,
            _ => WorkflowStatus::Queued,
        }
    }
}

#[async_trait]
impl PersistenceProvider for SqlitePersistence {
    async fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        let dependencies_json =
            serde_json::to_string(&task.dependencies).map_err(|source| Error::Serialization { source })?;
        let params_json =
            serde_json::to_string(&task.params).map_err(|source| Error::Serialization { source })?;
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| Error::Serialization { source })?;
        let error_json = task
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| Error::Serialization { source })?;

        sqlx::query(
            "INSERT INTO task (id, workflow_id, name, protocol, method, params_json, \
             dependencies_json, priority, status, attempt, result_json, error_json, \
             created_at, started_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             status = excluded.status, attempt = excluded.attempt, \
             result_json = excluded.result_json, error_json = excluded.error_json, \
             started_at = excluded.started_at, completed_at = excluded.completed_at",
        )
        .bind(&task.id)
        .bind(&task.workflow_id)
        .bind(&task.name)
        .bind(&task.protocol)
        .bind(&task.method)
        .bind(params_json)
        .bind(dependencies_json)
        .bind(&task.priority)
        .bind(Self::task_status_str(task.status))
        .bind(task.attempt as i64)
        .bind(result_json)
        .bind(error_json)
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context(DatabaseSnafu)?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM task WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        match row {
            Some(row) => Ok(Some(row_to_task_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE task SET status = ?, \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at) \
             WHERE id = ?",
        )
        .bind(Self::task_status_str(status))
        .bind(started_at.map(|t| t.to_rfc3339()))
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.pool)
        .await
        .context(DatabaseSnafu)?;
        if result.rows_affected() == 0 {
            return Err(Error::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn set_task_result(
        &self,
        id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<()> {
        let result_json = result
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|source| Error::Serialization { source })?;
        let error_json = error
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|source| Error::Serialization { source })?;
        let rows = sqlx::query("UPDATE task SET result_json = ?, error_json = ? WHERE id = ?")
            .bind(result_json)
            .bind(error_json)
            .bind(id)
            .execute(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        if rows.rows_affected() == 0 {
            return Err(Error::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn list_tasks_by_workflow(&self, workflow_id: &str) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM task WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        rows.iter().map(row_to_task_record).collect()
    }

    async fn count_tasks_by_status(&self, workflow_id: &str, status: TaskStatus) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM task WHERE workflow_id = ? AND status = ?",
        )
        .bind(workflow_id)
        .bind(Self::task_status_str(status))
        .fetch_one(&self.pool)
        .await
        .context(DatabaseSnafu)?;
        let count: i64 = row.try_get("c").context(DatabaseSnafu)?;
        Ok(count as u64)
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let task_results_json = serde_json::to_string(
            &workflow
                .task_results
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<String, Value>>(),
        )
        .map_err(|source| Error::Serialization { source })?;
        let completed_ids_json = serde_json::to_string(
            &workflow
                .completed_tasks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        )
        .map_err(|source| Error::Serialization { source })?;
        let failed_ids_json = serde_json::to_string(
            &workflow
                .failed_tasks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        )
        .map_err(|source| Error::Serialization { source })?;
        let error_strategy = match workflow.error_strategy {
            ErrorStrategy::Stop => "stop",
            ErrorStrategy::Continue => "continue",
        };

        sqlx::query(
            "INSERT INTO workflow (id, name, status, error_strategy, task_results_json, \
             completed_ids_json, failed_ids_json, created_at, started_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             status = excluded.status, task_results_json = excluded.task_results_json, \
             completed_ids_json = excluded.completed_ids_json, \
             failed_ids_json = excluded.failed_ids_json, \
             started_at = excluded.started_at, completed_at = excluded.completed_at",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(Self::workflow_status_str(workflow.status))
        .bind(error_strategy)
        .bind(task_results_json)
        .bind(completed_ids_json)
        .bind(failed_ids_json)
        .bind(workflow.created_at.to_rfc3339())
        .bind(workflow.started_at.map(|t| t.to_rfc3339()))
        .bind(workflow.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context(DatabaseSnafu)?;

        for task in &workflow.tasks {
            self.upsert_task(&crate::persistence::TaskRecord::from(task)).await?;
        }
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflow WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let task_records = self.list_tasks_by_workflow(id).await?;
        let tasks: Vec<Task> = task_records
            .into_iter()
            .filter_map(|r| Task::try_from(r).ok())
            .collect();
        Ok(Some(row_to_workflow(&row, tasks)?))
    }

    async fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<()> {
        let completed_at = status.is_terminal().then(chrono::Utc::now);
        let rows = sqlx::query(
            "UPDATE workflow SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(Self::workflow_status_str(status))
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.pool)
        .await
        .context(DatabaseSnafu)?;
        if rows.rows_affected() == 0 {
            return Err(Error::WorkflowNotFound { id: id.to_string() });
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
        let Some(mut workflow) = self.get_workflow(id).await? else {
            return Err(Error::WorkflowNotFound { id: id.to_string() });
        };
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
        let rows = sqlx::query("SELECT * FROM workflow WHERE status = 'RUNNING'")
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").context(DatabaseSnafu)?;
            let task_records = self.list_tasks_by_workflow(&id).await?;
            let tasks: Vec<Task> = task_records
                .into_iter()
                .filter_map(|r| Task::try_from(r).ok())
                .collect();
            out.push(row_to_workflow(row, tasks)?);
        }
        Ok(out)
    }
}

fn row_to_task_record(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let params_json: String = row.try_get("params_json").context(DatabaseSnafu)?;
    let dependencies_json: String = row.try_get("dependencies_json").context(DatabaseSnafu)?;
    let result_json: Option<String> = row.try_get("result_json").context(DatabaseSnafu)?;
    let error_json: Option<String> = row.try_get("error_json").context(DatabaseSnafu)?;
    let created_at: String = row.try_get("created_at").context(DatabaseSnafu)?;
    let started_at: Option<String> = row.try_get("started_at").context(DatabaseSnafu)?;
    let completed_at: Option<String> = row.try_get("completed_at").context(DatabaseSnafu)?;
    let status_str: String = row.try_get("status").context(DatabaseSnafu)?;

    Ok(TaskRecord {
        id: row.try_get("id").context(DatabaseSnafu)?,
        workflow_id: row.try_get("workflow_id").context(DatabaseSnafu)?,
        name: row.try_get("name").context(DatabaseSnafu)?,
        protocol: row.try_get("protocol").context(DatabaseSnafu)?,
        method: row.try_get("method").context(DatabaseSnafu)?,
        params: serde_json::from_str(&params_json).map_err(|source| Error::Serialization { source })?,
        dependencies: serde_json::from_str(&dependencies_json)
            .map_err(|source| Error::Serialization { source })?,
        priority: row.try_get("priority").context(DatabaseSnafu)?,
        status: SqlitePersistence::task_status_from_str(&status_str),
        attempt: row.try_get::<i64, _>("attempt").context(DatabaseSnafu)? as u32,
        result: result_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|source| Error::Serialization { source })?,
        error: error_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|source| Error::Serialization { source })?,
        created_at: parse_rfc3339(&created_at),
        started_at: started_at.as_deref().map(parse_rfc3339),
        completed_at: completed_at.as_deref().map(parse_rfc3339),
    })
}

fn row_to_workflow(row: &sqlx::sqlite::SqliteRow, tasks: Vec<Task>) -> Result<Workflow> {
    let id: String = row.try_get("id").context(DatabaseSnafu)?;
    let name: String = row.try_get("name").context(DatabaseSnafu)?;
    let status_str: String = row.try_get("status").context(DatabaseSnafu)?;
    let error_strategy_str: String = row.try_get("error_strategy").context(DatabaseSnafu)?;
    let task_results_json: String = row.try_get("task_results_json").context(DatabaseSnafu)?;
    let completed_ids_json: String = row.try_get("completed_ids_json").context(DatabaseSnafu)?;
    let failed_ids_json: String = row.try_get("failed_ids_json").context(DatabaseSnafu)?;
    let created_at: String = row.try_get("created_at").context(DatabaseSnafu)?;
    let started_at: Option<String> = row.try_get("started_at").context(DatabaseSnafu)?;
    let completed_at: Option<String> = row.try_get("completed_at").context(DatabaseSnafu)?;

    let results_map: HashMap<String, Value> =
        serde_json::from_str(&task_results_json).map_err(|source| Error::Serialization { source })?;
    let completed_ids: Vec<String> =
        serde_json::from_str(&completed_ids_json).map_err(|source| Error::Serialization { source })?;
    let failed_ids: Vec<String> =
        serde_json::from_str(&failed_ids_json).map_err(|source| Error::Serialization { source })?;

    Ok(Workflow {
        id: uuid::Uuid::parse_str(&id).unwrap_or_else(|_| uuid::Uuid::new_v4()),
        name,
        description: String::new(),
        tasks,
        status: SqlitePersistence::workflow_status_from_str(&status_str),
        completed_tasks: completed_ids
            .iter()
            .filter_map(|s| uuid::Uuid::parse_str(s).ok())
            .collect(),
        failed_tasks: failed_ids
            .iter()
            .filter_map(|s| uuid::Uuid::parse_str(s).ok())
            .collect(),
        task_results: results_map
            .into_iter()
            .filter_map(|(k, v)| uuid::Uuid::parse_str(&k).ok().map(|id| (id, v)))
            .collect(),
        error_strategy: if error_strategy_str == "continue" {
            ErrorStrategy::Continue
        } else {
            ErrorStrategy::Stop
        },
        created_at: parse_rfc3339(&created_at),
        started_at: started_at.as_deref().map(parse_rfc3339),
        completed_at: completed_at.as_deref().map(parse_rfc3339),
    })
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
