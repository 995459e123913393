//! Task/Workflow/TaskResult data model.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    #[must_use]
    pub fn from_str_or_normal(s: &str) -> Self {
        match s {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    Stop,
    Continue,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        ErrorStrategy::Stop
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub protocol: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_queued")]
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default = "one")]
    pub attempt: u32,
}

fn default_queued() -> TaskStatus {
    TaskStatus::Queued
}

fn one() -> u32 {
    1
}

impl Task {
    #[must_use]
    pub fn new(
        workflow_id: Uuid,
        name: impl Into<String>,
        protocol: impl Into<String>,
        method: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            name: name.into(),
            protocol: protocol.into(),
            method: method.into(),
            params,
            dependencies: Vec::new(),
            priority: Priority::default(),
            retry: RetryPolicy::default(),
            status: TaskStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempt: 1,
        }
    }
}

/// One invocation's outcome, independent of the live `Task`'s mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub duration_seconds: f64,
    pub completed_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<Task>,
    #[serde(default = "default_workflow_queued")]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub completed_tasks: HashSet<Uuid>,
    #[serde(default)]
    pub failed_tasks: HashSet<Uuid>,
    #[serde(default)]
    pub task_results: HashMap<Uuid, Value>,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_workflow_queued() -> WorkflowStatus {
    WorkflowStatus::Queued
}

impl Workflow {
    #[must_use]
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            tasks,
            status: WorkflowStatus::Queued,
            completed_tasks: HashSet::new(),
            failed_tasks: HashSet::new(),
            task_results: HashMap::new(),
            error_strategy: ErrorStrategy::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// `workflow.is_complete() ⇔ every task terminal`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    #[must_use]
    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    #[must_use]
    pub fn task_by_id(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Resolves a dependency reference (task name or id) to a task id within
    /// this workflow.
    #[must_use]
    pub fn resolve_task_ref(&self, reference: &str) -> Option<Uuid> {
        if let Ok(id) = Uuid::parse_str(reference) {
            if self.task_by_id(id).is_some() {
                return Some(id);
            }
        }
        self.task_by_name(reference).map(|t| t.id)
    }
}

impl From<&Task> for crate::persistence::TaskRecord {
    fn from(task: &Task) -> Self {
        crate::persistence::TaskRecord {
            id: task.id.to_string(),
            workflow_id: task.workflow_id.to_string(),
            name: task.name.clone(),
            protocol: task.protocol.clone(),
            method: task.method.clone(),
            params: task.params.clone(),
            dependencies: task.dependencies.clone(),
            priority: task.priority.as_str().to_string(),
            status: task.status,
            attempt: task.attempt,
            result: task.result.clone(),
            error: task.error.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

impl TryFrom<crate::persistence::TaskRecord> for Task {
    type Error = uuid::Error;

    fn try_from(record: crate::persistence::TaskRecord) -> Result<Self, Self::Error> {
        Ok(Task {
            id: Uuid::parse_str(&record.id)?,
            workflow_id: Uuid::parse_str(&record.workflow_id)?,
            name: record.name,
            protocol: record.protocol,
            method: record.method,
            params: record.params,
            dependencies: record.dependencies,
            priority: Priority::from_str_or_normal(&record.priority),
            retry: RetryPolicy::default(),
            status: record.status,
            result: record.result,
            error: record.error,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            attempt: record.attempt,
        })
    }
}

/// A reusable workflow template: `{{name}}` placeholders distinct from
/// runtime `${...}` substitution, expanded once at instantiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: HashMap<String, Option<Value>>,
    /// The raw task definitions, serialized with `{{name}}` placeholders
    /// still present in string leaves.
    pub tasks: Value,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_workflow_is_immediately_complete() {
        let workflow = Workflow::new("empty", vec![]);
        assert!(workflow.is_complete());
    }

    #[test]
    fn incomplete_workflow_with_running_task() {
        let wf_id = Uuid::new_v4();
        let mut task = Task::new(wf_id, "A", "echo/v1", "echo/echo", serde_json::json!({}));
        task.status = TaskStatus::Running;
        let workflow = Workflow::new("w", vec![task]);
        assert!(!workflow.is_complete());
    }

    #[test]
    fn resolve_task_ref_by_name() {
        let wf_id = Uuid::new_v4();
        let task = Task::new(wf_id, "A", "echo/v1", "echo/echo", serde_json::json!({}));
        let task_id = task.id;
        let workflow = Workflow::new("w", vec![task]);
        assert_eq!(workflow.resolve_task_ref("A"), Some(task_id));
    }
}
