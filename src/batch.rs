//! Batch processor: fan a single method out across a directory of files,
//! with an optional aggregator task, layered purely over [`WorkflowManager`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use snafu::Snafu;
use uuid::Uuid;

use crate::manager::WorkflowManager;
use crate::workflow::{ErrorStrategy, Task, TaskStatus, Workflow};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read directory {path:?}: {source}"))]
    ReadDir { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to read file {path:?}: {source}"))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("no files in {path:?} matched pattern '{pattern}'"))]
    NoMatches { path: PathBuf, pattern: String },

    #[snafu(display("manager error: {source}"))]
    Manager { source: crate::manager::Error },

    #[snafu(display("workflow did not complete within the polling budget"))]
    Timeout,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<crate::manager::Error> for Error {
    fn from(source: crate::manager::Error) -> Self {
        Error::Manager { source }
    }
}

/// A shell glob of `*` wildcards only (no `?`, `[...]`, or `**`); sufficient
/// for the file-extension patterns batch jobs actually use (`*.txt`, `report-*.md`).
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some(b'*') => {
                (0..=name.len()).any(|i| matches(&pattern[1..], &name[i..]))
            }
            Some(&c) => name.first() == Some(&c) && matches(&pattern[1..], &name[1..]),
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub file: String,
    pub status: TaskStatus,
    pub content: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub results: HashMap<Uuid, BatchItemResult>,
}

impl BatchResult {
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Batch result\n\n- total: {}\n- successful: {}\n- failed: {}\n- duration: {:.2}s\n\n",
            self.total,
            self.successful,
            self.failed,
            self.duration.as_secs_f64()
        ));
        out.push_str("| file | status | detail |\n|---|---|---|\n");
        for item in self.results.values() {
            let detail = item
                .error
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| item.content.as_ref().map(ToString::to_string))
                .unwrap_or_default();
            out.push_str(&format!("| {} | {:?} | {} |\n", item.file, item.status, detail));
        }
        out
    }
}

mod duration_millis {
    use serde::{Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }
}

/// One file-fan-out job: every matched file becomes an independent task
/// named after the file, with `path`/`content` merged into `base_params`.
/// An optional `aggregator` runs last, depending on every file task by name.
pub struct BatchJob<'a> {
    pub directory: &'a Path,
    pub pattern: &'a str,
    pub protocol: &'a str,
    pub method: &'a str,
    pub base_params: Value,
    pub aggregator: Option<(&'a str, &'a str)>,
}

pub struct BatchProcessor {
    manager: Arc<WorkflowManager>,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(manager: Arc<WorkflowManager>) -> Self {
        Self { manager }
    }

    /// Submits the job's workflow and polls until every task is terminal or
    /// `poll_budget` elapses. Assumes the engine's worker loop is already
    /// running elsewhere (the processor only submits and reads status).
    pub async fn run(&self, job: &BatchJob<'_>, poll_budget: Duration) -> Result<BatchResult> {
        let start = Instant::now();
        let entries = std::fs::read_dir(job.directory).map_err(|source| Error::ReadDir {
            path: job.directory.to_path_buf(),
            source,
        })?;

        let mut tasks = Vec::new();
        let mut file_names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::ReadDir {
                path: job.directory.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file() || !glob_match(job.pattern, name) {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|source| Error::ReadFile {
                path: path.clone(),
                source,
            })?;

            let mut params = job.base_params.clone();
            if let Value::Object(ref mut map) = params {
                map.insert("path".to_string(), Value::String(path.display().to_string()));
                map.insert("content".to_string(), Value::String(content));
            }

            let workflow_id = Uuid::nil(); // rebound once the workflow id is known
            let mut task = Task::new(workflow_id, name, job.protocol, job.method, params);
            task.priority = crate::workflow::Priority::Normal;
            file_names.push(task.name.clone());
            tasks.push(task);
        }

        if tasks.is_empty() {
            return Err(Error::NoMatches {
                path: job.directory.to_path_buf(),
                pattern: job.pattern.to_string(),
            });
        }

        if let Some((agg_protocol, agg_method)) = job.aggregator {
            let mut aggregator = Task::new(
                Uuid::nil(),
                "aggregate",
                agg_protocol,
                agg_method,
                serde_json::json!({}),
            );
            aggregator.dependencies = file_names.clone();
            tasks.push(aggregator);
        }

        let mut workflow = Workflow::new(
            format!("batch:{}", job.directory.display()),
            tasks,
        );
        workflow.error_strategy = ErrorStrategy::Continue;
        let workflow_id = workflow.id;
        for task in &mut workflow.tasks {
            task.workflow_id = workflow_id;
        }

        let submitted_id = self.manager.submit(workflow).await?;

        let deadline = Instant::now() + poll_budget;
        let final_workflow = loop {
            let status = self.manager.status(submitted_id).await?;
            if status.is_complete() {
                break status;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        };

        let mut results = HashMap::with_capacity(file_names.len());
        let mut successful = 0;
        let mut failed = 0;
        for name in &file_names {
            let Some(task) = final_workflow.task_by_name(name) else {
                continue;
            };
            if task.status == TaskStatus::Completed {
                successful += 1;
            } else {
                failed += 1;
            }
            results.insert(
                task.id,
                BatchItemResult {
                    file: name.clone(),
                    status: task.status,
                    content: task.result.clone(),
                    error: task.error.clone(),
                },
            );
        }

        Ok(BatchResult {
            total: file_names.len(),
            successful,
            failed,
            duration: start.elapsed(),
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_extension_wildcard() {
        assert!(glob_match("*.txt", "report.txt"));
        assert!(!glob_match("*.txt", "report.md"));
    }

    #[test]
    fn glob_matches_prefix_and_suffix() {
        assert!(glob_match("report-*.md", "report-2024.md"));
        assert!(!glob_match("report-*.md", "summary-2024.md"));
    }

    #[test]
    fn glob_without_wildcard_requires_exact_match() {
        assert!(glob_match("notes.txt", "notes.txt"));
        assert!(!glob_match("notes.txt", "notes.txt.bak"));
    }

    #[test]
    fn markdown_rendering_includes_counts() {
        let result = BatchResult {
            total: 2,
            successful: 1,
            failed: 1,
            duration: Duration::from_secs(1),
            results: HashMap::new(),
        };
        let markdown = result.to_markdown();
        assert!(markdown.contains("total: 2"));
        assert!(markdown.contains("successful: 1"));
    }
}
