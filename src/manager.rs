//! Workflow manager: a thin coordinator above the engine that validates a
//! workflow's DAG at submission time and expands templates.
//!
//! Grounded on the execution-graph construction of the teacher's durable
//! engine (`DiGraph` with a name→`NodeIndex` map, built once per submission),
//! generalized from its linear `then`-transition chains to arbitrary
//! `dependencies` edges, plus cycle detection via `petgraph::algo`.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use uuid::Uuid;

use crate::engine::Engine;
use crate::resolver;
use crate::retry::RetryPolicy;
use crate::workflow::{Priority, Task, Workflow, WorkflowTemplate};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("workflow contains a dependency cycle"))]
    CyclicWorkflow,

    #[snafu(display("task '{task}' declares unknown dependency '{reference}'"))]
    UnknownDependency { task: String, reference: String },

    #[snafu(display("task '{task}' has no registered protocol '{protocol}'"))]
    UnknownProtocol { task: String, protocol: String },

    #[snafu(display("task '{task}' calls unsupported method '{method}' on protocol '{protocol}'"))]
    UnknownMethod {
        task: String,
        protocol: String,
        method: String,
    },

    #[snafu(display("task '{task}' references '{reference}' which is not a declared dependency"))]
    UndeclaredSubstitution { task: String, reference: String },

    #[snafu(display("template parameter '{name}' has no default and no value was supplied"))]
    MissingParameter { name: String },

    #[snafu(display("template expansion failed: {reason}"))]
    TemplateExpansion { reason: String },

    #[snafu(display("workflow document parse failed: {reason}"))]
    DocumentParse { reason: String },

    #[snafu(display("engine error: {source}"))]
    Engine { source: crate::error::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<crate::error::Error> for Error {
    fn from(source: crate::error::Error) -> Self {
        Error::Engine { source }
    }
}

/// Coordinates submission, status, and cancellation above an [`Engine`].
pub struct WorkflowManager {
    engine: Arc<Engine>,
}

impl WorkflowManager {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Validates the workflow's DAG (acyclic, dependency references resolve,
    /// every protocol/method is registered, every substitution reference is
    /// within the task's declared dependency set) then hands it to the
    /// engine for persistence and enqueueing.
    pub async fn submit(&self, workflow: Workflow) -> Result<Uuid> {
        let dependency_ids = self.validate(&workflow).await?;
        Ok(self.engine.submit_workflow(workflow, dependency_ids).await?)
    }

    async fn validate(&self, workflow: &Workflow) -> Result<HashMap<Uuid, Vec<Uuid>>> {
        let mut graph = DiGraph::<Uuid, ()>::new();
        let mut nodes = HashMap::with_capacity(workflow.tasks.len());
        for task in &workflow.tasks {
            nodes.insert(task.id, graph.add_node(task.id));
        }

        let mut dependency_ids = HashMap::with_capacity(workflow.tasks.len());

        for task in &workflow.tasks {
            let mut resolved = Vec::with_capacity(task.dependencies.len());
            for reference in &task.dependencies {
                let dep_id = workflow
                    .resolve_task_ref(reference)
                    .ok_or_else(|| Error::UnknownDependency {
                        task: task.name.clone(),
                        reference: reference.clone(),
                    })?;
                let src = nodes.get(&dep_id).copied().ok_or_else(|| Error::UnknownDependency {
                    task: task.name.clone(),
                    reference: reference.clone(),
                })?;
                let dst = nodes
                    .get(&task.id)
                    .copied()
                    .expect("task node inserted above");
                graph.add_edge(src, dst, ());
                resolved.push(dep_id);
            }
            dependency_ids.insert(task.id, resolved);

            let protocol = self.engine.protocols.get(&task.protocol).await.ok_or_else(|| {
                Error::UnknownProtocol {
                    task: task.name.clone(),
                    protocol: task.protocol.clone(),
                }
            })?;
            if !protocol.methods.contains_key(&task.method) {
                return Err(Error::UnknownMethod {
                    task: task.name.clone(),
                    protocol: task.protocol.clone(),
                    method: task.method.clone(),
                });
            }

            for reference in resolver::referenced_keys(&task.params) {
                if !task.dependencies.iter().any(|d| d == &reference) {
                    return Err(Error::UndeclaredSubstitution {
                        task: task.name.clone(),
                        reference,
                    });
                }
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(Error::CyclicWorkflow);
        }

        Ok(dependency_ids)
    }

    pub async fn status(&self, id: Uuid) -> Result<Workflow> {
        Ok(self.engine.workflow_status(id).await?)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        Ok(self.engine.cancel_workflow(id).await?)
    }

    /// Expands a template's `{{name}}` placeholders against supplied
    /// parameter values (falling back to each parameter's default), then
    /// submits the resulting workflow.
    pub async fn submit_template(
        &self,
        template: &WorkflowTemplate,
        params: HashMap<String, Value>,
    ) -> Result<Uuid> {
        let workflow = instantiate_template(template, params)?;
        self.submit(workflow).await
    }

    /// Parses a workflow definition document (YAML or JSON) and submits it.
    pub async fn submit_document(&self, source: &str) -> Result<Uuid> {
        let workflow = parse_workflow_document(source)?;
        self.submit(workflow).await
    }
}

/// A workflow definition document as described by the external file format:
/// top-level `name`/`description`/`error_strategy`/`tasks`, no template
/// placeholders. Unknown top-level keys are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowDocument {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    error_strategy: crate::workflow::ErrorStrategy,
    tasks: Vec<TaskDef>,
}

/// Parses a workflow definition document into a `Workflow` bound to a fresh
/// id. YAML and JSON share one schema since JSON is valid YAML, so a single
/// `serde_yaml` deserializer handles both wire formats.
pub fn parse_workflow_document(source: &str) -> Result<Workflow> {
    let document: WorkflowDocument =
        serde_yaml::from_str(source).map_err(|e| Error::DocumentParse {
            reason: e.to_string(),
        })?;

    let workflow_id = Uuid::new_v4();
    let tasks = document
        .tasks
        .into_iter()
        .map(|def| {
            let mut task = Task::new(workflow_id, def.name, def.protocol, def.method, def.params);
            if let Some(id) = def.id {
                task.id = id;
            }
            task.dependencies = def.dependencies;
            task.priority = def.priority;
            task.retry = def.retry;
            task
        })
        .collect();

    let mut workflow = Workflow::new(document.name, tasks);
    workflow.id = workflow_id;
    workflow.description = document.description;
    workflow.error_strategy = document.error_strategy;
    Ok(workflow)
}

/// A task definition as it appears in a template or workflow file, before a
/// workflow id has been assigned (distinct from the runtime [`Task`], whose
/// `workflow_id` field is mandatory).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDef {
    #[serde(default)]
    id: Option<Uuid>,
    name: String,
    protocol: String,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    retry: RetryPolicy,
}

/// Resolves every `{{name}}` placeholder in `template.tasks` against
/// `params` (falling back to each declared parameter's default), then
/// deserializes the result into concrete tasks bound to a fresh workflow id.
pub fn instantiate_template(
    template: &WorkflowTemplate,
    params: HashMap<String, Value>,
) -> Result<Workflow> {
    let mut resolved = HashMap::with_capacity(template.parameters.len());
    for (name, default) in &template.parameters {
        match params.get(name).cloned().or_else(|| default.clone()) {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => return Err(Error::MissingParameter { name: name.clone() }),
        }
    }

    let expanded = expand_placeholders(&template.tasks, &resolved)?;
    let defs: Vec<TaskDef> = serde_json::from_value(expanded).map_err(|e| Error::TemplateExpansion {
        reason: e.to_string(),
    })?;

    let workflow_id = Uuid::new_v4();
    let tasks = defs
        .into_iter()
        .map(|def| {
            let mut task = Task::new(workflow_id, def.name, def.protocol, def.method, def.params);
            if let Some(id) = def.id {
                task.id = id;
            }
            task.dependencies = def.dependencies;
            task.priority = def.priority;
            task.retry = def.retry;
            task
        })
        .collect();

    let mut workflow = Workflow::new(template.name.clone(), tasks);
    workflow.id = workflow_id;
    workflow.description = template.description.clone();
    workflow.error_strategy = template.error_strategy;
    Ok(workflow)
}

fn expand_placeholders(value: &Value, params: &HashMap<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => expand_string(s, params),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_placeholders(v, params)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_placeholders(item, params)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_string(s: &str, params: &HashMap<String, Value>) -> Result<Value> {
    let Some((start, end, name)) = find_placeholder(s, 0) else {
        return Ok(Value::String(s.to_string()));
    };
    let value = params.get(name).cloned().ok_or_else(|| Error::TemplateExpansion {
        reason: format!("unknown template parameter '{name}'"),
    })?;

    if start == 0 && end == s.len() {
        return Ok(value);
    }

    let mut out = String::new();
    out.push_str(&s[..start]);
    out.push_str(&canonical(&value));
    let mut cursor = end;
    loop {
        match find_placeholder(s, cursor) {
            Some((next_start, next_end, next_name)) => {
                out.push_str(&s[cursor..next_start]);
                let value = params.get(next_name).cloned().ok_or_else(|| Error::TemplateExpansion {
                    reason: format!("unknown template parameter '{next_name}'"),
                })?;
                out.push_str(&canonical(&value));
                cursor = next_end;
            }
            None => {
                out.push_str(&s[cursor..]);
                break;
            }
        }
    }
    Ok(Value::String(out))
}

fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Finds the next `{{name}}` placeholder in `s` starting at or after `from`.
fn find_placeholder(s: &str, from: usize) -> Option<(usize, usize, &str)> {
    let bytes = s.as_bytes();
    let mut i = from;
    while i + 3 < s.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            if let Some(rel_end) = s[i + 2..].find("}}") {
                let end = i + 2 + rel_end + 2;
                return Some((i, end, s[i + 2..i + 2 + rel_end].trim()));
            }
            return None;
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::persistence::InMemoryPersistence;
    use crate::protocol::{MethodSpec, ParamType, ParameterSpec, ProtocolRegistry, ProtocolSpec};
    use crate::provider::{HealthCheckResult, Provider, ProviderInstance, ProviderRegistry, ProviderStatus};
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn initialize(&self) -> crate::provider::Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> crate::provider::Result<()> {
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
        async fn handle(&self, _method: &str, params: Value) -> crate::provider::Result<Value> {
            Ok(params)
        }
    }

    async fn manager() -> WorkflowManager {
        let protocols = ProtocolRegistry::new();
        let mut params_schema = HashMap::new();
        params_schema.insert(
            "text".to_string(),
            ParameterSpec {
                param_type: Some(ParamType::String),
                ..Default::default()
            },
        );
        let mut methods = HashMap::new();
        methods.insert(
            "echo/echo".to_string(),
            MethodSpec {
                params_schema,
                returns_schema: None,
            },
        );
        protocols
            .register(ProtocolSpec {
                name: "echo".to_string(),
                version: "v1".to_string(),
                description: String::new(),
                methods,
                additional_properties: true,
            })
            .await
            .unwrap();

        let providers = ProviderRegistry::new();
        providers
            .register(ProviderInstance::new("p1", "echo/v1", Arc::new(EchoProvider)))
            .await
            .unwrap();

        let engine = Engine::new(
            EngineConfig::default(),
            protocols,
            providers,
            Arc::new(InMemoryPersistence::new()),
        );
        WorkflowManager::new(engine)
    }

    fn task(name: &str, deps: Vec<&str>, params: Value) -> Task {
        let mut t = Task::new(Uuid::nil(), name, "echo/v1", "echo/echo", params);
        t.dependencies = deps.into_iter().map(String::from).collect();
        t
    }

    #[tokio::test]
    async fn cyclic_workflow_is_rejected() {
        let manager = manager().await;
        let a = task("A", vec!["B"], serde_json::json!({"text": "x"}));
        let b = task("B", vec!["A"], serde_json::json!({"text": "x"}));
        let workflow = Workflow::new("cycle", vec![a, b]);
        let err = manager.submit(workflow).await.unwrap_err();
        assert!(matches!(err, Error::CyclicWorkflow));
    }

    #[tokio::test]
    async fn undeclared_substitution_is_rejected_at_submission() {
        let manager = manager().await;
        let a = task("A", vec![], serde_json::json!({"text": "x"}));
        let b = task("B", vec![], serde_json::json!({"text": "${A.text}"}));
        let workflow = Workflow::new("bad-ref", vec![a, b]);
        let err = manager.submit(workflow).await.unwrap_err();
        assert!(matches!(err, Error::UndeclaredSubstitution { .. }));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let manager = manager().await;
        let mut bad = task("A", vec![], serde_json::json!({}));
        bad.method = "echo/missing".to_string();
        let workflow = Workflow::new("bad-method", vec![bad]);
        let err = manager.submit(workflow).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMethod { .. }));
    }

    #[tokio::test]
    async fn valid_workflow_submits() {
        let manager = manager().await;
        let a = task("A", vec![], serde_json::json!({"text": "x"}));
        let b = task(
            "B",
            vec!["A"],
            serde_json::json!({"text": "${A.text}"}),
        );
        let workflow = Workflow::new("ok", vec![a, b]);
        manager.submit(workflow).await.unwrap();
    }

    #[test]
    fn template_expands_whole_token_and_spliced_placeholders() {
        let mut parameters = HashMap::new();
        parameters.insert("topic".to_string(), Some(serde_json::json!("rust")));
        parameters.insert("count".to_string(), None);

        let template = WorkflowTemplate {
            name: "templated".to_string(),
            description: String::new(),
            parameters,
            tasks: serde_json::json!([
                {
                    "name": "Generate",
                    "protocol": "echo/v1",
                    "method": "echo/echo",
                    "params": { "text": "Discuss {{topic}}", "count": "{{count}}" }
                }
            ]),
            error_strategy: crate::workflow::ErrorStrategy::Stop,
        };

        let mut params = HashMap::new();
        params.insert("count".to_string(), serde_json::json!(3));
        let workflow = instantiate_template(&template, params).unwrap();
        assert_eq!(workflow.tasks.len(), 1);
        let generated = &workflow.tasks.first().unwrap().params;
        assert_eq!(generated.get("text").unwrap(), &serde_json::json!("Discuss rust"));
        assert_eq!(generated.get("count").unwrap(), &serde_json::json!(3));
    }

    #[test]
    fn document_parses_yaml_with_dependencies() {
        let yaml = r#"
name: "Dependent Workflow"
description: "two steps"
error_strategy: stop
tasks:
  - name: "Generate"
    protocol: echo/v1
    method: echo/echo
    params:
      text: "hi"
  - name: "Expand"
    protocol: echo/v1
    method: echo/echo
    dependencies: ["Generate"]
    params:
      text: "${Generate.text}"
"#;
        let workflow = parse_workflow_document(yaml).unwrap();
        assert_eq!(workflow.name, "Dependent Workflow");
        assert_eq!(workflow.tasks.len(), 2);
        let expand = workflow.tasks.get(1).unwrap();
        assert_eq!(expand.dependencies, vec!["Generate".to_string()]);
    }

    #[test]
    fn document_parses_equivalent_json() {
        let json = r#"{
            "name": "json-workflow",
            "tasks": [
                {"name": "only", "protocol": "echo/v1", "method": "echo/echo", "params": {"text": "hi"}}
            ]
        }"#;
        let workflow = parse_workflow_document(json).unwrap();
        assert_eq!(workflow.name, "json-workflow");
        assert_eq!(workflow.tasks.len(), 1);
    }

    #[test]
    fn document_rejects_unknown_top_level_key() {
        let yaml = "name: bad\ntasks: []\nbogus: true\n";
        let err = parse_workflow_document(yaml).unwrap_err();
        assert!(matches!(err, Error::DocumentParse { .. }));
    }

    #[tokio::test]
    async fn submit_document_runs_end_to_end() {
        let manager = manager().await;
        let yaml = r#"
name: "one-step"
tasks:
  - name: "only"
    protocol: echo/v1
    method: echo/echo
    params: { text: "hi" }
"#;
        manager.submit_document(yaml).await.unwrap();
    }

    #[test]
    fn missing_template_parameter_without_default_errors() {
        let mut parameters = HashMap::new();
        parameters.insert("topic".to_string(), None);
        let template = WorkflowTemplate {
            name: "templated".to_string(),
            description: String::new(),
            parameters,
            tasks: serde_json::json!([]),
            error_strategy: crate::workflow::ErrorStrategy::Stop,
        };
        let err = instantiate_template(&template, HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::MissingParameter { .. }));
    }
}
