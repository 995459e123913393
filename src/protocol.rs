//! Protocol registry: named protocols with typed method schemas and
//! parameter validation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use tokio::sync::RwLock;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("protocol {id} is already registered"))]
    DuplicateProtocol { id: String },

    #[snafu(display("protocol {id} not found"))]
    ProtocolNotFound { id: String },

    #[snafu(display("method {method} is not supported by protocol {protocol}"))]
    MethodNotSupported { protocol: String, method: String },

    #[snafu(display("invalid parameter at {path}: {reason}"))]
    InvalidParameter { path: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (ParamType::String, Value::String(_)) => true,
            (ParamType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            // integer is a subtype of number
            (ParamType::Number, Value::Number(_)) => true,
            (ParamType::Boolean, Value::Bool(_)) => true,
            (ParamType::Array, Value::Array(_)) => true,
            (ParamType::Object, Value::Object(_)) => true,
            (ParamType::Null, Value::Null) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: Option<ParamType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub properties: Option<HashMap<String, ParameterSpec>>,
    #[serde(default)]
    pub items: Option<Box<ParameterSpec>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodSpec {
    pub params_schema: HashMap<String, ParameterSpec>,
    #[serde(default)]
    pub returns_schema: Option<HashMap<String, ParameterSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub methods: HashMap<String, MethodSpec>,
    /// Unknown keys beyond the declared schema are permitted by default
    /// (defaults to true for backward compatibility).
    #[serde(default = "default_true")]
    pub additional_properties: bool,
}

fn default_true() -> bool {
    true
}

impl ProtocolSpec {
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

fn validate_value(path: &str, spec: &ParameterSpec, value: &Value) -> Result<()> {
    if let Some(ty) = spec.param_type {
        if !ty.matches(value) {
            return Err(Error::InvalidParameter {
                path: path.to_string(),
                reason: format!("expected type {ty:?}, got {value}"),
            });
        }
    }
    if let Some(ref enum_values) = spec.enum_values {
        if !enum_values.contains(value) {
            return Err(Error::InvalidParameter {
                path: path.to_string(),
                reason: "value not in enum".to_string(),
            });
        }
    }
    if let Value::String(s) = value {
        if let Some(min) = spec.min_length {
            if s.chars().count() < min {
                return Err(Error::InvalidParameter {
                    path: path.to_string(),
                    reason: format!("string shorter than minimum length {min}"),
                });
            }
        }
        if let Some(max) = spec.max_length {
            if s.chars().count() > max {
                return Err(Error::InvalidParameter {
                    path: path.to_string(),
                    reason: format!("string longer than maximum length {max}"),
                });
            }
        }
        if let Some(ref pattern) = spec.pattern {
            let re = regex::Regex::new(pattern).map_err(|e| Error::InvalidParameter {
                path: path.to_string(),
                reason: format!("invalid pattern {pattern}: {e}"),
            })?;
            if !re.is_match(s) {
                return Err(Error::InvalidParameter {
                    path: path.to_string(),
                    reason: format!("does not match pattern {pattern}"),
                });
            }
        }
    }
    if let Value::Number(n) = value {
        let n = n.as_f64().unwrap_or(f64::NAN);
        if let Some(min) = spec.minimum {
            if n < min {
                return Err(Error::InvalidParameter {
                    path: path.to_string(),
                    reason: format!("value below minimum {min}"),
                });
            }
        }
        if let Some(max) = spec.maximum {
            if n > max {
                return Err(Error::InvalidParameter {
                    path: path.to_string(),
                    reason: format!("value above maximum {max}"),
                });
            }
        }
    }
    if let (Some(items_spec), Value::Array(items)) = (&spec.items, value) {
        for (i, item) in items.iter().enumerate() {
            validate_value(&format!("{path}[{i}]"), items_spec, item)?;
        }
    }
    if let (Some(props), Value::Object(obj)) = (&spec.properties, value) {
        for (key, prop_spec) in props {
            if prop_spec.required && !obj.contains_key(key) {
                return Err(Error::InvalidParameter {
                    path: format!("{path}.{key}"),
                    reason: "required property missing".to_string(),
                });
            }
            if let Some(v) = obj.get(key) {
                validate_value(&format!("{path}.{key}"), prop_spec, v)?;
            }
        }
    }
    Ok(())
}

/// Holds an immutable-after-registration set of `ProtocolSpec` keyed by `"{name}/{version}"`.
#[derive(Debug, Default, Clone)]
pub struct ProtocolRegistry {
    specs: Arc<RwLock<HashMap<String, ProtocolSpec>>>,
}

impl ProtocolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, spec: ProtocolSpec) -> Result<()> {
        let id = spec.id();
        let mut specs = self.specs.write().await;
        if specs.contains_key(&id) {
            return Err(Error::DuplicateProtocol { id });
        }
        specs.insert(id, spec);
        Ok(())
    }

    pub async fn get(&self, protocol_id: &str) -> Option<ProtocolSpec> {
        self.specs.read().await.get(protocol_id).cloned()
    }

    /// Resolves `method` within `protocol_id`, then validates `params` against
    /// its `params_schema`.
    pub async fn validate_call(
        &self,
        protocol_id: &str,
        method: &str,
        params: &Value,
    ) -> Result<()> {
        let specs = self.specs.read().await;
        let spec = specs.get(protocol_id).ok_or_else(|| Error::ProtocolNotFound {
            id: protocol_id.to_string(),
        })?;
        let method_spec = spec
            .methods
            .get(method)
            .ok_or_else(|| Error::MethodNotSupported {
                protocol: protocol_id.to_string(),
                method: method.to_string(),
            })?;

        let obj = params.as_object().cloned().unwrap_or_default();

        for (name, param_spec) in &method_spec.params_schema {
            if param_spec.required && !obj.contains_key(name) {
                return Err(Error::InvalidParameter {
                    path: name.clone(),
                    reason: "required parameter missing".to_string(),
                });
            }
            if let Some(value) = obj.get(name) {
                validate_value(name, param_spec, value)?;
            }
        }

        if !spec.additional_properties {
            for key in obj.keys() {
                if !method_spec.params_schema.contains_key(key) {
                    return Err(Error::InvalidParameter {
                        path: key.clone(),
                        reason: "unknown parameter not permitted".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_protocol() -> ProtocolSpec {
        let mut methods = HashMap::new();
        let mut params_schema = HashMap::new();
        params_schema.insert(
            "text".to_string(),
            ParameterSpec {
                param_type: Some(ParamType::String),
                required: true,
                ..Default::default()
            },
        );
        methods.insert(
            "echo/echo".to_string(),
            MethodSpec {
                params_schema,
                returns_schema: None,
            },
        );
        ProtocolSpec {
            name: "echo".to_string(),
            version: "v1".to_string(),
            description: String::new(),
            methods,
            additional_properties: true,
        }
    }

    #[tokio::test]
    async fn register_then_duplicate_fails() {
        let registry = ProtocolRegistry::new();
        registry.register(echo_protocol()).await.unwrap();
        let err = registry.register(echo_protocol()).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateProtocol { .. }));
    }

    #[tokio::test]
    async fn validate_call_rejects_missing_required() {
        let registry = ProtocolRegistry::new();
        registry.register(echo_protocol()).await.unwrap();
        let err = registry
            .validate_call("echo/v1", "echo/echo", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn validate_call_accepts_valid_params() {
        let registry = ProtocolRegistry::new();
        registry.register(echo_protocol()).await.unwrap();
        registry
            .validate_call("echo/v1", "echo/echo", &serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn validate_call_unknown_method() {
        let registry = ProtocolRegistry::new();
        registry.register(echo_protocol()).await.unwrap();
        let err = registry
            .validate_call("echo/v1", "echo/missing", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotSupported { .. }));
    }
}
