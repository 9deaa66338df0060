//! Boundary surface for the agent-pipeline engine.
//!
//! This crate defines everything an external collaborator touches: the
//! generic plan-node description produced by a declarative authoring layer,
//! the invocation config/response types exchanged with model providers, the
//! tool-calling protocol, structured-output type descriptors with their
//! coercion function, and the [`AgentProvider`] / [`ToolHandler`] traits.
//!
//! The engine crate (`agent-pipeline`) consumes these types; provider and
//! tool implementations live outside both crates.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// Re-export async trait for implementors' convenience
pub use async_trait::async_trait;

/// A node of the declarative plan, as produced by the authoring layer.
///
/// The engine interprets `kind` against its known node kinds and rebuilds
/// the typed plan tree from this description on every frame. Properties are
/// an open bag; unknown keys are ignored by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub kind: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<NodeDescription>,
}

impl NodeDescription {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            props: Map::new(),
            children: Vec::new(),
        }
    }

    /// Set a property, consuming and returning the description.
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn child(mut self, child: NodeDescription) -> Self {
        self.children.push(child);
        self
    }
}

/// A tool made available to the provider for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON description of the tool's argument object.
    pub parameters: Value,
}

/// A tool call requested by the provider mid-invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The result of one tool call, fed back to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: Value,
}

/// One completed call/result pair, kept in the response trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTraceEntry {
    pub call: ToolCall,
    pub result: Value,
}

/// Token usage counters reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Structured-output type descriptor.
///
/// Descriptors are explicit values, not reflected schemas; the engine parses
/// them from the plan's property bag via serde. The wire form is
/// `{"type": "object", "fields": [{"name": ..., "type": ...}, ...]}` with
/// `array` carrying an `items` descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaShape {
    String,
    Number,
    Boolean,
    Array { items: Box<SchemaShape> },
    Object { fields: Vec<FieldShape> },
}

/// One declared field of an object descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldShape {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(flatten)]
    pub shape: SchemaShape,
}

fn default_required() -> bool {
    true
}

impl SchemaShape {
    fn type_name(&self) -> &'static str {
        match self {
            SchemaShape::String => "string",
            SchemaShape::Number => "number",
            SchemaShape::Boolean => "boolean",
            SchemaShape::Array { .. } => "array",
            SchemaShape::Object { .. } => "object",
        }
    }
}

/// A single validation failure produced by [`coerce_output`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoercionIssue {
    /// Dotted path into the payload, `$` for the root.
    pub path: String,
    pub expected: String,
    pub found: String,
}

impl std::fmt::Display for CoercionIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.path, self.expected, self.found
        )
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Coerce a provider payload against a declared output descriptor.
///
/// Primitive payloads (string, number, boolean) are wrapped into a
/// single-field `{"value": ...}` object unconditionally, so callers always
/// receive an object-shaped result. Object and array payloads are validated
/// against the descriptor and passed through unchanged; a mismatch returns
/// the full list of issues rather than the first one.
pub fn coerce_output(schema: &SchemaShape, payload: Value) -> Result<Value, Vec<CoercionIssue>> {
    match payload {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), payload);
            Ok(Value::Object(wrapped))
        }
        other => {
            let mut issues = Vec::new();
            validate_shape(schema, &other, "$", &mut issues);
            if issues.is_empty() {
                Ok(other)
            } else {
                Err(issues)
            }
        }
    }
}

fn validate_shape(schema: &SchemaShape, value: &Value, path: &str, issues: &mut Vec<CoercionIssue>) {
    let mismatch = |issues: &mut Vec<CoercionIssue>| {
        issues.push(CoercionIssue {
            path: path.to_string(),
            expected: schema.type_name().to_string(),
            found: value_type_name(value).to_string(),
        });
    };

    match schema {
        SchemaShape::String => {
            if !value.is_string() {
                mismatch(issues);
            }
        }
        SchemaShape::Number => {
            if !value.is_number() {
                mismatch(issues);
            }
        }
        SchemaShape::Boolean => {
            if !value.is_boolean() {
                mismatch(issues);
            }
        }
        SchemaShape::Array { items } => match value {
            Value::Array(elements) => {
                for (i, element) in elements.iter().enumerate() {
                    validate_shape(items, element, &format!("{}[{}]", path, i), issues);
                }
            }
            _ => mismatch(issues),
        },
        SchemaShape::Object { fields } => match value {
            Value::Object(map) => {
                for field in fields {
                    let field_path = format!("{}.{}", path, field.name);
                    match map.get(&field.name) {
                        Some(inner) => validate_shape(&field.shape, inner, &field_path, issues),
                        None if field.required => issues.push(CoercionIssue {
                            path: field_path,
                            expected: field.shape.type_name().to_string(),
                            found: "missing".to_string(),
                        }),
                        None => {}
                    }
                }
            }
            _ => mismatch(issues),
        },
    }
}

/// Parameters for one agent invocation, assembled by the engine from a plan
/// node and immutable once built. The engine hashes the serialized form to
/// decide staleness across frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Logical role the dispatcher resolves to a concrete agent.
    pub role: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    pub output_schema: Option<SchemaShape>,
    /// Content handed down from the parent invocation, if any.
    pub parent_context: Option<String>,
}

/// Result of one completed invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub provider: String,
    pub model: Option<String>,
    pub content: String,
    /// Coerced structured payload, present when the config declared a schema.
    pub structured: Option<Value>,
    #[serde(default)]
    pub tool_trace: Vec<ToolTraceEntry>,
    pub usage: Usage,
    pub duration_ms: u64,
    pub timestamp: DateTime<Local>,
    pub error: Option<String>,
    /// At most one level of delegated sub-response; deeper nesting is
    /// truncated by the executor.
    pub nested: Option<Box<InvocationResponse>>,
}

/// One turn of the provider conversation.
#[derive(Debug, Clone)]
pub enum ProviderTurn {
    /// The provider wants tool results before it can finish.
    ToolRequest { calls: Vec<ToolCall>, usage: Usage },
    /// Terminal state: the provider produced its final payload.
    Completed {
        content: String,
        structured: Option<Value>,
        usage: Usage,
        /// Response of a sub-agent the provider delegated to, if any.
        delegated: Option<InvocationResponse>,
    },
}

/// Request sent to a provider. The first turn carries no tool results;
/// follow-up turns carry the results of every call from the previous
/// [`ProviderTurn::ToolRequest`].
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub config: InvocationConfig,
    pub tool_results: Vec<ToolResult>,
}

/// Errors surfaced by a provider implementation.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Transient errors are retried by the executor; everything else
    /// propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network(_))
    }
}

/// Errors surfaced by a tool handler.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool failed: {0}")]
    Failed(String),
}

/// An external model backend serving one or more registered agents.
///
/// Implementations own the transport entirely; the engine only sees turns.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Stable name recorded on responses (e.g. the backend product name).
    fn provider_name(&self) -> &str;

    async fn execute(&self, request: ProviderRequest) -> Result<ProviderTurn, ProviderError>;
}

/// An external tool handler registered alongside a pipeline.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review_schema() -> SchemaShape {
        SchemaShape::Object {
            fields: vec![
                FieldShape {
                    name: "issues".to_string(),
                    required: true,
                    shape: SchemaShape::Array {
                        items: Box::new(SchemaShape::String),
                    },
                },
                FieldShape {
                    name: "summary".to_string(),
                    required: true,
                    shape: SchemaShape::String,
                },
            ],
        }
    }

    #[test]
    fn test_primitive_payload_is_wrapped() {
        let result = coerce_output(&review_schema(), json!("looks fine")).unwrap();
        assert_eq!(result, json!({"value": "looks fine"}));

        let result = coerce_output(&review_schema(), json!(42)).unwrap();
        assert_eq!(result, json!({"value": 42}));

        let result = coerce_output(&review_schema(), json!(true)).unwrap();
        assert_eq!(result, json!({"value": true}));
    }

    #[test]
    fn test_matching_object_passes_through() {
        let payload = json!({"issues": ["missing docs"], "summary": "ok"});
        let result = coerce_output(&review_schema(), payload.clone()).unwrap();
        assert_eq!(result, payload);
    }

    #[test]
    fn test_extra_keys_are_tolerated() {
        let payload = json!({"issues": [], "summary": "ok", "confidence": 0.9});
        assert!(coerce_output(&review_schema(), payload).is_ok());
    }

    #[test]
    fn test_mismatch_collects_all_issues() {
        let payload = json!({"issues": "not-an-array"});
        let issues = coerce_output(&review_schema(), payload).unwrap_err();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].path, "$.issues");
        assert_eq!(issues[0].expected, "array");
        assert_eq!(issues[0].found, "string");
        assert_eq!(issues[1].path, "$.summary");
        assert_eq!(issues[1].found, "missing");
    }

    #[test]
    fn test_array_element_mismatch_has_indexed_path() {
        let schema = SchemaShape::Array {
            items: Box::new(SchemaShape::Number),
        };
        let issues = coerce_output(&schema, json!([1, "two", 3])).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "$[1]");
    }

    #[test]
    fn test_null_is_not_a_primitive() {
        let schema = SchemaShape::Object { fields: vec![] };
        let issues = coerce_output(&schema, json!(null)).unwrap_err();
        assert_eq!(issues[0].found, "null");
    }

    #[test]
    fn test_schema_parses_from_descriptor_json() {
        let descriptor = json!({
            "type": "object",
            "fields": [
                {"name": "issues", "type": "array", "items": {"type": "string"}},
                {"name": "summary", "type": "string"},
                {"name": "score", "type": "number", "required": false},
            ],
        });
        let shape: SchemaShape = serde_json::from_value(descriptor).unwrap();
        match &shape {
            SchemaShape::Object { fields } => {
                assert_eq!(fields.len(), 3);
                assert!(fields[0].required);
                assert!(!fields[2].required);
            }
            other => panic!("expected object shape, got {:?}", other),
        }
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.add(&Usage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn test_provider_error_transience() {
        assert!(ProviderError::RateLimited {
            retry_after_secs: Some(5)
        }
        .is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(!ProviderError::Auth("bad key".into()).is_transient());
        assert!(!ProviderError::Protocol("tool loop".into()).is_transient());
    }

    #[test]
    fn test_node_description_builder() {
        let desc = NodeDescription::new("phase")
            .prop("name", "review")
            .child(NodeDescription::new("agent-invocation").prop("role", "reviewer"));
        assert_eq!(desc.kind, "phase");
        assert_eq!(desc.props["name"], json!("review"));
        assert_eq!(desc.children.len(), 1);
    }
}
