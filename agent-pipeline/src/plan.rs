//! The rebuilt plan tree.
//!
//! The tree is reconstructed from the authoring layer's [`NodeDescription`]
//! on every frame. Nodes are arena-allocated with index-based child links
//! and a non-owning parent back-reference; identity across rebuilds is the
//! structural path, which stays stable as long as a node's ancestry and
//! declared ordering do not change. Invocation state is never stored in the
//! tree (see [`crate::invocation::InvocationTable`]).

use std::collections::HashMap;

use agent_pipeline_sdk::{InvocationConfig, NodeDescription, SchemaShape, ToolSpec};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

/// Known plan-node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Phase,
    Step,
    Constraint,
    AgentInvocation,
    Tool,
    OutputBinding,
    ProviderScope,
}

impl NodeKind {
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "phase" => Ok(Self::Phase),
            "step" => Ok(Self::Step),
            "constraint" => Ok(Self::Constraint),
            "agent-invocation" => Ok(Self::AgentInvocation),
            "tool" => Ok(Self::Tool),
            "output-binding" => Ok(Self::OutputBinding),
            "provider-scope" => Ok(Self::ProviderScope),
            other => Err(PipelineError::Validation(format!(
                "unknown node kind '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phase => "phase",
            Self::Step => "step",
            Self::Constraint => "constraint",
            Self::AgentInvocation => "agent-invocation",
            Self::Tool => "tool",
            Self::OutputBinding => "output-binding",
            Self::ProviderScope => "provider-scope",
        }
    }
}

/// One node of the rebuilt tree.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub kind: NodeKind,
    pub props: Map<String, Value>,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
    pub path: String,
}

impl PlanNode {
    fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }
}

/// Arena-backed plan tree with path-indexed lookup.
#[derive(Debug)]
pub struct PlanTree {
    nodes: Vec<PlanNode>,
    by_path: HashMap<String, usize>,
}

impl PlanTree {
    /// Build the tree from an authoring-layer description. Fails with a
    /// validation error on any unknown node kind.
    pub fn build(description: &NodeDescription) -> Result<Self> {
        let mut tree = Self {
            nodes: Vec::new(),
            by_path: HashMap::new(),
        };
        tree.insert(description, None)?;
        Ok(tree)
    }

    fn insert(&mut self, description: &NodeDescription, parent: Option<usize>) -> Result<usize> {
        let kind = NodeKind::parse(&description.kind)?;
        let path = match parent {
            None => kind.as_str().to_string(),
            Some(parent_index) => {
                let parent_node = &self.nodes[parent_index];
                // Ordinal among same-kind siblings keeps paths stable when
                // siblings of other kinds are added or removed.
                let ordinal = parent_node
                    .children
                    .iter()
                    .filter(|&&c| self.nodes[c].kind == kind)
                    .count();
                format!("{}/{}[{}]", parent_node.path, kind.as_str(), ordinal)
            }
        };

        let index = self.nodes.len();
        self.nodes.push(PlanNode {
            kind,
            props: description.props.clone(),
            children: Vec::new(),
            parent,
            path: path.clone(),
        });
        self.by_path.insert(path, index);
        if let Some(parent_index) = parent {
            self.nodes[parent_index].children.push(index);
        }

        for child in &description.children {
            self.insert(child, Some(index))?;
        }
        Ok(index)
    }

    pub fn node(&self, index: usize) -> &PlanNode {
        &self.nodes[index]
    }

    pub fn by_path(&self, path: &str) -> Option<&PlanNode> {
        self.by_path.get(path).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Indices of agent-invocation nodes, in preorder.
    pub fn invocation_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].kind == NodeKind::AgentInvocation)
            .collect()
    }

    /// The nearest enclosing provider scope, walking ancestry. A node with
    /// no governing scope is a hard error, not a silent global fallback.
    pub fn provider_scope_of(&self, index: usize) -> Result<&PlanNode> {
        let mut current = self.nodes[index].parent;
        while let Some(i) = current {
            if self.nodes[i].kind == NodeKind::ProviderScope {
                return Ok(&self.nodes[i]);
            }
            current = self.nodes[i].parent;
        }
        Err(PipelineError::MissingProvider(
            self.nodes[index].path.clone(),
        ))
    }

    /// Store keys this invocation declares as inputs.
    pub fn reads_of(&self, index: usize) -> Vec<String> {
        self.nodes[index]
            .props
            .get("inputs")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Store keys this invocation's output bindings write.
    pub fn writes_of(&self, index: usize) -> Vec<String> {
        self.nodes[index]
            .children
            .iter()
            .filter(|&&c| self.nodes[c].kind == NodeKind::OutputBinding)
            .filter_map(|&c| self.nodes[c].prop_str("key"))
            .map(str::to_string)
            .collect()
    }

    /// Assemble the invocation parameters for an agent-invocation node,
    /// merging inheritable defaults from the governing provider scope and
    /// folding constraint children into the system prompt.
    pub fn invocation_config(&self, index: usize) -> Result<InvocationConfig> {
        let node = &self.nodes[index];
        let scope = self.provider_scope_of(index)?;

        let role = node
            .prop_str("role")
            .ok_or_else(|| {
                PipelineError::Validation(format!("node '{}' is missing a role", node.path))
            })?
            .to_string();
        let user_prompt = node
            .prop_str("prompt")
            .ok_or_else(|| {
                PipelineError::Validation(format!("node '{}' is missing a prompt", node.path))
            })?
            .to_string();

        let model = node
            .prop_str("model")
            .or_else(|| scope.prop_str("model"))
            .map(str::to_string);
        let temperature = node
            .props
            .get("temperature")
            .or_else(|| scope.props.get("temperature"))
            .and_then(Value::as_f64);
        let max_tokens = node
            .props
            .get("max_tokens")
            .or_else(|| scope.props.get("max_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        let mut system_prompt = node.prop_str("system_prompt").map(str::to_string);
        let constraints: Vec<&str> = node
            .children
            .iter()
            .filter(|&&c| self.nodes[c].kind == NodeKind::Constraint)
            .filter_map(|&c| self.nodes[c].prop_str("text"))
            .collect();
        if !constraints.is_empty() {
            let joined = constraints.join("\n");
            system_prompt = Some(match system_prompt {
                Some(base) => format!("{}\n{}", base, joined),
                None => joined,
            });
        }

        let tools = node
            .children
            .iter()
            .filter(|&&c| self.nodes[c].kind == NodeKind::Tool)
            .map(|&c| {
                let tool = &self.nodes[c];
                let name = tool.prop_str("name").ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "tool node '{}' is missing a name",
                        tool.path
                    ))
                })?;
                Ok(ToolSpec {
                    name: name.to_string(),
                    description: tool.prop_str("description").unwrap_or_default().to_string(),
                    parameters: tool
                        .props
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let output_schema = node
            .props
            .get("output_schema")
            .map(|descriptor| {
                serde_json::from_value::<SchemaShape>(descriptor.clone()).map_err(|e| {
                    PipelineError::Validation(format!(
                        "node '{}' has an invalid output schema: {}",
                        node.path, e
                    ))
                })
            })
            .transpose()?;

        Ok(InvocationConfig {
            role,
            model,
            system_prompt,
            user_prompt,
            max_tokens,
            temperature,
            tools,
            output_schema,
            parent_context: node.prop_str("context").map(str::to_string),
        })
    }
}

/// Content hash of an invocation config, used for staleness. Configs are
/// assembled field-by-field from the same code path every frame, so the
/// serialized form is deterministic.
pub fn content_hash(config: &InvocationConfig) -> Result<String> {
    let bytes = serde_json::to_vec(config)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
