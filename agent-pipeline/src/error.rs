use std::time::Duration;

use agent_pipeline_sdk::{CoercionIssue, ProviderError, ToolError};
use thiserror::Error;

/// Error taxonomy for the pipeline engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed plan description or schema descriptor. Fatal to the run.
    #[error("invalid plan: {0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    /// Structured-output coercion failed against the declared descriptor.
    #[error("structured output mismatch: {}", format_issues(.0))]
    SchemaMismatch(Vec<CoercionIssue>),

    #[error("no agents registered for role '{0}'")]
    NoAgentsRegistered(String),

    /// No provider scope encloses the node. Fatal to the run.
    #[error("no provider scope encloses node '{0}'")]
    MissingProvider(String),

    /// Ledger write or read failure. Durability is never best-effort, so
    /// this is fatal to the run.
    #[error("ledger failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("invocation cancelled")]
    Cancelled,

    /// Iteration cap reached without the continuation condition turning
    /// false. The loop reports this as a termination reason rather than
    /// returning it; the variant exists for embedders.
    #[error("iteration cap of {0} reached without convergence")]
    ConvergenceExceeded(u32),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Fatal errors abort the reconciliation loop immediately; everything
    /// else fails a single node's branch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::MissingProvider(_) | Self::Persistence(_)
        )
    }
}

fn format_issues(issues: &[CoercionIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, PipelineError>;
