//! Execution engine for declarative multi-phase AI-agent pipelines.
//!
//! A pipeline is described as a tree of phases, steps and agent invocations
//! (see [`agent_pipeline_sdk::NodeDescription`]). The engine rebuilds that
//! tree from the shared [`store::WorkflowStore`] on every frame, executes
//! the invocation nodes that are new or whose content changed, applies the
//! resulting mutations back to the store, and repeats until the pipeline
//! converges. Every invocation attempt lands in the SQLite
//! [`ledger::ExecutionLedger`], which also feeds the round-robin
//! [`dispatch::RoundRobinDispatcher`] and makes a crashed pipeline
//! resumable.

// Error taxonomy
pub mod error;

// Reactive workflow state store
pub mod store;

// Durable execution ledger (SQLite)
pub mod ledger;

// Round-robin agent dispatch
pub mod dispatch;

// Plan tree building and hashing
pub mod plan;

// Invocation lifecycle tracking
pub mod invocation;

// Single-invocation executor
pub mod executor;

// Reconciliation loop
pub mod engine;

// Re-export the boundary crate for embedders
pub use agent_pipeline_sdk as sdk;

pub use dispatch::{DispatchConfig, RoundRobinDispatcher};
pub use engine::{
    fixed_plan, FrameReport, NodeFailure, Pipeline, PipelineBuilder, PlanSource, RunOptions,
    RunReport, TerminationReason, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_MAX_ITERATIONS,
};
pub use error::{PipelineError, Result};
pub use executor::{ExecutorConfig, InvocationExecutor};
pub use invocation::{InvocationState, InvocationStatus, InvocationTable};
pub use ledger::{
    AgentRegistration, ExecutionLedger, ExecutionOutcome, ExecutionRecord, LedgerStats,
};
pub use plan::{content_hash, NodeKind, PlanNode, PlanTree};
pub use store::{StoreSnapshot, SubscriptionId, WorkflowStore};
