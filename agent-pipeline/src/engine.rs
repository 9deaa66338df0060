//! The reconciliation loop.
//!
//! One frame = rebuild the plan tree from the current store, collect
//! invocation nodes that are new or stale (content hash changed), partition
//! out nodes blocked on a not-yet-completed dependency, execute the rest
//! concurrently up to the configured limit, and apply mutations in arrival
//! order. The loop owns the store, the invocation side table, and the
//! dispatcher; invocations themselves run concurrently but every mutation is
//! serialized through this single control sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_pipeline_sdk::{AgentProvider, InvocationConfig, NodeDescription, ToolHandler, Usage};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchConfig, RoundRobinDispatcher};
use crate::error::{PipelineError, Result};
use crate::executor::{ExecutorConfig, InvocationExecutor};
use crate::invocation::{InvocationState, InvocationStatus, InvocationTable};
use crate::ledger::{AgentRegistration, ExecutionLedger};
use crate::plan::{content_hash, PlanTree};
use crate::store::{StoreSnapshot, WorkflowStore};

pub const DEFAULT_MAX_ITERATIONS: u32 = 16;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

/// The tree-authoring boundary: anything that can produce a plan description
/// from the current store snapshot. Implemented by closures; fixed plans go
/// through [`fixed_plan`].
pub trait PlanSource {
    fn describe(&self, snapshot: &StoreSnapshot) -> Result<NodeDescription>;
}

impl<F> PlanSource for F
where
    F: Fn(&StoreSnapshot) -> Result<NodeDescription>,
{
    fn describe(&self, snapshot: &StoreSnapshot) -> Result<NodeDescription> {
        self(snapshot)
    }
}

/// Wrap a fixed description as a plan source that ignores the store.
pub fn fixed_plan(description: NodeDescription) -> impl PlanSource {
    move |_: &StoreSnapshot| Ok(description.clone())
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    Converged,
    ConditionFalse,
    MaxIterations,
    FatalError,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Converged => "converged",
            Self::ConditionFalse => "condition-false",
            Self::MaxIterations => "max-iterations",
            Self::FatalError => "fatal-error",
        };
        f.write_str(text)
    }
}

/// A failed branch, surfaced in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub path: String,
    pub error: String,
}

/// Per-frame progress, delivered to the `on_frame` callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameReport {
    pub frame: u32,
    pub dispatched: usize,
    pub mutations: usize,
    pub failures: usize,
}

/// Final result of a run. Partial success is first-class: failed branches
/// are listed in `errors` while completed siblings contribute to the
/// snapshot.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub final_snapshot: StoreSnapshot,
    pub frame_count: u32,
    pub total_duration: Duration,
    pub termination: TerminationReason,
    pub errors: Vec<NodeFailure>,
    /// Aggregate token usage across every completed invocation.
    pub usage: Usage,
}

/// Options governing one run.
pub struct RunOptions {
    pub max_iterations: u32,
    pub concurrency_limit: usize,
    /// Continuation condition, checked before every frame; returning false
    /// stops the run with `condition-false`.
    pub continue_while: Option<Box<dyn Fn(&StoreSnapshot) -> bool + Send>>,
    pub on_frame: Option<Box<dyn FnMut(&FrameReport) + Send>>,
    pub on_complete: Option<Box<dyn FnOnce(&RunReport) + Send>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            continue_while: None,
            on_frame: None,
            on_complete: None,
        }
    }
}

/// Builder wiring agents, providers, tools and the ledger into a pipeline.
pub struct PipelineBuilder {
    ledger_path: Option<PathBuf>,
    agents: Vec<(AgentRegistration, Arc<dyn AgentProvider>)>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    executor_config: ExecutorConfig,
    dispatch_config: DispatchConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            ledger_path: None,
            agents: Vec::new(),
            tools: HashMap::new(),
            executor_config: ExecutorConfig::default(),
            dispatch_config: DispatchConfig::default(),
        }
    }

    /// Persist the ledger at this path. Without it the ledger lives in
    /// memory and dies with the pipeline.
    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    pub fn agent(
        mut self,
        registration: AgentRegistration,
        provider: Arc<dyn AgentProvider>,
    ) -> Self {
        self.agents.push((registration, provider));
        self
    }

    pub fn tool(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.insert(name.into(), handler);
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch_config = config;
        self
    }

    /// Open the ledger, run migrations (fatal on failure), register agents,
    /// and recompute dispatcher state from durable rows.
    pub fn build(self) -> Result<Pipeline> {
        let ledger = match self.ledger_path {
            Some(path) => ExecutionLedger::open(path)?,
            None => ExecutionLedger::open_in_memory()?,
        };
        ledger.initialize_schema()?;
        let ledger = Arc::new(Mutex::new(ledger));

        let mut dispatcher = RoundRobinDispatcher::new(Arc::clone(&ledger), self.dispatch_config);
        let mut providers: HashMap<String, Arc<dyn AgentProvider>> = HashMap::new();
        for (registration, provider) in self.agents {
            dispatcher.register(&registration)?;
            providers.insert(registration.id.clone(), provider);
        }

        let executor = InvocationExecutor::new(
            providers,
            self.tools,
            Arc::clone(&ledger),
            self.executor_config,
        );

        Ok(Pipeline {
            ledger,
            dispatcher,
            executor,
            store: WorkflowStore::new(),
            states: InvocationTable::default(),
            cancel: CancellationToken::new(),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending invocation node, ready for dispatch.
struct PendingNode {
    path: String,
    config: InvocationConfig,
    hash: String,
    writes: Vec<String>,
}

enum FrameOutcome {
    Converged,
    Executed {
        dispatched: usize,
        mutations: usize,
        failures: usize,
    },
}

/// A pipeline instance: one store, one invocation table, one ledger.
pub struct Pipeline {
    ledger: Arc<Mutex<ExecutionLedger>>,
    dispatcher: RoundRobinDispatcher,
    executor: InvocationExecutor,
    store: WorkflowStore,
    states: InvocationTable,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Token for cooperative cancellation of a running pipeline.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> Arc<Mutex<ExecutionLedger>> {
        Arc::clone(&self.ledger)
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    /// Seed a value before a run starts.
    pub fn seed_value(&mut self, key: impl Into<String>, value: Value) {
        self.store.set_value(key, value);
    }

    pub fn invocation_status(&self, path: &str) -> Option<InvocationStatus> {
        self.states.get(path).map(|s| s.status)
    }

    /// Run the reconciliation loop to termination.
    ///
    /// All four termination reasons, including `fatal-error`, come back as
    /// `Ok` with partial results attached; `Err` means the run could not
    /// proceed at all.
    pub async fn run(
        &mut self,
        plan: impl PlanSource,
        mut options: RunOptions,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut frame_count = 0u32;
        let mut errors: Vec<NodeFailure> = Vec::new();
        let mut usage = Usage::default();

        let termination = loop {
            if self.cancel.is_cancelled() {
                break TerminationReason::ConditionFalse;
            }
            if let Some(condition) = &options.continue_while {
                if !condition(&self.store.snapshot()) {
                    break TerminationReason::ConditionFalse;
                }
            }
            if frame_count >= options.max_iterations {
                break TerminationReason::MaxIterations;
            }
            frame_count += 1;

            match self
                .run_frame(&plan, &options, &mut errors, &mut usage)
                .await
            {
                Ok(FrameOutcome::Converged) => break TerminationReason::Converged,
                Ok(FrameOutcome::Executed {
                    dispatched,
                    mutations,
                    failures,
                }) => {
                    let report = FrameReport {
                        frame: frame_count,
                        dispatched,
                        mutations,
                        failures,
                    };
                    if let Some(on_frame) = options.on_frame.as_mut() {
                        on_frame(&report);
                    }
                    debug!(
                        frame = frame_count,
                        dispatched, mutations, failures, "frame complete"
                    );
                    // Step 6: only a frame that mutated state warrants a
                    // rebuild; a mutation-free frame cannot change the tree.
                    if mutations == 0 {
                        break TerminationReason::Converged;
                    }
                }
                Err(error) => {
                    warn!(error = %error, "fatal error, aborting run");
                    errors.push(NodeFailure {
                        path: String::new(),
                        error: error.to_string(),
                    });
                    break TerminationReason::FatalError;
                }
            }
        };

        let report = RunReport {
            final_snapshot: self.store.snapshot(),
            frame_count,
            total_duration: started.elapsed(),
            termination,
            errors,
            usage,
        };
        info!(
            frames = report.frame_count,
            reason = %report.termination,
            errors = report.errors.len(),
            "pipeline run finished"
        );
        if let Some(on_complete) = options.on_complete.take() {
            on_complete(&report);
        }
        Ok(report)
    }

    /// One frame: rebuild, collect, partition, execute, apply. Returns `Err`
    /// only for fatal errors, which abort the run.
    async fn run_frame(
        &mut self,
        plan: &impl PlanSource,
        options: &RunOptions,
        errors: &mut Vec<NodeFailure>,
        usage: &mut Usage,
    ) -> Result<FrameOutcome> {
        // Step 1: rebuild the tree from the current snapshot.
        let description = plan.describe(&self.store.snapshot())?;
        let tree = PlanTree::build(&description)?;

        // Step 2: collect new and stale invocation nodes. `active_writes`
        // tracks the store keys owned by any not-yet-completed invocation,
        // which is what dependents must wait for.
        let mut pending: Vec<PendingNode> = Vec::new();
        let mut reads: HashMap<String, Vec<String>> = HashMap::new();
        let mut active_writes: HashMap<String, String> = HashMap::new();
        for index in tree.invocation_nodes() {
            let config = tree.invocation_config(index)?;
            let hash = content_hash(&config)?;
            let node = tree.node(index);

            let completed_with_same_hash = matches!(
                self.states.get(&node.path),
                Some(state)
                    if state.status == InvocationStatus::Completed && state.config_hash == hash
            );
            if completed_with_same_hash {
                continue;
            }

            for key in tree.writes_of(index) {
                active_writes.insert(key, node.path.clone());
            }

            // An errored node with an unchanged hash stays terminal; it only
            // re-runs once its config content changes.
            let stale_or_new = match self.states.get(&node.path) {
                None => true,
                Some(state) => state.status.is_terminal() && state.config_hash != hash,
            };
            if stale_or_new {
                reads.insert(node.path.clone(), tree.reads_of(index));
                pending.push(PendingNode {
                    path: node.path.clone(),
                    config,
                    hash,
                    writes: tree.writes_of(index),
                });
            }
        }

        if pending.is_empty() {
            return Ok(FrameOutcome::Converged);
        }

        // Step 3: a node consuming another node's declared output waits for
        // that dependency to complete.
        let dispatchable: Vec<PendingNode> = pending
            .into_iter()
            .filter(|node| {
                reads
                    .get(&node.path)
                    .map(|keys| {
                        keys.iter().all(|key| match active_writes.get(key) {
                            None => true,
                            Some(writer) => writer == &node.path,
                        })
                    })
                    .unwrap_or(true)
            })
            .collect();

        if dispatchable.is_empty() {
            // Every pending node is blocked on an errored dependency; the
            // failed branches are already in the report.
            return Ok(FrameOutcome::Converged);
        }

        // Step 4: dispatch the group, bounded by the concurrency limit.
        let semaphore = Arc::new(Semaphore::new(options.concurrency_limit.max(1)));
        let mut inflight = FuturesUnordered::new();
        let mut dispatched = 0usize;
        let mut failures = 0usize;
        for node in dispatchable {
            let agent_id = match self.dispatcher.select(&node.config.role) {
                Ok(agent_id) => agent_id,
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    // Branch failure; sibling branches still execute.
                    let mut state =
                        InvocationState::new(&node.path, node.config.clone(), node.hash.clone());
                    state.mark_running();
                    state.mark_error(error.to_string());
                    self.states.schedule(state);
                    errors.push(NodeFailure {
                        path: node.path.clone(),
                        error: error.to_string(),
                    });
                    failures += 1;
                    warn!(path = %node.path, error = %error, "branch failed at dispatch");
                    continue;
                }
            };

            let mut state = InvocationState::new(&node.path, node.config.clone(), node.hash.clone());
            state.mark_running();
            self.states.schedule(state);
            dispatched += 1;

            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            inflight.push(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => executor.execute(&agent_id, &node.config, &cancel).await,
                    Err(_) => Err(PipelineError::Cancelled),
                };
                (node, agent_id, result)
            });
        }

        // Step 5: apply results in arrival order, serialized here on the
        // control sequence even though the calls ran concurrently.
        let mut mutations = 0usize;
        while let Some((node, agent_id, result)) = inflight.next().await {
            match result {
                Ok(response) => {
                    usage.add(&response.usage);
                    self.dispatcher
                        .record_outcome(&node.config.role, &agent_id, true);

                    if let Some(nested) = response.nested.as_deref() {
                        let mut child = InvocationState::new(
                            format!("{}/nested", node.path),
                            node.config.clone(),
                            node.hash.clone(),
                        );
                        child.mark_running();
                        child.mark_completed(nested.clone());
                        self.states.attach_child(&node.path, child);
                    }

                    let value = response
                        .structured
                        .clone()
                        .unwrap_or_else(|| Value::String(response.content.clone()));
                    for key in &node.writes {
                        self.store.set_value(key.clone(), value.clone());
                        mutations += 1;
                    }

                    if let Some(state) = self.states.get_mut(&node.path) {
                        state.mark_completed(response);
                    }
                }
                Err(PipelineError::Cancelled) => {
                    failures += 1;
                    if let Some(state) = self.states.get_mut(&node.path) {
                        state.mark_error("cancelled");
                    }
                    errors.push(NodeFailure {
                        path: node.path,
                        error: "cancelled".to_string(),
                    });
                }
                Err(error) if error.is_fatal() => {
                    // Abort immediately; in-flight work is cancelled
                    // cooperatively and not awaited.
                    self.cancel.cancel();
                    if let Some(state) = self.states.get_mut(&node.path) {
                        state.mark_error(error.to_string());
                    }
                    return Err(error);
                }
                Err(error) => {
                    self.dispatcher
                        .record_outcome(&node.config.role, &agent_id, false);
                    failures += 1;
                    if let Some(state) = self.states.get_mut(&node.path) {
                        state.mark_error(error.to_string());
                    }
                    warn!(path = %node.path, error = %error, "branch failed");
                    errors.push(NodeFailure {
                        path: node.path,
                        error: error.to_string(),
                    });
                }
            }
        }

        Ok(FrameOutcome::Executed {
            dispatched,
            mutations,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_pipeline_sdk::NodeDescription;

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(TerminationReason::Converged.to_string(), "converged");
        assert_eq!(TerminationReason::ConditionFalse.to_string(), "condition-false");
        assert_eq!(TerminationReason::MaxIterations.to_string(), "max-iterations");
        assert_eq!(TerminationReason::FatalError.to_string(), "fatal-error");
    }

    #[test]
    fn test_run_options_defaults() {
        let options = RunOptions::default();
        assert_eq!(options.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(options.concurrency_limit, DEFAULT_CONCURRENCY_LIMIT);
        assert!(options.continue_while.is_none());
    }

    #[test]
    fn test_fixed_plan_ignores_the_snapshot() {
        let plan = fixed_plan(NodeDescription::new("provider-scope"));
        let snapshot = StoreSnapshot::default();
        let produced = plan.describe(&snapshot).unwrap();
        assert_eq!(produced.kind, "provider-scope");
    }
}
