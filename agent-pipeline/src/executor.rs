//! Drives a single invocation against an external provider.
//!
//! The executor owns the tool-calling protocol (provider turns fed with tool
//! results until a terminal turn), structured-output coercion, the retry and
//! timeout policy, and the one ledger row every invocation leaves behind.
//! Failed intermediate attempts are tracing diagnostics, not ledger rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use agent_pipeline_sdk::{
    coerce_output, AgentProvider, InvocationConfig, InvocationResponse, ProviderError,
    ProviderRequest, ProviderTurn, ToolError, ToolHandler, ToolResult, ToolTraceEntry, Usage,
};
use chrono::Local;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::ledger::{ExecutionLedger, ExecutionOutcome};

/// Hard cap on tool round-trips within one invocation; a provider that never
/// reaches a terminal turn is a protocol violation.
const MAX_TOOL_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Per-invocation deadline, covering one protocol attempt.
    pub timeout: Duration,
    /// Attempt budget for transient failures (including the first try).
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub struct InvocationExecutor {
    providers: Arc<HashMap<String, Arc<dyn AgentProvider>>>,
    tools: Arc<HashMap<String, Arc<dyn ToolHandler>>>,
    ledger: Arc<Mutex<ExecutionLedger>>,
    config: ExecutorConfig,
}

impl InvocationExecutor {
    pub fn new(
        providers: HashMap<String, Arc<dyn AgentProvider>>,
        tools: HashMap<String, Arc<dyn ToolHandler>>,
        ledger: Arc<Mutex<ExecutionLedger>>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            tools: Arc::new(tools),
            ledger,
            config,
        }
    }

    /// Execute one invocation for the selected agent and record its final
    /// outcome. A ledger write failure always propagates, even over a
    /// successful provider response.
    pub async fn execute(
        &self,
        agent_id: &str,
        config: &InvocationConfig,
        cancel: &CancellationToken,
    ) -> Result<InvocationResponse> {
        let provider = self.providers.get(agent_id).ok_or_else(|| {
            PipelineError::Validation(format!("no provider bound for agent '{}'", agent_id))
        })?;

        let started = Instant::now();
        let result = self.attempt_loop(provider, config, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (outcome, result_text, error_text) = match &result {
            Ok(response) => (ExecutionOutcome::Success, Some(response.content.clone()), None),
            Err(PipelineError::Cancelled) => (ExecutionOutcome::Cancelled, None, None),
            Err(e) => (ExecutionOutcome::Failure, None, Some(e.to_string())),
        };
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_execution(
                agent_id,
                outcome,
                result_text.as_deref(),
                error_text.as_deref(),
                elapsed_ms,
            )?;

        result.map(|mut response| {
            response.duration_ms = elapsed_ms;
            response
        })
    }

    async fn attempt_loop(
        &self,
        provider: &Arc<dyn AgentProvider>,
        config: &InvocationConfig,
        cancel: &CancellationToken,
    ) -> Result<InvocationResponse> {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let outcome =
                tokio::time::timeout(self.config.timeout, self.run_protocol(provider, config, cancel))
                    .await;
            let error = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => PipelineError::Timeout(self.config.timeout),
            };

            let transient = match &error {
                PipelineError::Provider(e) => e.is_transient(),
                PipelineError::Timeout(_) => true,
                _ => false,
            };
            if !transient || attempt >= self.config.max_attempts {
                return Err(error);
            }

            let delay = self.config.backoff_base * 2u32.saturating_pow(attempt - 1);
            warn!(
                attempt,
                role = %config.role,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One full protocol attempt: feed tool results back until the provider
    /// reaches a terminal turn.
    async fn run_protocol(
        &self,
        provider: &Arc<dyn AgentProvider>,
        config: &InvocationConfig,
        cancel: &CancellationToken,
    ) -> Result<InvocationResponse> {
        let mut request = ProviderRequest {
            config: config.clone(),
            tool_results: Vec::new(),
        };
        let mut usage = Usage::default();
        let mut trace: Vec<ToolTraceEntry> = Vec::new();

        for _ in 0..MAX_TOOL_ROUNDS {
            let turn = provider.execute(request.clone()).await?;
            match turn {
                ProviderTurn::ToolRequest {
                    calls,
                    usage: turn_usage,
                } => {
                    usage.add(&turn_usage);
                    // Cooperative checkpoint between tool rounds.
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    let mut results = Vec::new();
                    for call in calls {
                        let handler = self.tools.get(&call.name).ok_or_else(|| {
                            PipelineError::Tool(ToolError::UnknownTool(call.name.clone()))
                        })?;
                        debug!(tool = %call.name, call_id = %call.id, "invoking tool handler");
                        let output = handler.invoke(&call.name, call.arguments.clone()).await?;
                        results.push(ToolResult {
                            call_id: call.id.clone(),
                            content: output.clone(),
                        });
                        trace.push(ToolTraceEntry {
                            call,
                            result: output,
                        });
                    }
                    request.tool_results = results;
                }
                ProviderTurn::Completed {
                    content,
                    structured,
                    usage: turn_usage,
                    delegated,
                } => {
                    usage.add(&turn_usage);

                    let structured = match &config.output_schema {
                        Some(schema) => {
                            let payload = structured.unwrap_or_else(|| {
                                serde_json::from_str(&content)
                                    .unwrap_or_else(|_| Value::String(content.clone()))
                            });
                            Some(
                                coerce_output(schema, payload)
                                    .map_err(PipelineError::SchemaMismatch)?,
                            )
                        }
                        None => structured,
                    };

                    // One level of nesting; anything deeper is truncated.
                    let nested = delegated.map(|mut sub| {
                        sub.nested = None;
                        Box::new(sub)
                    });

                    return Ok(InvocationResponse {
                        provider: provider.provider_name().to_string(),
                        model: config.model.clone(),
                        content,
                        structured,
                        tool_trace: trace,
                        usage,
                        duration_ms: 0,
                        timestamp: Local::now(),
                        error: None,
                        nested,
                    });
                }
            }
        }

        Err(PipelineError::Provider(ProviderError::Protocol(format!(
            "no terminal turn after {} tool rounds",
            MAX_TOOL_ROUNDS
        ))))
    }
}
