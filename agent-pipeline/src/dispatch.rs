//! Round-robin agent selection with ledger-backed bookkeeping.
//!
//! One rotation cursor per logical type, persisted to `round_robin_state` on
//! every selection. Trailing success windows are rebuilt from the
//! `executions` table when a type is first touched, so a restarted pipeline
//! resumes rotation and demotion state from durable rows alone.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::ledger::{AgentRegistration, ExecutionLedger};

/// Tuning for the dispatcher's demotion policy.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Size of the trailing success-rate window per agent.
    pub window: usize,
    /// An agent whose trailing rate falls below this accrues one skip.
    pub demotion_threshold: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            window: 10,
            demotion_threshold: 0.5,
        }
    }
}

#[derive(Debug, Default)]
struct AgentHealth {
    /// Trailing outcomes, oldest first, bounded by the configured window.
    window: VecDeque<bool>,
    /// One pending skip, consumed the next time this agent's turn comes.
    pending_skip: bool,
}

impl AgentHealth {
    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|s| **s).count();
        successes as f64 / self.window.len() as f64
    }

    fn record(&mut self, success: bool, config: &DispatchConfig) {
        self.window.push_back(success);
        while self.window.len() > config.window {
            self.window.pop_front();
        }
        if self.success_rate() < config.demotion_threshold {
            self.pending_skip = true;
        }
    }
}

#[derive(Debug, Default)]
struct RotationState {
    cursor: u64,
    health: HashMap<String, AgentHealth>,
}

/// Selects a concrete agent instance for a logical role.
pub struct RoundRobinDispatcher {
    ledger: Arc<Mutex<ExecutionLedger>>,
    config: DispatchConfig,
    rotation: HashMap<String, RotationState>,
}

impl RoundRobinDispatcher {
    pub fn new(ledger: Arc<Mutex<ExecutionLedger>>, config: DispatchConfig) -> Self {
        Self {
            ledger,
            config,
            rotation: HashMap::new(),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, ExecutionLedger> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an agent (or refresh name/priority of an existing one).
    pub fn register(&mut self, registration: &AgentRegistration) -> Result<()> {
        self.ledger().upsert_agent(registration)?;
        Ok(())
    }

    /// Ordered candidate list for a logical type.
    pub fn agents_for(&self, role: &str) -> Result<Vec<AgentRegistration>> {
        self.ledger().agents_for_type(role)
    }

    /// Select the next agent for a logical type and durably advance the
    /// rotation cursor.
    pub fn select(&mut self, role: &str) -> Result<String> {
        let ledger = Arc::clone(&self.ledger);
        let ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let candidates = ledger.agents_for_type(role)?;
        if candidates.is_empty() {
            return Err(PipelineError::NoAgentsRegistered(role.to_string()));
        }

        if !self.rotation.contains_key(role) {
            let state = rebuild_rotation_state(&ledger, role, &candidates, &self.config)?;
            self.rotation.insert(role.to_string(), state);
        }
        let state = self
            .rotation
            .entry(role.to_string())
            .or_default();

        let mut chosen = None;
        // Every skipped candidate consumes its pending skip, so at most one
        // extra lap is needed before a turn lands.
        for _ in 0..=candidates.len() {
            let pos = state.cursor as usize % candidates.len();
            let candidate = &candidates[pos];
            state.cursor = state.cursor.wrapping_add(1);

            let health = state.health.entry(candidate.id.clone()).or_default();
            if health.pending_skip {
                health.pending_skip = false;
                debug!(
                    agent = %candidate.id,
                    role,
                    rate = health.success_rate(),
                    "trailing success rate below threshold, forwarding turn"
                );
                continue;
            }

            chosen = Some(candidate.id.clone());
            break;
        }
        let chosen = chosen
            .unwrap_or_else(|| candidates[state.cursor as usize % candidates.len()].id.clone());

        ledger.set_rotation_cursor(role, state.cursor)?;
        debug!(agent = %chosen, role, cursor = state.cursor, "agent selected");
        Ok(chosen)
    }

    /// Feed one recorded outcome into the agent's trailing window. Cancelled
    /// invocations must not be reported here.
    pub fn record_outcome(&mut self, role: &str, agent_id: &str, success: bool) {
        let state = self.rotation.entry(role.to_string()).or_default();
        let health = state.health.entry(agent_id.to_string()).or_default();
        let was_pending = health.pending_skip;
        health.record(success, &self.config);
        if health.pending_skip && !was_pending {
            debug!(
                agent = %agent_id,
                role,
                rate = health.success_rate(),
                "agent demoted for one turn"
            );
        }
    }
}

/// Startup recompute: cursor from `round_robin_state`, trailing windows and
/// pending demotions from `executions` rows.
fn rebuild_rotation_state(
    ledger: &ExecutionLedger,
    role: &str,
    candidates: &[AgentRegistration],
    config: &DispatchConfig,
) -> Result<RotationState> {
    let cursor = ledger.rotation_cursor(role)?.unwrap_or(0);
    let mut health = HashMap::new();
    for candidate in candidates {
        let mut outcomes = ledger.recent_outcomes(&candidate.id, config.window)?;
        // Query returns newest first; the window stores oldest first.
        outcomes.reverse();
        let window: VecDeque<bool> = outcomes.into();
        let mut entry = AgentHealth {
            window,
            pending_skip: false,
        };
        entry.pending_skip =
            !entry.window.is_empty() && entry.success_rate() < config.demotion_threshold;
        health.insert(candidate.id.clone(), entry);
    }
    Ok(RotationState { cursor, health })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ExecutionOutcome;

    fn dispatcher_with_agents(agents: &[(&str, i64)], role: &str) -> RoundRobinDispatcher {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        let mut dispatcher =
            RoundRobinDispatcher::new(Arc::new(Mutex::new(ledger)), DispatchConfig::default());
        for (id, priority) in agents {
            dispatcher
                .register(&AgentRegistration {
                    id: id.to_string(),
                    name: id.to_string(),
                    role: role.to_string(),
                    priority: *priority,
                })
                .unwrap();
        }
        dispatcher
    }

    #[test]
    fn test_no_agents_registered() {
        let mut dispatcher = dispatcher_with_agents(&[], "reviewer");
        match dispatcher.select("reviewer") {
            Err(PipelineError::NoAgentsRegistered(role)) => assert_eq!(role, "reviewer"),
            other => panic!("expected NoAgentsRegistered, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rotation_fairness_equal_priority() {
        let mut dispatcher =
            dispatcher_with_agents(&[("a", 0), ("b", 0), ("c", 0)], "reviewer");

        let picks: Vec<String> = (0..3)
            .map(|_| dispatcher.select("reviewer").unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_priority_then_id_rotation() {
        // a: priority 0, b: priority 1 -> a, b, a
        let mut dispatcher = dispatcher_with_agents(&[("b", 1), ("a", 0)], "reviewer");

        let picks: Vec<String> = (0..3)
            .map(|_| dispatcher.select("reviewer").unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_demoted_agent_skipped_once_then_recovers() {
        let mut dispatcher = dispatcher_with_agents(&[("a", 0), ("b", 0)], "reviewer");

        // Drive a's trailing rate to zero.
        dispatcher.record_outcome("reviewer", "a", false);
        dispatcher.record_outcome("reviewer", "a", false);

        // a's turn is forwarded to b exactly once, consuming the cycle...
        assert_eq!(dispatcher.select("reviewer").unwrap(), "b");
        // ...then a is selectable again without any new outcomes.
        assert_eq!(dispatcher.select("reviewer").unwrap(), "a");
        assert_eq!(dispatcher.select("reviewer").unwrap(), "b");
    }

    #[test]
    fn test_demotion_rearms_on_new_failure() {
        let mut dispatcher = dispatcher_with_agents(&[("a", 0), ("b", 0)], "reviewer");

        dispatcher.record_outcome("reviewer", "a", false);
        assert_eq!(dispatcher.select("reviewer").unwrap(), "b");

        // Another failure re-arms the skip.
        dispatcher.record_outcome("reviewer", "a", false);
        assert_eq!(dispatcher.select("reviewer").unwrap(), "b");
        assert_eq!(dispatcher.select("reviewer").unwrap(), "a");
    }

    #[test]
    fn test_cursor_survives_restart() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        let ledger = Arc::new(Mutex::new(ledger));

        for id in ["a", "b", "c"] {
            ledger
                .lock()
                .unwrap()
                .upsert_agent(&AgentRegistration {
                    id: id.into(),
                    name: id.into(),
                    role: "reviewer".into(),
                    priority: 0,
                })
                .unwrap();
        }

        let mut first =
            RoundRobinDispatcher::new(ledger.clone(), DispatchConfig::default());
        assert_eq!(first.select("reviewer").unwrap(), "a");
        assert_eq!(first.select("reviewer").unwrap(), "b");
        drop(first);

        // A rebuilt dispatcher continues where the previous one stopped.
        let mut second = RoundRobinDispatcher::new(ledger, DispatchConfig::default());
        assert_eq!(second.select("reviewer").unwrap(), "c");
        assert_eq!(second.select("reviewer").unwrap(), "a");
    }

    #[test]
    fn test_demotion_recomputed_from_ledger_at_startup() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        let ledger = Arc::new(Mutex::new(ledger));

        for id in ["a", "b"] {
            ledger
                .lock()
                .unwrap()
                .upsert_agent(&AgentRegistration {
                    id: id.into(),
                    name: id.into(),
                    role: "reviewer".into(),
                    priority: 0,
                })
                .unwrap();
        }
        // Durable failure rows for a, no in-memory state anywhere.
        for _ in 0..3 {
            ledger
                .lock()
                .unwrap()
                .record_execution("a", ExecutionOutcome::Failure, None, Some("boom"), 5)
                .unwrap();
        }

        let mut dispatcher = RoundRobinDispatcher::new(ledger, DispatchConfig::default());
        assert_eq!(dispatcher.select("reviewer").unwrap(), "b");
        assert_eq!(dispatcher.select("reviewer").unwrap(), "a");
    }
}
