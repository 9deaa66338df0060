//! Invocation lifecycle tracking.
//!
//! States live in a side table keyed by the plan node's structural path,
//! never inside the rebuilt tree, so identity survives re-renders. Status
//! moves strictly forward; the only way to mutate it is through the
//! `mark_*` methods, which ignore backward transitions.

use std::collections::HashMap;

use agent_pipeline_sdk::{InvocationConfig, InvocationResponse};
use chrono::{DateTime, Local};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl InvocationStatus {
    fn rank(self) -> u8 {
        match self {
            InvocationStatus::Pending => 0,
            InvocationStatus::Running => 1,
            InvocationStatus::Completed => 2,
            InvocationStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Error)
    }
}

/// Lifecycle tracker for one scheduled invocation.
#[derive(Debug, Clone)]
pub struct InvocationState {
    pub id: Uuid,
    pub path: String,
    pub status: InvocationStatus,
    pub config: InvocationConfig,
    /// Content hash of `config` at scheduling time; staleness is decided by
    /// comparing against the hash of a freshly built config.
    pub config_hash: String,
    pub response: Option<InvocationResponse>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub parent: Option<Uuid>,
    pub children: Vec<Uuid>,
}

impl InvocationState {
    pub fn new(path: impl Into<String>, config: InvocationConfig, config_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            status: InvocationStatus::Pending,
            config,
            config_hash,
            response: None,
            error: None,
            started_at: None,
            ended_at: None,
            parent: None,
            children: Vec::new(),
        }
    }

    fn advance(&mut self, next: InvocationStatus) -> bool {
        if next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_running(&mut self) {
        if self.advance(InvocationStatus::Running) {
            self.started_at = Some(Local::now());
        }
    }

    pub fn mark_completed(&mut self, response: InvocationResponse) {
        if self.advance(InvocationStatus::Completed) {
            self.response = Some(response);
            self.ended_at = Some(Local::now());
        }
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        if self.advance(InvocationStatus::Error) {
            self.error = Some(error.into());
            self.ended_at = Some(Local::now());
        }
    }
}

/// Side table of invocation states, keyed by structural path.
#[derive(Debug, Default)]
pub struct InvocationTable {
    states: HashMap<String, InvocationState>,
}

impl InvocationTable {
    pub fn get(&self, path: &str) -> Option<&InvocationState> {
        self.states.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut InvocationState> {
        self.states.get_mut(path)
    }

    /// Install a fresh state for a path, replacing any stale predecessor.
    pub fn schedule(&mut self, state: InvocationState) {
        self.states.insert(state.path.clone(), state);
    }

    /// Attach a completed child state (nested sub-invocation) to its parent.
    pub fn attach_child(&mut self, parent_path: &str, mut child: InvocationState) {
        let Some(parent) = self.states.get_mut(parent_path) else {
            return;
        };
        child.parent = Some(parent.id);
        parent.children.push(child.id);
        let child_path = child.path.clone();
        self.states.insert(child_path, child);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InvocationState)> {
        self.states.iter()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InvocationConfig {
        InvocationConfig {
            role: "reviewer".into(),
            model: None,
            system_prompt: None,
            user_prompt: "review this".into(),
            max_tokens: None,
            temperature: None,
            tools: vec![],
            output_schema: None,
            parent_context: None,
        }
    }

    fn response() -> InvocationResponse {
        InvocationResponse {
            provider: "mock".into(),
            model: None,
            content: "ok".into(),
            structured: None,
            tool_trace: vec![],
            usage: Default::default(),
            duration_ms: 1,
            timestamp: Local::now(),
            error: None,
            nested: None,
        }
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut state = InvocationState::new("phase[0]/agent-invocation[0]", config(), "h".into());
        assert_eq!(state.status, InvocationStatus::Pending);

        state.mark_running();
        assert_eq!(state.status, InvocationStatus::Running);
        assert!(state.started_at.is_some());

        state.mark_completed(response());
        assert_eq!(state.status, InvocationStatus::Completed);

        // Terminal states never move backward or sideways.
        state.mark_running();
        assert_eq!(state.status, InvocationStatus::Completed);
        state.mark_error("late failure");
        assert_eq!(state.status, InvocationStatus::Completed);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_error_is_terminal() {
        let mut state = InvocationState::new("p", config(), "h".into());
        state.mark_running();
        state.mark_error("boom");
        assert_eq!(state.status, InvocationStatus::Error);

        state.mark_completed(response());
        assert_eq!(state.status, InvocationStatus::Error);
        assert!(state.response.is_none());
    }

    #[test]
    fn test_schedule_replaces_stale_state() {
        let mut table = InvocationTable::default();
        let first = InvocationState::new("p", config(), "h1".into());
        let first_id = first.id;
        table.schedule(first);

        let second = InvocationState::new("p", config(), "h2".into());
        let second_id = second.id;
        table.schedule(second);

        assert_ne!(first_id, second_id);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("p").unwrap().config_hash, "h2");
    }

    #[test]
    fn test_attach_child_links_ids() {
        let mut table = InvocationTable::default();
        table.schedule(InvocationState::new("p", config(), "h".into()));

        let mut child = InvocationState::new("p/nested", config(), "h".into());
        child.mark_running();
        child.mark_completed(response());
        let child_id = child.id;
        table.attach_child("p", child);

        let parent = table.get("p").unwrap();
        assert_eq!(parent.children, vec![child_id]);
        assert_eq!(table.get("p/nested").unwrap().parent, Some(parent.id));
    }
}
