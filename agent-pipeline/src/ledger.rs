//! SQLite-backed execution ledger.
//!
//! The ledger is the durable source of truth for every invocation attempt,
//! the agent registry, and the dispatcher's rotation cursor. Dispatcher
//! statistics are recomputed from it at startup rather than trusted from any
//! in-memory cache, which is what makes a crashed pipeline resumable.
//!
//! # Schema
//!
//! 1. **agents** - registered dispatchable instances (id, name, type, priority)
//! 2. **executions** - append-only invocation outcomes
//! 3. **round_robin_state** - persisted rotation cursors, one row per logical type
//! 4. **schema_version** - monotonic version counter gating migrations

use std::path::PathBuf;

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{PipelineError, Result};

/// Reserved error text marking a cancelled outcome in the `executions`
/// table. The schema carries only a success flag, so cancellation is encoded
/// in the error column and decoded back on read; it is never conflated with
/// failure by any reader in this crate.
const CANCELLED_MARKER: &str = "cancelled";

/// Outcome of one recorded invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Cancelled,
}

/// One row of the `executions` table.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: i64,
    pub agent_id: String,
    pub outcome: ExecutionOutcome,
    pub result: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Local>,
}

/// A concrete dispatchable agent instance, as registered with the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistration {
    pub id: String,
    pub name: String,
    /// Logical role this instance serves (the `type` column).
    pub role: String,
    pub priority: i64,
}

/// Aggregate statistics over recorded executions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerStats {
    pub count: u64,
    pub success_count: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

/// Connection wrapper owning the ledger schema.
pub struct ExecutionLedger {
    conn: Connection,
}

impl ExecutionLedger {
    /// Open (or create) a ledger at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::Validation(format!("ledger directory: {}", e)))?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrent access
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self { conn })
    }

    /// In-memory ledger for tests and ephemeral pipelines.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Create all tables and run pending migrations. Safe to call on an
    /// already-initialized database.
    pub fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                execution_time_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,

                FOREIGN KEY(agent_id) REFERENCES agents(id)
            );

            CREATE TABLE IF NOT EXISTS round_robin_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
            [],
        )?;

        self.migrate_to_v2()?;

        Ok(())
    }

    /// Migrate to version 2: lookup indexes for the dispatcher's stat and
    /// candidate queries.
    fn migrate_to_v2(&self) -> Result<()> {
        if self.schema_version()? >= 2 {
            return Ok(());
        }

        // Plain CREATE INDEX on purpose: a migration that fails because the
        // target state is already present counts as applied.
        for statement in [
            "CREATE INDEX idx_executions_agent_id ON executions(agent_id, id DESC)",
            "CREATE INDEX idx_agents_type ON agents(type)",
        ] {
            match self.conn.execute(statement, []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("already exists") => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.conn
            .execute("UPDATE schema_version SET version = 2", [])?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i32> {
        let version: i32 =
            self.conn
                .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                    row.get(0)
                })?;
        Ok(version)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Insert an agent, or refresh name and priority for an existing id.
    /// The logical type of a registered agent never changes.
    pub fn upsert_agent(&self, registration: &AgentRegistration) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO agents (id, name, type, priority, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                priority = excluded.priority,
                updated_at = excluded.updated_at
            "#,
            params![
                registration.id,
                registration.name,
                registration.role,
                registration.priority,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRegistration>> {
        let agent = self
            .conn
            .query_row(
                "SELECT id, name, type, priority FROM agents WHERE id = ?1",
                params![id],
                map_agent_row,
            )
            .optional()?;
        Ok(agent)
    }

    /// Candidates for a logical type in deterministic rotation order:
    /// ascending priority, then lexicographic id.
    pub fn agents_for_type(&self, role: &str) -> Result<Vec<AgentRegistration>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, type, priority FROM agents
             WHERE type = ?1
             ORDER BY priority ASC, id ASC",
        )?;
        let agents = stmt
            .query_map(params![role], map_agent_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn update_priority(&self, id: &str, priority: i64) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE agents SET priority = ?1, updated_at = ?2 WHERE id = ?3",
            params![priority, now, id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Append one execution outcome. One row per invocation, written in its
    /// own transaction; failure here always propagates.
    pub fn record_execution(
        &self,
        agent_id: &str,
        outcome: ExecutionOutcome,
        result: Option<&str>,
        error: Option<&str>,
        execution_time_ms: u64,
    ) -> Result<i64> {
        let success = matches!(outcome, ExecutionOutcome::Success);
        let error = match outcome {
            ExecutionOutcome::Cancelled => Some(CANCELLED_MARKER),
            _ => error,
        };
        let created_at = Local::now().to_rfc3339();

        self.conn.execute(
            r#"
            INSERT INTO executions (agent_id, success, result, error, execution_time_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                agent_id,
                success as i64,
                result,
                error,
                execution_time_ms as i64,
                created_at,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent records first.
    pub fn history(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, success, result, error, execution_time_ms, created_at
             FROM executions
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit], map_execution_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Aggregate statistics, optionally scoped to one agent. Cancelled rows
    /// count as attempts but never as successes.
    pub fn stats(&self, agent_id: Option<&str>) -> Result<LedgerStats> {
        let query = "SELECT COUNT(*),
                            SUM(success),
                            AVG(execution_time_ms),
                            MIN(execution_time_ms),
                            MAX(execution_time_ms)
                     FROM executions";

        let map_stats = |row: &Row| {
            Ok(LedgerStats {
                count: row.get::<_, i64>(0)? as u64,
                success_count: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                avg_duration_ms: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                min_duration_ms: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                max_duration_ms: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
            })
        };

        let stats = match agent_id {
            Some(id) => self.conn.query_row(
                &format!("{} WHERE agent_id = ?1", query),
                params![id],
                map_stats,
            )?,
            None => self.conn.query_row(query, [], map_stats)?,
        };
        Ok(stats)
    }

    /// Success/failure outcomes for one agent, most recent first, bounded by
    /// `window`. Cancelled rows are excluded: cancellation is not failure.
    pub fn recent_outcomes(&self, agent_id: &str, window: usize) -> Result<Vec<bool>> {
        let mut stmt = self.conn.prepare(
            "SELECT success FROM executions
             WHERE agent_id = ?1 AND (error IS NULL OR error != ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let outcomes = stmt
            .query_map(params![agent_id, CANCELLED_MARKER, window], |row| {
                Ok(row.get::<_, i64>(0)? != 0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(outcomes)
    }

    /// Retention policy: delete records older than the cutoff. Returns the
    /// number of rows removed.
    pub fn delete_executions_before(&self, cutoff: DateTime<Local>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM executions WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Rotation state
    // ------------------------------------------------------------------

    pub fn rotation_cursor(&self, role: &str) -> Result<Option<u64>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM round_robin_state WHERE key = ?1",
                params![role],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub fn set_rotation_cursor(&self, role: &str, cursor: u64) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO round_robin_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![role, cursor.to_string(), now],
        )?;
        Ok(())
    }
}

fn map_agent_row(row: &Row) -> rusqlite::Result<AgentRegistration> {
    Ok(AgentRegistration {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        priority: row.get(3)?,
    })
}

fn map_execution_row(row: &Row) -> rusqlite::Result<ExecutionRecord> {
    let success: i64 = row.get(2)?;
    let result: Option<String> = row.get(3)?;
    let error: Option<String> = row.get(4)?;
    let created_at_str: String = row.get(6)?;

    let outcome = if success != 0 {
        ExecutionOutcome::Success
    } else if error.as_deref() == Some(CANCELLED_MARKER) {
        ExecutionOutcome::Cancelled
    } else {
        ExecutionOutcome::Failure
    };

    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Local);

    Ok(ExecutionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        outcome,
        result,
        error,
        execution_time_ms: row.get::<_, i64>(5)? as u64,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ledger_with_agent(id: &str, role: &str) -> ExecutionLedger {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        ledger
            .upsert_agent(&AgentRegistration {
                id: id.to_string(),
                name: format!("Agent {}", id),
                role: role.to_string(),
                priority: 0,
            })
            .unwrap();
        ledger
    }

    #[test]
    fn test_schema_initialization_and_version() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        assert_eq!(ledger.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_initialize_schema_is_idempotent() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        // Second run must not fail and must not bump the version.
        ledger.initialize_schema().unwrap();
        assert_eq!(ledger.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_record_then_history_returns_it() {
        let ledger = ledger_with_agent("a1", "reviewer");

        let id = ledger
            .record_execution("a1", ExecutionOutcome::Success, Some("done"), None, 120)
            .unwrap();

        let history = ledger.history(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].agent_id, "a1");
        assert_eq!(history[0].outcome, ExecutionOutcome::Success);
        assert_eq!(history[0].result.as_deref(), Some("done"));
        assert_eq!(history[0].execution_time_ms, 120);
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let ledger = ledger_with_agent("a1", "reviewer");
        for i in 0..5 {
            ledger
                .record_execution("a1", ExecutionOutcome::Success, None, None, i)
                .unwrap();
        }

        let history = ledger.history(3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].execution_time_ms, 4);
        assert_eq!(history[2].execution_time_ms, 2);
    }

    #[test]
    fn test_stats_aggregation() {
        let ledger = ledger_with_agent("a1", "reviewer");
        ledger
            .upsert_agent(&AgentRegistration {
                id: "a2".into(),
                name: "Agent a2".into(),
                role: "reviewer".into(),
                priority: 0,
            })
            .unwrap();

        ledger
            .record_execution("a1", ExecutionOutcome::Success, None, None, 100)
            .unwrap();
        ledger
            .record_execution("a1", ExecutionOutcome::Failure, None, Some("boom"), 300)
            .unwrap();
        ledger
            .record_execution("a2", ExecutionOutcome::Success, None, None, 50)
            .unwrap();

        let all = ledger.stats(None).unwrap();
        assert_eq!(all.count, 3);
        assert_eq!(all.success_count, 2);
        assert_eq!(all.min_duration_ms, 50);
        assert_eq!(all.max_duration_ms, 300);
        assert!((all.avg_duration_ms - 150.0).abs() < f64::EPSILON);

        let a1 = ledger.stats(Some("a1")).unwrap();
        assert_eq!(a1.count, 2);
        assert_eq!(a1.success_count, 1);
    }

    #[test]
    fn test_stats_on_empty_ledger() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        let stats = ledger.stats(None).unwrap();
        assert_eq!(stats, LedgerStats::default());
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        let before = {
            let ledger = ExecutionLedger::open(path.clone()).unwrap();
            ledger.initialize_schema().unwrap();
            ledger
                .upsert_agent(&AgentRegistration {
                    id: "a1".into(),
                    name: "Agent a1".into(),
                    role: "reviewer".into(),
                    priority: 0,
                })
                .unwrap();
            ledger
                .record_execution("a1", ExecutionOutcome::Success, Some("ok"), None, 42)
                .unwrap();
            ledger.set_rotation_cursor("reviewer", 7).unwrap();
            ledger.stats(None).unwrap()
        };

        // Simulated restart: fresh connection to the same file.
        let ledger = ExecutionLedger::open(path).unwrap();
        ledger.initialize_schema().unwrap();
        assert_eq!(ledger.stats(None).unwrap(), before);
        assert_eq!(ledger.rotation_cursor("reviewer").unwrap(), Some(7));
    }

    #[test]
    fn test_cancelled_outcome_round_trips_distinctly() {
        let ledger = ledger_with_agent("a1", "reviewer");
        ledger
            .record_execution("a1", ExecutionOutcome::Cancelled, None, None, 10)
            .unwrap();
        ledger
            .record_execution("a1", ExecutionOutcome::Failure, None, Some("boom"), 10)
            .unwrap();

        let history = ledger.history(10).unwrap();
        assert_eq!(history[1].outcome, ExecutionOutcome::Cancelled);
        assert_eq!(history[0].outcome, ExecutionOutcome::Failure);

        // Cancelled rows never enter the trailing window.
        let outcomes = ledger.recent_outcomes("a1", 10).unwrap();
        assert_eq!(outcomes, vec![false]);
    }

    #[test]
    fn test_recent_outcomes_window_and_order() {
        let ledger = ledger_with_agent("a1", "reviewer");
        for outcome in [
            ExecutionOutcome::Success,
            ExecutionOutcome::Failure,
            ExecutionOutcome::Success,
        ] {
            ledger
                .record_execution("a1", outcome, None, None, 1)
                .unwrap();
        }

        let outcomes = ledger.recent_outcomes("a1", 2).unwrap();
        assert_eq!(outcomes, vec![true, false]);
    }

    #[test]
    fn test_upsert_refreshes_priority_but_not_type() {
        let ledger = ledger_with_agent("a1", "reviewer");
        ledger
            .upsert_agent(&AgentRegistration {
                id: "a1".into(),
                name: "Renamed".into(),
                role: "planner".into(),
                priority: 5,
            })
            .unwrap();

        let agent = ledger.get_agent("a1").unwrap().unwrap();
        assert_eq!(agent.name, "Renamed");
        assert_eq!(agent.priority, 5);
        assert_eq!(agent.role, "reviewer");
    }

    #[test]
    fn test_candidate_ordering() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();
        for (id, priority) in [("b", 0), ("a", 1), ("c", 0)] {
            ledger
                .upsert_agent(&AgentRegistration {
                    id: id.into(),
                    name: id.into(),
                    role: "reviewer".into(),
                    priority,
                })
                .unwrap();
        }

        let ids: Vec<String> = ledger
            .agents_for_type("reviewer")
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_retention_deletes_old_rows() {
        let ledger = ledger_with_agent("a1", "reviewer");
        ledger
            .record_execution("a1", ExecutionOutcome::Success, None, None, 1)
            .unwrap();

        // Nothing is older than an hour ago.
        let deleted = ledger
            .delete_executions_before(Local::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(deleted, 0);

        let deleted = ledger
            .delete_executions_before(Local::now() + Duration::hours(1))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(ledger.history(10).unwrap().is_empty());
    }

    #[test]
    fn test_rotation_cursor_upsert() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        ledger.initialize_schema().unwrap();

        assert_eq!(ledger.rotation_cursor("reviewer").unwrap(), None);
        ledger.set_rotation_cursor("reviewer", 1).unwrap();
        ledger.set_rotation_cursor("reviewer", 2).unwrap();
        assert_eq!(ledger.rotation_cursor("reviewer").unwrap(), Some(2));
    }
}
