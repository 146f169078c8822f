//! SQLite-backed policy store.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::store::{PolicyStore, PolicyStoreError};
use super::types::{
    NewExecutionLog, NewPolicy, Policy, PolicyAction, PolicyExecutionLog, PolicyPredicate,
    RunOutcome,
};
use crate::db::{format_ts, parse_ts};

const POLICY_COLUMNS: &str = "id, name, active, predicate, action, created_at, updated_at";

const LOG_COLUMNS: &str = "id, policy_id, run_key, run_at, artifacts_matched, artifacts_affected, artifacts_failed, outcome, error";

/// SQLite-backed policy store.
pub struct SqlitePolicyStore {
    conn: Mutex<Connection>,
}

impl SqlitePolicyStore {
    pub fn new(path: &Path) -> Result<Self, PolicyStoreError> {
        let conn = crate::db::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, PolicyStoreError> {
        let conn = crate::db::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), PolicyStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1,
                predicate TEXT NOT NULL,
                action TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_execution_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                policy_id TEXT NOT NULL,
                run_key TEXT NOT NULL,
                run_at TEXT NOT NULL,
                artifacts_matched INTEGER NOT NULL,
                artifacts_affected INTEGER NOT NULL,
                artifacts_failed INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS policy_run_items (
                policy_id TEXT NOT NULL,
                run_key TEXT NOT NULL,
                artifact_id TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (policy_id, run_key, artifact_id)
            );

            CREATE INDEX IF NOT EXISTS idx_policy_log_policy ON policy_execution_log(policy_id, id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PolicyStoreError> {
        self.conn
            .lock()
            .map_err(|_| PolicyStoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<Policy> {
        let predicate: String = row.get(3)?;
        let action: String = row.get(4)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;

        Ok(Policy {
            id: row.get(0)?,
            name: row.get(1)?,
            active: row.get::<_, i64>(2)? != 0,
            predicate: serde_json::from_str::<PolicyPredicate>(&predicate).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
            })?,
            action: serde_json::from_str::<PolicyAction>(&action).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<PolicyExecutionLog> {
        let run_at: String = row.get(3)?;
        let outcome: String = row.get(7)?;
        Ok(PolicyExecutionLog {
            id: row.get(0)?,
            policy_id: row.get(1)?,
            run_key: row.get(2)?,
            run_at: parse_ts(&run_at),
            artifacts_matched: row.get::<_, i64>(4)? as u64,
            artifacts_affected: row.get::<_, i64>(5)? as u64,
            artifacts_failed: row.get::<_, i64>(6)? as u64,
            outcome: RunOutcome::parse(&outcome).unwrap_or(RunOutcome::Failure),
            error: row.get(8)?,
        })
    }

    fn load(conn: &Connection, column: &str, value: &str) -> Result<Option<Policy>, PolicyStoreError> {
        let sql = format!("SELECT {} FROM policies WHERE {} = ?", POLICY_COLUMNS, column);
        Ok(conn
            .query_row(&sql, params![value], Self::row_to_policy)
            .optional()?)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PolicyStoreError> {
    serde_json::to_string(value).map_err(|e| PolicyStoreError::Database(e.to_string()))
}

impl PolicyStore for SqlitePolicyStore {
    fn create_policy(&self, policy: NewPolicy) -> Result<Policy, PolicyStoreError> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = format_ts(Utc::now());

        let result = conn.execute(
            "INSERT INTO policies (id, name, active, predicate, action, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                policy.name,
                policy.active as i64,
                to_json(&policy.predicate)?,
                to_json(&policy.action)?,
                now,
                now,
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(ffi, _))
                if ffi.code == ErrorCode::ConstraintViolation =>
            {
                return Err(PolicyStoreError::NameTaken(policy.name));
            }
            Err(e) => return Err(e.into()),
        }

        Self::load(&conn, "id", &id)?.ok_or(PolicyStoreError::NotFound(id))
    }

    fn get_policy(&self, id: &str) -> Result<Option<Policy>, PolicyStoreError> {
        let conn = self.lock()?;
        Self::load(&conn, "id", id)
    }

    fn get_policy_by_name(&self, name: &str) -> Result<Option<Policy>, PolicyStoreError> {
        let conn = self.lock()?;
        Self::load(&conn, "name", name)
    }

    fn list_policies(&self, active_only: bool) -> Result<Vec<Policy>, PolicyStoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM policies {} ORDER BY name ASC",
            POLICY_COLUMNS,
            if active_only { "WHERE active = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_policy)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn set_active(&self, id: &str, active: bool) -> Result<Policy, PolicyStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE policies SET active = ?, updated_at = ? WHERE id = ?",
            params![active as i64, format_ts(Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(PolicyStoreError::NotFound(id.to_string()));
        }
        Self::load(&conn, "id", id)?.ok_or_else(|| PolicyStoreError::NotFound(id.to_string()))
    }

    fn append_execution_log(
        &self,
        entry: NewExecutionLog,
    ) -> Result<PolicyExecutionLog, PolicyStoreError> {
        let conn = self.lock()?;
        let run_at = Utc::now();
        conn.execute(
            "INSERT INTO policy_execution_log
             (policy_id, run_key, run_at, artifacts_matched, artifacts_affected, artifacts_failed, outcome, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.policy_id,
                entry.run_key,
                format_ts(run_at),
                entry.artifacts_matched as i64,
                entry.artifacts_affected as i64,
                entry.artifacts_failed as i64,
                entry.outcome.as_str(),
                entry.error,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM policy_execution_log WHERE id = ?", LOG_COLUMNS);
        Ok(conn.query_row(&sql, params![id], Self::row_to_log)?)
    }

    fn list_execution_log(
        &self,
        policy_id: &str,
        limit: i64,
    ) -> Result<Vec<PolicyExecutionLog>, PolicyStoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM policy_execution_log WHERE policy_id = ? ORDER BY id DESC LIMIT ?",
            LOG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![policy_id, limit], Self::row_to_log)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn record_run_item(
        &self,
        policy_id: &str,
        run_key: &str,
        artifact_id: &str,
    ) -> Result<(), PolicyStoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO policy_run_items (policy_id, run_key, artifact_id, processed_at)
             VALUES (?, ?, ?, ?)",
            params![policy_id, run_key, artifact_id, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    fn processed_in_run(
        &self,
        policy_id: &str,
        run_key: &str,
    ) -> Result<HashSet<String>, PolicyStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT artifact_id FROM policy_run_items WHERE policy_id = ? AND run_key = ?",
        )?;
        let rows = stmt.query_map(params![policy_id, run_key], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Tier;

    fn archive_policy(name: &str) -> NewPolicy {
        NewPolicy {
            name: name.to_string(),
            active: true,
            predicate: PolicyPredicate {
                min_age_days: Some(90),
                ..Default::default()
            },
            action: PolicyAction::TransitionTo(Tier::Archive),
        }
    }

    #[test]
    fn test_create_and_get_policy() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let policy = store.create_policy(archive_policy("archive-old")).unwrap();

        assert_eq!(policy.name, "archive-old");
        assert!(policy.active);
        assert_eq!(policy.action, PolicyAction::TransitionTo(Tier::Archive));
        assert_eq!(policy.predicate.min_age_days, Some(90));

        assert_eq!(store.get_policy(&policy.id).unwrap(), Some(policy.clone()));
        assert_eq!(
            store.get_policy_by_name("archive-old").unwrap().map(|p| p.id),
            Some(policy.id)
        );
    }

    #[test]
    fn test_policy_names_are_unique() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        store.create_policy(archive_policy("archive-old")).unwrap();
        assert!(matches!(
            store.create_policy(archive_policy("archive-old")),
            Err(PolicyStoreError::NameTaken(_))
        ));
    }

    #[test]
    fn test_list_active_only() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let a = store.create_policy(archive_policy("a")).unwrap();
        store.create_policy(archive_policy("b")).unwrap();
        store.set_active(&a.id, false).unwrap();

        assert_eq!(store.list_policies(false).unwrap().len(), 2);
        let active = store.list_policies(true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
    }

    #[test]
    fn test_execution_log_is_append_only_and_newest_first() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        let policy = store.create_policy(archive_policy("a")).unwrap();
        for outcome in [RunOutcome::Failure, RunOutcome::Success] {
            store
                .append_execution_log(NewExecutionLog {
                    policy_id: policy.id.clone(),
                    run_key: "2026-01-01T00:00:00.000000Z".to_string(),
                    artifacts_matched: 2,
                    artifacts_affected: 1,
                    artifacts_failed: 1,
                    outcome,
                    error: None,
                })
                .unwrap();
        }

        let log = store.list_execution_log(&policy.id, 10).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].outcome, RunOutcome::Success);
        assert_eq!(log[1].outcome, RunOutcome::Failure);
        assert!(log[0].id > log[1].id);
    }

    #[test]
    fn test_run_items_are_scoped_to_run() {
        let store = SqlitePolicyStore::in_memory().unwrap();
        store.record_run_item("p1", "run-1", "a1").unwrap();
        store.record_run_item("p1", "run-1", "a1").unwrap();
        store.record_run_item("p1", "run-1", "a2").unwrap();
        store.record_run_item("p1", "run-2", "a3").unwrap();
        store.record_run_item("p2", "run-1", "a4").unwrap();

        let done = store.processed_in_run("p1", "run-1").unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.contains("a1") && done.contains("a2"));
    }
}
