//! SQLite-backed artifact store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::error::ArtifactStoreError;
use super::traits::{ArtifactFilter, ArtifactStore};
use super::types::{
    DatasetArtifact, NewArtifact, RehydrationPriority, RehydrationState, Tier, TierChange,
    TierTransitionRecord,
};
use crate::db::{format_ts, parse_opt_ts, parse_ts};

const ARTIFACT_COLUMNS: &str = "id, job_id, chunk_id, location, tier, size_bytes, access_count, rehydration_state, rehydration_priority, rehydration_eta, created_at, last_accessed_at, tier_changed_at";

/// SQLite-backed artifact store.
pub struct SqliteArtifactStore {
    conn: Mutex<Connection>,
}

impl SqliteArtifactStore {
    /// Create a new store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, ArtifactStoreError> {
        let conn = crate::db::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, ArtifactStoreError> {
        let conn = crate::db::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), ArtifactStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                chunk_id TEXT,
                location TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                rehydration_state TEXT NOT NULL DEFAULT 'absent',
                rehydration_priority TEXT,
                rehydration_eta TEXT,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT,
                tier_changed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tier_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                artifact_id TEXT NOT NULL,
                from_tier TEXT NOT NULL,
                to_tier TEXT,
                reason TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_job ON artifacts(job_id);
            CREATE INDEX IF NOT EXISTS idx_artifacts_tier ON artifacts(tier);
            CREATE INDEX IF NOT EXISTS idx_artifacts_rehydration ON artifacts(rehydration_state);
            CREATE INDEX IF NOT EXISTS idx_tier_transitions_artifact ON tier_transitions(artifact_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ArtifactStoreError> {
        self.conn
            .lock()
            .map_err(|_| ArtifactStoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn build_where_clause(filter: &ArtifactFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref job_id) = filter.job_id {
            conditions.push("job_id = ?");
            params.push(Box::new(job_id.clone()));
        }

        if let Some(tier) = filter.tier {
            conditions.push("tier = ?");
            params.push(Box::new(tier.as_str()));
        }

        if let Some(state) = filter.rehydration_state {
            conditions.push("rehydration_state = ?");
            params.push(Box::new(state.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<DatasetArtifact> {
        let tier: String = row.get(4)?;
        let rehydration_state: String = row.get(7)?;
        let rehydration_priority: Option<String> = row.get(8)?;
        let created_at: String = row.get(10)?;
        let tier_changed_at: String = row.get(12)?;

        Ok(DatasetArtifact {
            id: row.get(0)?,
            job_id: row.get(1)?,
            chunk_id: row.get(2)?,
            location: row.get(3)?,
            tier: Tier::parse(&tier).unwrap_or(Tier::Archive),
            size_bytes: row.get::<_, i64>(5)? as u64,
            access_count: row.get::<_, i64>(6)? as u64,
            rehydration_state: RehydrationState::parse(&rehydration_state).unwrap_or_default(),
            rehydration_priority: rehydration_priority
                .as_deref()
                .and_then(RehydrationPriority::parse),
            rehydration_eta: parse_opt_ts(row.get(9)?),
            created_at: parse_ts(&created_at),
            last_accessed_at: parse_opt_ts(row.get(11)?),
            tier_changed_at: parse_ts(&tier_changed_at),
        })
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<DatasetArtifact>, ArtifactStoreError> {
        let sql = format!("SELECT {} FROM artifacts WHERE id = ?", ARTIFACT_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], Self::row_to_artifact)
            .optional()?)
    }

    fn load_required(conn: &Connection, id: &str) -> Result<DatasetArtifact, ArtifactStoreError> {
        Self::load(conn, id)?.ok_or_else(|| ArtifactStoreError::NotFound(id.to_string()))
    }
}

impl ArtifactStore for SqliteArtifactStore {
    fn insert_artifact(&self, artifact: NewArtifact) -> Result<DatasetArtifact, ArtifactStoreError> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = format_ts(Utc::now());

        conn.execute(
            "INSERT INTO artifacts (id, job_id, chunk_id, location, tier, size_bytes, created_at, tier_changed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(location) DO NOTHING",
            params![
                id,
                artifact.job_id,
                artifact.chunk_id,
                artifact.location,
                Tier::Hot.as_str(),
                artifact.size_bytes as i64,
                now,
                now,
            ],
        )?;

        let sql = format!(
            "SELECT {} FROM artifacts WHERE location = ?",
            ARTIFACT_COLUMNS
        );
        Ok(conn.query_row(&sql, params![artifact.location], Self::row_to_artifact)?)
    }

    fn get_artifact(&self, id: &str) -> Result<Option<DatasetArtifact>, ArtifactStoreError> {
        let conn = self.lock()?;
        Self::load(&conn, id)
    }

    fn list_artifacts(
        &self,
        filter: &ArtifactFilter,
    ) -> Result<Vec<DatasetArtifact>, ArtifactStoreError> {
        let conn = self.lock()?;
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM artifacts {} ORDER BY created_at ASC, id ASC LIMIT ?",
            ARTIFACT_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit.unwrap_or(-1)));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), Self::row_to_artifact)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn apply_tier_change(
        &self,
        id: &str,
        change: &TierChange,
    ) -> Result<DatasetArtifact, ArtifactStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = format_ts(Utc::now());

        let changed = tx.execute(
            "UPDATE artifacts
             SET tier = ?, rehydration_state = ?,
                 rehydration_priority = CASE WHEN ? = 'absent' THEN NULL ELSE rehydration_priority END,
                 rehydration_eta = NULL, tier_changed_at = ?
             WHERE id = ? AND tier = ?",
            params![
                change.to.as_str(),
                change.rehydration.as_str(),
                change.rehydration.as_str(),
                now,
                id,
                change.from.as_str(),
            ],
        )?;
        if changed == 0 {
            return match Self::load(&tx, id)? {
                Some(_) => Err(ArtifactStoreError::Conflict(id.to_string())),
                None => Err(ArtifactStoreError::NotFound(id.to_string())),
            };
        }

        tx.execute(
            "INSERT INTO tier_transitions (artifact_id, from_tier, to_tier, reason, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
            params![id, change.from.as_str(), change.to.as_str(), change.reason, now],
        )?;

        let artifact = Self::load_required(&tx, id)?;
        tx.commit()?;
        Ok(artifact)
    }

    fn mark_rehydrating(
        &self,
        id: &str,
        priority: RehydrationPriority,
        eta: DateTime<Utc>,
    ) -> Result<DatasetArtifact, ArtifactStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE artifacts
             SET rehydration_state = 'in_progress', rehydration_priority = ?, rehydration_eta = ?
             WHERE id = ? AND tier = 'archive'",
            params![priority.as_str(), format_ts(eta), id],
        )?;
        if changed == 0 {
            return match Self::load(&conn, id)? {
                Some(_) => Err(ArtifactStoreError::Conflict(id.to_string())),
                None => Err(ArtifactStoreError::NotFound(id.to_string())),
            };
        }
        Self::load_required(&conn, id)
    }

    fn record_access(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<DatasetArtifact, ArtifactStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE artifacts SET access_count = access_count + 1, last_accessed_at = ? WHERE id = ?",
            params![format_ts(at), id],
        )?;
        if changed == 0 {
            return Err(ArtifactStoreError::NotFound(id.to_string()));
        }
        Self::load_required(&conn, id)
    }

    fn delete_artifact(&self, id: &str, reason: &str) -> Result<(), ArtifactStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let artifact = Self::load_required(&tx, id)?;

        tx.execute("DELETE FROM artifacts WHERE id = ?", params![id])?;
        tx.execute(
            "INSERT INTO tier_transitions (artifact_id, from_tier, to_tier, reason, recorded_at)
             VALUES (?, ?, NULL, ?, ?)",
            params![id, artifact.tier.as_str(), reason, format_ts(Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_transitions(
        &self,
        artifact_id: &str,
    ) -> Result<Vec<TierTransitionRecord>, ArtifactStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, artifact_id, from_tier, to_tier, reason, recorded_at
             FROM tier_transitions WHERE artifact_id = ? ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![artifact_id], |row| {
            let from_tier: String = row.get(2)?;
            let to_tier: Option<String> = row.get(3)?;
            let recorded_at: String = row.get(5)?;
            Ok(TierTransitionRecord {
                id: row.get(0)?,
                artifact_id: row.get(1)?,
                from_tier: Tier::parse(&from_tier).unwrap_or(Tier::Hot),
                to_tier: to_tier.as_deref().and_then(Tier::parse),
                reason: row.get(4)?,
                recorded_at: parse_ts(&recorded_at),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_artifact(location: &str) -> NewArtifact {
        NewArtifact {
            job_id: "job-1".to_string(),
            chunk_id: Some("chunk-1".to_string()),
            location: location.to_string(),
            size_bytes: 2048,
        }
    }

    fn archive(store: &SqliteArtifactStore, id: &str) -> DatasetArtifact {
        store
            .apply_tier_change(
                id,
                &TierChange {
                    from: Tier::Hot,
                    to: Tier::Archive,
                    rehydration: RehydrationState::Absent,
                    reason: "manual".to_string(),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let artifact = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();

        assert_eq!(artifact.tier, Tier::Hot);
        assert_eq!(artifact.size_bytes, 2048);
        assert_eq!(artifact.rehydration_state, RehydrationState::Absent);

        let loaded = store.get_artifact(&artifact.id).unwrap().unwrap();
        assert_eq!(loaded, artifact);
        assert!(store.get_artifact("missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_same_location_is_idempotent() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let first = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        let second = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_artifacts(&ArtifactFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_tier_change_is_recorded() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let artifact = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();

        let archived = archive(&store, &artifact.id);
        assert_eq!(archived.tier, Tier::Archive);

        let history = store.list_transitions(&artifact.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_tier, Tier::Hot);
        assert_eq!(history[0].to_tier, Some(Tier::Archive));
        assert_eq!(history[0].reason, "manual");
    }

    #[test]
    fn test_tier_change_compares_current_tier() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let artifact = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        archive(&store, &artifact.id);

        let stale = store.apply_tier_change(
            &artifact.id,
            &TierChange {
                from: Tier::Hot,
                to: Tier::Cool,
                rehydration: RehydrationState::Absent,
                reason: "manual".to_string(),
            },
        );
        assert!(matches!(stale, Err(ArtifactStoreError::Conflict(_))));
        assert_eq!(store.list_transitions(&artifact.id).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_rehydrating_requires_archive() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let artifact = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        let eta = Utc::now() + chrono::Duration::hours(1);

        assert!(matches!(
            store.mark_rehydrating(&artifact.id, RehydrationPriority::Expedited, eta),
            Err(ArtifactStoreError::Conflict(_))
        ));

        archive(&store, &artifact.id);
        let rehydrating = store
            .mark_rehydrating(&artifact.id, RehydrationPriority::Expedited, eta)
            .unwrap();
        assert_eq!(rehydrating.rehydration_state, RehydrationState::InProgress);
        assert_eq!(
            rehydrating.rehydration_priority,
            Some(RehydrationPriority::Expedited)
        );
        assert!(rehydrating.rehydration_eta.is_some());

        let pending = store
            .list_artifacts(&ArtifactFilter::new().with_rehydration_state(RehydrationState::InProgress))
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_record_access() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let artifact = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        store.record_access(&artifact.id, Utc::now()).unwrap();
        let updated = store.record_access(&artifact.id, Utc::now()).unwrap();
        assert_eq!(updated.access_count, 2);
        assert!(updated.last_accessed_at.is_some());
    }

    #[test]
    fn test_delete_keeps_history() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let artifact = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        store.delete_artifact(&artifact.id, "policy:cleanup").unwrap();

        assert!(store.get_artifact(&artifact.id).unwrap().is_none());
        let history = store.list_transitions(&artifact.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_tier, None);

        assert!(matches!(
            store.delete_artifact(&artifact.id, "manual"),
            Err(ArtifactStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_filter_by_job_and_tier() {
        let store = SqliteArtifactStore::in_memory().unwrap();
        let a = store.insert_artifact(new_artifact("job-1/a.tar")).unwrap();
        store.insert_artifact(new_artifact("job-1/b.tar")).unwrap();
        store
            .insert_artifact(NewArtifact {
                job_id: "job-2".to_string(),
                ..new_artifact("job-2/a.tar")
            })
            .unwrap();
        archive(&store, &a.id);

        let job1 = store
            .list_artifacts(&ArtifactFilter::new().with_job("job-1"))
            .unwrap();
        assert_eq!(job1.len(), 2);

        let archived = store
            .list_artifacts(&ArtifactFilter::new().with_tier(Tier::Archive))
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, a.id);
    }
}
