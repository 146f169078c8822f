//! SQLite-backed job store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    AdmissionLimits, AdmissionOutcome, Chunk, ChunkCounters, ChunkStatus, ChunkUpdate, Job,
    JobCounters, JobFilter, JobStatus, JobStore, JobStoreError, NewJob,
};
use crate::db::{format_ts, parse_opt_ts, parse_ts};

const JOB_COLUMNS: &str = "id, owner, requested_items, chunk_size, status, attempt, cancel_requested, items_downloaded, items_completed, items_failed, created_at, started_at, completed_at, updated_at";

const CHUNK_COLUMNS: &str = "c.id, c.job_id, c.ordinal, c.job_attempt, c.item_count, c.status, c.retry_count, c.dispatch_id, c.task_handle, c.reserved_bytes, c.items_downloaded, c.items_completed, c.items_failed, c.last_error, c.next_attempt_at, c.heartbeat_at, c.created_at, c.started_at, c.ended_at, c.updated_at";

const ACTIVE_STATUSES: &str = "('admitted', 'running')";

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, JobStoreError> {
        let conn = crate::db::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, JobStoreError> {
        let conn = crate::db::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                requested_items INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                items_downloaded INTEGER NOT NULL DEFAULT 0,
                items_completed INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                ordinal INTEGER NOT NULL,
                job_attempt INTEGER NOT NULL,
                item_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                dispatch_id TEXT,
                task_handle TEXT,
                reserved_bytes INTEGER NOT NULL DEFAULT 0,
                items_downloaded INTEGER NOT NULL DEFAULT 0,
                items_completed INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at TEXT,
                heartbeat_at TEXT,
                superseded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner);
            CREATE INDEX IF NOT EXISTS idx_chunks_job ON chunks(job_id, superseded, ordinal);
            CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(status);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, JobStoreError> {
        self.conn
            .lock()
            .map_err(|_| JobStoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref owner) = filter.owner {
            conditions.push("owner = ?");
            params.push(Box::new(owner.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status: String = row.get(4)?;
        let items_downloaded = row.get::<_, i64>(7)? as u64;
        let items_completed = row.get::<_, i64>(8)? as u64;
        let items_failed = row.get::<_, i64>(9)? as u64;

        Ok(Job {
            id: row.get(0)?,
            owner: row.get(1)?,
            requested_items: row.get::<_, i64>(2)? as u64,
            chunk_size: row.get::<_, i64>(3)? as u64,
            chunk_ids: Vec::new(),
            counters: JobCounters {
                items_downloaded,
                items_completed,
                items_failed,
                total_items_processed: items_completed + items_failed,
            },
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
            attempt: row.get(5)?,
            cancel_requested: row.get::<_, i64>(6)? != 0,
            created_at: parse_ts(&row.get::<_, String>(10)?),
            started_at: parse_opt_ts(row.get(11)?),
            completed_at: parse_opt_ts(row.get(12)?),
            updated_at: parse_ts(&row.get::<_, String>(13)?),
        })
    }

    fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
        let status: String = row.get(5)?;
        Ok(Chunk {
            id: row.get(0)?,
            job_id: row.get(1)?,
            ordinal: row.get(2)?,
            job_attempt: row.get(3)?,
            item_count: row.get::<_, i64>(4)? as u64,
            status: ChunkStatus::parse(&status).unwrap_or(ChunkStatus::Failed),
            retry_count: row.get(6)?,
            dispatch_id: row.get(7)?,
            task_handle: row.get(8)?,
            reserved_bytes: row.get::<_, i64>(9)? as u64,
            counters: ChunkCounters {
                items_downloaded: row.get::<_, i64>(10)? as u64,
                items_completed: row.get::<_, i64>(11)? as u64,
                items_failed: row.get::<_, i64>(12)? as u64,
            },
            last_error: row.get(13)?,
            next_attempt_at: parse_opt_ts(row.get(14)?),
            heartbeat_at: parse_opt_ts(row.get(15)?),
            created_at: parse_ts(&row.get::<_, String>(16)?),
            started_at: parse_opt_ts(row.get(17)?),
            ended_at: parse_opt_ts(row.get(18)?),
            updated_at: parse_ts(&row.get::<_, String>(19)?),
        })
    }

    fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>, JobStoreError> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id FROM chunks WHERE job_id = ? AND superseded = 0 ORDER BY ordinal ASC",
        )?;
        let ids = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        for chunk_id in ids {
            job.chunk_ids.push(chunk_id?);
        }

        Ok(Some(job))
    }

    fn load_chunk(conn: &Connection, id: &str) -> Result<Option<Chunk>, JobStoreError> {
        let chunk = conn
            .query_row(
                &format!("SELECT {} FROM chunks c WHERE c.id = ?", CHUNK_COLUMNS),
                params![id],
                Self::row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    fn query_chunks(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Chunk>, JobStoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::row_to_chunk)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    fn count_active(conn: &Connection) -> Result<u64, JobStoreError> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM chunks WHERE status IN {}", ACTIVE_STATUSES),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn reserved_bytes(conn: &Connection) -> Result<u64, JobStoreError> {
        let bytes: i64 = conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(reserved_bytes), 0) FROM chunks WHERE status IN {}",
                ACTIVE_STATUSES
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    fn insert_chunk(
        conn: &Connection,
        job_id: &str,
        ordinal: u32,
        job_attempt: u32,
        item_count: u64,
        now: DateTime<Utc>,
    ) -> Result<String, JobStoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO chunks (id, job_id, ordinal, job_attempt, item_count, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                job_id,
                ordinal,
                job_attempt,
                item_count as i64,
                ChunkStatus::Pending.as_str(),
                format_ts(now),
                format_ts(now),
            ],
        )?;
        Ok(id)
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        tx.execute(
            "INSERT INTO jobs (id, owner, requested_items, chunk_size, status, attempt, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
            params![
                id,
                job.owner,
                job.requested_items as i64,
                job.chunk_size as i64,
                JobStatus::Created.as_str(),
                format_ts(now),
                format_ts(now),
            ],
        )?;

        let mut chunk_ids = Vec::with_capacity(job.chunk_item_counts.len());
        for (ordinal, item_count) in job.chunk_item_counts.iter().enumerate() {
            chunk_ids.push(Self::insert_chunk(
                &tx,
                &id,
                ordinal as u32,
                1,
                *item_count,
                now,
            )?);
        }

        tx.commit()?;

        Ok(Job {
            id,
            owner: job.owner,
            requested_items: job.requested_items,
            chunk_size: job.chunk_size,
            chunk_ids,
            counters: JobCounters::default(),
            status: JobStatus::Created,
            attempt: 1,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let conn = self.lock()?;
        Self::load_job(&conn, id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.lock()?;
        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT id FROM jobs {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_clause
        );

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let ids: Vec<String> = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = Self::load_job(&conn, &id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobStoreError> {
        let conn = self.lock()?;
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    fn set_job_status(&self, id: &str, status: JobStatus) -> Result<Job, JobStoreError> {
        let conn = self.lock()?;
        let current =
            Self::load_job(&conn, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;

        let now = Utc::now();
        let started_at = match (status, current.started_at) {
            (JobStatus::Running, None) => Some(now),
            (_, existing) => existing,
        };
        let completed_at = if status.is_terminal() { Some(now) } else { None };

        let changed = conn.execute(
            "UPDATE jobs SET status = ?, started_at = ?, completed_at = ?, updated_at = ? WHERE id = ? AND status = ?",
            params![
                status.as_str(),
                started_at.map(format_ts),
                completed_at.map(format_ts),
                format_ts(now),
                id,
                current.status.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(JobStoreError::Conflict(id.to_string()));
        }

        Ok(Job {
            status,
            started_at,
            completed_at,
            updated_at: now,
            ..current
        })
    }

    fn set_job_counters(&self, id: &str, counters: JobCounters) -> Result<(), JobStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET items_downloaded = ?, items_completed = ?, items_failed = ?, updated_at = ? WHERE id = ?",
            params![
                counters.items_downloaded as i64,
                counters.items_completed as i64,
                counters.items_failed as i64,
                format_ts(Utc::now()),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn request_cancel(&self, id: &str) -> Result<Job, JobStoreError> {
        let conn = self.lock()?;
        let current =
            Self::load_job(&conn, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;

        if current.status.is_terminal() {
            return Err(JobStoreError::InvalidState {
                job_id: id.to_string(),
                current_state: current.status.to_string(),
                operation: "cancel".to_string(),
            });
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE id = ?",
            params![format_ts(now), id],
        )?;

        Ok(Job {
            cancel_requested: true,
            updated_at: now,
            ..current
        })
    }

    fn is_cancel_requested(&self, id: &str) -> Result<bool, JobStoreError> {
        let conn = self.lock()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match flag {
            Some(flag) => Ok(flag != 0),
            None => Err(JobStoreError::NotFound(id.to_string())),
        }
    }

    fn begin_retry(&self, id: &str) -> Result<Job, JobStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current =
            Self::load_job(&tx, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        if !current.status.can_retry() {
            return Err(JobStoreError::InvalidState {
                job_id: id.to_string(),
                current_state: current.status.to_string(),
                operation: "retry".to_string(),
            });
        }

        let unfinished = Self::query_chunks(
            &tx,
            &format!(
                "SELECT {} FROM chunks c WHERE c.job_id = ? AND c.superseded = 0 AND c.status != 'completed' ORDER BY c.ordinal ASC",
                CHUNK_COLUMNS
            ),
            params![id],
        )?;

        let now = Utc::now();
        let next_attempt = current.attempt + 1;
        for chunk in &unfinished {
            tx.execute(
                "UPDATE chunks SET superseded = 1, updated_at = ? WHERE id = ?",
                params![format_ts(now), chunk.id],
            )?;
            Self::insert_chunk(&tx, id, chunk.ordinal, next_attempt, chunk.item_count, now)?;
        }

        tx.execute(
            "UPDATE jobs SET status = ?, attempt = ?, cancel_requested = 0, completed_at = NULL, updated_at = ? WHERE id = ?",
            params![
                JobStatus::Running.as_str(),
                next_attempt,
                format_ts(now),
                id
            ],
        )?;

        let job = Self::load_job(&tx, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        tx.commit()?;
        Ok(job)
    }

    fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, JobStoreError> {
        let conn = self.lock()?;
        Self::load_chunk(&conn, id)
    }

    fn list_chunks(&self, job_id: &str) -> Result<Vec<Chunk>, JobStoreError> {
        let conn = self.lock()?;
        Self::query_chunks(
            &conn,
            &format!(
                "SELECT {} FROM chunks c WHERE c.job_id = ? AND c.superseded = 0 ORDER BY c.ordinal ASC",
                CHUNK_COLUMNS
            ),
            params![job_id],
        )
    }

    fn list_admission_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Chunk>, JobStoreError> {
        let conn = self.lock()?;
        let now = format_ts(now);
        Self::query_chunks(
            &conn,
            &format!(
                "SELECT {} FROM chunks c JOIN jobs j ON j.id = c.job_id \
                 WHERE c.superseded = 0 \
                   AND (c.status = 'pending' OR (c.status = 'retrying' AND (c.next_attempt_at IS NULL OR c.next_attempt_at <= ?1))) \
                   AND j.status = 'running' AND j.cancel_requested = 0 \
                 ORDER BY j.created_at ASC, c.ordinal ASC LIMIT ?2",
                CHUNK_COLUMNS
            ),
            params![now, limit],
        )
    }

    fn list_stale_chunks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Chunk>, JobStoreError> {
        let conn = self.lock()?;
        let cutoff = format_ts(cutoff);
        Self::query_chunks(
            &conn,
            &format!(
                "SELECT {} FROM chunks c WHERE c.status IN {} AND COALESCE(c.heartbeat_at, c.updated_at) < ?1",
                CHUNK_COLUMNS, ACTIVE_STATUSES
            ),
            params![cutoff],
        )
    }

    fn count_active_chunks(&self) -> Result<u64, JobStoreError> {
        let conn = self.lock()?;
        Self::count_active(&conn)
    }

    fn scratch_usage_bytes(&self) -> Result<u64, JobStoreError> {
        let conn = self.lock()?;
        Self::reserved_bytes(&conn)
    }

    fn count_chunks_by_status(&self) -> Result<Vec<(ChunkStatus, u64)>, JobStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM chunks WHERE superseded = 0 GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = ChunkStatus::parse(&status) {
                counts.push((status, count as u64));
            }
        }
        Ok(counts)
    }

    fn try_admit(
        &self,
        chunk_id: &str,
        limits: &AdmissionLimits,
        dispatch_id: &str,
    ) -> Result<AdmissionOutcome, JobStoreError> {
        let conn = self.lock()?;
        let now = format_ts(Utc::now());

        // Eligibility and both ceilings are evaluated inside one statement so
        // that concurrent orchestrators sharing the database cannot overshoot.
        let changed = conn.execute(
            &format!(
                "UPDATE chunks SET status = 'admitted', reserved_bytes = ?1, dispatch_id = ?2, \
                     task_handle = NULL, next_attempt_at = NULL, heartbeat_at = ?3, updated_at = ?3 \
                 WHERE id = ?4 AND superseded = 0 \
                   AND (status = 'pending' OR (status = 'retrying' AND (next_attempt_at IS NULL OR next_attempt_at <= ?3))) \
                   AND EXISTS (SELECT 1 FROM jobs j WHERE j.id = chunks.job_id AND j.status = 'running' AND j.cancel_requested = 0) \
                   AND (SELECT COUNT(*) FROM chunks a WHERE a.status IN {active}) < ?5 \
                   AND (SELECT COALESCE(SUM(a.reserved_bytes), 0) FROM chunks a WHERE a.status IN {active}) + ?1 <= ?6",
                active = ACTIVE_STATUSES
            ),
            params![
                limits.required_bytes as i64,
                dispatch_id,
                now,
                chunk_id,
                limits.max_concurrent_chunks as i64,
                limits.max_scratch_bytes as i64,
            ],
        )?;

        let chunk = Self::load_chunk(&conn, chunk_id)?
            .ok_or_else(|| JobStoreError::ChunkNotFound(chunk_id.to_string()))?;

        if changed == 1 {
            return Ok(AdmissionOutcome::Admitted(chunk));
        }

        let job_admits: Option<bool> = conn
            .query_row(
                "SELECT status = 'running' AND cancel_requested = 0 FROM jobs WHERE id = ?",
                params![chunk.job_id],
                |row| row.get(0),
            )
            .optional()?;
        let due = chunk.status == ChunkStatus::Pending
            || chunk.next_attempt_at.map_or(true, |at| format_ts(at) <= now);
        if !chunk.status.awaits_admission() || !due || job_admits != Some(true) {
            return Ok(AdmissionOutcome::NotEligible {
                status: chunk.status,
            });
        }

        let active = Self::count_active(&conn)?;
        if active >= limits.max_concurrent_chunks {
            return Ok(AdmissionOutcome::ConcurrencyCeiling { active });
        }
        Ok(AdmissionOutcome::ScratchBudget {
            used: Self::reserved_bytes(&conn)?,
        })
    }

    fn attach_task(
        &self,
        chunk_id: &str,
        dispatch_id: &str,
        task_handle: &str,
    ) -> Result<(), JobStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE chunks SET task_handle = ?, updated_at = ? WHERE id = ? AND dispatch_id = ?",
            params![task_handle, format_ts(Utc::now()), chunk_id, dispatch_id],
        )?;
        if changed == 0 {
            return Err(JobStoreError::Conflict(format!(
                "chunk {} no longer on dispatch {}",
                chunk_id, dispatch_id
            )));
        }
        Ok(())
    }

    fn transition_chunk(
        &self,
        chunk_id: &str,
        update: ChunkUpdate,
    ) -> Result<Chunk, JobStoreError> {
        let conn = self.lock()?;
        let current = Self::load_chunk(&conn, chunk_id)?
            .ok_or_else(|| JobStoreError::ChunkNotFound(chunk_id.to_string()))?;

        if let Some(ref expected) = update.expected_dispatch {
            if current.dispatch_id.as_deref() != Some(expected.as_str()) {
                return Err(JobStoreError::Conflict(format!(
                    "chunk {} dispatch {} is stale",
                    chunk_id, expected
                )));
            }
        }

        if !current.status.can_transition_to(update.status) {
            return Err(JobStoreError::InvalidTransition {
                chunk_id: chunk_id.to_string(),
                from: current.status,
                to: update.status,
            });
        }

        let now = Utc::now();
        let status = update.status;
        let reserved_bytes = if status.is_active() {
            current.reserved_bytes
        } else {
            0
        };
        let retry_count = current.retry_count + u32::from(update.increment_retry);
        let counters = update.counters.unwrap_or(current.counters);
        let last_error = update.error.or(current.last_error.clone());
        let next_attempt_at = if status == ChunkStatus::Retrying {
            update.next_attempt_at
        } else {
            None
        };
        let started_at = if status == ChunkStatus::Running {
            Some(now)
        } else {
            current.started_at
        };
        let heartbeat_at = if status == ChunkStatus::Running {
            Some(now)
        } else {
            current.heartbeat_at
        };
        let ended_at = if status.is_terminal() { Some(now) } else { None };

        let changed = conn.execute(
            "UPDATE chunks SET status = ?, retry_count = ?, reserved_bytes = ?, items_downloaded = ?, items_completed = ?, items_failed = ?, \
                 last_error = ?, next_attempt_at = ?, heartbeat_at = ?, started_at = ?, ended_at = ?, updated_at = ? \
             WHERE id = ? AND status = ? AND dispatch_id IS ?",
            params![
                status.as_str(),
                retry_count,
                reserved_bytes as i64,
                counters.items_downloaded as i64,
                counters.items_completed as i64,
                counters.items_failed as i64,
                last_error,
                next_attempt_at.map(format_ts),
                heartbeat_at.map(format_ts),
                started_at.map(format_ts),
                ended_at.map(format_ts),
                format_ts(now),
                chunk_id,
                current.status.as_str(),
                current.dispatch_id,
            ],
        )?;
        if changed == 0 {
            return Err(JobStoreError::Conflict(chunk_id.to_string()));
        }

        Ok(Chunk {
            status,
            retry_count,
            reserved_bytes,
            counters,
            last_error,
            next_attempt_at,
            heartbeat_at,
            started_at,
            ended_at,
            updated_at: now,
            ..current
        })
    }

    fn record_heartbeat(&self, chunk_id: &str, dispatch_id: &str) -> Result<bool, JobStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            &format!(
                "UPDATE chunks SET heartbeat_at = ? WHERE id = ? AND dispatch_id = ? AND status IN {}",
                ACTIVE_STATUSES
            ),
            params![format_ts(Utc::now()), chunk_id, dispatch_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteJobStore {
        SqliteJobStore::in_memory().unwrap()
    }

    fn new_job(counts: Vec<u64>) -> NewJob {
        NewJob {
            owner: "test-user".to_string(),
            requested_items: counts.iter().sum(),
            chunk_size: 500,
            chunk_item_counts: counts,
        }
    }

    fn limits(max_concurrent: u64, max_scratch: u64, required: u64) -> AdmissionLimits {
        AdmissionLimits {
            max_concurrent_chunks: max_concurrent,
            max_scratch_bytes: max_scratch,
            required_bytes: required,
        }
    }

    fn running_job(store: &SqliteJobStore, counts: Vec<u64>) -> Job {
        let job = store.create_job(new_job(counts)).unwrap();
        store.set_job_status(&job.id, JobStatus::Running).unwrap();
        store.get_job(&job.id).unwrap().unwrap()
    }

    #[test]
    fn test_create_job_with_chunks() {
        let store = create_test_store();
        let job = store.create_job(new_job(vec![500, 500, 200])).unwrap();

        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.chunk_ids.len(), 3);

        let chunks = store.list_chunks(&job.id).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].item_count, 200);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));

        let fetched = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(fetched.chunk_ids, job.chunk_ids);
    }

    #[test]
    fn test_get_nonexistent_job() {
        let store = create_test_store();
        assert!(store.get_job("missing").unwrap().is_none());
        assert!(store.get_chunk("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_and_count_with_filters() {
        let store = create_test_store();
        let a = store.create_job(new_job(vec![10])).unwrap();
        store.create_job(new_job(vec![10])).unwrap();
        store.set_job_status(&a.id, JobStatus::Running).unwrap();

        let running = JobFilter::new().with_status(JobStatus::Running);
        assert_eq!(store.list_jobs(&running).unwrap().len(), 1);
        assert_eq!(store.count_jobs(&JobFilter::new()).unwrap(), 2);
        assert_eq!(
            store
                .count_jobs(&JobFilter::new().with_owner("someone-else"))
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .list_jobs(&JobFilter::new().with_limit(1).with_offset(1))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_admission_respects_concurrency_ceiling() {
        let store = create_test_store();
        let job = running_job(&store, vec![10, 10, 10]);
        let l = limits(2, 1_000_000, 100);

        let first = store.try_admit(&job.chunk_ids[0], &l, "d1").unwrap();
        let second = store.try_admit(&job.chunk_ids[1], &l, "d2").unwrap();
        let third = store.try_admit(&job.chunk_ids[2], &l, "d3").unwrap();

        assert!(matches!(first, AdmissionOutcome::Admitted(_)));
        assert!(matches!(second, AdmissionOutcome::Admitted(_)));
        assert_eq!(third, AdmissionOutcome::ConcurrencyCeiling { active: 2 });
        assert_eq!(store.count_active_chunks().unwrap(), 2);
        assert_eq!(store.scratch_usage_bytes().unwrap(), 200);
    }

    #[test]
    fn test_admission_respects_scratch_budget() {
        let store = create_test_store();
        let job = running_job(&store, vec![10, 10]);
        let l = limits(10, 150, 100);

        assert!(matches!(
            store.try_admit(&job.chunk_ids[0], &l, "d1").unwrap(),
            AdmissionOutcome::Admitted(_)
        ));
        assert_eq!(
            store.try_admit(&job.chunk_ids[1], &l, "d2").unwrap(),
            AdmissionOutcome::ScratchBudget { used: 100 }
        );
    }

    #[test]
    fn test_admission_requires_running_job() {
        let store = create_test_store();
        let job = store.create_job(new_job(vec![10])).unwrap();
        let outcome = store
            .try_admit(&job.chunk_ids[0], &limits(5, 1000, 10), "d1")
            .unwrap();
        assert_eq!(
            outcome,
            AdmissionOutcome::NotEligible {
                status: ChunkStatus::Pending
            }
        );
    }

    #[test]
    fn test_terminal_transition_releases_reservation() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        let chunk_id = &job.chunk_ids[0];
        store
            .try_admit(chunk_id, &limits(5, 1000, 100), "d1")
            .unwrap();

        store
            .transition_chunk(chunk_id, ChunkUpdate::to(ChunkStatus::Running).for_dispatch("d1"))
            .unwrap();
        let done = store
            .transition_chunk(
                chunk_id,
                ChunkUpdate::to(ChunkStatus::Completed)
                    .for_dispatch("d1")
                    .with_counters(ChunkCounters {
                        items_downloaded: 10,
                        items_completed: 9,
                        items_failed: 1,
                    }),
            )
            .unwrap();

        assert_eq!(done.reserved_bytes, 0);
        assert!(done.ended_at.is_some());
        assert_eq!(store.count_active_chunks().unwrap(), 0);
        assert_eq!(store.scratch_usage_bytes().unwrap(), 0);
    }

    #[test]
    fn test_stale_dispatch_is_rejected() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        let chunk_id = &job.chunk_ids[0];
        store.try_admit(chunk_id, &limits(5, 1000, 1), "d1").unwrap();

        let result = store.transition_chunk(
            chunk_id,
            ChunkUpdate::to(ChunkStatus::Running).for_dispatch("old"),
        );
        assert!(matches!(result, Err(JobStoreError::Conflict(_))));
    }

    #[test]
    fn test_terminal_chunk_cannot_regress() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        let chunk_id = &job.chunk_ids[0];
        store
            .transition_chunk(chunk_id, ChunkUpdate::to(ChunkStatus::Cancelled))
            .unwrap();

        let result = store.transition_chunk(chunk_id, ChunkUpdate::to(ChunkStatus::Admitted));
        assert!(matches!(
            result,
            Err(JobStoreError::InvalidTransition {
                from: ChunkStatus::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn test_retrying_chunk_waits_for_backoff() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        let chunk_id = &job.chunk_ids[0];
        let l = limits(5, 1000, 1);
        store.try_admit(chunk_id, &l, "d1").unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        let retrying = store
            .transition_chunk(
                chunk_id,
                ChunkUpdate::to(ChunkStatus::Retrying)
                    .for_dispatch("d1")
                    .with_error("boom")
                    .retry_at(later),
            )
            .unwrap();
        assert_eq!(retrying.retry_count, 1);
        assert_eq!(retrying.last_error.as_deref(), Some("boom"));

        assert!(store
            .list_admission_candidates(Utc::now(), 10)
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.try_admit(chunk_id, &l, "d2").unwrap(),
            AdmissionOutcome::NotEligible { .. }
        ));

        let due = store
            .list_admission_candidates(later + chrono::Duration::seconds(1), 10)
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_heartbeat_and_stale_detection() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        let chunk_id = &job.chunk_ids[0];
        store.try_admit(chunk_id, &limits(5, 1000, 1), "d1").unwrap();

        assert!(store.record_heartbeat(chunk_id, "d1").unwrap());
        assert!(!store.record_heartbeat(chunk_id, "other").unwrap());

        let future_cutoff = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(store.list_stale_chunks(future_cutoff).unwrap().len(), 1);
        let past_cutoff = Utc::now() - chrono::Duration::seconds(10);
        assert!(store.list_stale_chunks(past_cutoff).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_flag() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        assert!(!store.is_cancel_requested(&job.id).unwrap());
        store.request_cancel(&job.id).unwrap();
        assert!(store.is_cancel_requested(&job.id).unwrap());
        assert!(store
            .list_admission_candidates(Utc::now(), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cannot_cancel_terminal_job() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        store.set_job_status(&job.id, JobStatus::Completed).unwrap();
        assert!(matches!(
            store.request_cancel(&job.id),
            Err(JobStoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_begin_retry_recreates_unfinished_chunks() {
        let store = create_test_store();
        let job = running_job(&store, vec![10, 10]);
        let l = limits(5, 1000, 1);

        store.try_admit(&job.chunk_ids[0], &l, "d1").unwrap();
        store
            .transition_chunk(
                &job.chunk_ids[0],
                ChunkUpdate::to(ChunkStatus::Completed).for_dispatch("d1"),
            )
            .unwrap();
        store.try_admit(&job.chunk_ids[1], &l, "d2").unwrap();
        store
            .transition_chunk(
                &job.chunk_ids[1],
                ChunkUpdate::to(ChunkStatus::Failed).for_dispatch("d2"),
            )
            .unwrap();
        store
            .set_job_status(&job.id, JobStatus::CompletedWithErrors)
            .unwrap();

        let retried = store.begin_retry(&job.id).unwrap();
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.status, JobStatus::Running);
        assert!(retried.completed_at.is_none());
        assert_eq!(retried.chunk_ids.len(), 2);
        assert_eq!(retried.chunk_ids[0], job.chunk_ids[0]);
        assert_ne!(retried.chunk_ids[1], job.chunk_ids[1]);

        let chunks = store.list_chunks(&job.id).unwrap();
        assert_eq!(chunks[0].status, ChunkStatus::Completed);
        assert_eq!(chunks[1].status, ChunkStatus::Pending);
        assert_eq!(chunks[1].job_attempt, 2);
        assert_eq!(chunks[1].ordinal, 1);
    }

    #[test]
    fn test_begin_retry_rejects_running_job() {
        let store = create_test_store();
        let job = running_job(&store, vec![10]);
        assert!(matches!(
            store.begin_retry(&job.id),
            Err(JobStoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_count_chunks_by_status() {
        let store = create_test_store();
        let job = running_job(&store, vec![10, 10, 10]);
        store
            .try_admit(&job.chunk_ids[0], &limits(5, 1000, 1), "d1")
            .unwrap();

        let counts = store.count_chunks_by_status().unwrap();
        let pending = counts
            .iter()
            .find(|(s, _)| *s == ChunkStatus::Pending)
            .map(|(_, n)| *n);
        let admitted = counts
            .iter()
            .find(|(s, _)| *s == ChunkStatus::Admitted)
            .map(|(_, n)| *n);
        assert_eq!(pending, Some(2));
        assert_eq!(admitted, Some(1));
    }

    #[test]
    fn test_file_based_store_shared_between_handles() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("jobs.db");

        let first = SqliteJobStore::new(&db_path).unwrap();
        let second = SqliteJobStore::new(&db_path).unwrap();
        let job = running_job(&first, vec![10, 10]);
        let l = limits(1, 1000, 1);

        assert!(matches!(
            first.try_admit(&job.chunk_ids[0], &l, "d1").unwrap(),
            AdmissionOutcome::Admitted(_)
        ));
        assert_eq!(
            second.try_admit(&job.chunk_ids[1], &l, "d2").unwrap(),
            AdmissionOutcome::ConcurrencyCeiling { active: 1 }
        );
        assert!(db_path.exists());
    }
}
