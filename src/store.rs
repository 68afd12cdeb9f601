use chrono::{SecondsFormat, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{
    CallLog, CallStatus, CallbackResult, Candidate, CandidateQuery, CandidateRecord,
    CandidateStatus, InsertSummary, Resolution, SearchParams, SearchQuery, Statistics,
    StatusPatch, WebhookTool,
};

const CANDIDATE_COLUMNS: &str = "id, search_id, identity_key, source_id, name, email, phone,
    experience_years, current_company, current_designation, skills, location, profile_url,
    salary, posted_date, contacted, interested, interview_scheduled, comments, last_updated,
    scraped_at";

const CALL_COLUMNS: &str = "id, candidate_id, tool, script, dispatched_at, status, response,
    correlation_token, resolved_at, result_fingerprint, resolved_by";

/// Durable storage for searches, candidates and call logs.
///
/// One SQLite connection behind a mutex. Writes run in `IMMEDIATE`
/// transactions, which also serializes writers in other processes sharing
/// the same file.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Validation(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path())
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "scout") {
            proj_dirs.data_dir().join("scout.db")
        } else {
            PathBuf::from("scout.db")
        }
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction rolls the transaction back, so the
        // connection is still consistent after poisoning.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn init(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS searches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                keyword TEXT NOT NULL,
                location TEXT NOT NULL,
                experience_min REAL,
                experience_max REAL,
                job_type TEXT,
                next_page INTEGER NOT NULL DEFAULT 1,
                closed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                search_id INTEGER NOT NULL REFERENCES searches(id),
                identity_key TEXT NOT NULL,
                email_key TEXT,
                phone_key TEXT,
                source_id TEXT,
                name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                experience_years REAL,
                current_company TEXT,
                current_designation TEXT,
                skills TEXT NOT NULL DEFAULT '[]',
                location TEXT,
                profile_url TEXT,
                salary TEXT,
                posted_date TEXT,
                contacted INTEGER NOT NULL DEFAULT 0,
                interested INTEGER,
                interview_scheduled INTEGER NOT NULL DEFAULT 0,
                comments TEXT,
                last_updated TEXT NOT NULL,
                scraped_at TEXT NOT NULL,
                UNIQUE (search_id, identity_key)
            );

            CREATE TABLE IF NOT EXISTS call_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                candidate_id INTEGER NOT NULL REFERENCES candidates(id),
                tool TEXT NOT NULL CHECK (tool IN ('n8n', 'make', 'custom')),
                script TEXT NOT NULL,
                dispatched_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'completed', 'failed')),
                response TEXT,
                correlation_token TEXT NOT NULL UNIQUE,
                resolved_at TEXT,
                result_fingerprint TEXT,
                resolved_by TEXT CHECK (resolved_by IN ('callback', 'dispatch', 'timeout'))
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_search ON candidates(search_id);
            CREATE INDEX IF NOT EXISTS idx_candidates_email ON candidates(search_id, email_key);
            CREATE INDEX IF NOT EXISTS idx_candidates_phone ON candidates(search_id, phone_key);
            CREATE INDEX IF NOT EXISTS idx_calls_candidate ON call_logs(candidate_id);
            CREATE INDEX IF NOT EXISTS idx_calls_status ON call_logs(status);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='candidates'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(PipelineError::Validation(
                "database not initialized. Run 'scout init' first.".into(),
            ));
        }
        Ok(())
    }

    // --- Search operations ---

    pub fn create_search(&self, params: &SearchParams) -> Result<SearchQuery> {
        params.validate()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO searches (keyword, location, experience_min, experience_max, job_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                params.keyword.trim(),
                params.location.trim(),
                params.experience_min,
                params.experience_max,
                params.job_type,
                now()
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(search_id = id, keyword = %params.keyword, "created search");
        fetch_search(&conn, id)?.ok_or_else(|| PipelineError::not_found("search", id))
    }

    pub fn get_search(&self, id: i64) -> Result<Option<SearchQuery>> {
        fetch_search(&self.conn(), id)
    }

    pub fn list_searches(&self, limit: usize) -> Result<Vec<SearchQuery>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, keyword, location, experience_min, experience_max, job_type, next_page, closed, created_at
             FROM searches ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_search)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Mark a search read-only once acquisition is over.
    pub fn close_search(&self, id: i64, next_page: u32) -> Result<SearchQuery> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE searches SET closed = 1, next_page = ?1 WHERE id = ?2",
            params![next_page, id],
        )?;
        if changed == 0 {
            return Err(PipelineError::not_found("search", id));
        }
        fetch_search(&conn, id)?.ok_or_else(|| PipelineError::not_found("search", id))
    }

    // --- Candidate operations ---

    /// Insert new candidates, merging repeat sightings into the stored row.
    ///
    /// A sighting matches a stored row by identity key, or by normalized
    /// email or phone alone. Each record is its own transaction: concurrent
    /// callers with overlapping records serialize on the write lock, and the
    /// second one finds the first one's row. A search closed by another
    /// writer stops the batch at the next record.
    pub fn add_candidates(&self, search_id: i64, records: &[CandidateRecord]) -> Result<InsertSummary> {
        if let Some(index) = records.iter().position(|r| r.name.trim().is_empty()) {
            return Err(PipelineError::Validation(format!(
                "record {} has no name",
                index
            )));
        }

        let mut conn = self.conn();
        let mut summary = InsertSummary::default();
        for record in records {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_open(&tx, search_id)?;

            let key = record.identity_key();
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM candidates
                         WHERE search_id = ?1 AND (identity_key = ?2 OR email_key = ?3 OR phone_key = ?4)
                         ORDER BY identity_key = ?2 DESC, id
                         LIMIT 1",
                        CANDIDATE_COLUMNS
                    ),
                    params![search_id, key, record.normalized_email(), record.normalized_phone()],
                    row_to_candidate,
                )
                .optional()?;

            match existing {
                Some(mut candidate) => {
                    if record.backfill(&mut candidate.profile) {
                        write_profile(&tx, candidate.id, &candidate.profile)?;
                    }
                    summary.deduped += 1;
                    debug!(candidate_id = candidate.id, key = %key, "merged duplicate candidate");
                }
                None => {
                    insert_candidate(&tx, search_id, &key, record)?;
                    summary.inserted += 1;
                }
            }
            tx.commit()?;
        }

        info!(
            search_id,
            inserted = summary.inserted,
            deduped = summary.deduped,
            "stored candidates"
        );
        Ok(summary)
    }

    pub fn get_candidate(&self, id: i64) -> Result<Option<Candidate>> {
        fetch_candidate(&self.conn(), id)
    }

    pub fn list_candidates(&self, search_id: i64) -> Result<Vec<Candidate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM candidates WHERE search_id = ?1 ORDER BY id",
            CANDIDATE_COLUMNS
        ))?;
        let rows = stmt.query_map([search_id], row_to_candidate)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Candidates across searches (or within one) matching every set criterion.
    pub fn search_candidates(&self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let mut sql = format!("SELECT {} FROM candidates WHERE 1 = 1", CANDIDATE_COLUMNS);
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(search_id) = query.search_id {
            values.push(search_id.into());
            sql.push_str(&format!(" AND search_id = ?{}", values.len()));
        }
        for skill in query.skills.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            values.push(skill.to_lowercase().into());
            sql.push_str(&format!(" AND instr(lower(skills), ?{}) > 0", values.len()));
        }
        if let Some(location) = query.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            values.push(location.to_lowercase().into());
            sql.push_str(&format!(" AND instr(lower(location), ?{}) > 0", values.len()));
        }
        if let Some(min) = query.min_experience {
            values.push(min.into());
            sql.push_str(&format!(" AND experience_years >= ?{}", values.len()));
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_candidate)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Candidate ids ready for (or already through) automated calling.
    pub fn candidates_for_calling(
        &self,
        search_id: i64,
        contacted: bool,
        interested_only: bool,
    ) -> Result<Vec<i64>> {
        let mut sql = String::from("SELECT id FROM candidates WHERE search_id = ?1 AND contacted = ?2");
        if interested_only {
            sql.push_str(" AND interested = 1");
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![search_id, contacted], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub fn update_status(&self, candidate_id: i64, patch: &StatusPatch) -> Result<Candidate> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate = apply_status_patch(&tx, candidate_id, patch)?;
        tx.commit()?;
        Ok(candidate)
    }

    /// Data-privacy erasure: removes the candidate and every call log
    /// referencing it. Returns false if there was nothing to erase.
    pub fn erase_candidate(&self, candidate_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let calls = tx.execute("DELETE FROM call_logs WHERE candidate_id = ?1", [candidate_id])?;
        let removed = tx.execute("DELETE FROM candidates WHERE id = ?1", [candidate_id])?;
        tx.commit()?;
        if removed > 0 {
            info!(candidate_id, call_logs = calls, "erased candidate");
        }
        Ok(removed > 0)
    }

    pub fn statistics(&self, search_id: i64) -> Result<Statistics> {
        let stats = self.conn().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(contacted), 0),
                    COALESCE(SUM(CASE WHEN interested = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(interview_scheduled), 0)
             FROM candidates WHERE search_id = ?1",
            [search_id],
            |row| {
                Ok(Statistics {
                    total: row.get(0)?,
                    contacted: row.get(1)?,
                    interested: row.get(2)?,
                    interview_scheduled: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    // --- Call log operations ---

    /// Insert a `pending` call log with a fresh correlation token.
    pub fn record_call(&self, candidate_id: i64, tool: WebhookTool, script: &str) -> Result<CallLog> {
        let conn = self.conn();
        if fetch_candidate(&conn, candidate_id)?.is_none() {
            return Err(PipelineError::not_found("candidate", candidate_id));
        }
        let token = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO call_logs (candidate_id, tool, script, dispatched_at, correlation_token)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![candidate_id, tool.as_str(), script, now(), token],
        )?;
        fetch_call(&conn, &token)?.ok_or_else(|| PipelineError::not_found("call log", &token))
    }

    pub fn get_call(&self, token: &str) -> Result<Option<CallLog>> {
        fetch_call(&self.conn(), token)
    }

    pub fn call_logs(&self, candidate_id: i64) -> Result<Vec<CallLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM call_logs WHERE candidate_id = ?1 ORDER BY id DESC",
            CALL_COLUMNS
        ))?;
        let rows = stmt.query_map([candidate_id], |row| row_to_call(row).map(|(log, _)| log))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Token of the call a tool most likely answers: the newest pending one,
    /// or else the newest resolved one (so replays still find their log).
    pub fn latest_call_token(&self, candidate_id: i64, tool: WebhookTool) -> Result<Option<String>> {
        let token = self
            .conn()
            .query_row(
                "SELECT correlation_token FROM call_logs
                 WHERE candidate_id = ?1 AND tool = ?2
                 ORDER BY (status = 'pending') DESC, id DESC
                 LIMIT 1",
                params![candidate_id, tool.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }

    /// Keep the tool's acknowledgement on a still-pending call.
    pub fn set_call_response(&self, token: &str, response: &str) -> Result<CallLog> {
        let conn = self.conn();
        conn.execute(
            "UPDATE call_logs SET response = ?1 WHERE correlation_token = ?2 AND status = 'pending'",
            params![response, token],
        )?;
        fetch_call(&conn, token)?.ok_or_else(|| PipelineError::not_found("call log", token))
    }

    /// Fail a pending call whose outbound request never got through.
    pub fn mark_call_failed(&self, token: &str, reason: &str) -> Result<CallLog> {
        let conn = self.conn();
        conn.execute(
            "UPDATE call_logs SET status = 'failed', response = ?1, resolved_at = ?2, resolved_by = 'dispatch'
             WHERE correlation_token = ?3 AND status = 'pending'",
            params![reason, now(), token],
        )?;
        fetch_call(&conn, token)?.ok_or_else(|| PipelineError::not_found("call log", token))
    }

    /// Resolve a pending call from a verified callback.
    ///
    /// Replaying the same token with the same result returns the stored log
    /// untouched. Anything else aimed at a resolved or unknown token is
    /// `StaleCallback`, with nothing written.
    pub fn ingest_callback(&self, token: &str, result: &CallbackResult) -> Result<CallLog> {
        if result.call_status == CallStatus::Pending {
            return Err(PipelineError::Validation(
                "callback status must be completed or failed".into(),
            ));
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some((log, applied)) = fetch_call_with_fingerprint(&tx, token)? else {
            warn!("callback for unknown correlation token");
            return Err(PipelineError::StaleCallback);
        };

        let fingerprint = result.fingerprint();
        if log.status.is_terminal() {
            if applied.as_deref() == Some(fingerprint.as_str()) {
                debug!(call_id = log.id, "replayed callback ignored");
                return Ok(log);
            }
            warn!(call_id = log.id, status = log.status.as_str(), "callback for resolved call");
            return Err(PipelineError::StaleCallback);
        }

        tx.execute(
            "UPDATE call_logs SET status = ?1, response = ?2, resolved_at = ?3, result_fingerprint = ?4,
                resolved_by = 'callback'
             WHERE id = ?5",
            params![
                result.call_status.as_str(),
                result.response.as_deref().or(log.response.as_deref()),
                now(),
                fingerprint,
                log.id
            ],
        )?;

        if result.interested.is_some() || result.contacted.is_some() {
            // A callback can report contact but never retract it.
            let contacted = match (result.contacted, result.call_status) {
                (Some(true), _) | (None, CallStatus::Completed) => Some(true),
                _ => None,
            };
            let patch = StatusPatch {
                contacted,
                interested: result.interested,
                interview_scheduled: None,
                comments: result.response.clone(),
                override_clear: false,
            };
            apply_status_patch(&tx, log.candidate_id, &patch)?;
        }

        let resolved = fetch_call(&tx, token)?.ok_or(PipelineError::StaleCallback)?;
        tx.commit()?;
        info!(
            call_id = resolved.id,
            candidate_id = resolved.candidate_id,
            status = resolved.status.as_str(),
            "callback ingested"
        );
        Ok(resolved)
    }

    /// Explicit timeout sweep: pending calls dispatched before
    /// `now - older_than` become `failed`.
    pub fn expire_pending(&self, older_than: TimeDelta) -> Result<usize> {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            // Older than any representable time: nothing qualifies.
            return Ok(0);
        };
        let cutoff = timestamp(cutoff);
        let expired = self.conn().execute(
            "UPDATE call_logs SET status = 'failed', response = 'timed out', resolved_at = ?1,
                resolved_by = 'timeout'
             WHERE status = 'pending' AND dispatched_at < ?2",
            params![now(), cutoff],
        )?;
        if expired > 0 {
            info!(expired, "timed out pending calls");
        }
        Ok(expired)
    }
}

fn timestamp(at: chrono::DateTime<Utc>) -> String {
    // Fixed width and UTC so string order is time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now() -> String {
    timestamp(Utc::now())
}

fn ensure_open(conn: &Connection, search_id: i64) -> Result<()> {
    let closed: Option<bool> = conn
        .query_row("SELECT closed FROM searches WHERE id = ?1", [search_id], |row| row.get(0))
        .optional()?;
    match closed {
        None => Err(PipelineError::not_found("search", search_id)),
        Some(true) => Err(PipelineError::Validation(format!("search {} is closed", search_id))),
        Some(false) => Ok(()),
    }
}

fn fetch_search(conn: &Connection, id: i64) -> Result<Option<SearchQuery>> {
    Ok(conn
        .query_row(
            "SELECT id, keyword, location, experience_min, experience_max, job_type, next_page, closed, created_at
             FROM searches WHERE id = ?1",
            [id],
            row_to_search,
        )
        .optional()?)
}

fn fetch_candidate(conn: &Connection, id: i64) -> Result<Option<Candidate>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM candidates WHERE id = ?1", CANDIDATE_COLUMNS),
            [id],
            row_to_candidate,
        )
        .optional()?)
}

fn fetch_call_with_fingerprint(conn: &Connection, token: &str) -> Result<Option<(CallLog, Option<String>)>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM call_logs WHERE correlation_token = ?1", CALL_COLUMNS),
            [token],
            row_to_call,
        )
        .optional()?)
}

fn fetch_call(conn: &Connection, token: &str) -> Result<Option<CallLog>> {
    Ok(fetch_call_with_fingerprint(conn, token)?.map(|(log, _)| log))
}

fn insert_candidate(tx: &Transaction<'_>, search_id: i64, key: &str, record: &CandidateRecord) -> Result<()> {
    let stamp = now();
    tx.execute(
        "INSERT INTO candidates (search_id, identity_key, email_key, phone_key, source_id, name,
            email, phone, experience_years, current_company, current_designation, skills,
            location, profile_url, salary, posted_date, last_updated, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
        params![
            search_id,
            key,
            record.normalized_email(),
            record.normalized_phone(),
            record.source_id,
            record.name.trim(),
            record.email,
            record.phone,
            record.experience_years,
            record.current_company,
            record.current_designation,
            encode_skills(&record.skills),
            record.location,
            record.profile_url,
            record.salary,
            record.posted_date,
            stamp
        ],
    )?;
    Ok(())
}

fn write_profile(tx: &Transaction<'_>, id: i64, profile: &CandidateRecord) -> Result<()> {
    tx.execute(
        "UPDATE candidates SET source_id = ?1, email = ?2, phone = ?3, experience_years = ?4,
            current_company = ?5, current_designation = ?6, skills = ?7, location = ?8,
            profile_url = ?9, salary = ?10, posted_date = ?11, last_updated = ?12,
            email_key = ?14, phone_key = ?15
         WHERE id = ?13",
        params![
            profile.source_id,
            profile.email,
            profile.phone,
            profile.experience_years,
            profile.current_company,
            profile.current_designation,
            encode_skills(&profile.skills),
            profile.location,
            profile.profile_url,
            profile.salary,
            profile.posted_date,
            now(),
            id,
            profile.normalized_email(),
            profile.normalized_phone()
        ],
    )?;
    Ok(())
}

fn apply_status_patch(conn: &Connection, candidate_id: i64, patch: &StatusPatch) -> Result<Candidate> {
    let mut candidate =
        fetch_candidate(conn, candidate_id)?.ok_or_else(|| PipelineError::not_found("candidate", candidate_id))?;
    if patch.is_empty() {
        return Ok(candidate);
    }
    patch.apply_to(&mut candidate.status)?;
    candidate.status.last_updated = now();
    conn.execute(
        "UPDATE candidates SET contacted = ?1, interested = ?2, interview_scheduled = ?3,
            comments = ?4, last_updated = ?5
         WHERE id = ?6",
        params![
            candidate.status.contacted,
            candidate.status.interested,
            candidate.status.interview_scheduled,
            candidate.status.comments,
            candidate.status.last_updated,
            candidate_id
        ],
    )?;
    Ok(candidate)
}

fn encode_skills(skills: &BTreeSet<String>) -> String {
    serde_json::to_string(skills).unwrap_or_else(|_| "[]".to_string())
}

fn decode_skills(raw: &str) -> BTreeSet<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_search(row: &Row) -> rusqlite::Result<SearchQuery> {
    Ok(SearchQuery {
        id: row.get(0)?,
        keyword: row.get(1)?,
        location: row.get(2)?,
        experience_min: row.get(3)?,
        experience_max: row.get(4)?,
        job_type: row.get(5)?,
        next_page: row.get(6)?,
        closed: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_candidate(row: &Row) -> rusqlite::Result<Candidate> {
    let skills: String = row.get(10)?;
    Ok(Candidate {
        id: row.get(0)?,
        search_id: row.get(1)?,
        identity_key: row.get(2)?,
        profile: CandidateRecord {
            source_id: row.get(3)?,
            name: row.get(4)?,
            email: row.get(5)?,
            phone: row.get(6)?,
            experience_years: row.get(7)?,
            current_company: row.get(8)?,
            current_designation: row.get(9)?,
            skills: decode_skills(&skills),
            location: row.get(11)?,
            profile_url: row.get(12)?,
            salary: row.get(13)?,
            posted_date: row.get(14)?,
        },
        status: CandidateStatus {
            contacted: row.get(15)?,
            interested: row.get(16)?,
            interview_scheduled: row.get(17)?,
            comments: row.get(18)?,
            last_updated: row.get(19)?,
        },
        scraped_at: row.get(20)?,
    })
}

fn row_to_call(row: &Row) -> rusqlite::Result<(CallLog, Option<String>)> {
    let tool: String = row.get(2)?;
    let status: String = row.get(5)?;
    let resolved_by: Option<String> = row.get(10)?;
    let log = CallLog {
        id: row.get(0)?,
        candidate_id: row.get(1)?,
        tool: tool.parse().map_err(|e| conversion_error(2, e))?,
        script: row.get(3)?,
        dispatched_at: row.get(4)?,
        status: status.parse().map_err(|e| conversion_error(5, e))?,
        response: row.get(6)?,
        correlation_token: row.get(7)?,
        resolved_at: row.get(8)?,
        resolved_by: resolved_by
            .map(|r| r.parse::<Resolution>())
            .transpose()
            .map_err(|e| conversion_error(10, e))?,
    };
    Ok((log, row.get(9)?))
}

fn conversion_error(column: usize, err: PipelineError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn store_with_search() -> (Store, SearchQuery) {
        let store = Store::open_in_memory().unwrap();
        let search = store
            .create_search(&SearchParams::new("python developer", "Bangalore").with_experience(Some(2.0), Some(5.0)))
            .unwrap();
        (store, search)
    }

    fn candidate(name: &str, email: &str) -> CandidateRecord {
        CandidateRecord {
            email: Some(email.to_string()),
            ..CandidateRecord::new(name)
        }
    }

    fn completed(interested: bool) -> CallbackResult {
        CallbackResult {
            call_status: CallStatus::Completed,
            interested: Some(interested),
            contacted: None,
            response: Some("Candidate is interested".into()),
        }
    }

    #[test]
    fn test_create_search_validates() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .create_search(&SearchParams::new("rust", "Pune").with_experience(Some(6.0), Some(3.0)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(store.list_searches(10).unwrap().is_empty());
    }

    #[test]
    fn test_add_same_record_twice_stores_one() {
        let (store, search) = store_with_search();
        let record = candidate("Asha Rao", "asha@example.com");

        let first = store.add_candidates(search.id, &[record.clone()]).unwrap();
        let second = store.add_candidates(search.id, &[record]).unwrap();

        assert_eq!(first, InsertSummary { inserted: 1, deduped: 0 });
        assert_eq!(second, InsertSummary { inserted: 0, deduped: 1 });
        assert_eq!(store.list_candidates(search.id).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_backfills_nulls_and_keeps_existing() {
        let (store, search) = store_with_search();
        let mut first = candidate("Asha Rao", "asha@example.com");
        first.current_company = Some("Acme".into());
        store.add_candidates(search.id, &[first]).unwrap();

        let mut again = candidate("Asha Rao", "ASHA@example.com ");
        again.current_company = Some("Globex".into());
        again.experience_years = Some(4.5);
        again.skills = ["python".to_string(), "django".to_string()].into_iter().collect();
        store.add_candidates(search.id, &[again]).unwrap();

        let stored = store.list_candidates(search.id).unwrap();
        assert_eq!(stored.len(), 1);
        let profile = &stored[0].profile;
        assert_eq!(profile.current_company.as_deref(), Some("Acme"));
        assert_eq!(profile.experience_years, Some(4.5));
        assert_eq!(profile.skills.len(), 2);
    }

    #[test]
    fn test_duplicates_within_one_batch_merge() {
        let (store, search) = store_with_search();
        let a = candidate("Asha Rao", "asha@example.com");
        let mut b = candidate("Asha Rao", "asha@example.com");
        b.phone = Some("9876543210".into());
        // Different email, different person
        let c = candidate("Ravi Kumar", "ravi@example.com");

        let summary = store.add_candidates(search.id, &[a, c, b]).unwrap();
        assert_eq!(summary, InsertSummary { inserted: 2, deduped: 1 });

        let stored = store.list_candidates(search.id).unwrap();
        let asha = stored.iter().find(|c| c.profile.name == "Asha Rao").unwrap();
        assert_eq!(asha.profile.phone.as_deref(), Some("9876543210"));
    }

    #[test]
    fn test_phone_only_sighting_merges_with_later_contact_details() {
        let (store, search) = store_with_search();
        let first = CandidateRecord {
            phone: Some("+91 98450 12345".into()),
            ..CandidateRecord::new("Ravi Kumar")
        };
        let mut second = candidate("Ravi Kumar", "Ravi@Example.com");
        second.phone = Some("+91-98450-12345".into());
        // Email only: found through the email backfilled by the second sighting
        let third = candidate("R. Kumar", "ravi@example.com");

        assert_eq!(store.add_candidates(search.id, &[first]).unwrap().inserted, 1);
        let summary = store.add_candidates(search.id, &[second, third]).unwrap();
        assert_eq!(summary, InsertSummary { inserted: 0, deduped: 2 });

        let stored = store.list_candidates(search.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].identity_key, "phone:919845012345");
        assert_eq!(stored[0].profile.email.as_deref(), Some("Ravi@Example.com"));
        assert_eq!(stored[0].profile.name, "Ravi Kumar");
    }

    #[test]
    fn test_same_person_in_different_searches_is_not_deduped() {
        let (store, search) = store_with_search();
        let other = store.create_search(&SearchParams::new("data engineer", "Pune")).unwrap();
        let record = candidate("Asha Rao", "asha@example.com");

        store.add_candidates(search.id, &[record.clone()]).unwrap();
        let summary = store.add_candidates(other.id, &[record]).unwrap();
        assert_eq!(summary.inserted, 1);
    }

    #[test]
    fn test_add_candidates_rejects_nameless_and_closed() {
        let (store, search) = store_with_search();
        let err = store
            .add_candidates(search.id, &[candidate("  ", "x@example.com")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let err = store.add_candidates(999, &[candidate("Asha", "a@example.com")]).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));

        store.close_search(search.id, 3).unwrap();
        let err = store
            .add_candidates(search.id, &[candidate("Asha", "a@example.com")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        let closed = store.get_search(search.id).unwrap().unwrap();
        assert!(closed.closed);
        assert_eq!(closed.next_page, 3);
    }

    #[test]
    fn test_concurrent_overlapping_inserts() {
        let (store, search) = store_with_search();
        let store = Arc::new(store);
        let records: Vec<CandidateRecord> = (0..20)
            .map(|i| candidate(&format!("Candidate {i}"), &format!("c{i}@example.com")))
            .collect();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                // Each thread takes an overlapping window of 10 records
                let batch: Vec<_> = records.iter().skip(t * 3).take(10).cloned().collect();
                let search_id = search.id;
                thread::spawn(move || store.add_candidates(search_id, &batch).unwrap())
            })
            .collect();

        let total: usize = handles
            .into_iter()
            .map(|h| {
                let summary = h.join().unwrap();
                summary.inserted + summary.deduped
            })
            .sum();
        assert_eq!(total, 40);

        // Windows cover records 0..19
        assert_eq!(store.list_candidates(search.id).unwrap().len(), 19);
    }

    #[test]
    fn test_concurrent_inserts_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.db");
        let setup = Store::open(&path).unwrap();
        setup.init().unwrap();
        let search = setup.create_search(&SearchParams::new("rust", "Pune")).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = Store::open(&path).unwrap();
                    let batch: Vec<_> = (0..8)
                        .map(|i| candidate(&format!("Dev {i}"), &format!("dev{i}@example.com")))
                        .collect();
                    store.add_candidates(search.id, &batch).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(setup.list_candidates(search.id).unwrap().len(), 8);
    }

    #[test]
    fn test_no_inserts_after_search_closed_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.db");
        let setup = Store::open(&path).unwrap();
        setup.init().unwrap();
        let search = setup.create_search(&SearchParams::new("rust", "Pune")).unwrap();

        let writer = {
            let path = path.clone();
            thread::spawn(move || {
                let store = Store::open(&path).unwrap();
                let batch: Vec<_> = (0..300)
                    .map(|i| candidate(&format!("Dev {i}"), &format!("dev{i}@example.com")))
                    .collect();
                store.add_candidates(search.id, &batch)
            })
        };

        thread::sleep(Duration::from_millis(20));
        let closer = Store::open(&path).unwrap();
        closer.close_search(search.id, 2).unwrap();
        let at_close = closer.list_candidates(search.id).unwrap().len();

        match writer.join().unwrap() {
            Ok(summary) => assert_eq!(summary.inserted, at_close),
            Err(err) => assert!(matches!(err, PipelineError::Validation(_))),
        }
        assert_eq!(closer.list_candidates(search.id).unwrap().len(), at_close);
    }

    #[test]
    fn test_search_candidates_by_criteria() {
        let (store, search) = store_with_search();
        let other = store.create_search(&SearchParams::new("data engineer", "Pune")).unwrap();
        let profile = |name: &str, skills: &[&str], location: &str, years: f64| CandidateRecord {
            email: Some(format!("{}@example.com", name.to_lowercase())),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            location: Some(location.to_string()),
            experience_years: Some(years),
            ..CandidateRecord::new(name)
        };
        store
            .add_candidates(
                search.id,
                &[
                    profile("Asha", &["Python", "Django"], "Bangalore", 4.0),
                    profile("Ravi", &["Java"], "Bangalore", 6.0),
                ],
            )
            .unwrap();
        store
            .add_candidates(other.id, &[profile("Meera", &["python", "Spark"], "Pune", 3.0)])
            .unwrap();

        let names = |query: CandidateQuery| -> Vec<String> {
            store
                .search_candidates(&query)
                .unwrap()
                .into_iter()
                .map(|c| c.profile.name)
                .collect()
        };

        assert_eq!(names(CandidateQuery::default()).len(), 3);
        assert_eq!(
            names(CandidateQuery {
                skills: vec!["python".into()],
                ..Default::default()
            }),
            vec!["Asha", "Meera"]
        );
        assert_eq!(
            names(CandidateQuery {
                skills: vec!["python".into()],
                min_experience: Some(3.5),
                ..Default::default()
            }),
            vec!["Asha"]
        );
        assert_eq!(
            names(CandidateQuery {
                location: Some("bangalore".into()),
                min_experience: Some(5.0),
                ..Default::default()
            }),
            vec!["Ravi"]
        );
        assert_eq!(
            names(CandidateQuery {
                search_id: Some(other.id),
                skills: vec!["spark".into(), "PYTHON".into()],
                ..Default::default()
            }),
            vec!["Meera"]
        );
        assert!(names(CandidateQuery {
            skills: vec!["rust".into()],
            ..Default::default()
        })
        .is_empty());
    }

    #[test]
    fn test_update_status() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;

        let updated = store
            .update_status(
                id,
                &StatusPatch {
                    contacted: Some(true),
                    comments: Some("left voicemail".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.status.contacted);
        assert_eq!(updated.status.interested, None);
        assert_eq!(updated.status.comments.as_deref(), Some("left voicemail"));

        let err = store
            .update_status(
                id,
                &StatusPatch {
                    contacted: Some(false),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(store.get_candidate(id).unwrap().unwrap().status.contacted);

        let err = store.update_status(4242, &StatusPatch::default()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn test_statistics() {
        let (store, search) = store_with_search();
        store
            .add_candidates(
                search.id,
                &[
                    candidate("A", "a@example.com"),
                    candidate("B", "b@example.com"),
                    candidate("C", "c@example.com"),
                ],
            )
            .unwrap();
        let ids = store.candidates_for_calling(search.id, false, false).unwrap();
        assert_eq!(ids.len(), 3);

        store
            .update_status(
                ids[0],
                &StatusPatch {
                    contacted: Some(true),
                    interested: Some(true),
                    interview_scheduled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_status(
                ids[1],
                &StatusPatch {
                    contacted: Some(true),
                    interested: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let stats = store.statistics(search.id).unwrap();
        assert_eq!(
            stats,
            Statistics {
                total: 3,
                contacted: 2,
                interested: 1,
                interview_scheduled: 1
            }
        );
        assert_eq!(store.candidates_for_calling(search.id, false, false).unwrap(), vec![ids[2]]);
        assert_eq!(store.candidates_for_calling(search.id, true, true).unwrap(), vec![ids[0]]);
        assert_eq!(store.statistics(9999).unwrap(), Statistics::default());
    }

    #[test]
    fn test_callback_is_idempotent() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;
        let log = store.record_call(id, WebhookTool::N8n, "Hello Asha").unwrap();
        assert_eq!(log.status, CallStatus::Pending);

        let result = completed(true);
        let first = store.ingest_callback(&log.correlation_token, &result).unwrap();
        let after_first = store.get_candidate(id).unwrap().unwrap();
        let second = store.ingest_callback(&log.correlation_token, &result).unwrap();
        let after_second = store.get_candidate(id).unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, CallStatus::Completed);
        assert_eq!(after_first, after_second);
        assert!(after_second.status.contacted);
        assert_eq!(after_second.status.interested, Some(true));

        // Same token, different outcome: stale, nothing changes
        let err = store.ingest_callback(&log.correlation_token, &completed(false)).unwrap_err();
        assert!(matches!(err, PipelineError::StaleCallback));
        assert_eq!(store.get_candidate(id).unwrap().unwrap(), after_second);
    }

    #[test]
    fn test_unknown_token_is_stale_without_mutation() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;
        let log = store.record_call(id, WebhookTool::Make, "Hi").unwrap();
        let before = store.get_candidate(id).unwrap().unwrap();

        let err = store.ingest_callback("forged-token", &completed(true)).unwrap_err();
        assert!(matches!(err, PipelineError::StaleCallback));
        assert_eq!(store.get_candidate(id).unwrap().unwrap(), before);
        assert_eq!(store.get_call(&log.correlation_token).unwrap().unwrap().status, CallStatus::Pending);
    }

    #[test]
    fn test_failed_call_and_timeout_are_terminal() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;

        let failed = store.record_call(id, WebhookTool::Custom, "Hi").unwrap();
        let failed = store.mark_call_failed(&failed.correlation_token, "connection refused").unwrap();
        assert_eq!(failed.status, CallStatus::Failed);
        assert_eq!(failed.resolved_by, Some(Resolution::Dispatch));
        let err = store.ingest_callback(&failed.correlation_token, &completed(true)).unwrap_err();
        assert!(matches!(err, PipelineError::StaleCallback));

        let pending = store.record_call(id, WebhookTool::Custom, "Hi again").unwrap();
        assert_eq!(store.expire_pending(chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(store.expire_pending(chrono::Duration::seconds(-1)).unwrap(), 1);
        let expired = store.get_call(&pending.correlation_token).unwrap().unwrap();
        assert_eq!(expired.status, CallStatus::Failed);
        assert_eq!(expired.response.as_deref(), Some("timed out"));
        assert_eq!(expired.resolved_by, Some(Resolution::Timeout));
    }

    #[test]
    fn test_expire_with_huge_age_is_a_no_op() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;
        let log = store.record_call(id, WebhookTool::N8n, "Hi").unwrap();

        assert_eq!(store.expire_pending(TimeDelta::MAX).unwrap(), 0);
        assert_eq!(store.get_call(&log.correlation_token).unwrap().unwrap().status, CallStatus::Pending);
    }

    #[test]
    fn test_callback_reporting_timed_out_is_not_a_timeout() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;
        let log = store.record_call(id, WebhookTool::N8n, "Hi").unwrap();

        let result = CallbackResult {
            call_status: CallStatus::Failed,
            interested: None,
            contacted: None,
            response: Some("timed out".into()),
        };
        let resolved = store.ingest_callback(&log.correlation_token, &result).unwrap();
        assert_eq!(resolved.resolved_by, Some(Resolution::Callback));
    }

    fn shared_call() -> (tempfile::TempDir, PathBuf, i64, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.db");
        let store = Store::open(&path).unwrap();
        store.init().unwrap();
        let search = store.create_search(&SearchParams::new("rust", "Pune")).unwrap();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;
        let token = store.record_call(id, WebhookTool::N8n, "Hi").unwrap().correlation_token;
        (dir, path, id, token)
    }

    fn race_callbacks(path: &Path, token: &str, results: Vec<CallbackResult>) -> Vec<Result<CallLog>> {
        let barrier = Arc::new(Barrier::new(results.len()));
        let handles: Vec<_> = results
            .into_iter()
            .map(|result| {
                let path = path.to_path_buf();
                let token = token.to_string();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let store = Store::open(&path).unwrap();
                    barrier.wait();
                    store.ingest_callback(&token, &result)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_concurrent_identical_callbacks_apply_once() {
        let (_dir, path, id, token) = shared_call();
        let outcomes = race_callbacks(&path, &token, vec![completed(true), completed(true)]);

        let logs: Vec<CallLog> = outcomes.into_iter().map(|r| r.unwrap()).collect();
        // The loser saw the winner's resolution instead of writing its own
        assert_eq!(logs[0], logs[1]);
        assert_eq!(logs[0].status, CallStatus::Completed);

        let store = Store::open(&path).unwrap();
        let candidate = store.get_candidate(id).unwrap().unwrap();
        assert!(candidate.status.contacted);
        assert_eq!(candidate.status.interested, Some(true));
    }

    #[test]
    fn test_concurrent_conflicting_callbacks_one_wins() {
        let (_dir, path, id, token) = shared_call();
        let outcomes = race_callbacks(&path, &token, vec![completed(true), completed(false)]);

        let winners: Vec<bool> = outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_ok().then_some(i == 0))
            .collect();
        assert_eq!(winners.len(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(PipelineError::StaleCallback))));

        let store = Store::open(&path).unwrap();
        let candidate = store.get_candidate(id).unwrap().unwrap();
        assert_eq!(candidate.status.interested, Some(winners[0]));
    }

    #[test]
    fn test_latest_call_token_prefers_pending() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;

        let older = store.record_call(id, WebhookTool::N8n, "one").unwrap();
        let newer = store.record_call(id, WebhookTool::N8n, "two").unwrap();
        store.ingest_callback(&newer.correlation_token, &completed(true)).unwrap();

        assert_eq!(
            store.latest_call_token(id, WebhookTool::N8n).unwrap().as_deref(),
            Some(older.correlation_token.as_str())
        );
        assert_eq!(store.latest_call_token(id, WebhookTool::Make).unwrap(), None);
    }

    #[test]
    fn test_record_call_requires_candidate() {
        let store = Store::open_in_memory().unwrap();
        let err = store.record_call(77, WebhookTool::N8n, "Hi").unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[test]
    fn test_erase_candidate_removes_call_logs() {
        let (store, search) = store_with_search();
        store.add_candidates(search.id, &[candidate("Asha", "asha@example.com")]).unwrap();
        let id = store.list_candidates(search.id).unwrap()[0].id;
        let log = store.record_call(id, WebhookTool::N8n, "Hi").unwrap();

        assert!(store.erase_candidate(id).unwrap());
        assert!(store.get_candidate(id).unwrap().is_none());
        assert!(store.get_call(&log.correlation_token).unwrap().is_none());
        assert!(!store.erase_candidate(id).unwrap());
    }
}
