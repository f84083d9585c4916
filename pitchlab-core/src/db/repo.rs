//! Database repository layer
//!
//! Provides query and insert operations for sessions, conversation records,
//! the phrase cache, batch completion tracking, and grading-run
//! observability.

use crate::error::{Error, Result};
use crate::store::SessionStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A session candidate for conversation correlation.
#[derive(Debug, Clone)]
pub struct SessionCandidate {
    pub session_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    /// Observed end; falls back to start + duration when the session has not
    /// recorded an explicit end.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Kind-agnostic record of one grading or batch run.
#[derive(Debug, Clone)]
pub struct GradingRunRecord {
    pub session_id: String,
    /// "rubric" or "batch"
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: GradingRunStatus,
    pub error_message: Option<String>,
    pub prompt_hash: Option<String>,
    pub downgraded: bool,
}

/// Status of a grading run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradingRunStatus {
    Success,
    Error,
    Timeout,
}

impl GradingRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradingRunStatus::Success => "success",
            GradingRunStatus::Error => "error",
            GradingRunStatus::Timeout => "timeout",
        }
    }

    pub fn from_storage(value: &str) -> Self {
        match value {
            "success" => GradingRunStatus::Success,
            "timeout" => GradingRunStatus::Timeout,
            _ => GradingRunStatus::Error,
        }
    }
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Session operations
    // ============================================

    /// Insert or replace a full session record.
    ///
    /// This is the owning application's ingestion path (and the test seed
    /// path); the pipeline itself only performs partial updates.
    pub fn upsert_session(&self, session: &StoredSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions (
                id, user_id, agent_id, started_at, ended_at, duration_secs,
                transcript, rapport, discovery, objection_handling, closing,
                safety, summary, feedback, metrics, line_ratings,
                total_batches, conversation_id, analytics, metadata
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, NULL, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                agent_id = excluded.agent_id,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                duration_secs = excluded.duration_secs,
                transcript = excluded.transcript,
                metadata = excluded.metadata
            "#,
            params![
                session.id,
                session.user_id,
                session.agent_id,
                session.started_at.to_rfc3339(),
                session.ended_at.map(|t| t.to_rfc3339()),
                session.duration_secs,
                serde_json::to_string(&session.transcript)?,
                session.scores.map(|s| s.rapport),
                session.scores.map(|s| s.discovery),
                session.scores.map(|s| s.objection_handling),
                session.scores.map(|s| s.closing),
                session.scores.map(|s| s.safety),
                session.summary,
                session
                    .feedback
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&session.line_ratings)?,
                session.total_batches,
                session.conversation_id,
                session
                    .analytics
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                session.metadata.to_string(),
            ],
        )
        .map_err(map_schema_error)?;
        Ok(())
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<StoredSession> {
        let started_at_str: String = row.get("started_at")?;
        let ended_at_str: Option<String> = row.get("ended_at")?;
        let transcript_str: String = row.get("transcript")?;
        let line_ratings_str: Option<String> = row.get("line_ratings")?;
        let metadata_str: Option<String> = row.get("metadata")?;
        let analytics_str: Option<String> = row.get("analytics")?;
        // Columns added by later migrations may be absent in older schemas
        let feedback_str: Option<String> = row.get("feedback").ok();
        let summary: Option<String> = row.get("summary")?;

        let scores = match (
            row.get::<_, Option<u8>>("rapport")?,
            row.get::<_, Option<u8>>("discovery")?,
            row.get::<_, Option<u8>>("objection_handling")?,
            row.get::<_, Option<u8>>("closing")?,
            row.get::<_, Option<u8>>("safety")?,
        ) {
            (Some(rapport), Some(discovery), Some(objection_handling), Some(closing), safety) => {
                Some(CategoryScores {
                    rapport,
                    discovery,
                    objection_handling,
                    closing,
                    safety: safety.unwrap_or(0),
                })
            }
            _ => None,
        };

        Ok(StoredSession {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            agent_id: row.get("agent_id")?,
            started_at: parse_ts(&started_at_str),
            ended_at: ended_at_str.as_deref().and_then(parse_opt_ts),
            duration_secs: row.get("duration_secs")?,
            transcript: serde_json::from_str(&transcript_str).unwrap_or_default(),
            scores,
            summary,
            feedback: feedback_str.and_then(|s| serde_json::from_str(&s).ok()),
            line_ratings: line_ratings_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            rated_batches: 0,
            total_batches: row.get("total_batches")?,
            conversation_id: row.get("conversation_id")?,
            analytics: analytics_str.and_then(|s| serde_json::from_str(&s).ok()),
            metadata: metadata_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_else(|| serde_json::json!({})),
        })
    }

    fn count_rated_batches(conn: &Connection, session_id: &str) -> Result<i32> {
        let count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM rated_batches WHERE session_id = ?",
            [session_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ============================================
    // Phrase cache operations
    // ============================================

    pub fn phrase_cache_get(&self, phrase: &str) -> Result<Option<LineRating>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT rating FROM phrase_cache WHERE phrase = ?",
                [phrase],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn phrase_cache_put(&self, phrase: &str, rating: &LineRating) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO phrase_cache (phrase, rating, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(phrase) DO UPDATE SET rating = excluded.rating
            "#,
            params![
                phrase,
                serde_json::to_string(rating)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Explicit cache clear; the only invalidation path.
    pub fn phrase_cache_clear(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM phrase_cache", [])?;
        Ok(removed)
    }

    pub fn phrase_cache_len(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM phrase_cache", [], |r| r.get(0))?;
        Ok(count)
    }

    // ============================================
    // Conversation record operations
    // ============================================

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM conversation_records WHERE conversation_id = ?",
            [conversation_id],
            Self::row_to_conversation,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_conversation(row: &Row) -> rusqlite::Result<ConversationRecord> {
        let started_at: Option<String> = row.get("started_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        let transcript: Option<String> = row.get("transcript")?;
        let analysis: Option<String> = row.get("analysis")?;
        let metadata: Option<String> = row.get("metadata")?;

        Ok(ConversationRecord {
            conversation_id: row.get("conversation_id")?,
            agent_id: row.get("agent_id")?,
            started_at: started_at.as_deref().and_then(parse_opt_ts),
            ended_at: ended_at.as_deref().and_then(parse_opt_ts),
            transcript: transcript.and_then(|s| serde_json::from_str(&s).ok()),
            analysis: analysis.and_then(|s| serde_json::from_str(&s).ok()),
            metadata: metadata
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_else(|| serde_json::json!({})),
        })
    }

    // ============================================
    // Grading run observability
    // ============================================

    pub fn insert_grading_run(&self, run: &GradingRunRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO grading_runs (
                session_id, kind, started_at, duration_ms, status,
                error_message, prompt_hash, downgraded
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                run.session_id,
                run.kind,
                run.started_at.to_rfc3339(),
                run.duration_ms,
                run.status.as_str(),
                run.error_message,
                run.prompt_hash,
                run.downgraded as i32,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_grading_runs(&self, session_id: &str, limit: usize) -> Result<Vec<GradingRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, kind, started_at, duration_ms, status,
                   error_message, prompt_hash, downgraded
            FROM grading_runs
            WHERE session_id = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            let started_at: String = row.get("started_at")?;
            let status: String = row.get("status")?;
            let downgraded: i32 = row.get("downgraded")?;
            Ok(GradingRunRecord {
                session_id: row.get("session_id")?,
                kind: row.get("kind")?,
                started_at: parse_ts(&started_at),
                duration_ms: row.get("duration_ms")?,
                status: GradingRunStatus::from_storage(&status),
                error_message: row.get("error_message")?,
                prompt_hash: row.get("prompt_hash")?,
                downgraded: downgraded != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

impl SessionStore for Database {
    fn load_session(&self, id: &str) -> Result<Option<StoredSession>> {
        let conn = self.conn.lock().unwrap();
        let session = conn
            .query_row("SELECT * FROM sessions WHERE id = ?", [id], |row| {
                Self::row_to_session(row)
            })
            .optional()?;

        match session {
            Some(mut session) => {
                session.rated_batches = Self::count_rated_batches(&conn, id)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();

        // Line ratings merge by index; everything else is a straight SET.
        if let Some(ratings) = &update.line_ratings {
            merge_ratings_locked(&conn, id, ratings)?;
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(scores) = update.scores {
            for (column, value) in [
                ("rapport", scores.rapport),
                ("discovery", scores.discovery),
                ("objection_handling", scores.objection_handling),
                ("closing", scores.closing),
                ("safety", scores.safety),
            ] {
                sets.push(format!("{} = ?", column));
                values.push(Box::new(value));
            }
        }
        if let Some(summary) = &update.summary {
            sets.push("summary = ?".to_string());
            values.push(Box::new(summary.clone()));
        }
        if let Some(feedback) = &update.feedback {
            sets.push("feedback = ?".to_string());
            values.push(Box::new(serde_json::to_string(feedback)?));
        }
        if let Some(metrics) = &update.metrics {
            sets.push("metrics = ?".to_string());
            values.push(Box::new(serde_json::to_string(metrics)?));
        }
        if let Some(analytics) = &update.analytics {
            sets.push("analytics = ?".to_string());
            values.push(Box::new(analytics.to_string()));
        }
        if let Some(conversation_id) = &update.conversation_id {
            sets.push("conversation_id = ?".to_string());
            values.push(Box::new(conversation_id.clone()));
        }
        if let Some(total) = update.total_batches {
            sets.push("total_batches = ?".to_string());
            values.push(Box::new(total));
        }

        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE sessions SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id.to_string()));

        let changed = conn
            .execute(&sql, rusqlite::params_from_iter(values.iter()))
            .map_err(map_schema_error)?;

        if changed == 0 {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    fn merge_line_ratings(
        &self,
        id: &str,
        ratings: &BTreeMap<usize, LineRating>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        merge_ratings_locked(&conn, id, ratings)
    }

    fn record_batch_complete(&self, id: &str, batch_index: u32) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO rated_batches (session_id, batch_index, completed_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![id, batch_index, Utc::now().to_rfc3339()],
        )?;
        Self::count_rated_batches(&conn, id)
    }

    fn sessions_for_agent(&self, agent_id: &str) -> Result<Vec<SessionCandidate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, started_at, ended_at, duration_secs
            FROM sessions
            WHERE agent_id = ?1
            ORDER BY started_at DESC
            "#,
        )?;
        let rows = stmt.query_map([agent_id], |row| {
            let started_at: String = row.get("started_at")?;
            let ended_at: Option<String> = row.get("ended_at")?;
            let duration_secs: i64 = row.get("duration_secs")?;
            let started_at = parse_ts(&started_at);
            Ok(SessionCandidate {
                session_id: row.get("id")?,
                user_id: row.get("user_id")?,
                started_at,
                ended_at: ended_at
                    .as_deref()
                    .and_then(parse_opt_ts)
                    .or_else(|| Some(started_at + chrono::Duration::seconds(duration_secs))),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn upsert_conversation(&self, record: &ConversationRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO conversation_records (
                conversation_id, agent_id, started_at, ended_at,
                transcript, analysis, metadata, received_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(conversation_id) DO UPDATE SET
                agent_id = excluded.agent_id,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                transcript = excluded.transcript,
                analysis = excluded.analysis,
                metadata = excluded.metadata
            "#,
            params![
                record.conversation_id,
                record.agent_id,
                record.started_at.map(|t| t.to_rfc3339()),
                record.ended_at.map(|t| t.to_rfc3339()),
                record
                    .transcript
                    .as_ref()
                    .map(|v| v.to_string()),
                record.analysis.as_ref().map(|v| v.to_string()),
                record.metadata.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn link_conversation(&self, session_id: &str, conversation_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sessions SET conversation_id = ?1 WHERE id = ?2",
            params![conversation_id, session_id],
        )?;
        if changed == 0 {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

/// Merge line ratings under an already-held connection lock so the
/// read-modify-write is atomic with respect to concurrent batches.
fn merge_ratings_locked(
    conn: &Connection,
    id: &str,
    ratings: &BTreeMap<usize, LineRating>,
) -> Result<()> {
    if ratings.is_empty() {
        return Ok(());
    }

    let existing: Option<Option<String>> = conn
        .query_row("SELECT line_ratings FROM sessions WHERE id = ?", [id], |r| {
            r.get(0)
        })
        .optional()?;

    let mut merged: BTreeMap<usize, LineRating> = match existing {
        Some(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
        Some(None) => BTreeMap::new(),
        None => return Err(Error::SessionNotFound(id.to_string())),
    };

    for (index, rating) in ratings {
        merged.insert(*index, rating.clone());
    }

    conn.execute(
        "UPDATE sessions SET line_ratings = ?1 WHERE id = ?2",
        params![serde_json::to_string(&merged)?, id],
    )
    .map_err(map_schema_error)?;
    Ok(())
}

/// Map "no such column" failures to the typed schema-mismatch error so the
/// orchestrator can downgrade instead of failing.
fn map_schema_error(e: rusqlite::Error) -> Error {
    let message = e.to_string();
    if message.contains("no such column") || message.contains("has no column named") {
        Error::SchemaMismatch(message)
    } else {
        Error::Database(e)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
