//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema (pre-feedback era, kept for downgrade tests)
    r#"
    -- ============================================
    -- Sessions (owned by the application, enriched by the core)
    -- ============================================

    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        user_id          TEXT NOT NULL,
        agent_id         TEXT,
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME,
        duration_secs    INTEGER NOT NULL DEFAULT 0,
        transcript       JSON NOT NULL,

        -- Rubric fields (written by the grading orchestrator)
        rapport            INTEGER,
        discovery          INTEGER,
        objection_handling INTEGER,
        closing            INTEGER,
        safety             INTEGER,
        summary            TEXT,

        -- Incremental line-rating state
        line_ratings     JSON,
        total_batches    INTEGER,

        -- Correlation
        conversation_id  TEXT,

        -- Reduced-payload target; must exist in every schema variant
        analytics        JSON,

        metadata         JSON
    );

    -- ============================================
    -- Conversation records (webhook ingress, idempotent upsert)
    -- ============================================

    CREATE TABLE IF NOT EXISTS conversation_records (
        conversation_id  TEXT PRIMARY KEY,
        agent_id         TEXT NOT NULL,
        started_at       DATETIME,
        ended_at         DATETIME,
        transcript       JSON,
        analysis         JSON,
        metadata         JSON,
        received_at      DATETIME NOT NULL
    );

    -- ============================================
    -- Phrase cache (cross-session, cleared only explicitly)
    -- ============================================

    CREATE TABLE IF NOT EXISTS phrase_cache (
        phrase       TEXT PRIMARY KEY,
        rating       JSON NOT NULL,
        created_at   DATETIME NOT NULL
    );

    -- ============================================
    -- Batch completion tracking (idempotent per batch index)
    -- ============================================

    CREATE TABLE IF NOT EXISTS rated_batches (
        session_id   TEXT NOT NULL,
        batch_index  INTEGER NOT NULL,
        completed_at DATETIME NOT NULL,
        PRIMARY KEY (session_id, batch_index)
    );

    -- ============================================
    -- Grading run observability
    -- ============================================

    CREATE TABLE IF NOT EXISTS grading_runs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL,
        kind             TEXT NOT NULL,
        started_at       DATETIME NOT NULL,
        duration_ms      INTEGER NOT NULL,
        status           TEXT NOT NULL,
        error_message    TEXT,
        prompt_hash      TEXT,
        downgraded       INTEGER NOT NULL DEFAULT 0
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at DESC);
    CREATE INDEX IF NOT EXISTS idx_conversations_agent ON conversation_records(agent_id);
    CREATE INDEX IF NOT EXISTS idx_grading_runs_session ON grading_runs(session_id, started_at);
    CREATE INDEX IF NOT EXISTS idx_grading_runs_status ON grading_runs(status) WHERE status != 'success';
    "#,
    // Version 2: structured feedback and batch counters on sessions
    r#"
    ALTER TABLE sessions ADD COLUMN feedback JSON;
    ALTER TABLE sessions ADD COLUMN metrics JSON;
    "#,
];

/// Run all pending migrations on the connection.
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "sessions",
            "conversation_records",
            "phrase_cache",
            "rated_batches",
            "grading_runs",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }
}
