use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

const SCHEMA_V1: &[&str] = &[
    r"
        CREATE TABLE IF NOT EXISTS units (
            id INTEGER PRIMARY KEY,
            level INTEGER NOT NULL CHECK (level >= 1),
            unit_type TEXT NOT NULL,
            character TEXT NOT NULL,
            payload TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS scheduling_states (
            user_id BLOB NOT NULL,
            unit_id INTEGER NOT NULL,
            facet TEXT NOT NULL,
            stage TEXT NOT NULL,
            stability REAL NOT NULL CHECK (stability > 0),
            difficulty REAL NOT NULL,
            reps INTEGER NOT NULL CHECK (reps >= 0),
            lapses INTEGER NOT NULL CHECK (lapses >= 0),
            due_at TEXT NOT NULL,
            last_review_at TEXT,
            PRIMARY KEY (user_id, unit_id, facet),
            FOREIGN KEY (unit_id) REFERENCES units(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS attempt_logs (
            id INTEGER PRIMARY KEY,
            user_id BLOB NOT NULL,
            unit_id INTEGER NOT NULL,
            facet TEXT NOT NULL,
            rating TEXT NOT NULL,
            session_failures INTEGER NOT NULL CHECK (session_failures >= 0),
            stage TEXT NOT NULL,
            stability REAL NOT NULL,
            difficulty REAL NOT NULL,
            reps INTEGER NOT NULL,
            lapses INTEGER NOT NULL,
            due_at TEXT NOT NULL,
            reviewed_at TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS session_traces (
            id INTEGER PRIMARY KEY,
            user_id BLOB NOT NULL,
            kind TEXT NOT NULL,
            total_items INTEGER NOT NULL CHECK (total_items >= 0),
            completed_items INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS session_trace_items (
            trace_id INTEGER NOT NULL,
            unit_id INTEGER NOT NULL,
            facet TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL CHECK (attempts >= 0),
            failures INTEGER NOT NULL CHECK (failures >= 0),
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (trace_id, unit_id, facet),
            FOREIGN KEY (trace_id) REFERENCES session_traces(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS lesson_batches (
            id INTEGER PRIMARY KEY,
            user_id BLOB NOT NULL,
            level INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS lesson_items (
            batch_id INTEGER NOT NULL,
            unit_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY (batch_id, unit_id),
            FOREIGN KEY (batch_id) REFERENCES lesson_batches(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS user_levels (
            user_id BLOB PRIMARY KEY,
            level INTEGER NOT NULL CHECK (level >= 1),
            updated_at TEXT NOT NULL
        );
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_units_level_id
            ON units (level, id);
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_scheduling_user_due
            ON scheduling_states (user_id, due_at);
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_attempt_logs_user_unit_reviewed
            ON attempt_logs (user_id, unit_id, reviewed_at);
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_lesson_batches_user_created
            ON lesson_batches (user_id, created_at);
    ",
];

/// Runs schema migrations that have not been recorded yet.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: curriculum, scheduling, traces and lessons.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        for statement in SCHEMA_V1 {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(version = 1, statements = SCHEMA_V1.len(), "schema migration applied");
    }

    Ok(())
}
