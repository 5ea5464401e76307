use chrono::{DateTime, Utc};
use kioku_core::model::{Facet, TraceId, UnitId, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{
    conn, facet as row_facet, ser, trace_id, u32_from_i64, unit_id_from_i64, unit_id_i64, user_id,
};
use crate::repository::{
    SessionItemOutcome, SessionItemStatus, SessionTraceRecord, SessionTraceRepository,
    StorageError, TraceKind,
};

fn parse_kind(s: &str) -> Result<TraceKind, StorageError> {
    match s {
        "review" => Ok(TraceKind::Review),
        "discovery" => Ok(TraceKind::Discovery),
        _ => Err(StorageError::Serialization(format!("invalid trace kind: {s}"))),
    }
}

impl SqliteRepository {
    async fn trace_exists(&self, trace: TraceId) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM session_traces WHERE id = ?1")
            .bind(trace.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        Ok(row.is_some())
    }
}

#[async_trait::async_trait]
impl SessionTraceRepository for SqliteRepository {
    async fn create_session_trace(
        &self,
        user: UserId,
        kind: TraceKind,
        total_items: u32,
        started_at: DateTime<Utc>,
    ) -> Result<TraceId, StorageError> {
        let res = sqlx::query(
            r"
                INSERT INTO session_traces (user_id, kind, total_items, started_at)
                VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(user.value())
        .bind(kind.as_str())
        .bind(i64::from(total_items))
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(TraceId::new(res.last_insert_rowid()))
    }

    async fn record_session_item_outcome(
        &self,
        trace: TraceId,
        unit: UnitId,
        facet: Facet,
        outcome: &SessionItemOutcome,
    ) -> Result<(), StorageError> {
        if !self.trace_exists(trace).await? {
            return Err(StorageError::NotFound);
        }

        sqlx::query(
            r"
                INSERT INTO session_trace_items (
                    trace_id, unit_id, facet, status, attempts, failures, recorded_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(trace_id, unit_id, facet) DO UPDATE SET
                    status = excluded.status,
                    attempts = excluded.attempts,
                    failures = excluded.failures,
                    recorded_at = excluded.recorded_at
            ",
        )
        .bind(trace.value())
        .bind(unit_id_i64(unit)?)
        .bind(facet.as_str())
        .bind(outcome.status.as_str())
        .bind(i64::from(outcome.attempts))
        .bind(i64::from(outcome.failures))
        .bind(outcome.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn mark_session_complete(
        &self,
        trace: TraceId,
        completed_items: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let res = sqlx::query(
            r"
                UPDATE session_traces
                SET completed_items = ?2, completed_at = ?3
                WHERE id = ?1
            ",
        )
        .bind(trace.value())
        .bind(i64::from(completed_items))
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn get_session_trace(&self, trace: TraceId) -> Result<SessionTraceRecord, StorageError> {
        let header = sqlx::query(
            r"
                SELECT id, user_id, kind, total_items, completed_items, started_at, completed_at
                FROM session_traces
                WHERE id = ?1
            ",
        )
        .bind(trace.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;

        let item_rows = sqlx::query(
            r"
                SELECT unit_id, facet, status, attempts, failures, recorded_at
                FROM session_trace_items
                WHERE trace_id = ?1
                ORDER BY unit_id ASC, facet ASC
            ",
        )
        .bind(trace.value())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut items = Vec::with_capacity(item_rows.len());
        for row in &item_rows {
            let status: SessionItemStatus = row
                .try_get::<String, _>("status")
                .map_err(ser)?
                .parse()?;
            let outcome = SessionItemOutcome {
                status,
                attempts: u32_from_i64(
                    "attempts",
                    row.try_get::<i64, _>("attempts").map_err(ser)?,
                )?,
                failures: u32_from_i64(
                    "failures",
                    row.try_get::<i64, _>("failures").map_err(ser)?,
                )?,
                recorded_at: row.try_get("recorded_at").map_err(ser)?,
            };
            items.push((
                unit_id_from_i64(row.try_get::<i64, _>("unit_id").map_err(ser)?)?,
                row_facet(row)?,
                outcome,
            ));
        }

        let kind: String = header.try_get("kind").map_err(ser)?;
        Ok(SessionTraceRecord {
            id: trace_id(&header, "id")?,
            user_id: user_id(&header)?,
            kind: parse_kind(&kind)?,
            total_items: u32_from_i64(
                "total_items",
                header.try_get::<i64, _>("total_items").map_err(ser)?,
            )?,
            completed_items: u32_from_i64(
                "completed_items",
                header.try_get::<i64, _>("completed_items").map_err(ser)?,
            )?,
            started_at: header.try_get("started_at").map_err(ser)?,
            completed_at: header.try_get("completed_at").map_err(ser)?,
            items,
        })
    }
}
