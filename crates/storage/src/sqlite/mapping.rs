use chrono::{DateTime, Utc};
use kioku_core::model::{
    Facet, Outcome, Rating, SchedulingState, Stage, TraceId, Unit, UnitId, UnitKind, UserId,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::{AttemptLogRecord, DueFacet, SchedulingRecord, StorageError};

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn(e: sqlx::Error) -> StorageError {
    StorageError::Connection(e.to_string())
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn unit_id_i64(id: UnitId) -> Result<i64, StorageError> {
    i64::try_from(id.value()).map_err(|_| StorageError::Serialization("unit_id overflow".into()))
}

pub(crate) fn unit_id_from_i64(v: i64) -> Result<UnitId, StorageError> {
    Ok(UnitId::new(i64_to_u64("unit_id", v)?))
}

pub(crate) fn trace_id(row: &SqliteRow, column: &str) -> Result<TraceId, StorageError> {
    Ok(TraceId::new(row.try_get::<i64, _>(column).map_err(ser)?))
}

pub(crate) fn user_id(row: &SqliteRow) -> Result<UserId, StorageError> {
    Ok(UserId::new(row.try_get("user_id").map_err(ser)?))
}

pub(crate) fn facet(row: &SqliteRow) -> Result<Facet, StorageError> {
    row.try_get::<String, _>("facet")
        .map_err(ser)?
        .parse()
        .map_err(ser)
}

fn map_state(row: &SqliteRow) -> Result<SchedulingState, StorageError> {
    let stage: Stage = row
        .try_get::<String, _>("stage")
        .map_err(ser)?
        .parse()
        .map_err(ser)?;
    Ok(SchedulingState {
        stage,
        stability: row.try_get("stability").map_err(ser)?,
        difficulty: row.try_get("difficulty").map_err(ser)?,
        reps: u32_from_i64("reps", row.try_get::<i64, _>("reps").map_err(ser)?)?,
        lapses: u32_from_i64("lapses", row.try_get::<i64, _>("lapses").map_err(ser)?)?,
    })
}

pub(crate) fn map_scheduling_row(row: &SqliteRow) -> Result<SchedulingRecord, StorageError> {
    Ok(SchedulingRecord {
        user_id: user_id(row)?,
        unit_id: unit_id_from_i64(row.try_get::<i64, _>("unit_id").map_err(ser)?)?,
        facet: facet(row)?,
        state: map_state(row)?,
        due_at: row.try_get("due_at").map_err(ser)?,
        last_review_at: row.try_get("last_review_at").map_err(ser)?,
    })
}

pub(crate) fn map_due_row(row: &SqliteRow) -> Result<DueFacet, StorageError> {
    Ok(DueFacet {
        unit_id: unit_id_from_i64(row.try_get::<i64, _>("unit_id").map_err(ser)?)?,
        facet: facet(row)?,
        state: map_state(row)?,
        due_at: row.try_get("due_at").map_err(ser)?,
    })
}

pub(crate) fn map_attempt_row(row: &SqliteRow) -> Result<AttemptLogRecord, StorageError> {
    let rating: Rating = row
        .try_get::<String, _>("rating")
        .map_err(ser)?
        .parse()
        .map_err(ser)?;
    let failures = u32_from_i64(
        "session_failures",
        row.try_get::<i64, _>("session_failures").map_err(ser)?,
    )?;
    let reviewed_at: DateTime<Utc> = row.try_get("reviewed_at").map_err(ser)?;
    Ok(AttemptLogRecord {
        id: Some(row.try_get("id").map_err(ser)?),
        user_id: user_id(row)?,
        unit_id: unit_id_from_i64(row.try_get::<i64, _>("unit_id").map_err(ser)?)?,
        facet: facet(row)?,
        outcome: Outcome::new(rating, failures),
        resulting_state: map_state(row)?,
        due_at: row.try_get("due_at").map_err(ser)?,
        reviewed_at,
    })
}

/// Rebuilds a unit through its validating constructor.
pub(crate) fn map_unit_row(row: &SqliteRow) -> Result<Unit, StorageError> {
    let payload: String = row.try_get("payload").map_err(ser)?;
    let kind: UnitKind = serde_json::from_str(&payload).map_err(ser)?;
    let level = u32_from_i64("level", row.try_get::<i64, _>("level").map_err(ser)?)?;
    Unit::new(
        unit_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        level,
        row.try_get::<String, _>("character").map_err(ser)?,
        kind,
    )
    .map_err(ser)
}
