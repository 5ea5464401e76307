use chrono::{DateTime, Utc};
use kioku_core::model::{Facet, Stage, UnitId, UserId};

use super::SqliteRepository;
use super::mapping::{conn, map_due_row, map_scheduling_row, unit_id_i64};
use crate::repository::{DueFacet, SchedulingRecord, SchedulingRepository, StorageError};

#[async_trait::async_trait]
impl SchedulingRepository for SqliteRepository {
    async fn fetch_due_facets(
        &self,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueFacet>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT unit_id, facet, stage, stability, difficulty, reps, lapses, due_at
            FROM scheduling_states
            WHERE user_id = ?1 AND due_at <= ?2 AND stage != ?3
            ORDER BY due_at ASC, unit_id ASC, facet ASC
            ",
        )
        .bind(user.value())
        .bind(now)
        .bind(Stage::Burned.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_due_row).collect()
    }

    async fn upsert_scheduling_state(&self, record: &SchedulingRecord) -> Result<(), StorageError> {
        let state = &record.state;
        sqlx::query(
            r"
            INSERT INTO scheduling_states (
                user_id, unit_id, facet, stage, stability, difficulty,
                reps, lapses, due_at, last_review_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(user_id, unit_id, facet) DO UPDATE SET
                stage = excluded.stage,
                stability = excluded.stability,
                difficulty = excluded.difficulty,
                reps = excluded.reps,
                lapses = excluded.lapses,
                due_at = excluded.due_at,
                last_review_at = excluded.last_review_at
            ",
        )
        .bind(record.user_id.value())
        .bind(unit_id_i64(record.unit_id)?)
        .bind(record.facet.as_str())
        .bind(state.stage.as_str())
        .bind(state.stability)
        .bind(state.difficulty)
        .bind(i64::from(state.reps))
        .bind(i64::from(state.lapses))
        .bind(record.due_at)
        .bind(record.last_review_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn get_scheduling_state(
        &self,
        user: UserId,
        unit: UnitId,
        facet: Facet,
    ) -> Result<Option<SchedulingRecord>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT user_id, unit_id, facet, stage, stability, difficulty,
                   reps, lapses, due_at, last_review_at
            FROM scheduling_states
            WHERE user_id = ?1 AND unit_id = ?2 AND facet = ?3
            ",
        )
        .bind(user.value())
        .bind(unit_id_i64(unit)?)
        .bind(facet.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        row.as_ref().map(map_scheduling_row).transpose()
    }
}
