use kioku_core::model::{UnitId, UserId};

use super::SqliteRepository;
use super::mapping::{conn, map_attempt_row, unit_id_i64};
use crate::repository::{AttemptLogRecord, AttemptLogRepository, StorageError};

#[async_trait::async_trait]
impl AttemptLogRepository for SqliteRepository {
    async fn append_attempt_log(&self, log: &AttemptLogRecord) -> Result<i64, StorageError> {
        let state = &log.resulting_state;
        let res = sqlx::query(
            r"
                INSERT INTO attempt_logs (
                    user_id, unit_id, facet, rating, session_failures,
                    stage, stability, difficulty, reps, lapses, due_at, reviewed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
        )
        .bind(log.user_id.value())
        .bind(unit_id_i64(log.unit_id)?)
        .bind(log.facet.as_str())
        .bind(log.outcome.rating.as_str())
        .bind(i64::from(log.outcome.session_failures))
        .bind(state.stage.as_str())
        .bind(state.stability)
        .bind(state.difficulty)
        .bind(i64::from(state.reps))
        .bind(i64::from(state.lapses))
        .bind(log.due_at)
        .bind(log.reviewed_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(res.last_insert_rowid())
    }

    async fn attempts_for_unit(
        &self,
        user: UserId,
        unit: UnitId,
    ) -> Result<Vec<AttemptLogRecord>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT id, user_id, unit_id, facet, rating, session_failures,
                       stage, stability, difficulty, reps, lapses, due_at, reviewed_at
                FROM attempt_logs
                WHERE user_id = ?1 AND unit_id = ?2
                ORDER BY reviewed_at ASC, id ASC
            ",
        )
        .bind(user.value())
        .bind(unit_id_i64(unit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_attempt_row).collect()
    }
}
