use chrono::{DateTime, Utc};
use kioku_core::model::{TraceId, UnitId, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, ser, u32_from_i64, unit_id_from_i64, unit_id_i64};
use crate::repository::{LessonItemStatus, LessonRepository, StorageError};

#[async_trait::async_trait]
impl LessonRepository for SqliteRepository {
    async fn create_lesson_batch(
        &self,
        user: UserId,
        level: u32,
        units: &[UnitId],
        created_at: DateTime<Utc>,
    ) -> Result<TraceId, StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;

        let res = sqlx::query(
            r"
                INSERT INTO lesson_batches (user_id, level, created_at)
                VALUES (?1, ?2, ?3)
            ",
        )
        .bind(user.value())
        .bind(i64::from(level))
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;
        let batch_id = res.last_insert_rowid();

        for (position, unit) in units.iter().enumerate() {
            let position = i64::try_from(position)
                .map_err(|_| StorageError::Serialization("position overflow".into()))?;
            sqlx::query(
                r"
                    INSERT INTO lesson_items (batch_id, unit_id, position, status)
                    VALUES (?1, ?2, ?3, ?4)
                ",
            )
            .bind(batch_id)
            .bind(unit_id_i64(*unit)?)
            .bind(position)
            .bind(LessonItemStatus::Unseen.as_str())
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        tx.commit().await.map_err(conn)?;
        Ok(TraceId::new(batch_id))
    }

    async fn update_lesson_item_status(
        &self,
        batch: TraceId,
        unit: UnitId,
        status: LessonItemStatus,
    ) -> Result<(), StorageError> {
        let res = sqlx::query(
            r"
                UPDATE lesson_items SET status = ?3
                WHERE batch_id = ?1 AND unit_id = ?2
            ",
        )
        .bind(batch.value())
        .bind(unit_id_i64(unit)?)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn lesson_item_statuses(
        &self,
        batch: TraceId,
    ) -> Result<Vec<(UnitId, LessonItemStatus)>, StorageError> {
        let exists = sqlx::query("SELECT 1 FROM lesson_batches WHERE id = ?1")
            .bind(batch.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        if exists.is_none() {
            return Err(StorageError::NotFound);
        }

        let rows = sqlx::query(
            r"
                SELECT unit_id, status FROM lesson_items
                WHERE batch_id = ?1
                ORDER BY position ASC
            ",
        )
        .bind(batch.value())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter()
            .map(|row| -> Result<_, StorageError> {
                let unit = unit_id_from_i64(row.try_get::<i64, _>("unit_id").map_err(ser)?)?;
                let status: LessonItemStatus =
                    row.try_get::<String, _>("status").map_err(ser)?.parse()?;
                Ok((unit, status))
            })
            .collect()
    }

    async fn count_batches_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let row = sqlx::query(
            r"
                SELECT COUNT(*) AS batches FROM lesson_batches
                WHERE user_id = ?1 AND created_at >= ?2
            ",
        )
        .bind(user.value())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(conn)?;

        u32_from_i64("batches", row.try_get::<i64, _>("batches").map_err(ser)?)
    }
}
