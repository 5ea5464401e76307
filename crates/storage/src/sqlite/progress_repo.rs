use chrono::Utc;
use kioku_core::model::{Stage, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, ser, u32_from_i64};
use crate::repository::{LevelMastery, ProgressRepository, StorageError};

#[async_trait::async_trait]
impl ProgressRepository for SqliteRepository {
    async fn current_level(&self, user: UserId) -> Result<u32, StorageError> {
        let row = sqlx::query("SELECT level FROM user_levels WHERE user_id = ?1")
            .bind(user.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        match row {
            Some(row) => u32_from_i64("level", row.try_get::<i64, _>("level").map_err(ser)?),
            None => Ok(1),
        }
    }

    async fn set_level(&self, user: UserId, level: u32) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO user_levels (user_id, level, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id) DO UPDATE SET
                    level = excluded.level,
                    updated_at = excluded.updated_at
            ",
        )
        .bind(user.value())
        .bind(i64::from(level))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn level_mastery(&self, user: UserId, level: u32) -> Result<LevelMastery, StorageError> {
        let row = sqlx::query(
            r"
                SELECT
                    (SELECT COUNT(*) FROM units WHERE level = ?2) AS total,
                    (SELECT COUNT(*) FROM units u
                        WHERE u.level = ?2
                          AND EXISTS (
                            SELECT 1 FROM scheduling_states s
                            WHERE s.user_id = ?1 AND s.unit_id = u.id
                          )
                          AND NOT EXISTS (
                            SELECT 1 FROM scheduling_states s
                            WHERE s.user_id = ?1 AND s.unit_id = u.id
                              AND s.stage NOT IN (?3, ?4)
                          )
                    ) AS mastered
            ",
        )
        .bind(user.value())
        .bind(i64::from(level))
        .bind(Stage::Review.as_str())
        .bind(Stage::Burned.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(conn)?;

        Ok(LevelMastery {
            total: u32_from_i64("total", row.try_get::<i64, _>("total").map_err(ser)?)?,
            mastered: u32_from_i64(
                "mastered",
                row.try_get::<i64, _>("mastered").map_err(ser)?,
            )?,
        })
    }
}
