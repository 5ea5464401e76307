use std::collections::HashMap;

use kioku_core::model::{Unit, UnitId, UserId};

use super::SqliteRepository;
use super::mapping::{conn, map_unit_row, ser, unit_id_i64};
use crate::repository::{ContentRepository, StorageError};

const UNIT_COLUMNS: &str = "id, level, unit_type, character, payload";

#[async_trait::async_trait]
impl ContentRepository for SqliteRepository {
    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StorageError> {
        let payload = serde_json::to_string(unit.kind()).map_err(ser)?;
        sqlx::query(
            r"
            INSERT INTO units (id, level, unit_type, character, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                level = excluded.level,
                unit_type = excluded.unit_type,
                character = excluded.character,
                payload = excluded.payload
            ",
        )
        .bind(unit_id_i64(unit.id())?)
        .bind(i64::from(unit.level()))
        .bind(unit.unit_type().as_str())
        .bind(unit.character().to_owned())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn get_units(&self, ids: &[UnitId]) -> Result<Vec<Unit>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE id IN (");
        for i in 0..ids.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            sql.push_str(&(i + 1).to_string());
        }
        sql.push(')');

        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(unit_id_i64(*id)?);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(conn)?;
        let mut by_id: HashMap<UnitId, Unit> = HashMap::with_capacity(rows.len());
        for row in rows {
            let unit = map_unit_row(&row)?;
            by_id.insert(unit.id(), unit);
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn fetch_new_units(
        &self,
        user: UserId,
        limit: u32,
        level: Option<u32>,
    ) -> Result<Vec<Unit>, StorageError> {
        let sql = format!(
            r"
            SELECT {UNIT_COLUMNS}
            FROM units u
            WHERE (?2 IS NULL OR u.level = ?2)
              AND NOT EXISTS (
                SELECT 1 FROM scheduling_states s
                WHERE s.user_id = ?1 AND s.unit_id = u.id
              )
            ORDER BY u.level ASC, u.id ASC
            LIMIT ?3
            "
        );
        let rows = sqlx::query(&sql)
            .bind(user.value())
            .bind(level.map(i64::from))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;

        rows.iter().map(map_unit_row).collect()
    }
}
