use serde::Serialize;
use sqlx::Row;
use time::OffsetDateTime;

use super::store::{EntityType, LocalStore, StoreError, from_micros, now_utc, to_micros};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub entity_type: EntityType,
    #[serde(with = "time::serde::rfc3339")]
    pub watermark: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl LocalStore {
    /// Watermark for `entity`, or the epoch when nothing was pulled yet.
    pub async fn get_cursor(&self, entity: EntityType) -> Result<OffsetDateTime, StoreError> {
        let row = sqlx::query("SELECT watermark FROM cursors WHERE entity_type = ?1")
            .bind(entity.as_str())
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => from_micros(row.try_get("watermark")?),
            None => Ok(OffsetDateTime::UNIX_EPOCH),
        }
    }

    /// Advances the watermark; a lower value than the stored one is ignored.
    pub async fn set_cursor(
        &self,
        entity: EntityType,
        watermark: OffsetDateTime,
    ) -> Result<OffsetDateTime, StoreError> {
        let row = sqlx::query(
            "INSERT INTO cursors (entity_type, watermark, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_type) DO UPDATE SET
                watermark = MAX(cursors.watermark, excluded.watermark),
                updated_at = excluded.updated_at
             RETURNING watermark",
        )
        .bind(entity.as_str())
        .bind(to_micros(watermark))
        .bind(to_micros(now_utc()))
        .fetch_one(self.pool())
        .await?;

        from_micros(row.try_get("watermark")?)
    }

    pub async fn list_cursors(&self) -> Result<Vec<Cursor>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, watermark, updated_at FROM cursors ORDER BY entity_type ASC",
        )
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_type: String = row.try_get("entity_type")?;
            out.push(Cursor {
                entity_type: EntityType::parse(&entity_type)?,
                watermark: from_micros(row.try_get("watermark")?)?,
                updated_at: from_micros(row.try_get("updated_at")?)?,
            });
        }
        Ok(out)
    }
}
