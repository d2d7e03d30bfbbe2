use std::fmt;
use std::{fs, path::Path, path::PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const TEMP_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored timestamp out of range: {0}")]
    Time(#[from] time::error::ComponentRange),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),
    #[error("invalid operation status: {0}")]
    InvalidStatus(String),
    #[error("invalid field name: {0}")]
    InvalidField(String),
    #[error("stored payload is not a JSON object")]
    InvalidPayload,
    #[error("record {id} belongs to {actual}, not {expected}")]
    EntityMismatch {
        id: String,
        expected: EntityType,
        actual: EntityType,
    },
    #[error("outbox operation not found: {0}")]
    MissingOperation(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Estudantes,
    Programas,
    Designacoes,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Estudantes,
        EntityType::Programas,
        EntityType::Designacoes,
    ];

    /// Also the remote table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Estudantes => "estudantes",
            EntityType::Programas => "programas",
            EntityType::Designacoes => "designacoes",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "estudantes" => Ok(EntityType::Estudantes),
            "programas" => Ok(EntityType::Programas),
            "designacoes" => Ok(EntityType::Designacoes),
            other => Err(StoreError::InvalidEntityType(other.to_string())),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub entity_type: EntityType,
    pub id: String,
    pub payload: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    pub revision: Option<i64>,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }
}

pub fn new_temporary_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Current time truncated to the microsecond precision the store keeps.
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.microsecond() * 1_000)
        .unwrap_or(now)
}

pub(crate) fn to_micros(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000) as i64
}

pub(crate) fn from_micros(value: i64) -> Result<OffsetDateTime, StoreError> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(
        i128::from(value) * 1_000,
    )?)
}

pub(crate) fn optional_from_micros(
    value: Option<i64>,
) -> Result<Option<OffsetDateTime>, StoreError> {
    value.map(from_micros).transpose()
}

pub(crate) fn decode_payload(raw: &str) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(object) => Ok(object),
        _ => Err(StoreError::InvalidPayload),
    }
}

/// Offline copy of remote records plus the cursor and outbox tables that
/// share its database.
pub struct LocalStore {
    pool: SqlitePool,
    max_retries: u32,
}

impl LocalStore {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    /// Opens an in-memory or URL-addressed database on a single connection.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Upserts the whole batch in one transaction; nothing is written if any
    /// record fails.
    pub async fn put_many(&self, entity: EntityType, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            if record.entity_type != entity {
                return Err(StoreError::EntityMismatch {
                    id: record.id.clone(),
                    expected: entity,
                    actual: record.entity_type,
                });
            }
            upsert_record(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_all(&self, entity: EntityType) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, id, payload, updated_at, deleted_at, revision
             FROM records
             WHERE entity_type = ?1
             ORDER BY id ASC",
        )
        .bind(entity.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Record>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, entity, id).await
    }

    /// Records whose top-level payload `field` equals `value`.
    pub async fn list_by_field(
        &self,
        entity: EntityType,
        field: &str,
        value: &str,
    ) -> Result<Vec<Record>, StoreError> {
        if field.is_empty()
            || !field
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(StoreError::InvalidField(field.to_string()));
        }
        let rows = sqlx::query(
            "SELECT entity_type, id, payload, updated_at, deleted_at, revision
             FROM records
             WHERE entity_type = ?1 AND json_extract(payload, ?2) = ?3
             ORDER BY id ASC",
        )
        .bind(entity.as_str())
        .bind(format!("$.{field}"))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Designacoes of one programa; matches the expression index exactly.
    pub async fn designacoes_for_programa(
        &self,
        programa_id: &str,
    ) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, id, payload, updated_at, deleted_at, revision
             FROM records
             WHERE entity_type = 'designacoes'
               AND json_extract(payload, '$.programa_id') = ?1
             ORDER BY id ASC",
        )
        .bind(programa_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

pub(crate) async fn upsert_record(
    conn: &mut SqliteConnection,
    record: &Record,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO records (entity_type, id, payload, updated_at, deleted_at, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(entity_type, id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted_at = excluded.deleted_at,
            revision = excluded.revision",
    )
    .bind(record.entity_type.as_str())
    .bind(&record.id)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(to_micros(record.updated_at))
    .bind(record.deleted_at.map(to_micros))
    .bind(record.revision)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn fetch_record(
    conn: &mut SqliteConnection,
    entity: EntityType,
    id: &str,
) -> Result<Option<Record>, StoreError> {
    let row = sqlx::query(
        "SELECT entity_type, id, payload, updated_at, deleted_at, revision
         FROM records
         WHERE entity_type = ?1 AND id = ?2",
    )
    .bind(entity.as_str())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

pub(crate) async fn delete_record(
    conn: &mut SqliteConnection,
    entity: EntityType,
    id: &str,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM records WHERE entity_type = ?1 AND id = ?2")
        .bind(entity.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let entity_type: String = row.try_get("entity_type")?;
    let payload: String = row.try_get("payload")?;
    Ok(Record {
        entity_type: EntityType::parse(&entity_type)?,
        id: row.try_get("id")?,
        payload: decode_payload(&payload)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
        deleted_at: optional_from_micros(row.try_get("deleted_at")?)?,
        revision: row.try_get("revision")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("sua-parte").join("offline.db"))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
