use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use time::OffsetDateTime;

use super::store::{
    EntityType, LocalStore, Record, StoreError, decode_payload, delete_record, fetch_record,
    from_micros, now_utc, optional_from_micros, to_micros, upsert_record,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(StoreError::InvalidOperationKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Synced,
    Failed,
    Conflict,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Synced => "synced",
            OperationStatus::Failed => "failed",
            OperationStatus::Conflict => "conflict",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(OperationStatus::Pending),
            "synced" => Ok(OperationStatus::Synced),
            "failed" => Ok(OperationStatus::Failed),
            "conflict" => Ok(OperationStatus::Conflict),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub entity_type: EntityType,
    pub kind: OperationKind,
    pub entity_id: String,
    pub payload: Map<String, Value>,
    pub revision: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxOperation {
    pub id: i64,
    pub entity_type: EntityType,
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    pub entity_id: String,
    pub payload: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub revision: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub retry_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl OutboxOperation {
    pub fn is_ready(&self, now: OffsetDateTime) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}

/// Result of one push attempt, as recorded by `mark_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Synced,
    Retryable { retry_at: Option<OffsetDateTime> },
    Permanent,
    Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStatus {
    pub pending_count: u64,
    pub failed_count: u64,
    pub conflict_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activity_time: Option<OffsetDateTime>,
}

const OPERATION_COLUMNS: &str = "id, entity_type, operation, entity_id, payload, enqueued_at, status, retry_count, last_error, revision, retry_at, updated_at";

impl LocalStore {
    pub async fn enqueue_op(&self, op: &NewOperation) -> Result<i64, StoreError> {
        let mut conn = self.pool().acquire().await?;
        insert_op(&mut conn, op, now_utc()).await
    }

    /// Writes the optimistic local copy and queues its operation in one
    /// transaction. The operation is stamped with the record's `updated_at`.
    pub async fn apply_local_mutation(
        &self,
        record: &Record,
        op: &NewOperation,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool().begin().await?;
        upsert_record(&mut tx, record).await?;
        let queue_id = insert_op(&mut tx, op, record.updated_at).await?;
        tx.commit().await?;
        Ok(queue_id)
    }

    /// Pending operations in push order: enqueue time, then queue id.
    pub async fn list_pending_ops(&self) -> Result<Vec<OutboxOperation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM outbox WHERE status = 'pending' ORDER BY enqueued_at ASC, id ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(operation_from_row).collect()
    }

    pub async fn list_ops(&self) -> Result<Vec<OutboxOperation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM outbox ORDER BY id ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(operation_from_row).collect()
    }

    pub async fn get_op(&self, queue_id: i64) -> Result<Option<OutboxOperation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM outbox WHERE id = ?1"
        ))
        .bind(queue_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(operation_from_row).transpose()
    }

    /// Ids of `entity` records that still have an unconfirmed local change.
    pub async fn pending_entity_ids(
        &self,
        entity: EntityType,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT entity_id FROM outbox WHERE entity_type = ?1 AND status = 'pending'",
        )
        .bind(entity.as_str())
        .fetch_all(self.pool())
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("entity_id")?);
        }
        Ok(out)
    }

    /// Records a push outcome and returns the resulting status. A retryable
    /// failure keeps the operation pending until `max_retries` is reached.
    pub async fn mark_op(
        &self,
        queue_id: i64,
        outcome: MarkOutcome,
        error: Option<&str>,
    ) -> Result<OperationStatus, StoreError> {
        let mut conn = self.pool().acquire().await?;
        mark_outcome(&mut conn, queue_id, outcome, error, self.max_retries()).await
    }

    /// Marks a refused operation. When it leaves the queue for good and
    /// `remote` is given, the local copy is replaced by `remote` in the same
    /// transaction, unless other pending operations still target the record.
    pub async fn reject_op(
        &self,
        op: &OutboxOperation,
        outcome: MarkOutcome,
        error: Option<&str>,
        remote: Option<&Record>,
    ) -> Result<OperationStatus, StoreError> {
        let mut tx = self.pool().begin().await?;
        let status = mark_outcome(&mut tx, op.id, outcome, error, self.max_retries()).await?;
        if let Some(remote) = remote {
            if remote.entity_type != op.entity_type || remote.id != op.entity_id {
                return Err(StoreError::EntityMismatch {
                    id: remote.id.clone(),
                    expected: op.entity_type,
                    actual: remote.entity_type,
                });
            }
            if status != OperationStatus::Pending
                && !has_pending(&mut tx, op.entity_type, &op.entity_id).await?
            {
                upsert_record(&mut tx, remote).await?;
            }
        }
        tx.commit().await?;
        Ok(status)
    }

    /// Confirms `op` with the record the remote returned for it, in one
    /// transaction:
    /// - later pending operations on the same record are pointed at the
    ///   server id and revision;
    /// - the local copy is replaced by `server`, or only re-keyed when later
    ///   local edits are still waiting;
    /// - `op` is marked synced.
    ///
    /// Returns how many later operations were rebased.
    pub async fn settle_op(&self, op: &OutboxOperation, server: &Record) -> Result<u64, StoreError> {
        if server.entity_type != op.entity_type {
            return Err(StoreError::EntityMismatch {
                id: server.id.clone(),
                expected: op.entity_type,
                actual: server.entity_type,
            });
        }
        let mut tx = self.pool().begin().await?;
        let rebased = rebase_pending(&mut tx, op, &server.id, server.revision).await?;
        let local = fetch_record(&mut tx, op.entity_type, &op.entity_id).await?;
        if op.entity_id != server.id {
            delete_record(&mut tx, op.entity_type, &op.entity_id).await?;
        }
        let settled = match local {
            Some(mut local) if rebased > 0 => {
                local.id = server.id.clone();
                local.revision = server.revision;
                local
            }
            _ => server.clone(),
        };
        upsert_record(&mut tx, &settled).await?;
        mark_synced(&mut tx, op.id).await?;
        tx.commit().await?;
        Ok(rebased)
    }

    /// Rewrites the entity id of still-pending operations.
    pub async fn remap_entity_id(
        &self,
        entity: EntityType,
        from: &str,
        to: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET entity_id = ?1
             WHERE entity_type = ?2 AND entity_id = ?3 AND status = 'pending'",
        )
        .bind(to)
        .bind(entity.as_str())
        .bind(from)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Moves a failed operation back to pending with a fresh retry budget.
    pub async fn requeue_failed(&self, queue_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox
             SET status = 'pending', retry_count = 0, retry_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
        )
        .bind(queue_id)
        .bind(to_micros(now_utc()))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn outbox_status(&self) -> Result<OutboxStatus, StoreError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending_count,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_count,
                COALESCE(SUM(CASE WHEN status = 'conflict' THEN 1 ELSE 0 END), 0) AS conflict_count,
                MAX(updated_at) AS last_activity
             FROM outbox",
        )
        .fetch_one(self.pool())
        .await?;

        let pending: i64 = row.try_get("pending_count")?;
        let failed: i64 = row.try_get("failed_count")?;
        let conflict: i64 = row.try_get("conflict_count")?;
        Ok(OutboxStatus {
            pending_count: pending.max(0) as u64,
            failed_count: failed.max(0) as u64,
            conflict_count: conflict.max(0) as u64,
            last_activity_time: optional_from_micros(row.try_get("last_activity")?)?,
        })
    }
}

async fn insert_op(
    conn: &mut SqliteConnection,
    op: &NewOperation,
    enqueued_at: OffsetDateTime,
) -> Result<i64, StoreError> {
    let stamp = to_micros(enqueued_at);
    let result = sqlx::query(
        "INSERT INTO outbox (entity_type, operation, entity_id, payload, enqueued_at, status, retry_count, revision, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7)",
    )
    .bind(op.entity_type.as_str())
    .bind(op.kind.as_str())
    .bind(&op.entity_id)
    .bind(serde_json::to_string(&op.payload)?)
    .bind(stamp)
    .bind(op.revision)
    .bind(stamp)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn rebase_pending(
    conn: &mut SqliteConnection,
    op: &OutboxOperation,
    server_id: &str,
    revision: Option<i64>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE outbox SET entity_id = ?1, revision = ?2
         WHERE entity_type = ?3 AND entity_id = ?4 AND status = 'pending' AND id != ?5",
    )
    .bind(server_id)
    .bind(revision)
    .bind(op.entity_type.as_str())
    .bind(&op.entity_id)
    .bind(op.id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn mark_outcome(
    conn: &mut SqliteConnection,
    queue_id: i64,
    outcome: MarkOutcome,
    error: Option<&str>,
    max_retries: u32,
) -> Result<OperationStatus, StoreError> {
    let now = to_micros(now_utc());
    let query = match outcome {
        MarkOutcome::Synced => sqlx::query(
            "UPDATE outbox
             SET status = 'synced', last_error = NULL, retry_at = NULL, updated_at = ?2
             WHERE id = ?1
             RETURNING status",
        )
        .bind(queue_id)
        .bind(now),
        MarkOutcome::Retryable { retry_at } => sqlx::query(
            "UPDATE outbox
             SET retry_count = retry_count + 1,
                 status = CASE WHEN retry_count + 1 >= ?2 THEN 'failed' ELSE 'pending' END,
                 last_error = ?3,
                 retry_at = ?4,
                 updated_at = ?5
             WHERE id = ?1
             RETURNING status",
        )
        .bind(queue_id)
        .bind(max_retries)
        .bind(error)
        .bind(retry_at.map(to_micros))
        .bind(now),
        MarkOutcome::Permanent => sqlx::query(
            "UPDATE outbox
             SET status = 'failed', last_error = ?2, retry_at = NULL, updated_at = ?3
             WHERE id = ?1
             RETURNING status",
        )
        .bind(queue_id)
        .bind(error)
        .bind(now),
        MarkOutcome::Conflict => sqlx::query(
            "UPDATE outbox
             SET status = 'conflict', last_error = ?2, retry_at = NULL, updated_at = ?3
             WHERE id = ?1
             RETURNING status",
        )
        .bind(queue_id)
        .bind(error)
        .bind(now),
    };

    let row = query
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::MissingOperation(queue_id))?;
    let status: String = row.try_get("status")?;
    OperationStatus::parse(&status)
}

async fn has_pending(
    conn: &mut SqliteConnection,
    entity: EntityType,
    entity_id: &str,
) -> Result<bool, StoreError> {
    let row = sqlx::query(
        "SELECT EXISTS(
            SELECT 1 FROM outbox
            WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'pending'
         ) AS pending",
    )
    .bind(entity.as_str())
    .bind(entity_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get::<bool, _>("pending")?)
}

async fn mark_synced(conn: &mut SqliteConnection, queue_id: i64) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE outbox
         SET status = 'synced', last_error = NULL, retry_at = NULL, updated_at = ?2
         WHERE id = ?1",
    )
    .bind(queue_id)
    .bind(to_micros(now_utc()))
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::MissingOperation(queue_id));
    }
    Ok(())
}

fn operation_from_row(row: &SqliteRow) -> Result<OutboxOperation, StoreError> {
    let entity_type: String = row.try_get("entity_type")?;
    let kind: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(OutboxOperation {
        id: row.try_get("id")?,
        entity_type: EntityType::parse(&entity_type)?,
        kind: OperationKind::parse(&kind)?,
        entity_id: row.try_get("entity_id")?,
        payload: decode_payload(&payload)?,
        enqueued_at: from_micros(row.try_get("enqueued_at")?)?,
        status: OperationStatus::parse(&status)?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        revision: row.try_get("revision")?,
        retry_at: optional_from_micros(row.try_get("retry_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
#[path = "outbox_tests.rs"]
mod tests;
