use std::collections::HashSet;

use parte_core::strip_bookkeeping;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::conflict::{RevisionCheck, check_revision};
use super::cursor::Cursor;
use super::outbox::{
    MarkOutcome, NewOperation, OperationKind, OperationStatus, OutboxOperation, OutboxStatus,
};
use super::remote::{RemoteAdapter, RemoteError, RestRemote};
use super::store::{
    EntityType, LocalStore, Record, StoreError, is_temporary_id, new_temporary_id, now_utc,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("a sync cycle is already running")]
    SyncInProgress,
    #[error("sync cycle cancelled")]
    Cancelled,
    #[error("record not found: {entity}/{id}")]
    MissingRecord { entity: EntityType, id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: LocalStore::DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub entity_type: EntityType,
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub watermark: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Conflict,
    Permanent,
}

impl From<&RemoteError> for FailureKind {
    fn from(err: &RemoteError) -> Self {
        match err {
            RemoteError::Transient { .. } => FailureKind::Transient,
            RemoteError::Conflict { .. } => FailureKind::Conflict,
            RemoteError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub operation_id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: FailureKind,
    pub error: String,
    /// Status the operation was left in.
    pub status: OperationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRemap {
    pub entity_type: EntityType,
    pub temporary_id: String,
    pub server_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub synced_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    pub errors: Vec<OperationError>,
    pub id_remaps: Vec<IdRemap>,
}

enum PushOutcome {
    Synced,
    Created(IdRemap),
    Rejected(Rejection),
}

/// A refused push, with the remote copy when one was read on the way.
struct Rejection {
    error: RemoteError,
    remote: Option<Record>,
}

impl From<RemoteError> for Rejection {
    fn from(error: RemoteError) -> Self {
        Self {
            error,
            remote: None,
        }
    }
}

/// Keeps the local store converging with the remote: local mutations are
/// written optimistically and queued, `sync` drains the queue, the pull
/// methods bring remote changes in. Pull, push and downloads share one cycle
/// lock and never overlap.
pub struct SyncEngine<R = RestRemote> {
    remote: R,
    store: LocalStore,
    backoff: Backoff,
    cycle: Mutex<()>,
    cancel: CancellationToken,
}

impl<R: RemoteAdapter> SyncEngine<R> {
    pub fn new(remote: R, store: LocalStore, config: EngineConfig) -> Self {
        Self {
            remote,
            store: store.with_max_retries(config.max_retries),
            backoff: config.backoff,
            cycle: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling the token stops running and future cycles at the next
    /// operation or entity boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Stores a new record under a temporary id and queues its creation.
    pub async fn create_local(
        &self,
        entity: EntityType,
        data: Map<String, Value>,
    ) -> Result<String, EngineError> {
        let payload = strip_bookkeeping(&data);
        let record = Record {
            entity_type: entity,
            id: new_temporary_id(),
            payload: payload.clone(),
            updated_at: now_utc(),
            deleted_at: None,
            revision: None,
        };
        let op = NewOperation {
            entity_type: entity,
            kind: OperationKind::Create,
            entity_id: record.id.clone(),
            payload,
            revision: None,
        };
        let queue_id = self.store.apply_local_mutation(&record, &op).await?;
        debug!(entity = %entity, id = %record.id, queue_id, "queued local create");
        Ok(record.id)
    }

    /// Replaces the business fields of a stored record and queues the update
    /// with the revision it was last seen at.
    pub async fn update_local(
        &self,
        entity: EntityType,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<i64, EngineError> {
        let existing = self.existing_record(entity, id).await?;
        let payload = strip_bookkeeping(&data);
        let op = NewOperation {
            entity_type: entity,
            kind: OperationKind::Update,
            entity_id: id.to_string(),
            payload: payload.clone(),
            revision: existing.revision,
        };
        let record = Record {
            payload,
            updated_at: now_utc(),
            ..existing
        };
        let queue_id = self.store.apply_local_mutation(&record, &op).await?;
        debug!(entity = %entity, id, queue_id, "queued local update");
        Ok(queue_id)
    }

    /// Tombstones a stored record and queues the remote soft delete.
    pub async fn delete_local(&self, entity: EntityType, id: &str) -> Result<i64, EngineError> {
        let existing = self.existing_record(entity, id).await?;
        let now = now_utc();
        let op = NewOperation {
            entity_type: entity,
            kind: OperationKind::Delete,
            entity_id: id.to_string(),
            payload: Map::new(),
            revision: existing.revision,
        };
        let record = Record {
            updated_at: now,
            deleted_at: Some(now),
            ..existing
        };
        let queue_id = self.store.apply_local_mutation(&record, &op).await?;
        debug!(entity = %entity, id, queue_id, "queued local delete");
        Ok(queue_id)
    }

    pub async fn outbox_status(&self) -> Result<OutboxStatus, EngineError> {
        Ok(self.store.outbox_status().await?)
    }

    pub async fn list_local(&self, entity: EntityType) -> Result<Vec<Record>, EngineError> {
        Ok(self.store.get_all(entity).await?)
    }

    pub async fn list_outbox(&self) -> Result<Vec<OutboxOperation>, EngineError> {
        Ok(self.store.list_ops().await?)
    }

    pub async fn cursors(&self) -> Result<Vec<Cursor>, EngineError> {
        Ok(self.store.list_cursors().await?)
    }

    pub async fn designacoes_for_programa(
        &self,
        programa_id: &str,
    ) -> Result<Vec<Record>, EngineError> {
        Ok(self.store.designacoes_for_programa(programa_id).await?)
    }

    pub async fn requeue_failed(&self, queue_id: i64) -> Result<bool, EngineError> {
        let requeued = self.store.requeue_failed(queue_id).await?;
        if requeued {
            info!(queue_id, "failed operation requeued");
        }
        Ok(requeued)
    }

    async fn existing_record(&self, entity: EntityType, id: &str) -> Result<Record, EngineError> {
        self.store
            .get(entity, id)
            .await?
            .ok_or_else(|| EngineError::MissingRecord {
                entity,
                id: id.to_string(),
            })
    }

    fn begin_cycle(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.cycle
            .try_lock()
            .map_err(|_| EngineError::SyncInProgress)
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

include!("engine_impl_pull.rs");
include!("engine_impl_push.rs");

#[cfg(test)]
mod tests {
    use super::*;
    use parte_core::RestClient;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> EngineConfig {
        EngineConfig {
            max_retries: 3,
            backoff: Backoff::immediate(),
        }
    }

    async fn make_engine(server: &MockServer) -> SyncEngine {
        let client = RestClient::new(&server.uri(), "test-key").unwrap();
        let store = LocalStore::new("sqlite::memory:").await.unwrap();
        SyncEngine::new(RestRemote::new(client), store, test_config())
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn ts(raw: &str) -> OffsetDateTime {
        parte_core::parse_timestamp(raw).unwrap()
    }

    include!("engine_tests/part1.rs");
    include!("engine_tests/part2.rs");
    include!("engine_tests/part3.rs");
}
