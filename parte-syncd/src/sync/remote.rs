use async_trait::async_trait;
use parte_core::{ApiErrorClass, RestClient, RestError, Row};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use super::store::{EntityType, Record};

pub const DEFAULT_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<u64>,
    },
    #[error(
        "revision conflict on {entity_id}: local {local_revision:?}, remote {remote_revision:?}"
    )]
    Conflict {
        entity_id: String,
        local_revision: Option<i64>,
        remote_revision: Option<i64>,
    },
    #[error("remote rejected the operation: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<RestError> for RemoteError {
    fn from(err: RestError) -> Self {
        let message = err.to_string();
        match err.classification() {
            Some(ApiErrorClass::Auth) => RemoteError::Permanent(message),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => RemoteError::Transient {
                message,
                retry_after: err.retry_after_secs(),
            },
            Some(ApiErrorClass::Permanent) => RemoteError::Permanent(message),
            None if err.is_retryable() => RemoteError::transient(message),
            None => RemoteError::Permanent(message),
        }
    }
}

/// Boundary to the authoritative backend. Every call addresses one entity
/// type; returned records carry the server's bookkeeping columns.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Records modified strictly after `since`, oldest first, tombstones
    /// included.
    async fn list(
        &self,
        entity: EntityType,
        since: OffsetDateTime,
    ) -> Result<Vec<Record>, RemoteError>;

    async fn fetch(&self, entity: EntityType, id: &str) -> Result<Option<Record>, RemoteError>;

    async fn insert(
        &self,
        entity: EntityType,
        payload: &Map<String, Value>,
    ) -> Result<Record, RemoteError>;

    /// With `expected_revision` the write only lands while the remote still
    /// holds that revision.
    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &Map<String, Value>,
        expected_revision: Option<i64>,
    ) -> Result<Record, RemoteError>;

    async fn soft_delete(
        &self,
        entity: EntityType,
        id: &str,
        at: OffsetDateTime,
    ) -> Result<Record, RemoteError>;
}

/// `RemoteAdapter` over the PostgREST tables named after each entity type.
#[derive(Clone)]
pub struct RestRemote {
    client: RestClient,
    page_size: u32,
}

impl RestRemote {
    pub fn new(client: RestClient) -> Self {
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl RemoteAdapter for RestRemote {
    async fn list(
        &self,
        entity: EntityType,
        since: OffsetDateTime,
    ) -> Result<Vec<Record>, RemoteError> {
        let rows = self
            .client
            .list_since_all(entity.as_str(), since, self.page_size)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| record_from_row(entity, row))
            .collect())
    }

    async fn fetch(&self, entity: EntityType, id: &str) -> Result<Option<Record>, RemoteError> {
        let row = self.client.fetch(entity.as_str(), id).await?;
        Ok(row.map(|row| record_from_row(entity, row)))
    }

    async fn insert(
        &self,
        entity: EntityType,
        payload: &Map<String, Value>,
    ) -> Result<Record, RemoteError> {
        let row = self.client.insert(entity.as_str(), payload).await?;
        Ok(record_from_row(entity, row))
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &Map<String, Value>,
        expected_revision: Option<i64>,
    ) -> Result<Record, RemoteError> {
        match self
            .client
            .update(entity.as_str(), id, payload, expected_revision)
            .await?
        {
            Some(row) => Ok(record_from_row(entity, row)),
            // The filter matched nothing: either the revision moved or the
            // row is gone. A re-read tells which.
            None if expected_revision.is_some() => {
                match self.client.fetch(entity.as_str(), id).await? {
                    Some(row) => Err(RemoteError::Conflict {
                        entity_id: id.to_string(),
                        local_revision: expected_revision,
                        remote_revision: row.revision,
                    }),
                    None => Err(missing_row(entity, id)),
                }
            }
            None => Err(missing_row(entity, id)),
        }
    }

    async fn soft_delete(
        &self,
        entity: EntityType,
        id: &str,
        at: OffsetDateTime,
    ) -> Result<Record, RemoteError> {
        self.client
            .soft_delete(entity.as_str(), id, at)
            .await?
            .map(|row| record_from_row(entity, row))
            .ok_or_else(|| missing_row(entity, id))
    }
}

fn missing_row(entity: EntityType, id: &str) -> RemoteError {
    RemoteError::Permanent(format!("{entity}/{id} does not exist remotely"))
}

fn record_from_row(entity: EntityType, row: Row) -> Record {
    Record {
        entity_type: entity,
        id: row.id,
        payload: row.fields,
        updated_at: row.updated_at,
        deleted_at: row.deleted_at,
        revision: row.revision,
    }
}
