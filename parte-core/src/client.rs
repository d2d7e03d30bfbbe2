use std::time::SystemTime;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::row::{self, DELETED_AT_COLUMN, Row};

const REST_PREFIX: &str = "/rest/v1/";

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("timestamp formatting failed: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("api returned no representation for the written row")]
    EmptyRepresentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: Url,
    api_key: String,
    access_token: String,
}

impl RestClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, RestError> {
        let api_key = api_key.into();
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            access_token: api_key.clone(),
            api_key,
        })
    }

    /// Uses a user session token for `Authorization` instead of the API key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = token.into();
        self
    }

    /// One page of rows modified strictly after `since`, oldest first.
    pub async fn list_since(
        &self,
        table: &str,
        since: OffsetDateTime,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Row>, RestError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("updated_at", &format!("gt.{}", row::format_timestamp(since)?))
            .append_pair("order", "updated_at.asc,id.asc")
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_rows(response).await
    }

    pub async fn list_since_all(
        &self,
        table: &str,
        since: OffsetDateTime,
        page_size: u32,
    ) -> Result<Vec<Row>, RestError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut rows = Vec::new();
        loop {
            let page = self.list_since(table, since, page_size, offset).await?;
            let fetched = page.len() as u32;
            offset = offset.saturating_add(fetched);
            rows.extend(page);
            if fetched < page_size {
                break;
            }
        }
        Ok(rows)
    }

    pub async fn fetch(&self, table: &str, id: &str) -> Result<Option<Row>, RestError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("select", "*")
            .append_pair("id", &format!("eq.{id}"));
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(Self::handle_rows(response).await?.into_iter().next())
    }

    pub async fn insert(&self, table: &str, fields: &Map<String, Value>) -> Result<Row, RestError> {
        let url = self.table_url(table)?;
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", "return=representation")
            .json(&row::strip_bookkeeping(fields))
            .send()
            .await?;
        Self::handle_rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or(RestError::EmptyRepresentation)
    }

    /// Patches a row. With `expected_revision` the write only matches while the
    /// stored revision is unchanged; `Ok(None)` means no row matched.
    pub async fn update(
        &self,
        table: &str,
        id: &str,
        fields: &Map<String, Value>,
        expected_revision: Option<i64>,
    ) -> Result<Option<Row>, RestError> {
        let mut url = self.table_url(table)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &format!("eq.{id}"));
            if let Some(revision) = expected_revision {
                query.append_pair("revision", &format!("eq.{revision}"));
            }
        }
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=representation")
            .json(&row::strip_bookkeeping(fields))
            .send()
            .await?;
        Ok(Self::handle_rows(response).await?.into_iter().next())
    }

    pub async fn soft_delete(
        &self,
        table: &str,
        id: &str,
        at: OffsetDateTime,
    ) -> Result<Option<Row>, RestError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        let mut body = Map::new();
        body.insert(
            DELETED_AT_COLUMN.to_string(),
            Value::String(row::format_timestamp(at)?),
        );
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        Ok(Self::handle_rows(response).await?.into_iter().next())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.access_token))
    }

    fn table_url(&self, table: &str) -> Result<Url, RestError> {
        Ok(self.base_url.join(REST_PREFIX)?.join(table)?)
    }

    async fn handle_rows(response: reqwest::Response) -> Result<Vec<Row>, RestError> {
        if response.status().is_success() {
            let values = response.json::<Vec<Value>>().await?;
            values.into_iter().map(Row::from_value).collect()
        } else {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            Err(RestError::Api {
                status,
                body,
                retry_after,
            })
        }
    }
}

impl RestError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            RestError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RestError::Request(err) => !(err.is_decode() || err.is_builder()),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RestError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|wait| wait.as_secs())
            .unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::FORBIDDEN),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::CONFLICT),
            ApiErrorClass::Permanent
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn parses_retry_after_seconds_and_dates() {
        assert_eq!(parse_retry_after("12"), Some(12));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(0));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn table_url_keeps_rest_prefix() {
        let client = RestClient::new("https://example.supabase.co", "key").unwrap();
        let url = client.table_url("estudantes").unwrap();
        assert_eq!(url.as_str(), "https://example.supabase.co/rest/v1/estudantes");
    }
}
