use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::client::RestError;

/// Bookkeeping columns every synced table carries next to its business fields.
pub const ID_COLUMN: &str = "id";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const DELETED_AT_COLUMN: &str = "deleted_at";
pub const REVISION_COLUMN: &str = "revision";

/// One table row as returned by the REST API, with the bookkeeping columns
/// lifted out of the JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    pub revision: Option<i64>,
    pub fields: Map<String, Value>,
}

impl Row {
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, RestError> {
        let id = match object.remove(ID_COLUMN) {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            Some(other) => return Err(RestError::InvalidRow(format!("unexpected id: {other}"))),
            None => return Err(RestError::InvalidRow("row has no id".to_string())),
        };
        // Rows written before the column existed come back with a null stamp.
        let updated_at = optional_timestamp(object.remove(UPDATED_AT_COLUMN))?
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let deleted_at = optional_timestamp(object.remove(DELETED_AT_COLUMN))?;
        let revision = match object.remove(REVISION_COLUMN) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(RestError::InvalidRow(format!(
                    "unexpected revision: {other}"
                )));
            }
        };
        Ok(Self {
            id,
            updated_at,
            deleted_at,
            revision,
            fields: object,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, RestError> {
        match value {
            Value::Object(object) => Self::from_object(object),
            other => Err(RestError::InvalidRow(format!("expected object, got {other}"))),
        }
    }
}

/// Removes the bookkeeping columns from an outgoing body; the server owns them.
pub fn strip_bookkeeping(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(key, _)| {
            !matches!(
                key.as_str(),
                ID_COLUMN | UPDATED_AT_COLUMN | DELETED_AT_COLUMN | REVISION_COLUMN
            )
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn optional_timestamp(value: Option<Value>) -> Result<Option<OffsetDateTime>, RestError> {
    match value {
        Some(Value::String(raw)) => Ok(Some(parse_timestamp(&raw)?)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(RestError::InvalidRow(format!(
            "unexpected timestamp: {other}"
        ))),
    }
}

pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, RestError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| RestError::InvalidRow(format!("bad timestamp {raw:?}: {err}")))
}

pub fn format_timestamp(value: OffsetDateTime) -> Result<String, RestError> {
    Ok(value.format(&Rfc3339)?)
}
