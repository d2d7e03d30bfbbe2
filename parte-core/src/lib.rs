mod client;
mod row;

pub use client::{ApiErrorClass, RestClient, RestError};
pub use row::{Row, format_timestamp, parse_timestamp, strip_bookkeeping};
