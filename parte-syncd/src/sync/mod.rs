pub mod backoff;
mod conflict;
pub mod cursor;
pub mod engine;
pub mod outbox;
pub mod remote;
pub mod store;
