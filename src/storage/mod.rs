//! Durable and in-memory key/value storage for the version and endpoint tables.

pub mod kv;
