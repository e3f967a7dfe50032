//! Data models (database entities and wire-level types).

pub mod payme;
pub mod transaction;
