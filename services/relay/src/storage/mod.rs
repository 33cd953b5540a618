//! Encrypted-at-rest local persistence.

pub mod state;

pub use state::{APP_SCHEMA, MESSAGING_SCHEMA, StateStore, StorageError};
