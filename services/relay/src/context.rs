//! Per-chat mini-app context records.
//!
//! One row per thread. `upsert` always lands the record in `active`;
//! `complete` and `clear` flip an active row to its terminal state and are
//! idempotent against rows already terminal. A later `upsert` on the same
//! thread starts a fresh active record (a new room supersedes a finished
//! one).

use crate::storage::{StateStore, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Active,
    Completed,
    Cleared,
}

impl ContextState {
    fn as_str(self) -> &'static str {
        match self {
            ContextState::Active => "active",
            ContextState::Completed => "completed",
            ContextState::Cleared => "cleared",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ContextState::Active),
            "completed" => Some(ContextState::Completed),
            "cleared" => Some(ContextState::Cleared),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub thread_id: String,
    pub app_id: String,
    pub room_id: String,
    pub state: ContextState,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ContextStore {
    store: StateStore,
}

impl ContextStore {
    pub fn new(store: StateStore) -> Self {
        ContextStore { store }
    }

    /// Create or refresh the thread's context; the row always ends `active`.
    pub async fn upsert(
        &self,
        thread_id: &str,
        app_id: &str,
        room_id: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        let metadata_blob = self
            .store
            .encrypt(&serde_json::Value::Object(metadata).to_string());
        let now = Utc::now().to_rfc3339();
        let thread_id = thread_id.to_owned();
        let app_id = app_id.to_owned();
        let room_id = room_id.to_owned();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO chat_contexts
                         (thread_id, app_id, room_id, state, metadata, updated_at)
                     VALUES (?1, ?2, ?3, 'active', ?4, ?5)
                     ON CONFLICT(thread_id) DO UPDATE SET
                         app_id = excluded.app_id,
                         room_id = excluded.room_id,
                         state = 'active',
                         metadata = excluded.metadata,
                         updated_at = excluded.updated_at",
                    params![thread_id, app_id, room_id, metadata_blob, now],
                )
            })
            .await?;
        Ok(())
    }

    /// Flip an active record to `completed`. Returns false when the thread
    /// has no active record for `app_id` (already terminal is not an error).
    pub async fn complete(&self, thread_id: &str, app_id: &str) -> Result<bool, StorageError> {
        let now = Utc::now().to_rfc3339();
        let thread_id = thread_id.to_owned();
        let app_id = app_id.to_owned();
        let changed = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE chat_contexts SET state = 'completed', updated_at = ?3
                     WHERE thread_id = ?1 AND app_id = ?2 AND state = 'active'",
                    params![thread_id, app_id, now],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    /// Flip an active record to `cleared`, recording the reason in metadata.
    /// Idempotent against already-terminal records.
    pub async fn clear(&self, thread_id: &str, reason: &str) -> Result<bool, StorageError> {
        let Some(mut record) = self.get(thread_id).await? else {
            return Ok(false);
        };
        if record.state != ContextState::Active {
            return Ok(false);
        }
        record
            .metadata
            .insert("clear_reason".to_owned(), reason.into());
        let metadata_blob = self
            .store
            .encrypt(&serde_json::Value::Object(record.metadata).to_string());
        let now = Utc::now().to_rfc3339();
        let thread_id = thread_id.to_owned();
        let changed = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE chat_contexts
                     SET state = 'cleared', metadata = ?2, updated_at = ?3
                     WHERE thread_id = ?1 AND state = 'active'",
                    params![thread_id, metadata_blob, now],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    pub async fn get(&self, thread_id: &str) -> Result<Option<ContextRecord>, StorageError> {
        let thread_id_owned = thread_id.to_owned();
        let row: Option<(String, String, String, String, String, String)> = self
            .store
            .call(move |conn| {
                conn.query_row(
                    "SELECT thread_id, app_id, room_id, state, metadata, updated_at
                     FROM chat_contexts WHERE thread_id = ?1",
                    params![thread_id_owned],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;
        row.map(|r| self.decode(r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ContextRecord>, StorageError> {
        let rows: Vec<(String, String, String, String, String, String)> = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT thread_id, app_id, room_id, state, metadata, updated_at
                     FROM chat_contexts ORDER BY updated_at DESC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    fn decode(
        &self,
        (thread_id, app_id, room_id, state, metadata_blob, updated_at): (
            String,
            String,
            String,
            String,
            String,
            String,
        ),
    ) -> Result<ContextRecord, StorageError> {
        let state = ContextState::parse(&state)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown context state '{state}'")))?;
        let metadata_json = self.store.decrypt(&metadata_blob)?;
        let metadata = match serde_json::from_str(&metadata_json) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => {
                return Err(StorageError::Corrupt(
                    "context metadata is not a JSON object".to_owned(),
                ));
            }
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StorageError::Corrupt(format!("bad updated_at: {e}")))?
            .with_timezone(&Utc);
        Ok(ContextRecord {
            thread_id,
            app_id,
            room_id,
            state,
            metadata,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StateKey;
    use crate::storage::APP_SCHEMA;

    fn make_store() -> ContextStore {
        let store = StateStore::open_in_memory(&StateKey([9u8; 32]), APP_SCHEMA).unwrap();
        ContextStore::new(store)
    }

    fn meta(key: &str, value: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert(key.to_owned(), value.into());
        m
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let contexts = make_store();
        contexts
            .upsert("T1", "trivia", "room-9", meta("score", "3"))
            .await
            .unwrap();

        let record = contexts.get("T1").await.unwrap().unwrap();
        assert_eq!(record.app_id, "trivia");
        assert_eq!(record.room_id, "room-9");
        assert_eq!(record.state, ContextState::Active);
        assert_eq!(record.metadata["score"], "3");
    }

    #[tokio::test]
    async fn complete_is_idempotent_on_terminal_records() {
        let contexts = make_store();
        contexts
            .upsert("T1", "trivia", "room-9", meta("k", "v"))
            .await
            .unwrap();

        assert!(contexts.complete("T1", "trivia").await.unwrap());
        assert!(!contexts.complete("T1", "trivia").await.unwrap());
        let record = contexts.get("T1").await.unwrap().unwrap();
        assert_eq!(record.state, ContextState::Completed);
    }

    #[tokio::test]
    async fn complete_requires_matching_app() {
        let contexts = make_store();
        contexts
            .upsert("T1", "trivia", "room-9", meta("k", "v"))
            .await
            .unwrap();

        assert!(!contexts.complete("T1", "other-app").await.unwrap());
        let record = contexts.get("T1").await.unwrap().unwrap();
        assert_eq!(record.state, ContextState::Active);
    }

    #[tokio::test]
    async fn clear_records_reason_and_is_idempotent() {
        let contexts = make_store();
        contexts
            .upsert("T1", "trivia", "room-9", meta("k", "v"))
            .await
            .unwrap();

        assert!(contexts.clear("T1", "session ended").await.unwrap());
        assert!(!contexts.clear("T1", "again").await.unwrap());

        let record = contexts.get("T1").await.unwrap().unwrap();
        assert_eq!(record.state, ContextState::Cleared);
        assert_eq!(record.metadata["clear_reason"], "session ended");
    }

    #[tokio::test]
    async fn update_after_reset_matches_single_update() {
        // context_update(T, k=v); context_reset(T); context_update(T, k=v)
        // must land in the same final state as one context_update.
        let contexts = make_store();
        contexts
            .upsert("T1", "trivia", "room-9", meta("k", "v"))
            .await
            .unwrap();
        contexts.clear("T1", "reset").await.unwrap();
        contexts
            .upsert("T1", "trivia", "room-9", meta("k", "v"))
            .await
            .unwrap();

        let record = contexts.get("T1").await.unwrap().unwrap();
        assert_eq!(record.state, ContextState::Active);
        assert_eq!(record.app_id, "trivia");
        assert_eq!(record.metadata.get("k").unwrap(), "v");
        assert!(record.metadata.get("clear_reason").is_none());
    }

    #[tokio::test]
    async fn list_returns_all_threads() {
        let contexts = make_store();
        contexts
            .upsert("T1", "a", "r1", meta("k", "1"))
            .await
            .unwrap();
        contexts
            .upsert("T2", "b", "r2", meta("k", "2"))
            .await
            .unwrap();
        let all = contexts.list().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
