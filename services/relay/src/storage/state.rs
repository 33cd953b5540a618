//! Encrypted SQLite state store.
//!
//! # Schema
//! Two stores share this module: the messaging store (`messaging.sql` --
//! scheduler queue + tail cursor) and the app store (`app.sql` -- contexts,
//! attachment cache, rules, plans).
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON. PRAGMA integrity_check runs at open; a failure is
//! `StorageError::Corrupt`, which the supervisor treats as fatal.
//!
//! # Encryption
//! Sensitive columns hold `base64(nonce || AES-256-GCM ciphertext)` under the
//! keychain key. Keys, cursors, timestamps, and status columns stay plaintext
//! so predicates (`WHERE status = 'pending'`, `ORDER BY send_at`) keep
//! working against the encrypted rows.
//!
//! # Locking
//! One connection per store behind an async mutex: writes serialize, and no
//! caller holds a transaction across an await point. SQLITE_BUSY retries with
//! bounded backoff for up to 5 s before propagating `StorageError::Locked`.

use crate::secrets::StateKey;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Scheduler queue + tail cursor tables.
pub const MESSAGING_SCHEMA: &str = include_str!("messaging.sql");
/// Contexts, attachment cache, rules, plans tables.
pub const APP_SCHEMA: &str = include_str!("app.sql");

const BUSY_RETRY_WINDOW: Duration = Duration::from_secs(5);
const BUSY_RETRY_INITIAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Integrity check failed or the file is unreadable as a database.
    /// Fatal: the supervisor exits rather than run against corrupt state.
    #[error("state store corrupt: {0}")]
    Corrupt(String),
    /// SQLITE_BUSY persisted past the retry window.
    #[error("state store locked: {0}")]
    Locked(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("state decryption failed: {0}")]
    Crypto(String),
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// One encrypted SQLite store. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    cipher: Arc<Aes256Gcm>,
}

impl StateStore {
    /// Open (or create) a store at `path`, apply PRAGMAs, verify integrity,
    /// and apply `schema`.
    pub fn open(path: &Path, key: &StateKey, schema: &str) -> Result<Self, StorageError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .map_err(|e| StorageError::Corrupt(format!("creating data dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(schema)?;

        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(StateStore {
            conn: Arc::new(Mutex::new(conn)),
            cipher: Arc::new(cipher),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory(key: &StateKey, schema: &str) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema)?;
        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(StateStore {
            conn: Arc::new(Mutex::new(conn)),
            cipher: Arc::new(cipher),
        })
    }

    /// Run `f` against the connection, retrying SQLITE_BUSY with bounded
    /// backoff. The mutex is released between attempts.
    pub async fn call<T, F>(&self, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let deadline = Instant::now() + BUSY_RETRY_WINDOW;
        let mut delay = BUSY_RETRY_INITIAL;
        loop {
            let result = {
                let conn = self.conn.lock().await;
                f(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    if Instant::now() + delay > deadline {
                        return Err(StorageError::Locked(e.to_string()));
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(StorageError::Sqlite(e)),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Blob encryption
    // -----------------------------------------------------------------------

    /// Encrypt a sensitive column value: `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // Aes256Gcm::encrypt only fails on absurd plaintext lengths.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption");
        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        BASE64.encode(blob)
    }

    /// Decrypt a column value produced by [`StateStore::encrypt`].
    pub fn decrypt(&self, blob: &str) -> Result<String, StorageError> {
        let bytes = BASE64
            .decode(blob)
            .map_err(|e| StorageError::Crypto(format!("not base64: {e}")))?;
        if bytes.len() < 12 {
            return Err(StorageError::Crypto("blob shorter than nonce".to_owned()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StorageError::Crypto("AEAD tag mismatch".to_owned()))?;
        String::from_utf8(plaintext).map_err(|e| StorageError::Crypto(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StorageError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StorageError::Corrupt(result));
    }
    Ok(())
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi, _)
            if ffi.code == rusqlite::ErrorCode::DatabaseBusy
                || ffi.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn test_key() -> StateKey {
        StateKey([7u8; 32])
    }

    #[tokio::test]
    async fn open_applies_schema_and_round_trips_rows() {
        let store = StateStore::open_in_memory(&test_key(), MESSAGING_SCHEMA).unwrap();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO cursor_state (id, last_source_row_id) VALUES (1, 42)",
                    [],
                )
            })
            .await
            .unwrap();
        let cursor: i64 = store
            .call(|conn| {
                conn.query_row(
                    "SELECT last_source_row_id FROM cursor_state WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(cursor, 42);
    }

    #[tokio::test]
    async fn conditional_update_reports_row_change_count() {
        let store = StateStore::open_in_memory(&test_key(), MESSAGING_SCHEMA).unwrap();
        store
            .call(|conn| {
                conn.execute(
                    "INSERT INTO scheduled_messages
                         (id, thread_id, message_text, send_at, status, created_at)
                     VALUES ('u1', 'T1', 'blob', '2026-01-01T00:00:00Z', 'pending',
                             '2026-01-01T00:00:00Z')",
                    [],
                )
            })
            .await
            .unwrap();

        let first = store
            .call(|conn| {
                conn.execute(
                    "UPDATE scheduled_messages SET status = 'sent'
                     WHERE id = ?1 AND status = 'pending'",
                    params!["u1"],
                )
            })
            .await
            .unwrap();
        let second = store
            .call(|conn| {
                conn.execute(
                    "UPDATE scheduled_messages SET status = 'sent'
                     WHERE id = ?1 AND status = 'pending'",
                    params!["u1"],
                )
            })
            .await
            .unwrap();
        assert_eq!(first, 1, "first claim wins");
        assert_eq!(second, 0, "second claim loses");
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let store = StateStore::open_in_memory(&test_key(), APP_SCHEMA).unwrap();
        let blob = store.encrypt("secret payload \u{1f512} with emoji");
        assert_ne!(blob, "secret payload \u{1f512} with emoji");
        assert_eq!(
            store.decrypt(&blob).unwrap(),
            "secret payload \u{1f512} with emoji"
        );
    }

    #[test]
    fn encrypt_uses_fresh_nonce_per_call() {
        let store = StateStore::open_in_memory(&test_key(), APP_SCHEMA).unwrap();
        assert_ne!(store.encrypt("same"), store.encrypt("same"));
    }

    #[test]
    fn decrypt_rejects_tampered_blob() {
        let store = StateStore::open_in_memory(&test_key(), APP_SCHEMA).unwrap();
        let blob = store.encrypt("payload");
        let mut bytes = BASE64.decode(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let tampered = BASE64.encode(bytes);
        assert!(matches!(
            store.decrypt(&tampered),
            Err(StorageError::Crypto(_))
        ));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let store_a = StateStore::open_in_memory(&StateKey([1u8; 32]), APP_SCHEMA).unwrap();
        let store_b = StateStore::open_in_memory(&StateKey([2u8; 32]), APP_SCHEMA).unwrap();
        let blob = store_a.encrypt("payload");
        assert!(store_b.decrypt(&blob).is_err());
    }
}
