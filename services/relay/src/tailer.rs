//! Chat-source tailer.
//!
//! Reads the external chat application's SQLite store (read-only, never
//! written) and emits an ordered, duplicate-free stream of new inbound
//! messages after the persisted cursor.
//!
//! # Cursor contract
//! The cursor is the largest `source_row_id` already handed to the caller.
//! `poll` returns a batch plus the candidate cursor; the caller commits the
//! cursor only after accepting the batch, so a crash between poll and commit
//! re-delivers rather than drops. On first open the cursor initializes to
//! the store's current max row id -- historical backlog is skipped.
//!
//! # External-store timestamps
//! The store's `date` column is ticks since 2001-01-01T00:00:00Z (nanosecond
//! ticks on current schema versions, whole seconds on ancient ones).

use crate::attachments::AttachmentResolver;
use crate::storage::{StateStore, StorageError};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Seconds between the Unix epoch and the chat store's 2001-01-01 reference.
const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;

/// Max rows fetched per poll.
const POLL_BATCH_LIMIT: u32 = 100;

const POLL_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One new inbound message. Lives only across one ingest pipeline execution.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub source_row_id: i64,
    pub thread_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub participants: Vec<String>,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub guid: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub absolute_path: PathBuf,
}

/// One poll's worth of messages plus the cursor to commit on acceptance.
#[derive(Debug, Default)]
pub struct TailBatch {
    pub messages: Vec<InboundMessage>,
    /// Largest row id observed; commit this after accepting the batch.
    pub cursor: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExternalStoreError {
    #[error("chat store unreadable: {0}")]
    Unreadable(String),
    #[error("chat store query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Cursor persistence
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CursorStore {
    store: StateStore,
}

impl CursorStore {
    pub fn new(store: StateStore) -> Self {
        CursorStore { store }
    }

    pub async fn get(&self) -> Result<Option<i64>, StorageError> {
        self.store
            .call(|conn| {
                conn.query_row(
                    "SELECT last_source_row_id FROM cursor_state WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn set(&self, cursor: i64) -> Result<(), StorageError> {
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cursor_state (id, last_source_row_id) VALUES (1, ?1)
                     ON CONFLICT(id) DO UPDATE SET
                         last_source_row_id = MAX(last_source_row_id, excluded.last_source_row_id)",
                    params![cursor],
                )
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Read-only chat store access
// ---------------------------------------------------------------------------

/// The external store connection. All queries run read-only.
pub struct ChatSource {
    conn: Mutex<Connection>,
    attachments_root: PathBuf,
}

impl ChatSource {
    pub fn open(db_path: &Path, attachments_root: &Path) -> Result<Self, ExternalStoreError> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ExternalStoreError::Unreadable(format!("{}: {e}", db_path.display())))?;
        conn.busy_timeout(POLL_QUERY_TIMEOUT)?;
        Ok(ChatSource {
            conn: Mutex::new(conn),
            attachments_root: attachments_root.to_owned(),
        })
    }

    /// Current max message row id (0 for an empty store).
    pub fn max_row_id(&self) -> Result<i64, ExternalStoreError> {
        let conn = self.conn.lock().expect("chat source mutex");
        let max: Option<i64> =
            conn.query_row("SELECT MAX(ROWID) FROM message", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    /// Fetch up to [`POLL_BATCH_LIMIT`] peer-authored messages after
    /// `cursor`, ordered by row id, joined with chat, sender, and
    /// attachments.
    pub fn fetch_after(&self, cursor: i64) -> Result<Vec<InboundMessage>, ExternalStoreError> {
        let conn = self.conn.lock().expect("chat source mutex");
        let mut stmt = conn.prepare_cached(
            "SELECT m.ROWID, m.text, m.date, m.cache_has_attachments,
                    c.ROWID, c.chat_identifier, h.id
             FROM message m
             JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
             JOIN chat c ON c.ROWID = cmj.chat_id
             LEFT JOIN handle h ON h.ROWID = m.handle_id
             WHERE m.ROWID > ?1
               AND m.is_from_me = 0
               AND ((m.text IS NOT NULL AND length(m.text) > 0)
                    OR m.cache_has_attachments = 1)
             ORDER BY m.ROWID ASC
             LIMIT ?2",
        )?;

        struct RawRow {
            row_id: i64,
            text: Option<String>,
            date: i64,
            has_attachments: bool,
            chat_row_id: i64,
            chat_identifier: String,
            sender: Option<String>,
        }

        let raw_rows: Vec<RawRow> = stmt
            .query_map(params![cursor, POLL_BATCH_LIMIT], |row| {
                Ok(RawRow {
                    row_id: row.get(0)?,
                    text: row.get(1)?,
                    date: row.get(2)?,
                    has_attachments: row.get::<_, i64>(3)? != 0,
                    chat_row_id: row.get(4)?,
                    chat_identifier: row.get(5)?,
                    sender: row.get(6)?,
                })
            })?
            .collect::<Result<_, _>>()?;

        let mut messages = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let attachments = if raw.has_attachments {
                self.attachments_for(&conn, raw.row_id)?
            } else {
                Vec::new()
            };
            let text = raw.text.unwrap_or_default();
            // Null text with nothing resolvable carries no signal; drop it.
            if text.is_empty() && attachments.is_empty() {
                continue;
            }
            let is_group = is_group_chat(&raw.chat_identifier);
            let participants = if is_group {
                self.participants_for(&conn, raw.chat_row_id)?
            } else {
                Vec::new()
            };
            messages.push(InboundMessage {
                source_row_id: raw.row_id,
                thread_id: raw.chat_identifier,
                sender_id: raw.sender.unwrap_or_else(|| "unknown".to_owned()),
                text,
                timestamp: ticks_to_utc(raw.date),
                is_group,
                participants,
                attachments,
            });
        }
        Ok(messages)
    }

    fn attachments_for(
        &self,
        conn: &Connection,
        message_row_id: i64,
    ) -> Result<Vec<AttachmentRef>, ExternalStoreError> {
        let mut stmt = conn.prepare_cached(
            "SELECT a.guid, a.filename, a.mime_type, a.total_bytes
             FROM attachment a
             JOIN message_attachment_join maj ON maj.attachment_id = a.ROWID
             WHERE maj.message_id = ?1
             ORDER BY a.ROWID ASC",
        )?;
        let rows: Vec<(String, Option<String>, Option<String>, i64)> = stmt
            .query_map(params![message_row_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut refs = Vec::new();
        for (guid, filename, mime_type, total_bytes) in rows {
            // An attachment without a filename cannot be resolved to disk.
            let Some(filename) = filename else { continue };
            refs.push(AttachmentRef {
                guid,
                mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
                size_bytes: u64::try_from(total_bytes).unwrap_or(0),
                absolute_path: self.resolve_path(&filename),
            });
        }
        Ok(refs)
    }

    fn participants_for(
        &self,
        conn: &Connection,
        chat_row_id: i64,
    ) -> Result<Vec<String>, ExternalStoreError> {
        let mut stmt = conn.prepare_cached(
            "SELECT h.id
             FROM chat_handle_join chj
             JOIN handle h ON h.ROWID = chj.handle_id
             WHERE chj.chat_id = ?1
             ORDER BY h.id ASC",
        )?;
        let rows = stmt
            .query_map(params![chat_row_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// Look up a single attachment by guid (upload-retry path).
    pub fn attachment_by_guid(&self, guid: &str) -> Result<Option<AttachmentRef>, ExternalStoreError> {
        let conn = self.conn.lock().expect("chat source mutex");
        let row: Option<(String, Option<String>, Option<String>, i64)> = conn
            .query_row(
                "SELECT guid, filename, mime_type, total_bytes
                 FROM attachment WHERE guid = ?1",
                params![guid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((guid, filename, mime_type, total_bytes)) = row else {
            return Ok(None);
        };
        let Some(filename) = filename else {
            return Ok(None);
        };
        Ok(Some(AttachmentRef {
            guid,
            mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
            size_bytes: u64::try_from(total_bytes).unwrap_or(0),
            absolute_path: self.resolve_path(&filename),
        }))
    }

    /// The store records attachment paths under `~/Library/Messages/...`;
    /// rebase them onto the configured attachments root.
    fn resolve_path(&self, filename: &str) -> PathBuf {
        if let Some(rest) = filename
            .strip_prefix("~/Library/Messages/Attachments/")
            .or_else(|| filename.strip_prefix("Attachments/"))
        {
            return self.attachments_root.join(rest);
        }
        PathBuf::from(filename)
    }
}

// The uploader's guid-lookup capability is the chat source itself, so the
// external store keeps a single read path.
impl AttachmentResolver for ChatSource {
    fn resolve_guid(&self, guid: &str) -> Option<AttachmentRef> {
        match self.attachment_by_guid(guid) {
            Ok(found) => found,
            Err(e) => {
                warn!(guid, error = %e, "attachment lookup failed");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tailer
// ---------------------------------------------------------------------------

pub struct ChatTailer {
    source: Arc<ChatSource>,
    cursors: CursorStore,
}

impl ChatTailer {
    /// Open the tailer, initializing the cursor to the store's current max
    /// row id on first run so history is never replayed.
    pub async fn open(source: Arc<ChatSource>, cursors: CursorStore) -> Result<Self, StorageError> {
        if cursors.get().await?.is_none() {
            let max = source.max_row_id().unwrap_or_else(|e| {
                warn!(error = %e, "chat store max row id unavailable, starting cursor at 0");
                0
            });
            cursors.set(max).await?;
        }
        Ok(ChatTailer { source, cursors })
    }

    /// One tail poll. Query errors against the external store degrade to an
    /// empty batch (logged); the cursor is unchanged until [`Self::commit`].
    pub async fn poll(&self) -> Result<TailBatch, StorageError> {
        let cursor = self.cursors.get().await?.unwrap_or(0);
        let messages = match self.source.fetch_after(cursor) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, cursor, "chat store poll failed, returning empty batch");
                return Ok(TailBatch {
                    messages: Vec::new(),
                    cursor,
                });
            }
        };
        let max_row = messages
            .iter()
            .map(|m| m.source_row_id)
            .max()
            .unwrap_or(cursor);
        Ok(TailBatch {
            messages,
            cursor: max_row,
        })
    }

    /// Persist the cursor after the caller accepted the batch.
    pub async fn commit(&self, cursor: i64) -> Result<(), StorageError> {
        self.cursors.set(cursor).await
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Group chats carry a `chat` prefix in their identifier; direct threads are
/// the peer's handle (phone or email).
fn is_group_chat(chat_identifier: &str) -> bool {
    chat_identifier.starts_with("chat")
}

/// Ticks since 2001-01-01T00:00:00Z to UTC. Values too small to be
/// nanosecond ticks are treated as whole seconds (pre-2011 schema).
fn ticks_to_utc(ticks: i64) -> DateTime<Utc> {
    let (secs, nanos) = if ticks.abs() > 10_000_000_000 {
        (
            ticks / 1_000_000_000,
            u32::try_from(ticks % 1_000_000_000).unwrap_or(0),
        )
    } else {
        (ticks, 0)
    };
    Utc.timestamp_opt(secs + APPLE_EPOCH_OFFSET_SECS, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StateKey;
    use crate::storage::MESSAGING_SCHEMA;

    /// Build a minimal chat-store fixture with the tables the tailer joins.
    fn fixture_store(dir: &Path) -> PathBuf {
        let db_path = dir.join("chat.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE message (
                 ROWID INTEGER PRIMARY KEY,
                 text TEXT,
                 date INTEGER NOT NULL,
                 is_from_me INTEGER NOT NULL DEFAULT 0,
                 cache_has_attachments INTEGER NOT NULL DEFAULT 0,
                 handle_id INTEGER
             );
             CREATE TABLE chat (
                 ROWID INTEGER PRIMARY KEY,
                 chat_identifier TEXT NOT NULL
             );
             CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
             CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
             CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT NOT NULL);
             CREATE TABLE attachment (
                 ROWID INTEGER PRIMARY KEY,
                 guid TEXT NOT NULL,
                 filename TEXT,
                 mime_type TEXT,
                 total_bytes INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);

             INSERT INTO chat (ROWID, chat_identifier) VALUES
                 (1, '+15551234567'),
                 (2, 'chat8675309');
             INSERT INTO handle (ROWID, id) VALUES
                 (1, '+15551234567'),
                 (2, '+15559876543');
             INSERT INTO chat_handle_join VALUES (2, 1), (2, 2);",
        )
        .unwrap();
        db_path
    }

    fn insert_message(
        db_path: &Path,
        row_id: i64,
        chat_id: i64,
        text: Option<&str>,
        is_from_me: bool,
        date: i64,
    ) {
        let conn = Connection::open(db_path).unwrap();
        conn.execute(
            "INSERT INTO message (ROWID, text, date, is_from_me, handle_id)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![row_id, text, date, is_from_me],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chat_message_join (chat_id, message_id) VALUES (?1, ?2)",
            params![chat_id, row_id],
        )
        .unwrap();
    }

    fn cursor_store() -> CursorStore {
        CursorStore::new(StateStore::open_in_memory(&StateKey([5u8; 32]), MESSAGING_SCHEMA).unwrap())
    }

    const NS_TICKS_2026: i64 = 790_000_000_000_000_000; // ~2026 in ns ticks

    #[tokio::test]
    async fn first_open_skips_existing_history() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        insert_message(&db_path, 100, 1, Some("old news"), false, NS_TICKS_2026);

        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        let batch = tailer.poll().await.unwrap();
        assert!(batch.messages.is_empty(), "history must not replay");

        insert_message(&db_path, 101, 1, Some("Hi"), false, NS_TICKS_2026);
        let batch = tailer.poll().await.unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].source_row_id, 101);
        assert_eq!(batch.messages[0].text, "Hi");
    }

    #[tokio::test]
    async fn own_messages_are_never_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        insert_message(&db_path, 1, 1, Some("mine"), true, NS_TICKS_2026);
        insert_message(&db_path, 2, 1, Some("theirs"), false, NS_TICKS_2026);

        let batch = tailer.poll().await.unwrap();
        let texts: Vec<&str> = batch.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["theirs"]);
    }

    #[tokio::test]
    async fn poll_does_not_redeliver_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        insert_message(&db_path, 1, 1, Some("a"), false, NS_TICKS_2026);
        insert_message(&db_path, 2, 1, Some("b"), false, NS_TICKS_2026);

        let batch = tailer.poll().await.unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.cursor, 2);

        // Uncommitted poll re-delivers.
        let again = tailer.poll().await.unwrap();
        assert_eq!(again.messages.len(), 2);

        tailer.commit(batch.cursor).await.unwrap();
        let after = tailer.poll().await.unwrap();
        assert!(after.messages.is_empty());
        assert_eq!(after.cursor, 2, "cursor holds when nothing is new");
    }

    #[tokio::test]
    async fn empty_text_without_attachments_is_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        // Tapback-style row: attachments flagged but none resolvable.
        let conn = Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO message (ROWID, text, date, is_from_me, cache_has_attachments, handle_id)
             VALUES (1, NULL, ?1, 0, 1, 1)",
            params![NS_TICKS_2026],
        )
        .unwrap();
        conn.execute("INSERT INTO chat_message_join VALUES (1, 1)", [])
            .unwrap();

        let batch = tailer.poll().await.unwrap();
        assert!(batch.messages.is_empty());
    }

    #[tokio::test]
    async fn group_chats_are_classified_and_carry_participants() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        insert_message(&db_path, 1, 2, Some("group hello"), false, NS_TICKS_2026);
        insert_message(&db_path, 2, 1, Some("direct hello"), false, NS_TICKS_2026);

        let batch = tailer.poll().await.unwrap();
        let group = &batch.messages[0];
        assert!(group.is_group);
        assert_eq!(group.thread_id, "chat8675309");
        assert_eq!(group.participants, vec!["+15551234567", "+15559876543"]);

        let direct = &batch.messages[1];
        assert!(!direct.is_group);
        assert!(direct.participants.is_empty());
    }

    #[tokio::test]
    async fn attachments_resolve_against_the_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO message (ROWID, text, date, is_from_me, cache_has_attachments, handle_id)
             VALUES (1, 'look', ?1, 0, 1, 1)",
            params![NS_TICKS_2026],
        )
        .unwrap();
        conn.execute("INSERT INTO chat_message_join VALUES (1, 1)", [])
            .unwrap();
        conn.execute(
            "INSERT INTO attachment (ROWID, guid, filename, mime_type, total_bytes)
             VALUES (1, 'G-1', '~/Library/Messages/Attachments/ab/cd/photo.heic',
                     'image/heic', 12582912)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO message_attachment_join VALUES (1, 1)", [])
            .unwrap();

        let batch = tailer.poll().await.unwrap();
        let att = &batch.messages[0].attachments[0];
        assert_eq!(att.guid, "G-1");
        assert_eq!(att.mime_type, "image/heic");
        assert_eq!(att.size_bytes, 12_582_912);
        assert_eq!(att.absolute_path, dir.path().join("ab/cd/photo.heic"));
    }

    #[test]
    fn tick_conversion_handles_nanosecond_and_second_precision() {
        // 2026-01-09T00:06:40Z == 789 048 400 s after the 2001 reference.
        let from_ns = ticks_to_utc(789_048_400_000_000_000);
        let from_secs = ticks_to_utc(789_048_400);
        assert_eq!(from_ns, from_secs);
        assert_eq!(from_ns.timestamp(), 789_048_400 + APPLE_EPOCH_OFFSET_SECS);
    }

    #[tokio::test]
    async fn unreadable_store_degrades_to_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = fixture_store(dir.path());
        let source = ChatSource::open(&db_path, dir.path()).unwrap();
        let tailer = ChatTailer::open(Arc::new(source), cursor_store()).await.unwrap();

        // Drop a joined table out from under the prepared query.
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("DROP TABLE chat_message_join;").unwrap();

        let batch = tailer.poll().await.unwrap();
        assert!(batch.messages.is_empty());
    }
}
