//! Persistent scheduler for future-dated sends.
//!
//! # At-most-once claim
//! Every execution first runs `UPDATE ... SET status='sent' WHERE id = ? AND
//! status = 'pending'` and proceeds only when exactly one row changed. Two
//! overlapping sweeps (adaptive timer + a wake forced by a fresh command)
//! both read the same due row; only one claim succeeds, so the send happens
//! once. Losing the claim is not an error.
//!
//! # Adaptive wake
//! The wake task sleeps until just before the earliest pending `send_at`
//! (100 ms lead), floors at 10 ms to avoid a tight loop, and never sleeps
//! longer than 60 s. `schedule` and `cancel` ping a notify so the loop
//! recomputes immediately when the earliest entry changes.
//!
//! # Instant encoding
//! `send_at`/`created_at` are stored RFC 3339 UTC at fixed microsecond
//! width (`...Z`), so SQL string ordering is chronological ordering.

use crate::health::Metrics;
use crate::send::{SendAdapter, SendError};
use crate::storage::{StateStore, StorageError};
use crate::telemetry::{Telemetry, TelemetryEvent};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, params};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on any adaptive sleep.
const MAX_WAKE_INTERVAL: Duration = Duration::from_secs(60);
/// Wake floor when an entry is already due.
const MIN_WAKE_INTERVAL: Duration = Duration::from_millis(10);
/// Wake this much before the target instant to absorb timer skew.
const WAKE_LEAD: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScheduleStatus::Pending),
            "sent" => Some(ScheduleStatus::Sent),
            "failed" => Some(ScheduleStatus::Failed),
            "cancelled" => Some(ScheduleStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEntry {
    pub id: Uuid,
    pub thread_id: String,
    pub message_text: String,
    pub send_at: DateTime<Utc>,
    pub is_group: bool,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub command_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    store: StateStore,
    adapter: Arc<dyn SendAdapter>,
    telemetry: Telemetry,
    metrics: Arc<Metrics>,
    wake: Notify,
    adaptive: bool,
    fallback_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        adapter: Arc<dyn SendAdapter>,
        telemetry: Telemetry,
        metrics: Arc<Metrics>,
        adaptive: bool,
        fallback_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Scheduler {
            store,
            adapter,
            telemetry,
            metrics,
            wake: Notify::new(),
            adaptive,
            fallback_interval,
        })
    }

    // -----------------------------------------------------------------------
    // Queue operations
    // -----------------------------------------------------------------------

    /// Insert a future send. `send_at` is immutable after this point.
    pub async fn schedule(
        &self,
        thread_id: &str,
        message_text: &str,
        send_at: DateTime<Utc>,
        is_group: bool,
        command_id: Option<Uuid>,
    ) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        let text_blob = self.store.encrypt(message_text);
        let id_s = id.to_string();
        let thread_id = thread_id.to_owned();
        let send_at_s = fmt_instant(send_at);
        let created_at_s = fmt_instant(Utc::now());
        let command_id_s = command_id.map(|c| c.to_string());
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO scheduled_messages
                         (id, thread_id, message_text, send_at, is_group, status,
                          created_at, command_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
                    params![id_s, thread_id, text_blob, send_at_s, is_group, created_at_s,
                            command_id_s],
                )
            })
            .await?;

        self.metrics.incr_scheduled_messages();
        self.telemetry.emit(TelemetryEvent::MessageScheduled {
            schedule_id: id.to_string(),
        });
        debug!(schedule_id = %id, send_at = %send_at, "message scheduled");
        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel a pending entry. False when the row is past `pending` (sent,
    /// failed, already cancelled, or unknown).
    pub async fn cancel(&self, id: Uuid) -> Result<bool, StorageError> {
        let id_s = id.to_string();
        let changed = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE scheduled_messages SET status = 'cancelled'
                     WHERE id = ?1 AND status = 'pending'",
                    params![id_s],
                )
            })
            .await?;
        self.wake.notify_one();
        Ok(changed == 1)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ScheduledEntry>, StorageError> {
        let id_s = id.to_string();
        let row = self
            .store
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, thread_id, message_text, send_at, is_group, status,
                            created_at, command_id, error
                     FROM scheduled_messages WHERE id = ?1",
                    params![id_s],
                    map_entry_row,
                )
                .optional()
            })
            .await?;
        row.map(|r| self.decode(r)).transpose()
    }

    pub async fn list_pending(&self) -> Result<Vec<ScheduledEntry>, StorageError> {
        let rows = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, thread_id, message_text, send_at, is_group, status,
                            created_at, command_id, error
                     FROM scheduled_messages WHERE status = 'pending'
                     ORDER BY send_at ASC, created_at ASC, id ASC",
                )?;
                let rows = stmt.query_map([], map_entry_row)?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    pub async fn stats(&self) -> Result<SchedulerStats, StorageError> {
        let counts: Vec<(String, u64)> = self
            .store
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM scheduled_messages GROUP BY status",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await?;
        let mut stats = SchedulerStats::default();
        for (status, count) in counts {
            match status.as_str() {
                "pending" => stats.pending = count,
                "sent" => stats.sent = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Wake loop
    // -----------------------------------------------------------------------

    /// Spawn the wake task. It runs until shutdown; every wake sweeps due
    /// entries and recomputes the next wake from the queue.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            info!(
                adaptive = scheduler.adaptive,
                "scheduler wake loop started"
            );
            loop {
                let delay = match scheduler.next_wake_delay().await {
                    Ok(delay) => delay,
                    Err(e) => {
                        warn!(error = %e, "next-wake query failed, using fallback interval");
                        scheduler.fallback_interval
                    }
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    // A schedule/cancel arrived: the earliest entry may have
                    // moved, recompute immediately.
                    _ = scheduler.wake.notified() => continue,
                    _ = tokio::time::sleep(delay) => {
                        scheduler.sweep(&mut shutdown).await;
                    }
                }
            }
            info!("scheduler wake loop stopped");
        })
    }

    async fn next_wake_delay(&self) -> Result<Duration, StorageError> {
        if !self.adaptive {
            return Ok(self.fallback_interval);
        }
        let earliest: Option<String> = self
            .store
            .call(|conn| {
                conn.query_row(
                    "SELECT MIN(send_at) FROM scheduled_messages WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )
            })
            .await?;
        let earliest = earliest
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(wake_delay(Utc::now(), earliest))
    }

    /// Execute all due entries. Shutdown aborts between rows; the row being
    /// executed is already claimed `sent`, so a restart cannot duplicate it.
    pub async fn sweep(&self, shutdown: &mut watch::Receiver<bool>) {
        let due = match self.due_entries().await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "sweep query failed");
                return;
            }
        };
        for entry in due {
            if *shutdown.borrow() {
                debug!("sweep aborted by shutdown");
                return;
            }
            self.execute_entry(entry).await;
        }
    }

    async fn due_entries(&self) -> Result<Vec<ScheduledEntry>, StorageError> {
        let now_s = fmt_instant(Utc::now());
        let rows = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, thread_id, message_text, send_at, is_group, status,
                            created_at, command_id, error
                     FROM scheduled_messages
                     WHERE status = 'pending' AND send_at <= ?1
                     ORDER BY send_at ASC, created_at ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![now_s], map_entry_row)?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    async fn execute_entry(&self, entry: ScheduledEntry) {
        // The atomic claim: exactly one sweep may flip pending -> sent.
        let id_s = entry.id.to_string();
        let claimed = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE scheduled_messages SET status = 'sent'
                     WHERE id = ?1 AND status = 'pending'",
                    params![id_s],
                )
            })
            .await;
        match claimed {
            Ok(1) => {}
            Ok(_) => {
                // Another sweep claimed the row first. Not an error.
                debug!(schedule_id = %entry.id, "claim lost to a concurrent sweep");
                return;
            }
            Err(e) => {
                warn!(schedule_id = %entry.id, error = %e, "claim update failed");
                return;
            }
        }

        let send_result = self
            .adapter
            .send_single(&entry.thread_id, &entry.message_text, entry.is_group)
            .await;
        let actual = Utc::now();
        let latency_ms = (actual - entry.send_at).num_milliseconds();

        match &send_result {
            Ok(()) => {
                self.metrics.incr_messages_sent();
                debug!(schedule_id = %entry.id, latency_ms, "scheduled send executed");
            }
            Err(e) => {
                warn!(schedule_id = %entry.id, error = %e, "scheduled send failed");
                self.record_failure(entry.id, e).await;
            }
        }
        self.telemetry.emit(TelemetryEvent::MessageScheduleExecuted {
            scheduled_time: entry.send_at,
            actual_time: actual,
            latency_ms,
            success: matches!(send_result, Ok(())),
        });
    }

    async fn record_failure(&self, id: Uuid, error: &SendError) {
        let id_s = id.to_string();
        let error_s = error.to_string();
        let result = self
            .store
            .call(move |conn| {
                conn.execute(
                    "UPDATE scheduled_messages SET status = 'failed', error = ?2
                     WHERE id = ?1",
                    params![id_s, error_s],
                )
            })
            .await;
        if let Err(e) = result {
            warn!(schedule_id = %id, error = %e, "failure record did not persist");
        }
    }

    fn decode(&self, r: EntryRow) -> Result<ScheduledEntry, StorageError> {
        Ok(ScheduledEntry {
            id: parse_uuid(&r.id)?,
            thread_id: r.thread_id,
            message_text: self.store.decrypt(&r.message_text_blob)?,
            send_at: parse_instant(&r.send_at)?,
            is_group: r.is_group,
            status: ScheduleStatus::parse(&r.status)
                .ok_or_else(|| StorageError::Corrupt(format!("unknown status '{}'", r.status)))?,
            created_at: parse_instant(&r.created_at)?,
            command_id: r.command_id.as_deref().map(parse_uuid).transpose()?,
            error: r.error,
        })
    }
}

// ---------------------------------------------------------------------------
// Wake computation
// ---------------------------------------------------------------------------

/// Pure adaptive-wake computation:
/// no pending entry → 60 s; due or nearly due → 10 ms floor; otherwise
/// sleep until 100 ms before the target, capped at 60 s.
pub fn wake_delay(now: DateTime<Utc>, earliest: Option<DateTime<Utc>>) -> Duration {
    let Some(earliest) = earliest else {
        return MAX_WAKE_INTERVAL;
    };
    let delta = earliest - now;
    let Ok(until_target) = delta.to_std() else {
        return MIN_WAKE_INTERVAL; // already past due
    };
    if until_target <= WAKE_LEAD {
        return MIN_WAKE_INTERVAL;
    }
    (until_target - WAKE_LEAD).clamp(MIN_WAKE_INTERVAL, MAX_WAKE_INTERVAL)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct EntryRow {
    id: String,
    thread_id: String,
    message_text_blob: String,
    send_at: String,
    is_group: bool,
    status: String,
    created_at: String,
    command_id: Option<String>,
    error: Option<String>,
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        message_text_blob: row.get(2)?,
        send_at: row.get(3)?,
        is_group: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        command_id: row.get(7)?,
        error: row.get(8)?,
    })
}

/// Fixed-width RFC 3339 UTC (microseconds, `Z`) so string order is time
/// order.
fn fmt_instant(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad instant '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("bad uuid '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StateKey;
    use crate::storage::MESSAGING_SCHEMA;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAdapter {
        sends: AtomicUsize,
        sent: StdMutex<Vec<String>>,
        fail: bool,
    }

    impl CountingAdapter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(CountingAdapter {
                sends: AtomicUsize::new(0),
                sent: StdMutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl SendAdapter for CountingAdapter {
        async fn send_single(
            &self,
            _thread_id: &str,
            text: &str,
            _is_group: bool,
        ) -> Result<(), SendError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SendError::Refused("adapter down".to_owned()));
            }
            self.sent.lock().unwrap().push(text.to_owned());
            Ok(())
        }

        async fn send_burst(
            &self,
            thread_id: &str,
            bubbles: &[String],
            is_group: bool,
            _batched: bool,
        ) -> Result<(), SendError> {
            for b in bubbles {
                self.send_single(thread_id, b, is_group).await?;
            }
            Ok(())
        }
    }

    fn make_scheduler(adapter: Arc<CountingAdapter>) -> Arc<Scheduler> {
        let store = StateStore::open_in_memory(&StateKey([6u8; 32]), MESSAGING_SCHEMA).unwrap();
        Scheduler::new(
            store,
            adapter,
            Telemetry::capturing().0,
            Metrics::new("edge-test"),
            true,
            Duration::from_secs(30),
        )
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn schedule_then_get_round_trips_and_send_at_is_preserved() {
        let scheduler = make_scheduler(CountingAdapter::new(false));
        let send_at = Utc::now() + chrono::Duration::hours(2);
        let id = scheduler
            .schedule("T1", "remember the milk", send_at, false, None)
            .await
            .unwrap();

        let entry = scheduler.get(id).await.unwrap().unwrap();
        assert_eq!(entry.message_text, "remember the milk");
        assert_eq!(entry.status, ScheduleStatus::Pending);
        // Stored at microsecond width.
        assert_eq!(entry.send_at.timestamp_micros(), send_at.timestamp_micros());
    }

    #[tokio::test]
    async fn cancel_before_fire_prevents_the_send() {
        let adapter = CountingAdapter::new(false);
        let scheduler = make_scheduler(adapter.clone());
        let id = scheduler
            .schedule(
                "T1",
                "never sent",
                Utc::now() - chrono::Duration::seconds(1),
                false,
                None,
            )
            .await
            .unwrap();

        assert!(scheduler.cancel(id).await.unwrap());
        assert!(!scheduler.cancel(id).await.unwrap(), "second cancel is a no-op");

        let (_tx, mut rx) = shutdown_pair();
        scheduler.sweep(&mut rx).await;
        assert_eq!(adapter.sends.load(Ordering::SeqCst), 0);

        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn concurrent_sweeps_send_exactly_once() {
        let adapter = CountingAdapter::new(false);
        let scheduler = make_scheduler(adapter.clone());
        scheduler
            .schedule(
                "T1",
                "exactly once",
                Utc::now() - chrono::Duration::seconds(5),
                false,
                None,
            )
            .await
            .unwrap();

        let (_tx, rx) = shutdown_pair();
        let (mut rx_a, mut rx_b) = (rx.clone(), rx);
        let (a, b) = tokio::join!(
            scheduler.sweep(&mut rx_a),
            scheduler.sweep(&mut rx_b)
        );
        let _ = (a, b);

        assert_eq!(adapter.sends.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn failed_send_records_error_and_failed_status() {
        let adapter = CountingAdapter::new(true);
        let scheduler = make_scheduler(adapter.clone());
        let id = scheduler
            .schedule(
                "T1",
                "doomed",
                Utc::now() - chrono::Duration::seconds(1),
                false,
                None,
            )
            .await
            .unwrap();

        let (_tx, mut rx) = shutdown_pair();
        scheduler.sweep(&mut rx).await;

        let entry = scheduler.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, ScheduleStatus::Failed);
        assert!(entry.error.unwrap().contains("adapter down"));
        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn due_entries_fire_in_send_at_order() {
        let adapter = CountingAdapter::new(false);
        let scheduler = make_scheduler(adapter.clone());
        let base = Utc::now() - chrono::Duration::seconds(10);
        scheduler
            .schedule("T1", "second", base + chrono::Duration::seconds(5), false, None)
            .await
            .unwrap();
        scheduler
            .schedule("T1", "first", base, false, None)
            .await
            .unwrap();

        let (_tx, mut rx) = shutdown_pair();
        scheduler.sweep(&mut rx).await;

        let sent = adapter.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn wake_loop_fires_a_due_entry_promptly() {
        let adapter = CountingAdapter::new(false);
        let scheduler = make_scheduler(adapter.clone());
        let (tx, rx) = shutdown_pair();
        let handle = scheduler.clone().start(rx);

        scheduler
            .schedule(
                "T1",
                "fire soon",
                Utc::now() + chrono::Duration::milliseconds(50),
                false,
                None,
            )
            .await
            .unwrap();

        // Generous bound for a loaded test host; the contract itself is
        // millisecond-class.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if adapter.sends.load(Ordering::SeqCst) == 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "scheduled entry did not fire"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = tx.send(true);
        let _ = handle.await;
    }

    #[test]
    fn wake_delay_follows_the_adaptive_algorithm() {
        let now = Utc::now();
        // Empty queue: bounded upper interval.
        assert_eq!(wake_delay(now, None), Duration::from_secs(60));
        // Past due: floor.
        assert_eq!(
            wake_delay(now, Some(now - chrono::Duration::seconds(3))),
            Duration::from_millis(10)
        );
        // Inside the lead window: floor.
        assert_eq!(
            wake_delay(now, Some(now + chrono::Duration::milliseconds(80))),
            Duration::from_millis(10)
        );
        // Normal case: target minus the 100 ms lead.
        assert_eq!(
            wake_delay(now, Some(now + chrono::Duration::seconds(5))),
            Duration::from_millis(4900)
        );
        // Far future: capped.
        assert_eq!(
            wake_delay(now, Some(now + chrono::Duration::hours(3))),
            Duration::from_secs(60)
        );
    }
}
