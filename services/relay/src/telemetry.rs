//! Observability events.
//!
//! The relay emits named, typed events; the sink destination is external.
//! The default drain task writes each event as one structured log line so an
//! external shipper can pick them up. Tests swap the drain for a capturing
//! channel via [`Telemetry::capturing`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

// ---------------------------------------------------------------------------
// Event shapes
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    AgentStarted {
        agent_id: String,
        version: String,
    },
    AgentStopped {
        uptime_seconds: u64,
    },
    MessageReceived {
        thread_id: String,
    },
    MessageSent {
        bubble_type: BubbleType,
        success: bool,
    },
    CommandProcessed {
        command: String,
        success: bool,
        duration_ms: u64,
    },
    MessageScheduled {
        schedule_id: String,
    },
    MessageScheduleExecuted {
        scheduled_time: DateTime<Utc>,
        actual_time: DateTime<Utc>,
        latency_ms: i64,
        success: bool,
    },
    PhotoUploadStarted {
        guid: String,
    },
    PhotoUploadCompleted {
        guid: String,
    },
    PhotoUploadFailed {
        guid: String,
        error: String,
    },
    LinkStatus {
        state: LinkState,
    },
    ErrorOccurred {
        kind: String,
        component: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleType {
    Single,
    Burst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

// ---------------------------------------------------------------------------
// Sink handle
// ---------------------------------------------------------------------------

/// Cloneable emit handle. Emission never blocks and never fails the caller;
/// a dropped sink just discards events.
#[derive(Clone)]
pub struct Telemetry {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl Telemetry {
    /// Telemetry wired to the default drain: one structured log line per
    /// event under the `telemetry` target.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "telemetry", event = %json),
                    Err(e) => info!(target: "telemetry", error = %e, "unserializable event"),
                }
            }
        });
        Telemetry { tx }
    }

    /// Telemetry whose events land in the returned receiver instead of the
    /// log drain. Test-facing.
    pub fn capturing() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Telemetry { tx }, rx)
    }

    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
