//! Health and metrics surface.
//!
//! Read-only snapshot of the relay for external probes:
//! - `GET /health`  -- rich JSON snapshot
//! - `GET /ready`   -- 200 once registered with the orchestrator, else 503
//! - `GET /live`    -- always 200 while the process runs
//! - `GET /metrics` -- text exposition of counters and gauges
//!
//! Readiness reflects local prerequisites plus registration; the
//! bidirectional channel's state is reported but does NOT gate readiness --
//! the relay is useful (ingest, scheduler) while the socket is down.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use edge_protocol::StatusSnapshot;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Process-lifetime counters and gauges. All methods are lock-free except
/// the agent-id swap after registration.
pub struct Metrics {
    started_at: Instant,
    agent_id: Mutex<String>,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    commands_processed: AtomicU64,
    scheduled_messages: AtomicU64,
    ws_connected: AtomicBool,
    registered: AtomicBool,
}

impl Metrics {
    pub fn new(agent_id: &str) -> Arc<Self> {
        Arc::new(Metrics {
            started_at: Instant::now(),
            agent_id: Mutex::new(agent_id.to_owned()),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            commands_processed: AtomicU64::new(0),
            scheduled_messages: AtomicU64::new(0),
            ws_connected: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        })
    }

    pub fn incr_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_commands_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_scheduled_messages(&self) {
        self.scheduled_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ws_connected(&self, connected: bool) {
        self.ws_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_registered(&self, agent_id: &str) {
        *self.agent_id.lock().expect("agent id mutex") = agent_id.to_owned();
        self.registered.store(true, Ordering::Relaxed);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            agent_id: self.agent_id.lock().expect("agent id mutex").clone(),
            uptime_seconds: self.uptime_seconds(),
            messages_received_total: self.messages_received.load(Ordering::Relaxed),
            messages_sent_total: self.messages_sent.load(Ordering::Relaxed),
            commands_processed_total: self.commands_processed.load(Ordering::Relaxed),
            scheduled_messages_total: self.scheduled_messages.load(Ordering::Relaxed),
            bidirectional_connected: self.ws_connected.load(Ordering::Relaxed),
            memory_mb: resident_memory_mb(),
        }
    }
}

/// Resident set size in MiB. Linux reads `/proc/self/statm`; elsewhere 0.
fn resident_memory_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm")
            && let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
        {
            return resident_pages * 4096 / (1024 * 1024);
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<Metrics>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/ready", get(get_ready))
        .route("/live", get(get_live))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Bind the health server on localhost and serve until shutdown.
pub async fn serve(
    port: u16,
    state: HealthState,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    Ok(serve_on(listener, state, shutdown))
}

/// Serve on an already-bound listener (tests bind port 0 themselves).
pub fn serve_on(
    listener: tokio::net::TcpListener,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health surface listening");
    }
    let app = router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "health server exited");
        }
    })
}

async fn get_health(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "ready": state.metrics.is_registered(),
        "snapshot": snapshot,
    }))
}

async fn get_ready(State(state): State<HealthState>) -> impl IntoResponse {
    if state.metrics.is_registered() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not registered")
    }
}

async fn get_live() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn get_metrics(State(state): State<HealthState>) -> impl IntoResponse {
    let s = state.metrics.snapshot();
    let body = format!(
        "relay_uptime_seconds {}\n\
         relay_messages_received_total {}\n\
         relay_messages_sent_total {}\n\
         relay_commands_processed_total {}\n\
         relay_scheduled_messages_total {}\n\
         relay_bidirectional_connected {}\n\
         relay_memory_mb {}\n",
        s.uptime_seconds,
        s.messages_received_total,
        s.messages_sent_total,
        s.commands_processed_total,
        s.scheduled_messages_total,
        u8::from(s.bidirectional_connected),
        s.memory_mb,
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_land_in_the_snapshot() {
        let metrics = Metrics::new("edge-1");
        metrics.incr_messages_received();
        metrics.incr_messages_received();
        metrics.incr_messages_sent();
        metrics.incr_scheduled_messages();
        metrics.set_ws_connected(true);

        let s = metrics.snapshot();
        assert_eq!(s.agent_id, "edge-1");
        assert_eq!(s.messages_received_total, 2);
        assert_eq!(s.messages_sent_total, 1);
        assert_eq!(s.scheduled_messages_total, 1);
        assert!(s.bidirectional_connected);
    }

    #[test]
    fn registration_updates_agent_id_and_readiness() {
        let metrics = Metrics::new("advisory");
        assert!(!metrics.is_registered());
        metrics.set_registered("edge-assigned-7");
        assert!(metrics.is_registered());
        assert_eq!(metrics.snapshot().agent_id, "edge-assigned-7");
    }
}
