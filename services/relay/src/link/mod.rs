//! Dual-transport link to the orchestrator.
//!
//! The WebSocket channel is primary; HTTP is the fallback. Both carry the
//! same bearer secret and agent id, which is the correlation the
//! orchestrator uses to push per-request artifacts (reflex sends) down the
//! socket while an HTTP request is still in flight.
//!
//! Failover: while the socket is up, HTTP sync polling is suspended. When it
//! drops, polling resumes on the configured interval; when it returns,
//! polling pauses at the next boundary without cancelling an in-flight poll.

pub mod http;
pub mod ws;

pub use http::{HttpClient, TransportError};
pub use ws::{WsSettings, backoff_delay};

use crate::config::RelayConfig;
use crate::health::Metrics;
use crate::telemetry::Telemetry;
use edge_protocol::{CommandAck, InboundPayload, OrchestratorCommand, SyncRequest, WsFrame};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cap on inbound events buffered for delivery via `/edge/sync` while the
/// orchestrator is unreachable. Oldest events drop first past the cap.
const PENDING_EVENTS_CAP: usize = 500;

// ---------------------------------------------------------------------------
// Pending-event buffer
// ---------------------------------------------------------------------------

/// Events whose `/edge/message` failed while disconnected, awaiting the next
/// successful sync.
#[derive(Default)]
pub struct PendingEvents {
    queue: Mutex<VecDeque<InboundPayload>>,
}

impl PendingEvents {
    pub fn push(&self, payload: InboundPayload) {
        let mut queue = self.queue.lock().expect("pending events mutex");
        if queue.len() >= PENDING_EVENTS_CAP {
            queue.pop_front();
            warn!("pending-event buffer full, dropping oldest event");
        }
        queue.push_back(payload);
    }

    pub fn drain(&self) -> Vec<InboundPayload> {
        self.queue
            .lock()
            .expect("pending events mutex")
            .drain(..)
            .collect()
    }

    /// Put drained events back at the front after a failed sync.
    pub fn requeue(&self, events: Vec<InboundPayload>) {
        let mut queue = self.queue.lock().expect("pending events mutex");
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
        queue.truncate(PENDING_EVENTS_CAP);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("pending events mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// OrchestratorLink
// ---------------------------------------------------------------------------

/// Shared handle to both transports. Cheap to clone via `Arc`.
pub struct OrchestratorLink {
    http: Arc<HttpClient>,
    outbound: mpsc::UnboundedSender<WsFrame>,
    connected: watch::Receiver<bool>,
    pending: Arc<PendingEvents>,
    last_command_id: Mutex<Option<Uuid>>,
    /// Keeps the connected channel alive when the WebSocket is disabled and
    /// no task owns the sender.
    _connected_tx: Option<watch::Sender<bool>>,
}

impl OrchestratorLink {
    /// Wire up the link and spawn its background tasks (WebSocket driver
    /// and HTTP fallback poller). Commands from either transport land in
    /// `command_tx` in arrival order.
    pub fn start(
        cfg: &RelayConfig,
        http: Arc<HttpClient>,
        command_tx: mpsc::UnboundedSender<OrchestratorCommand>,
        metrics: Arc<Metrics>,
        telemetry: Telemetry,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);

        let mut handles = Vec::new();
        let parked_connected_tx = if cfg.websocket.enabled {
            let settings = WsSettings {
                url: cfg.backend.websocket_url.clone(),
                secret: cfg.edge.secret.clone(),
                ping_interval: cfg.websocket.ping_interval,
                reconnect_attempts: cfg.websocket.reconnect_attempts,
            };
            handles.push(tokio::spawn(ws::run_ws_task(
                settings,
                http.clone(),
                outbound_rx,
                command_tx.clone(),
                connected_tx,
                metrics,
                telemetry,
                shutdown.clone(),
            )));
            None
        } else {
            info!("bidirectional channel disabled by config, HTTP sync only");
            Some(connected_tx)
        };

        let link = Arc::new(OrchestratorLink {
            http,
            outbound: outbound_tx,
            connected: connected_rx.clone(),
            pending: Arc::new(PendingEvents::default()),
            last_command_id: Mutex::new(None),
            _connected_tx: parked_connected_tx,
        });

        handles.push(tokio::spawn(run_sync_poller(
            link.clone(),
            command_tx,
            cfg.backend.sync_interval,
            connected_rx,
            shutdown,
        )));

        (link, handles)
    }

    pub fn http(&self) -> &Arc<HttpClient> {
        &self.http
    }

    pub fn pending_events(&self) -> &Arc<PendingEvents> {
        &self.pending
    }

    pub fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Acknowledge a command: bidirectional channel when up, HTTP otherwise.
    pub async fn ack(&self, ack: CommandAck) {
        self.note_command_seen(ack.command_id);
        if self.connected()
            && self
                .outbound
                .send(WsFrame::CommandAck { data: ack.clone() })
                .is_ok()
        {
            return;
        }
        if let Err(e) = self.http.ack_command(&ack).await {
            warn!(command_id = %ack.command_id, error = %e, "command ack failed on both transports");
        }
    }

    fn note_command_seen(&self, command_id: Uuid) {
        *self.last_command_id.lock().expect("last command mutex") = Some(command_id);
    }

    fn last_command_id(&self) -> Option<Uuid> {
        *self.last_command_id.lock().expect("last command mutex")
    }
}

// ---------------------------------------------------------------------------
// HTTP fallback poller
// ---------------------------------------------------------------------------

/// Poll `/edge/sync` while the bidirectional channel is down. Each poll
/// reports buffered pending events and drains the orchestrator's queued
/// commands into the executor.
async fn run_sync_poller(
    link: Arc<OrchestratorLink>,
    command_tx: mpsc::UnboundedSender<OrchestratorCommand>,
    sync_interval: std::time::Duration,
    mut connected: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if *connected.borrow() {
            // Socket is up: polling suspended until it drops.
            tokio::select! {
                _ = connected.changed() => continue,
                _ = shutdown.changed() => return,
            }
        }

        // Disconnected: poll immediately, then hold the cadence. A socket
        // recovery mid-sleep pauses polling at this boundary without
        // cancelling the poll that already ran.
        let pending = link.pending.drain();
        let pending_count = pending.len();
        let request = SyncRequest {
            last_command_id: link.last_command_id(),
            pending_events: pending.clone(),
        };
        match link.http.sync(&request).await {
            Ok(response) => {
                debug!(
                    commands = response.commands.len(),
                    pending_reported = pending_count,
                    "sync poll completed"
                );
                for command in response.commands {
                    link.note_command_seen(command.command_id);
                    if command_tx.send(command).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "sync poll failed, repending {pending_count} event(s)");
                link.pending.requeue(pending);
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = connected.changed() => {}
            _ = tokio::time::sleep(sync_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payload(text: &str) -> InboundPayload {
        InboundPayload {
            thread_id: "T1".to_owned(),
            sender_id: "+15551234567".to_owned(),
            text: text.to_owned(),
            timestamp: Utc::now(),
            is_group: false,
            participants: vec![],
            attachments: vec![],
            context: None,
            matched_rule_ids: vec![],
        }
    }

    #[test]
    fn pending_events_drop_oldest_past_cap() {
        let pending = PendingEvents::default();
        for i in 0..(PENDING_EVENTS_CAP + 10) {
            pending.push(payload(&format!("m{i}")));
        }
        assert_eq!(pending.len(), PENDING_EVENTS_CAP);
        let drained = pending.drain();
        assert_eq!(drained[0].text, "m10", "oldest ten were dropped");
    }

    #[test]
    fn requeue_preserves_order_at_the_front() {
        let pending = PendingEvents::default();
        pending.push(payload("later"));
        let drained = vec![payload("first"), payload("second")];
        pending.requeue(drained);
        let all = pending.drain();
        let texts: Vec<&str> = all.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "later"]);
    }
}
