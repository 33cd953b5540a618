//! Bidirectional WebSocket channel to the orchestrator.
//!
//! # Session
//! 1. Connect to `wss://<host>/edge/ws?edge_agent_id=<id>` with
//!    `Authorization: Bearer <secret>` and `X-Edge-Agent-Id` headers
//!    (10 s handshake timeout).
//! 2. Announce a status snapshot, then exchange frames: inbound `command`
//!    and `pong`, outbound `ping`, `command_ack`, `status`.
//! 3. A `ping` goes out every 30 s; silence of any kind for 60 s kills the
//!    session.
//!
//! # Reconnect
//! Every close schedules a reconnect with exponential backoff (1 s doubling,
//! capped at 60 s), forever. Auth failures on upgrade are logged but do not
//! suspend reconnection -- secrets rotate externally.

use crate::health::Metrics;
use crate::link::http::HttpClient;
use crate::telemetry::{LinkState, Telemetry, TelemetryEvent};
use edge_protocol::{OrchestratorCommand, WsFrame};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Connection is dead after this much inbound silence.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Handshake must complete within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Every Nth keepalive ping also carries a status snapshot.
const STATUS_EVERY_N_PINGS: u64 = 10;

#[derive(Clone)]
pub struct WsSettings {
    pub url: String,
    pub secret: String,
    pub ping_interval: Duration,
    /// Caps backoff doublings; the delay itself never exceeds 60 s.
    pub reconnect_attempts: u32,
}

/// Run the WebSocket channel until shutdown. Owns the outbound frame queue
/// and publishes connection state through `connected_tx`.
pub async fn run_ws_task(
    settings: WsSettings,
    identity: Arc<HttpClient>,
    mut outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    command_tx: mpsc::UnboundedSender<OrchestratorCommand>,
    connected_tx: watch::Sender<bool>,
    metrics: Arc<Metrics>,
    telemetry: Telemetry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect(&settings, &identity).await {
            Ok(ws) => {
                attempt = 0;
                let _ = connected_tx.send(true);
                metrics.set_ws_connected(true);
                telemetry.emit(TelemetryEvent::LinkStatus {
                    state: LinkState::Connected,
                });
                info!(url = %settings.url, "bidirectional channel established");

                let ended_by_shutdown = run_session(
                    ws,
                    &settings,
                    &mut outbound_rx,
                    &command_tx,
                    &metrics,
                    &mut shutdown,
                )
                .await;

                let _ = connected_tx.send(false);
                metrics.set_ws_connected(false);
                if ended_by_shutdown {
                    return;
                }
                telemetry.emit(TelemetryEvent::LinkStatus {
                    state: LinkState::Disconnected,
                });
            }
            Err(e) => {
                telemetry.emit(TelemetryEvent::LinkStatus {
                    state: LinkState::Failed,
                });
                warn!(error = %e, attempt, "bidirectional connect failed");
            }
        }

        let delay = backoff_delay(attempt, settings.reconnect_attempts);
        attempt = attempt.saturating_add(1);
        telemetry.emit(TelemetryEvent::LinkStatus {
            state: LinkState::Reconnecting,
        });
        debug!(delay_secs = delay.as_secs(), "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Reconnect delay: 1 s, 2 s, 4 s, ... capped at 60 s. `max_doublings`
/// additionally bounds the exponent so a small config cap pins the delay
/// early.
pub fn backoff_delay(attempt: u32, max_doublings: u32) -> Duration {
    let exponent = attempt.min(max_doublings).min(6);
    Duration::from_secs((1u64 << exponent).min(60))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(settings: &WsSettings, identity: &HttpClient) -> Result<WsStream, String> {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let agent_id = identity.agent_id();
    let url = format!("{}?edge_agent_id={agent_id}", settings.url);
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| format!("invalid URL '{url}': {e}"))?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        format!("Bearer {}", settings.secret)
            .parse()
            .map_err(|_| "invalid auth header".to_owned())?,
    );
    headers.insert(
        "X-Edge-Agent-Id",
        agent_id
            .parse()
            .map_err(|_| "invalid agent id header".to_owned())?,
    );

    let connect_result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| format!("handshake timed out after {}s", CONNECT_TIMEOUT.as_secs()))?;
    let (ws, _response) = connect_result.map_err(|e| classify_connect_error(&e))?;
    Ok(ws)
}

/// 4xx upgrade rejections are called out as auth problems; backoff continues
/// regardless.
fn classify_connect_error(e: &tokio_tungstenite::tungstenite::Error) -> String {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::Http(response) if response.status().is_client_error() => {
            format!("auth rejected on upgrade: HTTP {}", response.status())
        }
        other => other.to_string(),
    }
}

/// Drive one established session. Returns true when ended by shutdown.
async fn run_session(
    ws: WsStream,
    settings: &WsSettings,
    outbound_rx: &mut mpsc::UnboundedReceiver<WsFrame>,
    command_tx: &mpsc::UnboundedSender<OrchestratorCommand>,
    metrics: &Arc<Metrics>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut write, mut read) = ws.split();

    // Fresh status on connect so the orchestrator sees edge health
    // immediately.
    let hello = WsFrame::Status {
        data: metrics.snapshot(),
    };
    if send_frame(&mut write, &hello).await.is_err() {
        return false;
    }

    let mut ping_timer = tokio::time::interval(settings.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset(); // skip the immediate first tick
    let mut last_rx = Instant::now();
    let mut ping_count: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return true;
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return true };
                if send_frame(&mut write, &frame).await.is_err() {
                    return false;
                }
            }
            msg = read.next() => {
                match msg {
                    None => return false,
                    Some(Err(e)) => {
                        warn!(error = %e, "bidirectional read error");
                        return false;
                    }
                    Some(Ok(msg)) => {
                        last_rx = Instant::now();
                        if !handle_inbound(msg, &mut write, command_tx).await {
                            return false;
                        }
                    }
                }
            }
            _ = ping_timer.tick() => {
                if last_rx.elapsed() > LIVENESS_TIMEOUT {
                    warn!(
                        silent_secs = last_rx.elapsed().as_secs(),
                        "bidirectional channel silent past liveness window"
                    );
                    return false;
                }
                if send_frame(&mut write, &WsFrame::Ping).await.is_err() {
                    return false;
                }
                ping_count += 1;
                if ping_count.is_multiple_of(STATUS_EVERY_N_PINGS) {
                    let status = WsFrame::Status { data: metrics.snapshot() };
                    if send_frame(&mut write, &status).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Handle one inbound WS message; false ends the session.
async fn handle_inbound(
    msg: Message,
    write: &mut (impl SinkExt<Message> + Unpin),
    command_tx: &mpsc::UnboundedSender<OrchestratorCommand>,
) -> bool {
    match msg {
        Message::Text(text) => {
            match serde_json::from_str::<WsFrame>(&text) {
                Ok(WsFrame::Command { data }) => {
                    debug!(command_id = %data.command_id, kind = data.payload.kind(),
                           "command received on bidirectional channel");
                    if command_tx.send(data).is_err() {
                        return false;
                    }
                }
                Ok(WsFrame::Pong) => {}
                Ok(other) => {
                    debug!(?other, "unexpected frame direction, ignoring");
                }
                Err(e) => {
                    warn!(error = %e, "unparseable frame, ignoring");
                }
            }
            true
        }
        Message::Ping(data) => {
            // Protocol-level keepalive from the server side.
            let _ = write.send(Message::Pong(data)).await;
            true
        }
        Message::Close(_) => false,
        _ => true,
    }
}

async fn send_frame(
    write: &mut (impl SinkExt<Message> + Unpin),
    frame: &WsFrame,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    write.send(Message::Text(json.into())).await.map_err(|_| ())
}
