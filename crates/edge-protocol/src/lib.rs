// edge-protocol: Orchestrator wire-protocol types and serialization.
//
// All WebSocket frames use a top-level `type` field for discriminated
// deserialization.  Command payloads are a closed sum over the nine command
// kinds; the orchestrator's dynamic payloads become typed variants here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Commands (orchestrator -> relay)
// ---------------------------------------------------------------------------

/// A command pushed by the orchestrator, either down the WebSocket or inside
/// a `/edge/sync` response.
///
/// `send_at` and `schedule_id` are carried as strings and validated by the
/// executor, so a malformed field fails that one command with a `failed` ack
/// instead of poisoning frame parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorCommand {
    pub command_id: Uuid,
    #[serde(flatten)]
    pub payload: CommandPayload,
    #[serde(default)]
    pub priority: CommandPriority,
    pub timestamp: DateTime<Utc>,
}

/// The nine command kinds, adjacently tagged:
///
/// ```json
/// { "type": "schedule_message", "payload": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CommandPayload {
    SendMessageNow(SendMessageNow),
    ScheduleMessage(ScheduleMessage),
    CancelScheduled(CancelScheduled),
    SetRule(SetRule),
    UpdatePlan(UpdatePlan),
    ContextUpdate(ContextUpdate),
    ContextReset(ContextReset),
    UploadRetry(UploadRetry),
    EmitEvent(EmitEvent),
}

impl CommandPayload {
    /// Stable name of the command kind, used in acks, logs, and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandPayload::SendMessageNow(_) => "send_message_now",
            CommandPayload::ScheduleMessage(_) => "schedule_message",
            CommandPayload::CancelScheduled(_) => "cancel_scheduled",
            CommandPayload::SetRule(_) => "set_rule",
            CommandPayload::UpdatePlan(_) => "update_plan",
            CommandPayload::ContextUpdate(_) => "context_update",
            CommandPayload::ContextReset(_) => "context_reset",
            CommandPayload::UploadRetry(_) => "upload_retry",
            CommandPayload::EmitEvent(_) => "emit_event",
        }
    }
}

/// `immediate` commands cut in front of the executor's pending queue but do
/// not preempt the in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    #[default]
    Normal,
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageNow {
    pub thread_id: String,
    pub text: String,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleMessage {
    pub thread_id: String,
    pub message_text: String,
    /// RFC 3339 UTC; validated against [now, now + 1 year] by the executor.
    pub send_at: String,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelScheduled {
    /// UUID of the scheduled entry; validated by the executor.
    pub schedule_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRule {
    /// Absent id means create with a fresh UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub name: String,
    pub enabled: bool,
    /// Opaque to the relay; evaluated structurally during ingest only.
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
    #[serde(default)]
    pub action: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePlan {
    pub thread_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub thread_id: String,
    pub app_id: String,
    pub room_id: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextReset {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRetry {
    pub guid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitEvent {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Acks (relay -> orchestrator)
// ---------------------------------------------------------------------------

/// Exactly one ack is emitted per processed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Completed,
    Failed,
    Pending,
}

// ---------------------------------------------------------------------------
// WebSocket frames
// ---------------------------------------------------------------------------

/// All frame kinds on the bidirectional channel, both directions.
///
/// ```json
/// { "type": "command", "data": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    /// Orchestrator -> relay.
    Command { data: OrchestratorCommand },
    /// Orchestrator -> relay, response to a `ping`.
    Pong,
    /// Relay -> orchestrator keepalive.
    Ping,
    /// Relay -> orchestrator command acknowledgment.
    CommandAck { data: CommandAck },
    /// Relay -> orchestrator health snapshot.
    Status { data: StatusSnapshot },
}

/// Read-only health snapshot, shared by the `status` frame and `GET /health`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub agent_id: String,
    pub uptime_seconds: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub commands_processed_total: u64,
    pub scheduled_messages_total: u64,
    pub bidirectional_connected: bool,
    pub memory_mb: u64,
}

// ---------------------------------------------------------------------------
// HTTP payloads
// ---------------------------------------------------------------------------

/// Body of `POST /edge/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Advisory identity from config; the response's id wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub user_phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub edge_agent_id: String,
}

/// One attachment in an inbound payload.
///
/// `remote_photo_id` is set when the upload succeeded before `/edge/message`
/// was sent; otherwise `skip_reason` explains why the original guid is all
/// the orchestrator gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub guid: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_photo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// Body of `POST /edge/message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundPayload {
    pub thread_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
    /// Active context record for the thread, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Ids of enabled rules whose conditions matched this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_rule_ids: Vec<String>,
}

/// Response of `POST /edge/message`.
///
/// The orchestrator answers in one of three shapes: `should_respond: false`,
/// a reflex/burst set, or plain `reply_bubbles`.  [`MessageResponse::bubbles`]
/// normalizes all three into the ordered bubble list to dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_respond: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflex_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub burst_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reply_bubbles: Vec<String>,
}

impl MessageResponse {
    /// Normalize the three response shapes into one ordered bubble list.
    ///
    /// `reply_bubbles` wins when present; otherwise a `should_respond: true`
    /// response yields the reflex bubble (if any) followed by the burst.
    pub fn bubbles(&self) -> Vec<String> {
        if !self.reply_bubbles.is_empty() {
            return self.reply_bubbles.clone();
        }
        if self.should_respond != Some(true) {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.burst_messages.len() + 1);
        if let Some(reflex) = &self.reflex_message {
            out.push(reflex.clone());
        }
        out.extend(self.burst_messages.iter().cloned());
        out
    }
}

/// Body of `POST /edge/sync` (used only while the WebSocket is down).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command_id: Option<Uuid>,
    /// Inbound events that failed `/edge/message` while disconnected.
    #[serde(default)]
    pub pending_events: Vec<InboundPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub commands: Vec<OrchestratorCommand>,
    #[serde(default)]
    pub ack_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_updates: Option<serde_json::Value>,
}

/// Body of `POST /edge/command/ack` (WebSocket-down fallback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `POST /photos/upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoUploadResponse {
    pub photo_id: String,
    pub photo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
}
