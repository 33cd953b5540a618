//! Command executor.
//!
//! A single serializing task: commands from the bidirectional channel and
//! the HTTP sync poller are validated against their schema, dispatched to
//! the owning component, and acknowledged -- exactly one ack per command.
//! `immediate`-priority commands are placed at the head of the queue but
//! never preempt the command already executing.

use crate::attachments::AttachmentUploader;
use crate::context::ContextStore;
use crate::health::Metrics;
use crate::ingest::ReflexGuard;
use crate::rules::RuleStore;
use crate::scheduler::Scheduler;
use crate::send::{SendAdapter, contains_automation_sigils};
use crate::telemetry::{Telemetry, TelemetryEvent};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use edge_protocol::{
    AckStatus, CommandAck, CommandPayload, CommandPriority, OrchestratorCommand,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Minimum spacing between upload retries for one guid.
const UPLOAD_RETRY_GATE: Duration = Duration::from_secs(5);

/// Ack error strings are clipped to stay diagnostic, not a payload dump.
const MAX_ACK_ERROR_LEN: usize = 500;

const THREAD_ID_MAX_LEN: usize = 200;
const MESSAGE_TEXT_MAX_LEN: usize = 5_000;

// ---------------------------------------------------------------------------
// Ack capability
// ---------------------------------------------------------------------------

/// Where acks go. The orchestrator link prefers the socket and falls back
/// to HTTP; tests capture.
#[async_trait]
pub trait AckChannel: Send + Sync {
    async fn ack(&self, ack: CommandAck);
}

#[async_trait]
impl AckChannel for crate::link::OrchestratorLink {
    async fn ack(&self, ack: CommandAck) {
        crate::link::OrchestratorLink::ack(self, ack).await;
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: AckStatus,
    pub error: Option<String>,
}

impl CommandOutcome {
    fn completed() -> Self {
        CommandOutcome {
            status: AckStatus::Completed,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        CommandOutcome {
            status: AckStatus::Failed,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct CommandExecutor {
    scheduler: Arc<Scheduler>,
    contexts: ContextStore,
    rules: RuleStore,
    uploader: Arc<AttachmentUploader>,
    adapter: Arc<dyn SendAdapter>,
    acks: Arc<dyn AckChannel>,
    reflex: Arc<Mutex<ReflexGuard>>,
    metrics: Arc<Metrics>,
    telemetry: Telemetry,
    /// Bearer secret, scrubbed out of every ack error.
    secret: String,
    retry_gate: Mutex<HashMap<String, Instant>>,
}

impl CommandExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<Scheduler>,
        contexts: ContextStore,
        rules: RuleStore,
        uploader: Arc<AttachmentUploader>,
        adapter: Arc<dyn SendAdapter>,
        acks: Arc<dyn AckChannel>,
        reflex: Arc<Mutex<ReflexGuard>>,
        metrics: Arc<Metrics>,
        telemetry: Telemetry,
        secret: String,
    ) -> Arc<Self> {
        Arc::new(CommandExecutor {
            scheduler,
            contexts,
            rules,
            uploader,
            adapter,
            acks,
            reflex,
            metrics,
            telemetry,
            secret,
            retry_gate: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the serializing executor task.
    pub fn start(
        self: Arc<Self>,
        mut command_rx: mpsc::UnboundedReceiver<OrchestratorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let executor = self;
        tokio::spawn(async move {
            info!("command executor started");
            let mut queue: VecDeque<OrchestratorCommand> = VecDeque::new();
            loop {
                // Pull everything already delivered so immediate commands
                // can cut ahead of queued normal ones.
                while let Ok(command) = command_rx.try_recv() {
                    enqueue(&mut queue, command);
                }
                let Some(command) = queue.pop_front() else {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        received = command_rx.recv() => {
                            match received {
                                Some(command) => enqueue(&mut queue, command),
                                None => break,
                            }
                            continue;
                        }
                    }
                };
                executor.process(command).await;
            }
            info!("command executor stopped");
        })
    }

    /// Execute one command and emit its single ack.
    pub async fn process(&self, command: OrchestratorCommand) {
        let started = Instant::now();
        let kind = command.payload.kind().to_owned();
        let command_id = command.command_id;

        let outcome = self.execute(&command).await;
        let success = outcome.status == AckStatus::Completed;

        self.metrics.incr_commands_processed();
        self.telemetry.emit(TelemetryEvent::CommandProcessed {
            command: kind.clone(),
            success,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        debug!(command_id = %command_id, kind = %kind, success, "command processed");

        self.acks
            .ack(CommandAck {
                command_id,
                status: outcome.status,
                error: outcome.error.map(|e| self.sanitize_error(&e)),
            })
            .await;
    }

    /// Route a validated command to its owning component.
    pub async fn execute(&self, command: &OrchestratorCommand) -> CommandOutcome {
        match &command.payload {
            CommandPayload::SendMessageNow(p) => {
                if let Err(e) = self.validate_thread_id(&p.thread_id) {
                    return e;
                }
                if let Err(e) = self.validate_message_text(&p.text) {
                    return e;
                }
                match self
                    .adapter
                    .send_single(&p.thread_id, &p.text, p.is_group)
                    .await
                {
                    Ok(()) => {
                        // Remember the bubble so the ingest pipeline can
                        // drop the HTTP response's duplicate of it.
                        self.reflex
                            .lock()
                            .expect("reflex guard mutex")
                            .record(&p.thread_id, &p.text, Instant::now());
                        self.metrics.incr_messages_sent();
                        self.telemetry.emit(TelemetryEvent::MessageSent {
                            bubble_type: crate::telemetry::BubbleType::Single,
                            success: true,
                        });
                        CommandOutcome::completed()
                    }
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::ScheduleMessage(p) => {
                if let Err(e) = self.validate_thread_id(&p.thread_id) {
                    return e;
                }
                if let Err(e) = self.validate_message_text(&p.message_text) {
                    return e;
                }
                let send_at = match self.validate_send_at(&p.send_at) {
                    Ok(send_at) => send_at,
                    Err(e) => return e,
                };
                match self
                    .scheduler
                    .schedule(
                        &p.thread_id,
                        &p.message_text,
                        send_at,
                        p.is_group,
                        Some(command.command_id),
                    )
                    .await
                {
                    Ok(_id) => CommandOutcome::completed(),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::CancelScheduled(p) => {
                let Ok(id) = Uuid::parse_str(&p.schedule_id) else {
                    return CommandOutcome::failed(format!(
                        "schedule_id '{}' is not a UUID",
                        p.schedule_id
                    ));
                };
                match self.scheduler.cancel(id).await {
                    Ok(true) => CommandOutcome::completed(),
                    Ok(false) => CommandOutcome::failed("entry is not pending"),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::SetRule(p) => {
                match self
                    .rules
                    .upsert_rule(
                        p.id.clone(),
                        &p.rule_type,
                        &p.name,
                        p.enabled,
                        &p.conditions,
                        &p.action,
                    )
                    .await
                {
                    Ok(_id) => CommandOutcome::completed(),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::UpdatePlan(p) => {
                if let Err(e) = self.validate_thread_id(&p.thread_id) {
                    return e;
                }
                match self.rules.upsert_plan(&p.thread_id, &p.data).await {
                    Ok(_version) => CommandOutcome::completed(),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::ContextUpdate(p) => {
                if let Err(e) = self.validate_thread_id(&p.thread_id) {
                    return e;
                }
                match self
                    .contexts
                    .upsert(&p.thread_id, &p.app_id, &p.room_id, p.metadata.clone())
                    .await
                {
                    Ok(()) => CommandOutcome::completed(),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::ContextReset(p) => {
                if let Err(e) = self.validate_thread_id(&p.thread_id) {
                    return e;
                }
                let reason = p.reason.as_deref().unwrap_or("reset");
                match self.contexts.clear(&p.thread_id, reason).await {
                    // Clearing an already-terminal or absent context is
                    // still a completed reset.
                    Ok(_) => CommandOutcome::completed(),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::UploadRetry(p) => {
                if let Some(wait) = self.retry_gate_remaining(&p.guid) {
                    return CommandOutcome::failed(format!(
                        "retry for {} gated for another {}ms",
                        p.guid,
                        wait.as_millis()
                    ));
                }
                match self.uploader.retry(&p.guid).await {
                    Ok(_uploaded) => CommandOutcome::completed(),
                    Err(e) => CommandOutcome::failed(e.to_string()),
                }
            }

            CommandPayload::EmitEvent(p) => {
                // Forced observability event through the telemetry drain.
                info!(target: "telemetry", forced_event = %p.name, data = %p.data);
                CommandOutcome::completed()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn validate_thread_id(&self, thread_id: &str) -> Result<(), CommandOutcome> {
        if thread_id.is_empty() || thread_id.len() > THREAD_ID_MAX_LEN {
            return Err(CommandOutcome::failed(format!(
                "thread_id length {} outside 1-{THREAD_ID_MAX_LEN}",
                thread_id.len()
            )));
        }
        let ok = thread_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+@._-;".contains(c));
        if !ok {
            return Err(CommandOutcome::failed(
                "thread_id contains characters outside [a-zA-Z0-9+@._-;]",
            ));
        }
        Ok(())
    }

    fn validate_message_text(&self, text: &str) -> Result<(), CommandOutcome> {
        if text.is_empty() {
            return Err(CommandOutcome::failed("message_text is empty"));
        }
        if text.chars().count() > MESSAGE_TEXT_MAX_LEN {
            return Err(CommandOutcome::failed(format!(
                "message_text exceeds {MESSAGE_TEXT_MAX_LEN} characters"
            )));
        }
        if contains_automation_sigils(text) {
            self.telemetry.emit(TelemetryEvent::ErrorOccurred {
                kind: "security_violation".to_owned(),
                component: "executor".to_owned(),
            });
            warn!("command rejected: message_text carries automation sigils");
            return Err(CommandOutcome::failed(
                "message_text carries a host-automation keyword",
            ));
        }
        Ok(())
    }

    fn validate_send_at(&self, send_at: &str) -> Result<DateTime<Utc>, CommandOutcome> {
        let Ok(parsed) = DateTime::parse_from_rfc3339(send_at) else {
            return Err(CommandOutcome::failed(format!(
                "send_at '{send_at}' is not RFC 3339"
            )));
        };
        let send_at = parsed.with_timezone(&Utc);
        let now = Utc::now();
        if send_at < now {
            return Err(CommandOutcome::failed("send_at is in the past"));
        }
        if send_at > now + ChronoDuration::days(365) {
            return Err(CommandOutcome::failed(
                "send_at is more than one year ahead",
            ));
        }
        Ok(send_at)
    }

    /// Remaining gate time for a guid, recording this attempt when open.
    fn retry_gate_remaining(&self, guid: &str) -> Option<Duration> {
        let mut gate = self.retry_gate.lock().expect("retry gate mutex");
        let now = Instant::now();
        if let Some(last) = gate.get(guid) {
            let since = now.duration_since(*last);
            if since < UPLOAD_RETRY_GATE {
                return Some(UPLOAD_RETRY_GATE - since);
            }
        }
        gate.insert(guid.to_owned(), now);
        None
    }

    /// Diagnostic but never secret-bearing.
    fn sanitize_error(&self, error: &str) -> String {
        let scrubbed = if self.secret.is_empty() {
            error.to_owned()
        } else {
            error.replace(&self.secret, "[redacted]")
        };
        let mut clipped: String = scrubbed.chars().take(MAX_ACK_ERROR_LEN).collect();
        if clipped.len() < scrubbed.len() {
            clipped.push('…');
        }
        clipped
    }
}

/// Immediate commands go to the head; normal ones to the tail.
fn enqueue(queue: &mut VecDeque<OrchestratorCommand>, command: OrchestratorCommand) {
    match command.priority {
        CommandPriority::Immediate => queue.push_front(command),
        CommandPriority::Normal => queue.push_back(command),
    }
}
