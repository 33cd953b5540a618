//! Ingest coordinator.
//!
//! Drives the tail poll loop and, per inbound message: enriches attachments,
//! annotates the active context and matching rules, uploads attachments,
//! posts `/edge/message`, and dispatches the orchestrator's reply bubbles to
//! the send adapter.
//!
//! # Reflex suppression
//! While an HTTP request is in flight the orchestrator may push a
//! `send_message_now` down the WebSocket so the user sees a reaction fast.
//! The executor records those sends in the [`ReflexGuard`]; when the HTTP
//! response then leads with the same bubble for the same thread within 60 s,
//! that first bubble is dropped so the user sees it once.

use crate::attachments::AttachmentUploader;
use crate::context::{ContextState, ContextStore};
use crate::health::Metrics;
use crate::link::{HttpClient, PendingEvents};
use crate::rules::RuleStore;
use crate::send::{SendAdapter, SendError};
use crate::tailer::{ChatTailer, InboundMessage};
use crate::telemetry::{BubbleType, Telemetry, TelemetryEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Up to this many inbound messages process in parallel.
const INGEST_PARALLELISM: usize = 3;

/// Reflex entries expire after this long.
const REFLEX_TTL: Duration = Duration::from_secs(60);

/// Total reflex entries kept across all threads.
const REFLEX_CAP: usize = 1000;

// ---------------------------------------------------------------------------
// ReflexGuard
// ---------------------------------------------------------------------------

struct ReflexEntry {
    thread_id: String,
    text: String,
    inserted_at: Instant,
}

/// Recent reflex sends, insertion-ordered so age expiry and over-cap LRU
/// eviction both pop from the front.
#[derive(Default)]
pub struct ReflexGuard {
    entries: VecDeque<ReflexEntry>,
}

impl ReflexGuard {
    pub fn new() -> Self {
        ReflexGuard::default()
    }

    /// Record a reflex bubble dispatched via the bidirectional channel.
    pub fn record(&mut self, thread_id: &str, text: &str, now: Instant) {
        self.evict(now);
        if self.entries.len() >= REFLEX_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(ReflexEntry {
            thread_id: thread_id.to_owned(),
            text: text.to_owned(),
            inserted_at: now,
        });
    }

    /// True when `first_bubble` duplicates a recent reflex for this thread.
    /// A hit consumes the entry: one reflex suppresses one bubble.
    pub fn suppress(&mut self, thread_id: &str, first_bubble: &str, now: Instant) -> bool {
        self.evict(now);
        let position = self
            .entries
            .iter()
            .position(|e| e.thread_id == thread_id && e.text == first_bubble);
        match position {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.inserted_at) >= REFLEX_TTL {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct IngestCoordinator {
    tailer: ChatTailer,
    uploader: Arc<AttachmentUploader>,
    contexts: ContextStore,
    rules: RuleStore,
    http: Arc<HttpClient>,
    pending: Arc<PendingEvents>,
    adapter: Arc<dyn SendAdapter>,
    reflex: Arc<Mutex<ReflexGuard>>,
    metrics: Arc<Metrics>,
    telemetry: Telemetry,
    poll_interval: Duration,
    workers: Arc<Semaphore>,
}

impl IngestCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tailer: ChatTailer,
        uploader: Arc<AttachmentUploader>,
        contexts: ContextStore,
        rules: RuleStore,
        http: Arc<HttpClient>,
        pending: Arc<PendingEvents>,
        adapter: Arc<dyn SendAdapter>,
        reflex: Arc<Mutex<ReflexGuard>>,
        metrics: Arc<Metrics>,
        telemetry: Telemetry,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(IngestCoordinator {
            tailer,
            uploader,
            contexts,
            rules,
            http,
            pending,
            adapter,
            reflex,
            metrics,
            telemetry,
            poll_interval,
            workers: Arc::new(Semaphore::new(INGEST_PARALLELISM)),
        })
    }

    /// Spawn the poll loop. The poller itself never overlaps; messages fan
    /// out to the bounded worker pool.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = self;
        tokio::spawn(async move {
            info!(
                poll_interval_ms = coordinator.poll_interval.as_millis() as u64,
                "ingest poll loop started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(coordinator.poll_interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                coordinator.clone().poll_once().await;
            }
            info!("ingest poll loop stopped");
        })
    }

    /// One poll: fetch the batch, hand each message to a worker, then commit
    /// the cursor. Per-message failures are contained by the workers and do
    /// not rewind the cursor.
    pub async fn poll_once(self: Arc<Self>) {
        let batch = match self.tailer.poll().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "tail poll failed");
                self.telemetry.emit(TelemetryEvent::ErrorOccurred {
                    kind: "storage".to_owned(),
                    component: "ingest".to_owned(),
                });
                return;
            }
        };
        if batch.messages.is_empty() {
            return;
        }

        for message in batch.messages {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.process_message(message).await;
                drop(permit);
            });
        }

        if let Err(e) = self.tailer.commit(batch.cursor).await {
            warn!(error = %e, cursor = batch.cursor, "cursor commit failed");
        }
    }

    /// Full pipeline for one inbound message. Public so integration tests
    /// can drive a message through without the poll loop.
    pub async fn process_message(&self, message: InboundMessage) {
        self.metrics.incr_messages_received();
        self.telemetry.emit(TelemetryEvent::MessageReceived {
            thread_id: message.thread_id.clone(),
        });

        let payload = self.build_payload(&message).await;

        let response = match self.http.send_message(&payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!(thread_id = %message.thread_id, error = %e,
                      "/edge/message failed, buffering for sync");
                self.telemetry.emit(TelemetryEvent::ErrorOccurred {
                    kind: "transport".to_owned(),
                    component: "ingest".to_owned(),
                });
                self.pending.push(payload);
                return;
            }
        };

        let mut bubbles = response.bubbles();
        if bubbles.is_empty() {
            debug!(thread_id = %message.thread_id, "orchestrator chose not to respond");
            return;
        }

        // Reflex-duplicate suppression against the first bubble only.
        let suppressed = {
            let mut guard = self.reflex.lock().expect("reflex guard mutex");
            guard.suppress(&message.thread_id, &bubbles[0], Instant::now())
        };
        if suppressed {
            debug!(thread_id = %message.thread_id, "first bubble suppressed as reflex duplicate");
            bubbles.remove(0);
            if bubbles.is_empty() {
                return;
            }
        }

        if let Some(delay) = response.burst_delay_ms {
            // Advisory; natural spacing already exceeds typical requests.
            debug!(burst_delay_ms = delay, "orchestrator requested burst delay");
        }
        self.dispatch_bubbles(&message, bubbles).await;
    }

    async fn build_payload(&self, message: &InboundMessage) -> edge_protocol::InboundPayload {
        let mut attachments = self.uploader.enrich(&message.attachments);

        let context_record = match self.contexts.get(&message.thread_id).await {
            Ok(record) => record.filter(|r| r.state == ContextState::Active),
            Err(e) => {
                warn!(thread_id = %message.thread_id, error = %e, "context lookup failed");
                None
            }
        };

        let matched_rule_ids = match self
            .rules
            .matching_rule_ids(&message.text, &message.sender_id)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "rule evaluation failed");
                Vec::new()
            }
        };

        // Upload attachments before the post; failures degrade to a skip
        // reason instead of blocking the message.
        for (attachment, descriptor) in message.attachments.iter().zip(attachments.iter_mut()) {
            if descriptor.skip_reason.is_some() {
                continue;
            }
            match self.uploader.upload(attachment, context_record.as_ref()).await {
                Ok(uploaded) => descriptor.remote_photo_id = Some(uploaded.remote_photo_id),
                Err(e) => {
                    warn!(guid = %attachment.guid, error = %e, "attachment upload failed");
                    descriptor.skip_reason = Some(e.to_string());
                }
            }
        }

        edge_protocol::InboundPayload {
            thread_id: message.thread_id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
            is_group: message.is_group,
            participants: message.participants.clone(),
            attachments,
            context: context_record
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok()),
            matched_rule_ids,
        }
    }

    async fn dispatch_bubbles(&self, message: &InboundMessage, bubbles: Vec<String>) {
        let bubble_type = if bubbles.len() == 1 {
            BubbleType::Single
        } else {
            BubbleType::Burst
        };
        let result = if bubbles.len() == 1 {
            self.adapter
                .send_single(&message.thread_id, &bubbles[0], message.is_group)
                .await
        } else {
            self.adapter
                .send_burst(&message.thread_id, &bubbles, message.is_group, false)
                .await
        };

        match &result {
            Ok(()) => {
                for _ in &bubbles {
                    self.metrics.incr_messages_sent();
                }
                self.telemetry.emit(TelemetryEvent::MessageSent {
                    bubble_type,
                    success: true,
                });
            }
            Err(SendError::BurstAborted { sent, reason }) => {
                warn!(thread_id = %message.thread_id, sent = *sent, reason = %reason,
                      "burst partially delivered");
                for _ in 0..*sent {
                    self.metrics.incr_messages_sent();
                }
                self.telemetry.emit(TelemetryEvent::MessageSent {
                    bubble_type,
                    success: false,
                });
            }
            Err(e) => {
                warn!(thread_id = %message.thread_id, error = %e, "bubble dispatch failed");
                self.telemetry.emit(TelemetryEvent::MessageSent {
                    bubble_type,
                    success: false,
                });
            }
        }
    }
}
