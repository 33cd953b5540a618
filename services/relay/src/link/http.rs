//! HTTP fallback channel to the orchestrator.
//!
//! Every request carries the bearer secret, the agent id (so the
//! orchestrator can correlate an in-flight request to the WebSocket session
//! and push reflex artifacts down it before the response returns), a
//! request-scoped idempotency id, and a monotonic timestamp.

use crate::config::{BackendConfig, EdgeConfig};
use async_trait::async_trait;
use edge_protocol::{
    AckRequest, CommandAck, InboundPayload, MessageResponse, PhotoUploadResponse, RegisterRequest,
    RegisterResponse, SyncRequest, SyncResponse,
};
use reqwest::StatusCode;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection refused/reset, timeout, or 5xx -- worth retrying.
    #[error("transport error (retryable): {0}")]
    Retryable(String),
    /// 401/403 -- the secret may have rotated externally.
    #[error("transport auth failure: HTTP {0}")]
    Auth(u16),
    /// Anything else; retrying the same request will not help.
    #[error("transport error (terminal): {0}")]
    Terminal(String),
}

impl TransportError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            TransportError::Retryable(e.to_string())
        } else {
            TransportError::Terminal(e.to_string())
        }
    }

    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TransportError::Auth(status.as_u16())
            }
            s if s.is_server_error() => TransportError::Retryable(format!("HTTP {s}")),
            s => TransportError::Terminal(format!("HTTP {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpClient
// ---------------------------------------------------------------------------

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
    user_phone: String,
    /// Config-advisory id until `register` confirms or replaces it.
    agent_id: Mutex<String>,
}

impl HttpClient {
    pub fn new(backend: &BackendConfig, edge: &EdgeConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(backend.request_timeout)
            .build()
            .map_err(|e| TransportError::Terminal(e.to_string()))?;
        Ok(HttpClient {
            client,
            base_url: backend.url.clone(),
            secret: edge.secret.clone(),
            user_phone: edge.user_phone.clone(),
            agent_id: Mutex::new(edge.agent_id.clone()),
        })
    }

    /// The registered agent id (config-advisory until registration).
    pub fn agent_id(&self) -> String {
        self.agent_id.lock().expect("agent id mutex").clone()
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.secret)
            .header("X-Edge-Agent-Id", self.agent_id())
            .header("X-Idempotency-Id", Uuid::new_v4().to_string())
            .header(
                "X-Edge-Timestamp",
                chrono::Utc::now().timestamp_millis().to_string(),
            )
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// `POST /edge/register`. The response's id replaces the advisory one
    /// for all subsequent requests.
    pub async fn register(&self) -> Result<String, TransportError> {
        let body = RegisterRequest {
            agent_id: Some(self.agent_id()),
            user_phone: self.user_phone.clone(),
        };
        let response: RegisterResponse = self.post_json("/edge/register", &body).await?;
        let mut agent_id = self.agent_id.lock().expect("agent id mutex");
        if *agent_id != response.edge_agent_id {
            debug!(
                advisory = %agent_id,
                registered = %response.edge_agent_id,
                "orchestrator assigned a different agent id"
            );
            agent_id.clone_from(&response.edge_agent_id);
        }
        Ok(response.edge_agent_id)
    }

    /// `POST /edge/message`.
    pub async fn send_message(
        &self,
        payload: &InboundPayload,
    ) -> Result<MessageResponse, TransportError> {
        self.post_json("/edge/message", payload).await
    }

    /// `POST /edge/sync` -- WebSocket-down command delivery plus batched
    /// pending-event reporting.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        self.post_json("/edge/sync", request).await
    }

    /// `POST /edge/command/ack` -- WebSocket-down ack path.
    pub async fn ack_command(&self, ack: &CommandAck) -> Result<(), TransportError> {
        let body = AckRequest {
            command_id: ack.command_id,
            success: ack.status == edge_protocol::AckStatus::Completed,
            error: ack.error.clone(),
        };
        let response = self
            .request("/edge/command/ack")
            .json(&body)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(TransportError::from_status(response.status()));
        }
        Ok(())
    }

    /// `POST /photos/upload` -- multipart upload of normalized bytes.
    pub async fn upload_attachment(
        &self,
        guid: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<PhotoUploadResponse, TransportError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(guid.to_owned())
            .mime_str(mime_type)
            .map_err(|e| TransportError::Terminal(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("guid", guid.to_owned())
            .part("photo", part);
        let response = self
            .request("/photos/upload")
            // Uploads get a wider window than ordinary requests.
            .timeout(std::time::Duration::from_secs(60))
            .multipart(form)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(TransportError::from_status(response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Terminal(format!("response body: {e}")))
    }

    /// `GET /health` against the orchestrator.
    pub async fn health(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.secret)
            .header("X-Edge-Agent-Id", self.agent_id())
            .send()
            .await;
        matches!(result, Ok(r) if r.status().is_success())
    }

    // -----------------------------------------------------------------------
    // Private
    // -----------------------------------------------------------------------

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, TransportError>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .request(path)
            .json(body)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(TransportError::from_status(response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Terminal(format!("response body: {e}")))
    }
}

// The uploader's photo-endpoint capability is this client.
#[async_trait]
impl crate::attachments::PhotoUpload for HttpClient {
    async fn upload_photo(
        &self,
        guid: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<PhotoUploadResponse, String> {
        self.upload_attachment(guid, bytes, mime_type)
            .await
            .map_err(|e| e.to_string())
    }
}
