//! Relay configuration loading.
//!
//! TOML is the config source; the bearer secret and two overrides come from
//! the process environment (`EDGE_SECRET`, `BACKEND_URL`, `USER_PHONE`).
//! Default config path: `/etc/edge-relay/relay.toml`.
//!
//! Validation is collect-all: a bad config aborts startup with one error
//! listing every offending field, not just the first.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level relay configuration after validation and env overrides.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub edge: EdgeConfig,
    pub backend: BackendConfig,
    pub websocket: WebsocketConfig,
    pub imessage: ImessageConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub attachments: AttachmentsConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub agent_id: String,
    /// E.164 number of the local user; their own messages are never ingested.
    pub user_phone: String,
    /// Bearer secret from `EDGE_SECRET`.
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    /// Derived from `url` by scheme swap + `/edge/ws` when absent.
    pub websocket_url: String,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub enabled: bool,
    /// Caps the number of doublings in the reconnect backoff (delay still
    /// never exceeds 60 s and reconnection itself never stops).
    pub reconnect_attempts: u32,
    pub ping_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ImessageConfig {
    pub poll_interval: Duration,
    pub db_path: PathBuf,
    pub attachments_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Messaging store: scheduled_messages + cursor_state.
    pub path: PathBuf,
    /// App-state store: chat_contexts, rules, plans, attachment_cache.
    pub state_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub adaptive_mode: bool,
    /// Fallback sweep interval when adaptive mode is off.
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AttachmentsConfig {
    /// Longest-edge bound for transcoded uploads, in pixels.
    pub max_edge_px: u32,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub health_check_enabled: bool,
    pub health_check_port: u16,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub keychain_service: String,
    pub keychain_account: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option-everything, validated below)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    edge: Option<RawEdge>,
    backend: Option<RawBackend>,
    websocket: Option<RawWebsocket>,
    imessage: Option<RawImessage>,
    database: Option<RawDatabase>,
    scheduler: Option<RawScheduler>,
    attachments: Option<RawAttachments>,
    logging: Option<RawLogging>,
    monitoring: Option<RawMonitoring>,
    security: Option<RawSecurity>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEdge {
    agent_id: Option<String>,
    user_phone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBackend {
    url: Option<String>,
    websocket_url: Option<String>,
    sync_interval_seconds: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWebsocket {
    enabled: Option<bool>,
    reconnect_attempts: Option<u32>,
    ping_interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImessage {
    poll_interval_seconds: Option<f64>,
    db_path: Option<String>,
    attachments_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabase {
    path: Option<String>,
    state_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawScheduler {
    adaptive_mode: Option<bool>,
    check_interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAttachments {
    max_edge_px: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    level: Option<String>,
    file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMonitoring {
    health_check: Option<RawHealthCheck>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHealthCheck {
    enabled: Option<bool>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSecurity {
    keychain_service: Option<String>,
    keychain_account: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

/// Secrets and overrides read from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub edge_secret: Option<String>,
    pub backend_url: Option<String>,
    pub user_phone: Option<String>,
}

impl EnvOverrides {
    /// Capture `EDGE_SECRET`, `BACKEND_URL`, and `USER_PHONE` from the
    /// current process environment. Values are trimmed; empty means absent.
    pub fn from_env() -> Self {
        fn non_empty(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        }
        EnvOverrides {
            edge_secret: non_empty("EDGE_SECRET"),
            backend_url: non_empty("BACKEND_URL"),
            user_phone: non_empty("USER_PHONE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from the default path `/etc/edge-relay/relay.toml`.
pub fn load_config(env: &EnvOverrides) -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/edge-relay/relay.toml"), env)
}

/// Load relay config from a custom path.
pub fn load_config_from_path(path: &Path, env: &EnvOverrides) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str, env)
}

/// Load relay config from a TOML string, applying env overrides and
/// validating every field. All violations are reported together.
pub fn load_config_from_str(toml_str: &str, env: &EnvOverrides) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut bad: Vec<String> = Vec::new();

    // --- edge ---
    let raw_edge = raw.edge.unwrap_or_default();
    let agent_id = match raw_edge.agent_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            bad.push("edge.agent_id is required".to_owned());
            String::new()
        }
    };
    let user_phone = match env.user_phone.clone().or(raw_edge.user_phone) {
        Some(p) if is_e164(&p) => p,
        Some(p) => {
            bad.push(format!("edge.user_phone '{p}' is not an E.164 number"));
            String::new()
        }
        None => {
            bad.push("edge.user_phone is required".to_owned());
            String::new()
        }
    };
    let secret = match &env.edge_secret {
        Some(s) => s.clone(),
        None => {
            bad.push("EDGE_SECRET environment variable is required".to_owned());
            String::new()
        }
    };

    // --- backend ---
    let raw_backend = raw.backend.unwrap_or_default();
    let url = match env.backend_url.clone().or(raw_backend.url) {
        Some(u) if u.starts_with("https://") || u.starts_with("http://") => {
            u.trim_end_matches('/').to_owned()
        }
        Some(u) => {
            bad.push(format!("backend.url '{u}' must be an http(s) URL"));
            String::new()
        }
        None => {
            bad.push("backend.url is required".to_owned());
            String::new()
        }
    };
    let websocket_url = match raw_backend.websocket_url {
        Some(w) if w.starts_with("wss://") || w.starts_with("ws://") => w,
        Some(w) => {
            bad.push(format!("backend.websocket_url '{w}' must be a ws(s) URL"));
            String::new()
        }
        None => derive_websocket_url(&url),
    };
    let sync_interval_seconds = raw_backend.sync_interval_seconds.unwrap_or(30);
    if !(1..=300).contains(&sync_interval_seconds) {
        bad.push(format!(
            "backend.sync_interval_seconds {sync_interval_seconds} outside 1-300"
        ));
    }
    let request_timeout_ms = raw_backend.request_timeout_ms.unwrap_or(30_000);
    if request_timeout_ms == 0 {
        bad.push("backend.request_timeout_ms must be positive".to_owned());
    }

    // --- websocket ---
    let raw_ws = raw.websocket.unwrap_or_default();
    let websocket = WebsocketConfig {
        enabled: raw_ws.enabled.unwrap_or(true),
        reconnect_attempts: raw_ws.reconnect_attempts.unwrap_or(6),
        ping_interval: Duration::from_secs(raw_ws.ping_interval_seconds.unwrap_or(30)),
    };

    // --- imessage ---
    let raw_im = raw.imessage.unwrap_or_default();
    let poll_secs = raw_im.poll_interval_seconds.unwrap_or(1.0);
    if !(0.1..=60.0).contains(&poll_secs) {
        bad.push(format!(
            "imessage.poll_interval_seconds {poll_secs} outside 0.1-60"
        ));
    }
    let imessage = ImessageConfig {
        poll_interval: Duration::from_secs_f64(poll_secs.clamp(0.1, 60.0)),
        db_path: PathBuf::from(
            raw_im
                .db_path
                .unwrap_or_else(|| "~/Library/Messages/chat.db".to_owned()),
        ),
        attachments_path: PathBuf::from(
            raw_im
                .attachments_path
                .unwrap_or_else(|| "~/Library/Messages/Attachments".to_owned()),
        ),
    };

    // --- database ---
    let raw_db = raw.database.unwrap_or_default();
    let database = DatabaseConfig {
        path: PathBuf::from(raw_db.path.unwrap_or_else(|| "data/relay.db".to_owned())),
        state_path: PathBuf::from(
            raw_db
                .state_path
                .unwrap_or_else(|| "data/state.db".to_owned()),
        ),
    };

    // --- scheduler ---
    let raw_sched = raw.scheduler.unwrap_or_default();
    let scheduler = SchedulerConfig {
        adaptive_mode: raw_sched.adaptive_mode.unwrap_or(true),
        check_interval: Duration::from_secs(raw_sched.check_interval_seconds.unwrap_or(30)),
    };

    // --- attachments ---
    let raw_att = raw.attachments.unwrap_or_default();
    let attachments = AttachmentsConfig {
        max_edge_px: raw_att.max_edge_px.unwrap_or(2048),
    };

    // --- logging ---
    let raw_log = raw.logging.unwrap_or_default();
    let level = raw_log.level.unwrap_or_else(|| "info".to_owned());
    if !matches!(level.as_str(), "debug" | "info" | "warn" | "error") {
        bad.push(format!(
            "logging.level '{level}' must be one of debug, info, warn, error"
        ));
    }
    let logging = LoggingConfig {
        level,
        file: raw_log.file.map(PathBuf::from),
    };

    // --- monitoring ---
    let raw_mon = raw.monitoring.unwrap_or_default();
    let raw_hc = raw_mon.health_check.unwrap_or_default();
    let monitoring = MonitoringConfig {
        health_check_enabled: raw_hc.enabled.unwrap_or(true),
        health_check_port: raw_hc.port.unwrap_or(3001),
    };

    // --- security ---
    let raw_sec = raw.security.unwrap_or_default();
    let security = SecurityConfig {
        keychain_service: raw_sec
            .keychain_service
            .unwrap_or_else(|| "com.edge-relay.state".to_owned()),
        keychain_account: raw_sec
            .keychain_account
            .unwrap_or_else(|| "state-key".to_owned()),
    };

    if !bad.is_empty() {
        return Err(ConfigError::Invalid(bad));
    }

    Ok(RelayConfig {
        edge: EdgeConfig {
            agent_id,
            user_phone,
            secret,
        },
        backend: BackendConfig {
            url,
            websocket_url,
            sync_interval: Duration::from_secs(sync_interval_seconds),
            request_timeout: Duration::from_millis(request_timeout_ms),
        },
        websocket,
        imessage,
        database,
        scheduler,
        attachments,
        logging,
        monitoring,
        security,
    })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// `https://host/base` -> `wss://host/base/edge/ws` (http -> ws likewise).
fn derive_websocket_url(base_url: &str) -> String {
    let swapped = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return String::new();
    };
    format!("{}/edge/ws", swapped.trim_end_matches('/'))
}

/// E.164: leading `+`, then 8-15 digits, first digit non-zero.
fn is_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_secret() -> EnvOverrides {
        EnvOverrides {
            edge_secret: Some("test-secret".to_owned()),
            ..Default::default()
        }
    }

    const MINIMAL: &str = r#"
        [edge]
        agent_id = "edge-1"
        user_phone = "+15551234567"

        [backend]
        url = "https://orchestrator.example.com"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = load_config_from_str(MINIMAL, &env_with_secret()).unwrap();
        assert_eq!(cfg.edge.agent_id, "edge-1");
        assert_eq!(cfg.backend.sync_interval, Duration::from_secs(30));
        assert_eq!(cfg.backend.request_timeout, Duration::from_millis(30_000));
        assert!(cfg.websocket.enabled);
        assert_eq!(cfg.websocket.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.imessage.poll_interval, Duration::from_secs(1));
        assert!(cfg.scheduler.adaptive_mode);
        assert_eq!(cfg.monitoring.health_check_port, 3001);
        assert_eq!(cfg.attachments.max_edge_px, 2048);
    }

    #[test]
    fn websocket_url_is_derived_from_backend_url() {
        let cfg = load_config_from_str(MINIMAL, &env_with_secret()).unwrap();
        assert_eq!(
            cfg.backend.websocket_url,
            "wss://orchestrator.example.com/edge/ws"
        );
    }

    #[test]
    fn explicit_websocket_url_wins() {
        let toml = MINIMAL.replace(
            "url = \"https://orchestrator.example.com\"",
            "url = \"https://orchestrator.example.com\"\nwebsocket_url = \"wss://other.example.com/ws\"",
        );
        let cfg = load_config_from_str(&toml, &env_with_secret()).unwrap();
        assert_eq!(cfg.backend.websocket_url, "wss://other.example.com/ws");
    }

    #[test]
    fn all_violations_are_reported_together() {
        let toml = r#"
            [edge]
            user_phone = "not-a-phone"

            [backend]
            url = "ftp://nope"
            sync_interval_seconds = 900

            [logging]
            level = "chatty"
        "#;
        let err = load_config_from_str(toml, &EnvOverrides::default()).unwrap_err();
        let ConfigError::Invalid(fields) = err else {
            panic!("expected Invalid, got {err:?}");
        };
        let joined = fields.join("\n");
        assert!(joined.contains("edge.agent_id"));
        assert!(joined.contains("user_phone"));
        assert!(joined.contains("EDGE_SECRET"));
        assert!(joined.contains("backend.url"));
        assert!(joined.contains("sync_interval_seconds"));
        assert!(joined.contains("logging.level"));
    }

    #[test]
    fn env_overrides_beat_toml_values() {
        let env = EnvOverrides {
            edge_secret: Some("s".to_owned()),
            backend_url: Some("https://override.example.com".to_owned()),
            user_phone: Some("+442071234567".to_owned()),
        };
        let cfg = load_config_from_str(MINIMAL, &env).unwrap();
        assert_eq!(cfg.backend.url, "https://override.example.com");
        assert_eq!(cfg.edge.user_phone, "+442071234567");
    }

    #[test]
    fn poll_interval_accepts_fractional_seconds() {
        let toml = format!("{MINIMAL}\n[imessage]\npoll_interval_seconds = 0.5\n");
        let cfg = load_config_from_str(&toml, &env_with_secret()).unwrap();
        assert_eq!(cfg.imessage.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn e164_rejects_missing_plus_and_short_numbers() {
        assert!(is_e164("+15551234567"));
        assert!(!is_e164("15551234567"));
        assert!(!is_e164("+1555"));
        assert!(!is_e164("+0155512345"));
        assert!(!is_e164("+1555123456x"));
    }
}
