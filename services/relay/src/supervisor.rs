//! Lifecycle supervisor.
//!
//! Owns every component and every background task. Startup order: secret
//! key → state stores → tailer/context/attachments/scheduler/rules → link
//! (connect attempt is non-blocking) → ingest poll loop → scheduler wake →
//! health surface. Shutdown on SIGINT/SIGTERM: signal every task, give the
//! executor a bounded drain, abort stragglers, flush telemetry, release the
//! pidfile.

use crate::attachments::AttachmentUploader;
use crate::config::RelayConfig;
use crate::context::ContextStore;
use crate::executor::CommandExecutor;
use crate::health::{self, HealthState, Metrics};
use crate::ingest::{IngestCoordinator, ReflexGuard};
use crate::link::{HttpClient, OrchestratorLink, backoff_delay};
use crate::rules::RuleStore;
use crate::scheduler::Scheduler;
use crate::secrets::{self, SecretError};
use crate::send::SendAdapter;
use crate::storage::{APP_SCHEMA, MESSAGING_SCHEMA, StateStore, StorageError};
use crate::tailer::{ChatSource, ChatTailer, CursorStore, ExternalStoreError};
use crate::telemetry::{Telemetry, TelemetryEvent};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// In-flight commands get this long to drain on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("another relay instance is running (pid {0})")]
    AlreadyRunning(u32),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    ChatStore(#[from] ExternalStoreError),
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Pidfile guard
// ---------------------------------------------------------------------------

/// Single-instance guard. The file holds the owning pid; a stale file (dead
/// pid) is removed and reacquired. Released on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<PidFile, SupervisorError> {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(pid) = content.trim().parse::<u32>() {
                if process_alive(pid) {
                    return Err(SupervisorError::AlreadyRunning(pid));
                }
                info!(pid, "removing stale pidfile");
            }
            let _ = std::fs::remove_file(path);
        }
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(PidFile {
            path: path.to_owned(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Process-liveness probe behind the pidfile check.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// `relay.pid` next to the messaging store.
pub fn pidfile_path(cfg: &RelayConfig) -> PathBuf {
    cfg.database
        .path
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relay.pid")
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Bring the relay up, run until a termination signal, then shut down
/// gracefully. `send_adapter` is the host automation driver (already
/// selected at construction; policy wrapping happens here).
pub async fn run(
    cfg: RelayConfig,
    send_adapter: Arc<dyn SendAdapter>,
) -> Result<(), SupervisorError> {
    let _pidfile = PidFile::acquire(&pidfile_path(&cfg))?;
    let telemetry = Telemetry::new();

    // Key first, then the two encrypted stores it unlocks.
    let key = secrets::ensure_key(
        &cfg.security.keychain_service,
        &cfg.security.keychain_account,
    )
    .await?;
    let messaging_store = StateStore::open(&cfg.database.path, &key, MESSAGING_SCHEMA)?;
    let app_store = StateStore::open(&cfg.database.state_path, &key, APP_SCHEMA)?;

    let metrics = Metrics::new(&cfg.edge.agent_id);
    let http = Arc::new(
        HttpClient::new(&cfg.backend, &cfg.edge)
            .map_err(|e| SupervisorError::Transport(e.to_string()))?,
    );

    // Leaf components.
    let adapter: Arc<dyn SendAdapter> =
        Arc::new(crate::send::RateLimitedAdapter::new(send_adapter));
    let chat_source = Arc::new(ChatSource::open(
        &cfg.imessage.db_path,
        &cfg.imessage.attachments_path,
    )?);
    let contexts = ContextStore::new(app_store.clone());
    let rules = RuleStore::new(app_store.clone());
    let uploader = Arc::new(AttachmentUploader::new(
        app_store,
        chat_source.clone(),
        http.clone(),
        telemetry.clone(),
        cfg.attachments.max_edge_px,
    ));
    let tailer = ChatTailer::open(
        chat_source,
        CursorStore::new(messaging_store.clone()),
    )
    .await?;
    let scheduler = Scheduler::new(
        messaging_store,
        adapter.clone(),
        telemetry.clone(),
        metrics.clone(),
        cfg.scheduler.adaptive_mode,
        cfg.scheduler.check_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    // Link tasks (connect attempt is non-blocking).
    let (link, mut tasks) = OrchestratorLink::start(
        &cfg,
        http.clone(),
        command_tx,
        metrics.clone(),
        telemetry.clone(),
        shutdown_rx.clone(),
    );
    tasks.push(spawn_registration(
        http,
        metrics.clone(),
        telemetry.clone(),
        shutdown_rx.clone(),
    ));

    // Ingest and scheduler loops.
    let reflex = Arc::new(Mutex::new(ReflexGuard::new()));
    let ingest = IngestCoordinator::new(
        tailer,
        uploader.clone(),
        contexts.clone(),
        rules.clone(),
        link.http().clone(),
        link.pending_events().clone(),
        adapter.clone(),
        reflex.clone(),
        metrics.clone(),
        telemetry.clone(),
        cfg.imessage.poll_interval,
    );
    tasks.push(ingest.start(shutdown_rx.clone()));
    tasks.push(scheduler.clone().start(shutdown_rx.clone()));

    // Serialized command execution.
    let executor = CommandExecutor::new(
        scheduler,
        contexts,
        rules,
        uploader,
        adapter,
        link,
        reflex,
        metrics.clone(),
        telemetry.clone(),
        cfg.edge.secret.clone(),
    );
    tasks.push(executor.start(command_rx, shutdown_rx.clone()));

    // Health surface.
    if cfg.monitoring.health_check_enabled {
        let state = HealthState {
            metrics: metrics.clone(),
        };
        tasks.push(health::serve(cfg.monitoring.health_check_port, state, shutdown_rx).await?);
    }

    telemetry.emit(TelemetryEvent::AgentStarted {
        agent_id: cfg.edge.agent_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    });
    info!(agent_id = %cfg.edge.agent_id, "relay up");

    wait_for_termination().await;
    info!("termination signal received, shutting down");

    let _ = shutdown_tx.send(true);
    drain_tasks(tasks).await;

    telemetry.emit(TelemetryEvent::AgentStopped {
        uptime_seconds: metrics.uptime_seconds(),
    });
    // Give the telemetry drain one beat to flush the stop event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("relay stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Shutdown plumbing
// ---------------------------------------------------------------------------

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Wait up to the drain window for tasks to finish, then abort stragglers.
async fn drain_tasks(tasks: Vec<JoinHandle<()>>) {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    let all_done = futures_util::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_DRAIN, all_done).await.is_err() {
        warn!(
            drain_secs = SHUTDOWN_DRAIN.as_secs(),
            "drain window elapsed, aborting remaining tasks"
        );
        for abort in aborts {
            abort.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Registration (retries forever until shutdown)
// ---------------------------------------------------------------------------

fn spawn_registration(
    http: Arc<HttpClient>,
    metrics: Arc<Metrics>,
    telemetry: Telemetry,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match http.register().await {
                Ok(agent_id) => {
                    metrics.set_registered(&agent_id);
                    info!(agent_id = %agent_id, "registered with orchestrator");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "registration failed");
                    telemetry.emit(TelemetryEvent::ErrorOccurred {
                        kind: "transport".to_owned(),
                        component: "registration".to_owned(),
                    });
                }
            }
            let delay = backoff_delay(attempt, 6);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        {
            let _guard = PidFile::acquire(&path).unwrap();
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content, std::process::id().to_string());

            // Second acquire sees a live pid (ours) and refuses.
            let err = PidFile::acquire(&path).unwrap_err();
            assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        }
        assert!(!path.exists(), "released on drop");
    }

    #[test]
    fn stale_pidfile_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        // No live process has pid near u32::MAX on any sane host.
        std::fs::write(&path, "4294967294").unwrap();

        let _guard = PidFile::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn garbage_pidfile_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        std::fs::write(&path, "not a pid").unwrap();
        let _guard = PidFile::acquire(&path).unwrap();
    }
}
