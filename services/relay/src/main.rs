// relay: Bridges the local chat store to the remote orchestrator.

use clap::{Arg, Command};
use relay::config::{self, ConfigError, EnvOverrides, RelayConfig};
use relay::send::LogOnlySendAdapter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

fn main() {
    let matches = Command::new("relay")
        .about("Edge relay between the local chat store and the orchestrator")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .default_value("/etc/edge-relay/relay.toml"),
        )
        .get_matches();
    let config_path = PathBuf::from(matches.get_one::<String>("config").expect("has default"));

    let cfg = match config::load_config_from_path(&config_path, &EnvOverrides::from_env()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {e}");
            std::process::exit(3);
        }
    };

    init_tracing(&cfg);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_id = %cfg.edge.agent_id,
        "relay starting"
    );

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let result = runtime.block_on(relay::supervisor::run(cfg, Arc::new(LogOnlySendAdapter)));

    if let Err(e) = result {
        error!(error = %e, "relay exited with error");
        let code = match e {
            relay::supervisor::SupervisorError::AlreadyRunning(_) => 1,
            relay::supervisor::SupervisorError::Secret(_) => 3,
            _ => 1,
        };
        std::process::exit(code);
    }
}

/// Structured logging to stdout, or the configured log file. `RUST_LOG`
/// still wins over the config level when set.
fn init_tracing(cfg: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.logging.level.clone()));

    match open_log_file(cfg) {
        Ok(Some(file)) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        other => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            if let Err(e) = other {
                error!(error = %e, "log file unavailable, logging to stdout");
            }
        }
    }
}

fn open_log_file(cfg: &RelayConfig) -> Result<Option<std::fs::File>, ConfigError> {
    let Some(path) = &cfg.logging.file else {
        return Ok(None);
    };
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)
            .map_err(|e| ConfigError::Io(format!("creating log dir: {e}")))?;
    }
    std::fs::File::options()
        .create(true)
        .append(true)
        .open(path)
        .map(Some)
        .map_err(|e| ConfigError::Io(format!("opening log file '{}': {e}", path.display())))
}
