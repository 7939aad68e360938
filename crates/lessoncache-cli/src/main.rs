//! lessoncache - command line driver for the offline module cache.
//!
//! One-shot commands open the store, probe the remote once and exit. `run`
//! keeps the engine alive with background sync until interrupted.

mod commands;
mod format;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use lessoncache_core::{
    ApiClient, CachedModule, Config, ConnectivityProbe, DirectoryQuota, DownloadOptions,
    HttpProbe, HttpTransfer, NetworkMonitor, NetworkStatus, OfflineEngine, ProgressRecord,
    PushOutcome, RemoteAuthority, RemoteError, Store,
};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix inside `log_dir`; the appender adds the date.
const LOG_FILE_PREFIX: &str = "lessoncache.log";

/// User id recorded on progress when none is configured.
const DEFAULT_USER_ID: &str = "local";

#[derive(Parser)]
#[command(name = "lessoncache")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Offline cache and progress sync for learning modules")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show connectivity, storage and sync state
    Status,

    /// List known modules
    Catalog {
        /// Fetch the catalog from the remote first
        #[arg(short, long)]
        refresh: bool,
    },

    /// Download a module and wait for it to finish
    Download {
        module_id: String,
    },

    /// Remove a module and media no other module uses
    Remove {
        module_id: String,
    },

    /// Pin a module so the sweep never removes it
    Pin {
        module_id: String,

        /// Unpin instead
        #[arg(long)]
        off: bool,
    },

    /// Record progress for a section
    Progress {
        module_id: String,
        section_id: String,

        /// Completion fraction, 0.0 to 1.0
        completion: f32,

        #[arg(long)]
        score: Option<f32>,

        /// Seconds spent on the section
        #[arg(long, default_value_t = 0)]
        time_spent: u64,

        /// Answers as a JSON document
        #[arg(long, value_name = "JSON")]
        responses: Option<String>,
    },

    /// Push pending progress now
    Sync,

    /// Remove expired, unpinned modules and orphaned media
    Sweep,

    /// Delete all cached media
    ClearCache,

    /// Show or change engine settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },

    /// Keep running with background sync until interrupted
    Run,
}

#[derive(Subcommand)]
pub enum SettingsAction {
    Show,
    /// Apply one or more camelCase `key=value` assignments
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        assignments: Vec<String>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(default_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Stand-in remote when no `remote_url` is configured.
struct Unconfigured;

#[async_trait]
impl RemoteAuthority for Unconfigured {
    async fn push_progress(&self, _records: &[ProgressRecord]) -> Result<PushOutcome, RemoteError> {
        Err(RemoteError::Unavailable("no remote_url configured".into()))
    }

    async fn fetch_catalog(&self) -> Result<Vec<CachedModule>, RemoteError> {
        Err(RemoteError::Unavailable("no remote_url configured".into()))
    }
}

/// Everything a command needs.
pub struct Session {
    pub engine: OfflineEngine,
    pub network: NetworkMonitor,
    pub probe: Option<Arc<dyn ConnectivityProbe>>,
    pub config: Config,
}

impl Session {
    pub fn user_id(&self) -> &str {
        self.config.user_id.as_deref().unwrap_or(DEFAULT_USER_ID)
    }
}

async fn open_session(config: Config) -> Result<Session> {
    let data_dir = config.data_dir()?;
    let store = Arc::new(
        Store::open(&data_dir)
            .await
            .with_context(|| format!("Failed to open store at {}", data_dir.display()))?,
    );
    debug!(dir = %data_dir.display(), "Store opened");

    let remote: Arc<dyn RemoteAuthority>;
    let probe: Option<Arc<dyn ConnectivityProbe>>;
    match config.remote_url.as_deref() {
        Some(url) => {
            let mut client = ApiClient::new(url).context("Failed to create API client")?;
            if let Some(ref token) = config.api_token {
                client.set_token(token.clone());
            }
            remote = Arc::new(client);
            probe = Some(Arc::new(
                HttpProbe::new(url, config.connection_type)
                    .context("Failed to create connectivity probe")?,
            ));
        }
        None => {
            remote = Arc::new(Unconfigured);
            probe = None;
        }
    }

    // One probe up front so admission sees real connectivity.
    let initial = match &probe {
        Some(probe) => probe.probe().await,
        None => NetworkStatus::offline(),
    };
    let network = NetworkMonitor::new(initial);

    let engine = OfflineEngine::builder(
        remote,
        Arc::new(HttpTransfer::new().context("Failed to create media transfer")?),
    )
    .store(store.clone())
    .quota(Arc::new(DirectoryQuota::new(config.storage_capacity, store)))
    .network(network.clone())
    .download_options(DownloadOptions {
        max_concurrent: config.max_concurrent_downloads,
        enforce_storage_ceiling: config.enforce_storage_ceiling,
    })
    .build()
    .await;

    Ok(Session {
        engine,
        network,
        probe,
        config,
    })
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env();
    if let Some(ref dir) = cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let default_level = if matches!(cli.command, Commands::Run) { "info" } else { "warn" };
    let _guard = init_tracing(default_level, config.log_dir.as_deref());
    info!("lessoncache starting");

    let session = open_session(config).await?;
    let result = commands::dispatch(&session, cli.command).await;
    session.engine.shutdown().await;
    info!("lessoncache shutting down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_progress() {
        let cli = Cli::try_parse_from([
            "lessoncache",
            "progress",
            "m1",
            "s1",
            "0.5",
            "--score",
            "90",
        ])
        .expect("parse");
        match cli.command {
            Commands::Progress {
                module_id,
                completion,
                score,
                time_spent,
                ..
            } => {
                assert_eq!(module_id, "m1");
                assert_eq!(completion, 0.5);
                assert_eq!(score, Some(90.0));
                assert_eq!(time_spent, 0);
            }
            _ => panic!("expected progress command"),
        }
    }

    #[test]
    fn test_settings_set_requires_assignment() {
        assert!(Cli::try_parse_from(["lessoncache", "settings", "set"]).is_err());
        let cli = Cli::try_parse_from(["lessoncache", "settings", "set", "autoDownload=true"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Settings {
                action: Some(SettingsAction::Set { .. })
            }
        ));
    }

    #[test]
    fn test_global_data_dir_flag() {
        let cli = Cli::try_parse_from(["lessoncache", "sweep", "--data-dir", "/tmp/lc"])
            .expect("parse");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/lc")));
    }
}
