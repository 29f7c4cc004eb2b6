pub mod reaper;
pub mod run;
pub mod scheduler;
pub mod status;
pub mod worker;

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::watch;
use tracing::{info, warn};

use syncgrid_core::{SharedClock, SyncGridConfig, system_clock};
use syncgrid_state::{StateError, StateStore};

/// Everything a subcommand needs: parsed config, an open store, the clock.
pub struct Context {
    pub config: SyncGridConfig,
    pub store: StateStore,
    pub clock: SharedClock,
}

impl Context {
    pub fn load(config_path: Option<&Path>, db: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => SyncGridConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SyncGridConfig::default(),
        };
        let db_path = config.require_storage_path(db)?;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = StateStore::open(&db_path).map_err(|e| match e {
            StateError::AlreadyOpen(_) => anyhow::anyhow!(
                "{e}; one process owns the store, so stop it or host scheduler, \
                 workers and reaper together with `syncd run`"
            ),
            other => anyhow::Error::new(other)
                .context(format!("opening state store {}", db_path.display())),
        })?;
        info!(db = %db_path.display(), repositories = config.repositories.len(), "state store opened");
        Ok(Self {
            config,
            store,
            clock: system_clock(),
        })
    }
}

/// Flips to `true` on Ctrl-C.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for interrupt; shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

/// Loop interval from the flag, falling back to the configured one.
pub fn interval(flag: Option<u64>, configured: u64) -> Duration {
    Duration::from_secs(flag.unwrap_or(configured).max(1))
}
