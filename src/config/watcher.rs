//! Hot reload of the device configuration
//!
//! notify callbacks run on their own OS thread, so reloads are spawned onto
//! the runtime captured when the watcher was created.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Time given to editors to finish writing before the file is re-read
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches the device configuration file and delivers reloaded configs
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load `config_path` and start watching it
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        let (tx, rx) = mpsc::channel(10);
        let runtime = Handle::current();
        let path = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if matches!(event.kind, EventKind::Modify(_)) => {
                    debug!("Device config modified: {:?}", event.paths);
                    runtime.spawn(reload(path.clone(), tx.clone()));
                }
                Ok(_) => {}
                Err(e) => error!("Watch error: {}", e),
            }
        })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;

        info!("👀 Watching device config: {}", config_path);

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            Arc::new(initial_config),
        ))
    }

    /// Next successfully reloaded config, `None` once the watcher is closed
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

/// Re-read the file; a config that fails to parse is skipped
async fn reload(path: String, tx: mpsc::Sender<AppConfig>) {
    tokio::time::sleep(RELOAD_DEBOUNCE).await;

    match AppConfig::load(&path).await {
        Ok(config) => {
            info!("🔄 Device configuration reloaded");
            if let Err(e) = tx.send(config).await {
                error!("Failed to send config update: {}", e);
            }
        }
        Err(e) => warn!("Failed to reload config (keeping old config): {:#}", e),
    }
}
