//! Discovery from a shared cache file.
//!
//! The file holds blob records separated by `\n%%%\n`. Whatever precedes the
//! first separator is a header and ignored. A file whose modification time
//! is older than `max_age` is refused.

use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::{DiscoveryRegistry, Source};
use crate::config::CacheConfig;
use crate::{Error, Result};

/// Record separator.
pub const RECORD_SEPARATOR: &str = "\n%%%\n";

/// Blob records of a cache file, header dropped.
pub fn records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .skip(1)
        .filter(|chunk| !chunk.trim().is_empty())
}

/// Loader for one cache file.
#[derive(Debug)]
pub struct CacheFile {
    config: CacheConfig,
    state: Mutex<LoadState>,
}

#[derive(Debug, Default)]
struct LoadState {
    mtime: Option<SystemTime>,
    checked: Option<Instant>,
}

impl CacheFile {
    /// Loader for `config.path`.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LoadState::default()),
        }
    }

    fn mtime(&self) -> Result<SystemTime> {
        let mtime = std::fs::metadata(&self.config.path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default();
        if age > self.config.max_age {
            return Err(Error::StaleCache(format!(
                "{} last modified {}s ago",
                self.config.path.display(),
                age.as_secs()
            )));
        }
        Ok(mtime)
    }

    /// Read the file and replace the registry's permanent contents.
    /// Returns the number of records read.
    pub fn load(&self, registry: &DiscoveryRegistry) -> Result<usize> {
        let mtime = self.mtime()?;
        let text = std::fs::read_to_string(&self.config.path)?;
        let blobs: Vec<&str> = records(&text).collect();
        registry.reload(blobs.iter().map(|b| b.as_bytes()), Source::Permanent);

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.mtime = Some(mtime);
        state.checked = Some(Instant::now());
        debug!(path = %self.config.path.display(), records = blobs.len(), "loaded discovery cache");
        Ok(blobs.len())
    }

    /// Reload if `reload_interval` has passed since the last check and the
    /// file changed. Returns whether a reload happened.
    pub fn refresh(&self, registry: &DiscoveryRegistry) -> Result<bool> {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            if state
                .checked
                .is_some_and(|at| now.duration_since(at) < self.config.reload_interval)
            {
                return Ok(false);
            }
            state.checked = Some(now);
            let mtime = self.mtime()?;
            if state.mtime == Some(mtime) {
                return Ok(false);
            }
        }
        self.load(registry)?;
        Ok(true)
    }

    /// Poll the file every `reload_interval` until shutdown.
    pub fn spawn(
        self,
        registry: DiscoveryRegistry,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(path = %self.config.path.display(), "watching discovery cache");
            let mut interval = tokio::time::interval(self.config.reload_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.refresh(&registry) {
                            warn!(error = %e, "discovery cache reload failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("discovery cache watcher shutting down");
                        break;
                    }
                }
            }
        })
    }
}
