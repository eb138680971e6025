use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use backupd_core::config::{BackupdConfig, OutputConfig};
use backupd_scheduler::{ProfileRegistry, ReloadReport};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Cheap change detector for the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    /// `None` when the file cannot be stat'ed.
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Result of one look at the file, computed off the async runtime.
enum Observed {
    Missing,
    Unchanged,
    Changed(Fingerprint, backupd_core::Result<BackupdConfig>),
}

fn observe(path: &Path, last: Option<Fingerprint>) -> Observed {
    let Some(current) = Fingerprint::of(path) else {
        return Observed::Missing;
    };
    if last == Some(current) {
        return Observed::Unchanged;
    }
    let loaded = BackupdConfig::load(Some(&*path.to_string_lossy()));
    Observed::Changed(current, loaded)
}

/// Re-reads the config file when it changes and pushes the new profile list
/// into the registry.
pub struct ConfigWatcher {
    path: PathBuf,
    registry: Arc<ProfileRegistry>,
    interval: Duration,
    last: Option<Fingerprint>,
    /// Settings that only take effect at startup.
    output: OutputConfig,
    time_zone: String,
}

impl ConfigWatcher {
    /// `loaded` is the configuration the daemon started with and `baseline`
    /// the file's fingerprint taken before it was read.
    pub fn new(
        path: PathBuf,
        registry: Arc<ProfileRegistry>,
        loaded: &BackupdConfig,
        baseline: Option<Fingerprint>,
    ) -> Self {
        Self {
            path,
            registry,
            interval: Duration::from_secs(loaded.scheduler.reload_interval_secs.max(1)),
            last: baseline,
            output: loaded.output.clone(),
            time_zone: loaded.scheduler.time_zone.clone(),
        }
    }

    /// Check the file once. Returns the registry's report when a reload was
    /// applied.
    pub async fn poll(&mut self) -> Option<ReloadReport> {
        let path = self.path.clone();
        let last = self.last;
        let observed = match tokio::task::spawn_blocking(move || observe(&path, last)).await {
            Ok(o) => o,
            Err(e) => {
                error!(error = %e, "config check task failed");
                return None;
            }
        };

        let (current, loaded) = match observed {
            Observed::Unchanged => return None,
            Observed::Missing => {
                if self.last.take().is_some() {
                    warn!(path = %self.path.display(), "config file disappeared, keeping current profiles");
                }
                return None;
            }
            Observed::Changed(current, loaded) => (current, loaded),
        };
        self.last = Some(current);

        debug!(path = %self.path.display(), "config file changed, reloading");
        let config = match loaded {
            Ok(c) => c,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "config reload failed, keeping current profiles");
                return None;
            }
        };

        if config.output != self.output || config.scheduler.time_zone != self.time_zone {
            warn!("output or scheduler time zone changed; restart backupd to apply");
        }
        Some(self.registry.apply_configuration(&config.profiles))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), every_secs = self.interval.as_secs(), "watching config file");

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
