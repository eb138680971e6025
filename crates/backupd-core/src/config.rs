use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_TIME_ZONE: &str = "UTC";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
/// Environment overrides use this prefix and `__` between nesting levels,
/// e.g. `BACKUPD_SCHEDULER__TICK_INTERVAL_MS=500`.
pub const ENV_PREFIX: &str = "BACKUPD_";

/// Top-level config (backupd.toml + BACKUPD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupdConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Full profile list. Delivered to the registry as a replacement on every reload.
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the worker asks the registry for invocations.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often the config file is polled for changes.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// IANA zone for profiles that don't name their own.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            reload_interval_secs: DEFAULT_RELOAD_INTERVAL_SECS,
            time_zone: DEFAULT_TIME_ZONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// gzip level, 0 (store) to 9 (best).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Where finished archives are shipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputConfig {
    /// Write `{profile}.tar.gz` into a local directory.
    Filesystem { path: String },
    /// Upload `{profile}.tar.gz` into a blob storage container.
    Blob(BlobConfig),
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: default_archive_dir(),
        }
    }
}

/// Blob storage account plus the service principal used to reach it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobConfig {
    /// Account endpoint, e.g. `https://account.blob.core.windows.net`.
    pub endpoint: String,
    pub container: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
}

impl std::fmt::Debug for BlobConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobConfig")
            .field("endpoint", &self.endpoint)
            .field("container", &self.container)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authority_host", &self.authority_host)
            .finish()
    }
}

/// A raw, unvalidated profile record as it appears in the config file.
///
/// Every field defaults so one incomplete record never fails the whole file;
/// binding rejects it on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    /// Stable profile id across reloads.
    #[serde(default)]
    pub name: String,
    /// 5-field (minute) or 6/7-field (seconds, year) cron expression.
    #[serde(default)]
    pub cron: String,
    /// Overrides `scheduler.time_zone` for this profile.
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub search_definition: SearchDefinitionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchDefinitionConfig {
    #[serde(default)]
    pub directory: String,
    /// Order matters: a reordered list is a changed profile.
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_reload_interval_secs() -> u64 {
    DEFAULT_RELOAD_INTERVAL_SECS
}
fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}
fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}
fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}
fn default_archive_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.backupd/archives", home)
}

impl BackupdConfig {
    /// Load config from a TOML file with BACKUPD_* env var overrides.
    ///
    /// A missing file is not an error: figment treats it as empty and the
    /// defaults (no profiles) apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = Self::resolve_path(config_path);

        let config: BackupdConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| crate::error::BackupdError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Explicit path argument, else `~/.backupd/backupd.toml`.
    pub fn resolve_path(config_path: Option<&str>) -> PathBuf {
        config_path
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path)
    }
}

fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(format!("{}/.backupd/backupd.toml", home))
}
