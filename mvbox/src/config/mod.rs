use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thread_classifier::ClassifierConfig;
use tracing::info;

use crate::backoff::Backoff;
use crate::error::{MvboxError, Result};
use crate::transport::imap::ImapSettings;
use crate::worker::WorkerSettings;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub imap: ImapConfig,

    #[serde(default)]
    pub folders: FoldersConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    /// IMAP server hostname
    pub host: String,

    /// IMAP server port, TLS only
    pub port: u16,

    /// Login name, usually the email address
    pub user: String,

    pub password: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            user: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldersConfig {
    /// Folder receiving new mail
    pub source: String,

    /// Folder chat messages are moved to, created if missing
    pub target: String,
}

impl Default for FoldersConfig {
    fn default() -> Self {
        Self {
            source: "INBOX".to_string(),
            target: "DeltaChat".to_string(),
        }
    }
}

/// Classification and scheduling tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound of one long-poll wait
    pub idle_timeout_secs: u64,

    /// Minimum time between two stuck-message sweeps
    pub housekeeping_interval_secs: u64,

    /// How long a message may stay undecided
    pub stuck_timeout_secs: i64,

    pub gap_run_threshold: u32,

    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let classifier = ClassifierConfig::default();
        Self {
            idle_timeout_secs: 30,
            housekeeping_interval_secs: 60,
            stuck_timeout_secs: 3600,
            gap_run_threshold: classifier.gap_run_threshold,
            max_depth: classifier.max_depth,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file, defaults to the platform data directory
    pub path: Option<PathBuf>,
}

/// Restarting halted workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Off: a halted worker stays halted
    pub enabled: bool,

    pub base_delay_ms: u64,

    pub max_delay_secs: u64,

    /// Give up after this many consecutive failures
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_delay_ms: 1000,
            max_delay_secs: 300,
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_secs(self.max_delay_secs),
            self.max_retries,
        )
    }
}

impl AppConfig {
    pub fn imap_settings(&self) -> Result<ImapSettings> {
        if self.imap.host.is_empty() {
            return Err(MvboxError::Config("No IMAP host configured".into()));
        }
        if self.imap.user.is_empty() {
            return Err(MvboxError::Config("No IMAP user configured".into()));
        }

        Ok(ImapSettings {
            host: self.imap.host.clone(),
            port: self.imap.port,
            user: self.imap.user.clone(),
            password: self.imap.password.clone(),
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            source_folder: self.folders.source.clone(),
            target_folder: self.folders.target.clone(),
            idle_timeout: Duration::from_secs(self.engine.idle_timeout_secs),
            housekeeping_interval: Duration::from_secs(self.engine.housekeeping_interval_secs),
            stuck_timeout: chrono::Duration::seconds(self.engine.stuck_timeout_secs),
            classifier: ClassifierConfig {
                gap_run_threshold: self.engine.gap_run_threshold,
                max_depth: self.engine.max_depth,
            },
        }
    }

    /// Configured database path, or the default one
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }
}

pub fn default_database_path() -> Result<PathBuf> {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|dir| dir.join("mvbox").join("mvbox.db"))
        .ok_or_else(|| MvboxError::Config("Cannot determine a data directory".into()))
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mvbox").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mvbox").join("config.toml"));
        paths.push(home_dir.join(".mvbox.toml"));
    }

    paths
}

/// Load configuration from `path`, or from the first default path that exists
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        return load_from_path(path);
    }

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

pub fn load_from_path(path: &Path) -> Result<AppConfig> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| MvboxError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MvboxError::Config(format!("Failed to parse config: {}", e)))?;

    Ok(config)
}
