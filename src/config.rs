use crate::core::error::{Error, Result};
use crate::core::events::DEFAULT_QUEUE_CAPACITY;
use crate::core::rule::{DEFAULT_CHAIN, DEFAULT_TABLE};
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which firewall backend the service drives
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Iptables,
    /// In-process table, nothing touches the host firewall
    Memory,
}

/// Service configuration, stored as `config.json` in the data directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
    /// Pass `-w` to iptables so callers queue on the xtables lock
    #[serde(default = "default_true")]
    pub wait_for_lock: bool,
    /// Run iptables through sudo/run0/pkexec when not root
    #[serde(default = "default_true")]
    pub elevate: bool,
    /// Upper bound on a single iptables invocation
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// History lines per streamed message
    #[serde(default = "default_history_batch_size")]
    pub history_batch_size: usize,
    /// Append every add/delete attempt to the audit log
    #[serde(default)]
    pub audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            chain: default_chain(),
            backend: BackendKind::default(),
            iptables_path: default_iptables_path(),
            wait_for_lock: true,
            elevate: true,
            backend_timeout_secs: default_backend_timeout(),
            subscriber_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            history_batch_size: default_history_batch_size(),
            audit_log: false,
        }
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

fn default_iptables_path() -> String {
    crate::SYSTEM_IPTABLES_PATH.to_string()
}

fn default_true() -> bool {
    true
}

fn default_backend_timeout() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_history_batch_size() -> usize {
    1
}

/// Saves the config to disk using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    let Some(mut path) = get_data_dir() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Data directory not found",
        ));
    };
    path.push("config.json");
    save_config_to(config, &path).await
}

pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600) // Set permissions BEFORE any data is written
        .open(&temp_path)
        .await?;

    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from the data directory, or returns default if not found.
pub async fn load_config() -> AppConfig {
    if let Some(mut path) = get_data_dir() {
        path.push("config.json");
        if let Ok(config) = load_config_from(&path).await {
            return config;
        }
    }
    AppConfig::default()
}

/// Loads the config at `path`. Missing fields take their defaults.
pub async fn load_config_from(path: &Path) -> Result<AppConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    let config = serde_json::from_str::<AppConfig>(&json)?;
    if config.history_batch_size == 0 {
        return Err(Error::validation("history_batch_size", "must be at least 1"));
    }
    Ok(config)
}
