// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "MODEL_INSTALLER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Settings for the installer, its HTTP clients and the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Maximum number of files transferred at the same time per job.
    pub max_concurrency: usize,
    /// Largest slice written to disk and reported as one progress delta.
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    /// Longest wait for the next body chunk before a transfer is considered stalled.
    pub read_timeout_secs: u64,
    pub user_agent: String,
    /// Check published SHA-256 checksums while streaming.
    pub verify_checksums: bool,
    pub hf_endpoint: String,
    pub hf_token: Option<String>,
    pub download_dir: PathBuf,
    pub bind_addr: String,
    pub db_path: PathBuf,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            chunk_size: 64 * 1024,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            user_agent: concat!("model-installer/", env!("CARGO_PKG_VERSION")).to_string(),
            verify_checksums: false,
            hf_endpoint: "https://huggingface.co".to_string(),
            hf_token: None,
            download_dir: PathBuf::from("./models"),
            bind_addr: "127.0.0.1:8000".to_string(),
            db_path: PathBuf::from("jobs.db"),
        }
    }
}

impl InstallerConfig {
    /// Defaults overridden by `MODEL_INSTALLER_*` variables and `HF_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = var("MAX_CONCURRENCY") {
            config.max_concurrency = parse("MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("CHUNK_SIZE") {
            config.chunk_size = parse("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = var("CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs = parse("CONNECT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("READ_TIMEOUT_SECS") {
            config.read_timeout_secs = parse("READ_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("VERIFY_CHECKSUMS") {
            config.verify_checksums = parse("VERIFY_CHECKSUMS", &v)?;
        }
        if let Some(v) = var("USER_AGENT") {
            config.user_agent = v;
        }
        if let Some(v) = var("HF_ENDPOINT") {
            config.hf_endpoint = v;
        }
        if let Some(v) = var("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Some(v) = var("DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        config.hf_token = lookup("HF_TOKEN").filter(|t| !t.is_empty());

        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.max_concurrency = self.max_concurrency.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}
