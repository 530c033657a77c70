//! Runtime configuration: defaults, an optional YAML file, then command-line overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// A member whose send queue is full is removed from the room and disconnected.
    Disconnect,
    /// The message is skipped for that member, who stays registered.
    Drop,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub listen: SocketAddr,
    pub history_db: Option<PathBuf>,
    pub static_dir: PathBuf,
    pub status_debounce_ms: u64,
    pub send_queue_capacity: usize,
    pub room_mailbox_capacity: usize,
    pub inbound_capacity: usize,
    pub recent_history: usize,
    /// Events kept per room by the in-memory store when `history-db` is unset.
    pub memory_history: usize,
    pub heartbeat_secs: u64,
    pub write_wait_secs: u64,
    pub read_wait_secs: u64,
    pub max_message_size: usize,
    pub history_page_limit: u32,
    pub history_max_limit: u32,
    pub backpressure: Backpressure,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 12345)),
            history_db: None,
            static_dir: PathBuf::from("public"),
            status_debounce_ms: 1000,
            send_queue_capacity: 256,
            room_mailbox_capacity: 256,
            inbound_capacity: 32,
            recent_history: 50,
            memory_history: 1000,
            heartbeat_secs: 15,
            write_wait_secs: 10,
            read_wait_secs: 60,
            max_message_size: 512,
            history_page_limit: 50,
            history_max_limit: 500,
            backpressure: Backpressure::Disconnect,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| RelayError::Config(format!("failed to parse config: {e}")))?;
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.send_queue_capacity == 0 || self.room_mailbox_capacity == 0 || self.inbound_capacity == 0 {
            return Err(RelayError::Config("queue capacities must be positive".to_string()));
        }
        if self.heartbeat_secs == 0 || self.heartbeat_secs >= self.read_wait_secs {
            return Err(RelayError::Config(
                "heartbeat-secs must be positive and below read-wait-secs".to_string(),
            ));
        }
        if self.history_page_limit > self.history_max_limit {
            return Err(RelayError::Config(
                "history-page-limit exceeds history-max-limit".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn status_debounce(&self) -> Duration {
        Duration::from_millis(self.status_debounce_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_secs(self.read_wait_secs)
    }

    /// `limit` for a history query, defaulted and clamped.
    pub fn page_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.history_page_limit)
            .min(self.history_max_limit)
    }
}

#[derive(Parser, Debug)]
#[command(name = "chat_relay")]
#[command(about = "Real-time chat relay with named rooms", long_about = None)]
pub struct Cli {
    /// YAML config file
    #[arg(short, long, env = "CHAT_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "CHAT_RELAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// SQLite file for the durable message log (overrides config)
    #[arg(long, env = "CHAT_RELAY_HISTORY_DB")]
    pub history_db: Option<PathBuf>,

    /// Directory served as static files (overrides config)
    #[arg(long, env = "CHAT_RELAY_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Policy for members whose send queue is full (overrides config)
    #[arg(long, value_enum, env = "CHAT_RELAY_BACKPRESSURE")]
    pub backpressure: Option<Backpressure>,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(db) = self.history_db {
            config.history_db = Some(db);
        }
        if let Some(dir) = self.static_dir {
            config.static_dir = dir;
        }
        if let Some(policy) = self.backpressure {
            config.backpressure = policy;
        }
        config.validate()
    }
}
