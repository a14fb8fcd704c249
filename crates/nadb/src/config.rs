use crate::error::ReplicationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub replication: ReplicationConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

/// Replication role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Primary,
    Secondary,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Primary => f.write_str("primary"),
            Mode::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub mode: Mode,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,
    #[serde(default = "default_max_operation_log")]
    pub max_operation_log: usize,
    /// Queue sends per link instead of writing to the socket inline
    #[serde(default = "default_broadcast_async")]
    pub broadcast_async: bool,
    #[serde(default)]
    pub primary_host: Option<String>,
    #[serde(default = "default_port")]
    pub primary_port: u16,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: f64,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_heartbeat_interval_secs() -> f64 {
    5.0
}

fn default_max_operation_log() -> usize {
    10_000
}

fn default_broadcast_async() -> bool {
    true
}

fn default_reconnect_interval_secs() -> f64 {
    5.0
}

impl ReplicationConfig {
    pub fn primary(listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            mode: Mode::Primary,
            listen_host: listen_host.into(),
            listen_port,
            ..Self::defaults(Mode::Primary)
        }
    }

    pub fn secondary(primary_host: impl Into<String>, primary_port: u16) -> Self {
        Self {
            primary_host: Some(primary_host.into()),
            primary_port,
            ..Self::defaults(Mode::Secondary)
        }
    }

    fn defaults(mode: Mode) -> Self {
        Self {
            mode,
            listen_host: default_listen_host(),
            listen_port: default_port(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_operation_log: default_max_operation_log(),
            broadcast_async: default_broadcast_async(),
            primary_host: None,
            primary_port: default_port(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }

    /// Negative or NaN is treated as zero; values too large for a
    /// `Duration` saturate. `validate` rejects both.
    pub fn heartbeat_interval(&self) -> Duration {
        seconds(self.heartbeat_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        seconds(self.reconnect_interval_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn validate(&self) -> Result<(), ReplicationError> {
        if self.max_operation_log == 0 {
            return Err(ReplicationError::Config(
                "max_operation_log must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("reconnect_interval_secs", self.reconnect_interval_secs),
        ] {
            if value < 0.0 || Duration::try_from_secs_f64(value).is_err() {
                return Err(ReplicationError::Config(format!(
                    "{} must be a finite, non-negative number of seconds (got {})",
                    name, value
                )));
            }
        }
        if self.mode == Mode::Secondary && self.primary_host.is_none() {
            return Err(ReplicationError::Config(
                "primary_host is required in secondary mode".to_string(),
            ));
        }
        Ok(())
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Fs,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub path: PathBuf,
    #[serde(default = "default_sqlite_cache_size")]
    pub sqlite_cache_size: i32,
    #[serde(default = "default_sqlite_busy_timeout")]
    pub sqlite_busy_timeout: i32,
}

fn default_sqlite_cache_size() -> i32 {
    10000
}

fn default_sqlite_busy_timeout() -> i32 {
    5000
}

/// Database and namespace that replicated writes are tagged with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub db: String,
    pub namespace: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            db: "default".to_string(),
            namespace: "default".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }
}
