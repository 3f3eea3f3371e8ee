//! Tidelog Configuration
//!
//! TOML configuration for the replication master, slave and the shared
//! TCP server. The replication core consumes these structs; loading
//! and validation happen once at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::txlog::header_size;

/// Main tidelog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TidelogConfig {
    /// Node identity and storage location
    pub node: NodeConfig,

    /// TCP server; required when master or slave runs in server role
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Master role configuration
    #[serde(default)]
    pub master: Option<MasterConfig>,

    /// Slave role configuration
    #[serde(default)]
    pub slave: Option<SlaveConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Instance name, used to route connections on a shared server
    pub instance: String,

    /// Numeric id stamped into every transaction written here; slaves
    /// use it to filter out records that originated locally
    pub instance_id: u32,

    /// Data directory; replication files live in `<data_dir>/replication`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Which side opens the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpRole {
    Server,
    Client,
}

/// Shared TCP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8099"
    pub listen: String,

    /// Maximum size of one wire frame
    #[serde(default = "default_max_tuple_size")]
    pub max_tuple_size: usize,
}

/// Replication master settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Streams to replicate, in order; the position is the stream id
    pub streams: Vec<String>,

    #[serde(default = "default_server_role")]
    pub tcp_role: TcpRole,

    /// Transactions per index page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Index capacity; bounds the transactions per file
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Preallocated size of each replication file
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,

    /// Files older than this are deleted
    #[serde(default = "default_expiration_days")]
    pub expiration_days: f64,

    /// Files not accessed for this long are closed
    #[serde(default = "default_file_close_time_secs")]
    pub file_close_time_secs: u64,

    /// How often the current file is forced to disk
    #[serde(default = "default_file_sync_time_secs")]
    pub file_sync_time_secs: u64,

    /// How often a TIME message is interleaved into each session
    #[serde(default = "default_time_msg_freq_secs")]
    pub time_msg_freq_secs: u64,

    /// Poll delay while a session waits for new data in the tail
    #[serde(default = "default_tail_poll_interval_ms")]
    pub tail_poll_interval_ms: u64,

    /// Poll delay while a requested transaction id is still in the future
    #[serde(default = "default_future_tx_poll_ms")]
    pub future_tx_poll_ms: u64,

    /// Reconnection interval in client role
    #[serde(default = "default_reconnection_interval_secs")]
    pub reconnection_interval_secs: u64,

    /// Maximum size of one wire frame / serialized tuple
    #[serde(default = "default_max_tuple_size")]
    pub max_tuple_size: usize,

    /// Slaves to connect to in client role
    #[serde(default)]
    pub slaves: Vec<SlaveAddress>,
}

/// Address of one slave the master connects to in client role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveAddress {
    pub host: String,
    pub port: u16,
    pub instance: String,
}

/// Replication slave settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Remote-to-local stream name mappings; unlisted remote streams
    /// are ignored
    pub streams: Vec<StreamMapping>,

    #[serde(default = "default_client_role")]
    pub tcp_role: TcpRole,

    /// Master address in client role
    #[serde(default)]
    pub master_host: Option<String>,
    #[serde(default)]
    pub master_port: Option<u16>,

    /// Master instance to request; defaults to this node's instance
    #[serde(default)]
    pub master_instance: Option<String>,

    #[serde(default = "default_reconnection_interval_secs")]
    pub reconnection_interval_secs: u64,

    /// Close and reconnect when no message arrives for this long
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,

    /// Maximum size of one wire frame / serialized tuple
    #[serde(default = "default_max_tuple_size")]
    pub max_tuple_size: usize,
}

/// Mapping of a remote stream name to a local one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMapping {
    pub remote: String,
    pub local: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tidelog")
}

fn default_server_role() -> TcpRole {
    TcpRole::Server
}

fn default_client_role() -> TcpRole {
    TcpRole::Client
}

fn default_page_size() -> u32 {
    500
}

fn default_max_pages() -> u32 {
    500
}

fn default_max_file_size_kb() -> u64 {
    100 * 1024
}

fn default_expiration_days() -> f64 {
    7.0
}

fn default_file_close_time_secs() -> u64 {
    300
}

fn default_file_sync_time_secs() -> u64 {
    10
}

fn default_time_msg_freq_secs() -> u64 {
    10
}

fn default_tail_poll_interval_ms() -> u64 {
    200
}

fn default_future_tx_poll_ms() -> u64 {
    500
}

fn default_reconnection_interval_secs() -> u64 {
    30
}

fn default_receive_timeout_secs() -> u64 {
    30
}

fn default_max_tuple_size() -> usize {
    131072
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MasterConfig {
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_kb * 1024
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs_f64(self.expiration_days * 24.0 * 3600.0)
    }

    pub fn file_close_time(&self) -> Duration {
        Duration::from_secs(self.file_close_time_secs)
    }

    pub fn file_sync_time(&self) -> Duration {
        Duration::from_secs(self.file_sync_time_secs)
    }

    pub fn time_msg_freq(&self) -> Duration {
        Duration::from_secs(self.time_msg_freq_secs)
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_interval_ms)
    }

    pub fn future_tx_poll(&self) -> Duration {
        Duration::from_millis(self.future_tx_poll_ms)
    }

    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_secs(self.reconnection_interval_secs)
    }
}

impl SlaveConfig {
    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_secs(self.reconnection_interval_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

impl TidelogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: TidelogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.instance.is_empty() {
            return Err(crate::Error::Config("node.instance cannot be empty".into()));
        }
        if self.master.is_none() && self.slave.is_none() {
            return Err(crate::Error::Config(
                "at least one of [master] or [slave] must be configured".into(),
            ));
        }

        let mut needs_server = false;
        if let Some(master) = &self.master {
            if master.streams.is_empty() {
                return Err(crate::Error::Config(
                    "master.streams cannot be empty".into(),
                ));
            }
            let hdr = header_size(master.max_pages);
            if master.max_file_size() <= hdr as u64 {
                return Err(crate::Error::Config(format!(
                    "master.max_file_size_kb has to be higher than the header size, \
                     which for max_pages={} is {} bytes",
                    master.max_pages, hdr
                )));
            }
            match master.tcp_role {
                TcpRole::Client if master.slaves.is_empty() => {
                    return Err(crate::Error::Config(
                        "master in client role requires at least one entry in master.slaves".into(),
                    ));
                }
                TcpRole::Server => needs_server = true,
                _ => {}
            }
        }
        if let Some(slave) = &self.slave {
            match slave.tcp_role {
                TcpRole::Client => {
                    if slave.master_host.is_none() || slave.master_port.is_none() {
                        return Err(crate::Error::Config(
                            "slave in client role requires master_host and master_port".into(),
                        ));
                    }
                }
                TcpRole::Server => needs_server = true,
            }
        }
        if needs_server && self.server.is_none() {
            return Err(crate::Error::Config(
                "a server tcp_role requires the [server] section".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding replication files and the slave progress file
    pub fn replication_dir(&self) -> PathBuf {
        self.node.data_dir.join("replication")
    }
}

#[cfg(test)]
pub(crate) fn test_master_config() -> MasterConfig {
    MasterConfig {
        streams: vec!["tm_realtime".to_string()],
        tcp_role: TcpRole::Server,
        page_size: 4,
        max_pages: 16,
        max_file_size_kb: 64,
        expiration_days: default_expiration_days(),
        file_close_time_secs: default_file_close_time_secs(),
        file_sync_time_secs: default_file_sync_time_secs(),
        time_msg_freq_secs: default_time_msg_freq_secs(),
        tail_poll_interval_ms: 20,
        future_tx_poll_ms: 20,
        reconnection_interval_secs: 1,
        max_tuple_size: default_max_tuple_size(),
        slaves: Vec::new(),
    }
}

#[cfg(test)]
pub(crate) fn test_slave_config() -> SlaveConfig {
    SlaveConfig {
        streams: vec![StreamMapping {
            remote: "tm_realtime".to_string(),
            local: "tm_local".to_string(),
        }],
        tcp_role: TcpRole::Client,
        master_host: Some("127.0.0.1".to_string()),
        master_port: Some(0),
        master_instance: Some("ops".to_string()),
        reconnection_interval_secs: 1,
        receive_timeout_secs: 5,
        max_tuple_size: default_max_tuple_size(),
    }
}
