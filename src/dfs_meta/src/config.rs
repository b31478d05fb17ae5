use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Name node settings, read from a json file by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameConfig {
    #[serde(alias = "data_dir", alias = "meta_path")]
    pub data_path: PathBuf,
    #[serde(alias = "host")]
    pub tcp_host: String,
    #[serde(alias = "port")]
    pub tcp_port: u16,
    pub block_size: u64,
    #[serde(alias = "replica")]
    pub default_replica: u32,
    #[serde(alias = "lock_ttl")]
    pub default_lock_ttl_secs: u64,
    pub lock_sweep_interval_secs: u64,
    /// Records applied between scheduler yields during recovery.
    pub recovery_yield_every: usize,
    pub exclude_full_nodes: bool,
    pub node_db_name: String,
    pub log_level: String,
}

impl Default for NameConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/var/lib/dfs_name"),
            tcp_host: "0.0.0.0".to_string(),
            tcp_port: 6061,
            block_size: DEFAULT_BLOCK_SIZE,
            default_replica: 1,
            default_lock_ttl_secs: 60,
            lock_sweep_interval_secs: 1,
            recovery_yield_every: 1000,
            exclude_full_nodes: true,
            node_db_name: "data_nodes.db".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl NameConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.tcp_host, self.tcp_port)
    }

    pub fn node_db_path(&self) -> PathBuf {
        self.data_path.join(&self.node_db_name)
    }

    pub fn default_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lock_ttl_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs.max(1))
    }
}
