use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PeerstoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Address peers use to reach this node; `bind_ip:port` when unset.
    pub advertise_address: Option<String>,
    pub storage_path: PathBuf,
    /// Bytes this node offers to the cluster.
    pub capacity: u64,
    /// Seed peer addresses (`host:port`) announced to at startup.
    pub peers: Vec<String>,
    pub replication_factor: usize,
    pub sweep_interval_secs: u64,
    pub stale_after_secs: u64,
    pub probe_timeout_secs: u64,
    pub expire_after_secs: u64,
    pub push_timeout_secs: u64,
    pub max_in_flight: usize,
    pub max_attempts: u32,
}

impl Config {
    pub fn new(node_id: String, bind_ip: IpAddr, port: u16) -> Self {
        Self {
            node_id,
            bind_ip,
            port,
            advertise_address: None,
            storage_path: PathBuf::from("./data"),
            capacity: 10 * 1024 * 1024 * 1024, // 10 GiB
            peers: Vec::new(),
            replication_factor: 3,
            sweep_interval_secs: 30,
            stale_after_secs: 60,
            probe_timeout_secs: 5,
            expire_after_secs: 600,
            push_timeout_secs: 30,
            max_in_flight: 16,
            max_attempts: 1,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| self.bind_address())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(PeerstoreError::InvalidConfig("node id must not be empty".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(PeerstoreError::InvalidConfig(
                "sweep interval must be at least one second".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(PeerstoreError::InvalidConfig(
                "max in-flight replications must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PeerstoreError::InvalidConfig(
                "max attempts must be positive".to_string(),
            ));
        }
        if let Some(peer) = self.peers.iter().find(|peer| !peer.contains(':')) {
            return Err(PeerstoreError::InvalidConfig(format!(
                "peer address {} must be host:port",
                peer
            )));
        }
        Ok(())
    }
}

impl From<&Config> for storage::StoreOptions {
    fn from(_config: &Config) -> Self {
        storage::StoreOptions::default()
    }
}

impl From<&Config> for cluster::MembershipConfig {
    fn from(config: &Config) -> Self {
        cluster::MembershipConfig {
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            expire_after: Duration::from_secs(config.expire_after_secs),
        }
    }
}

impl From<&Config> for replication::ReplicationConfig {
    fn from(config: &Config) -> Self {
        replication::ReplicationConfig {
            replication_factor: config.replication_factor,
            push_timeout: Duration::from_secs(config.push_timeout_secs),
            max_in_flight: config.max_in_flight,
            max_attempts: config.max_attempts,
        }
    }
}

impl From<&Config> for api::Config {
    fn from(config: &Config) -> Self {
        api::Config {
            node_ip: config.bind_ip,
            port: config.port,
        }
    }
}
