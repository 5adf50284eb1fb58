mod membership;
mod client;

pub use membership::{Membership, SweepSummary};
pub use client::{HealthProbe, HttpPeerClient};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub load: f64,
    pub capacity: u64,
    pub used: u64,
    /// Start of the current unhealthy streak, used for expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Unknown,
    Healthy,
    Unhealthy,
    /// Terminal: expired after a long unhealthy streak, reaped on the next sweep.
    Removed,
}

impl Node {
    pub fn new(id: &str, address: &str, capacity: u64) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            status: NodeStatus::Unknown,
            last_seen: Utc::now(),
            load: 0.0,
            capacity,
            used: 0,
            unhealthy_since: None,
        }
    }

    /// Unknown peers are eligible straight after registration.
    pub fn is_eligible(&self) -> bool {
        matches!(self.status, NodeStatus::Healthy | NodeStatus::Unknown)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return f64::INFINITY;
        }
        self.used as f64 / self.capacity as f64
    }
}

/// Body of a node registration or heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub load: f64,
    #[serde(default)]
    pub capacity: u64,
    #[serde(default)]
    pub used: u64,
}

impl From<&Node> for NodeRegistration {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            address: node.address.clone(),
            load: node.load,
            capacity: node.capacity,
            used: node.used,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub total_capacity: u64,
    pub total_used: u64,
    pub utilization: f64,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub sweep_interval: Duration,
    /// A peer not seen for longer than this is marked unhealthy without a probe.
    pub stale_after: Duration,
    pub probe_timeout: Duration,
    /// A peer unhealthy for longer than this is removed.
    pub expire_after: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            expire_after: Duration::from_secs(600),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("Peer rejected request: {0}")]
    Rejected(String),
}
