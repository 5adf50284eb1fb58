mod coordinator;
mod transport;

pub use coordinator::{ReplicationCoordinator, ReplicationHandle};
pub use transport::{
    HttpReplicaTransport, PushRequest, ReplicaTransport, HEADER_CHECKSUM, HEADER_OBJECT_ID,
    HEADER_REPLICATION_SOURCE,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Tracked record of one replication attempt for an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub object_id: String,
    pub object_key: String,
    pub source_node: String,
    pub target_nodes: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub targets: Vec<TargetOutcome>,
    /// Distinguishes this attempt from a later re-initiation for the same object.
    pub attempt_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub node_id: String,
    pub address: String,
    pub status: TransferStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ReplicationTask {
    pub fn successes(&self) -> usize {
        self.targets
            .iter()
            .filter(|target| target.status == TransferStatus::Succeeded)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Number of peer copies requested per object.
    pub replication_factor: usize,
    pub push_timeout: Duration,
    /// Replications allowed to buffer and push at the same time; the rest wait
    /// as `pending`.
    pub max_in_flight: usize,
    /// Attempts per target, including the first.
    pub max_attempts: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            push_timeout: Duration::from_secs(30),
            max_in_flight: 16,
            max_attempts: 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("No healthy nodes available for replication")]
    NoHealthyTargets,

    #[error("Failed to buffer payload: {0}")]
    Buffer(#[from] std::io::Error),

    #[error("Replication task aborted: {0}")]
    Aborted(String),

    #[error("Transport setup failed: {0}")]
    Transport(String),
}

/// Failure of a single push to a single peer. Never aborts sibling pushes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rejected with status {0}")]
    Rejected(u16),
}
