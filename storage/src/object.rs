use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub type ObjectId = String;

/// Descriptor of one stored object version.
///
/// `replicas` only ever lists the copy written by this node. Remote copies
/// made by replication are tracked by the replication coordinator, which can
/// merge both views into a replica set on request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageObject {
    pub id: ObjectId,
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub storage_tier: StorageTier,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub replicas: Vec<ReplicaInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Hot,
    Warm,
    Cold,
}

impl Default for StorageTier {
    fn default() -> Self {
        StorageTier::Hot
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub node_id: String,
    pub location: String,
    pub status: ReplicaStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Active,
    Syncing,
    Failed,
}

impl StorageObject {
    pub(crate) fn new(
        id: ObjectId,
        key: &str,
        size: u64,
        content_type: &str,
        checksum: String,
        metadata: HashMap<String, String>,
        local: ReplicaInfo,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            key: key.to_string(),
            size,
            content_type: content_type.to_string(),
            checksum,
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_access: now,
            storage_tier: StorageTier::Hot,
            metadata,
            replicas: vec![local],
        }
    }

    /// Bumps the access statistics. `last_access` never moves backwards even if
    /// the wall clock does.
    pub(crate) fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        if now > self.last_access {
            self.last_access = now;
        }
    }

    pub fn local_replica(&self, node_id: &str) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|replica| replica.node_id == node_id)
    }
}

impl ReplicaInfo {
    pub fn local(node_id: &str, path: &Path) -> Self {
        Self {
            node_id: node_id.to_string(),
            location: path.to_string_lossy().into_owned(),
            status: ReplicaStatus::Active,
        }
    }
}

/// Object IDs name a key at a creation instant, not its content: storing the
/// same bytes twice under one key yields two IDs and two payload files.
pub(crate) fn generate_id(key: &str, created_at: DateTime<Utc>) -> ObjectId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(
        created_at
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.finalize().to_hex()[..32].to_string()
}
