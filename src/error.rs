use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerstoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("Replication error: {0}")]
    Replication(#[from] replication::ReplicationError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Service stopped: {0}")]
    ServiceStopped(String),
}

pub type Result<T> = std::result::Result<T, PeerstoreError>;
