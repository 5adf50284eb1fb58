use async_trait::async_trait;
use bytes::Bytes;
use cluster::Node;
use reqwest::{header, Client, StatusCode, Url};
use std::time::Duration;

use crate::{ReplicationError, TransferError};

pub const HEADER_OBJECT_ID: &str = "x-object-id";
pub const HEADER_CHECKSUM: &str = "x-checksum";
pub const HEADER_REPLICATION_SOURCE: &str = "x-replication-source";

/// Everything a peer needs to store a copy of an object.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub object_id: String,
    pub object_key: String,
    pub content_type: String,
    pub checksum: String,
    pub source_node: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Pushes one copy to `target`. `Ok` means the peer acknowledged it.
    async fn push(&self, target: &Node, request: &PushRequest) -> Result<(), TransferError>;
}

/// Pushes payloads with `PUT http://{address}/internal/replicate/{key}`.
/// Only `200 OK` counts as an acknowledgement.
#[derive(Clone)]
pub struct HttpReplicaTransport {
    client: Client,
}

impl HttpReplicaTransport {
    pub fn new(timeout: Duration) -> Result<Self, ReplicationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplicationError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn replicate_url(address: &str, key: &str) -> Result<Url, TransferError> {
        let mut url = Url::parse(&format!("http://{}/", address))
            .map_err(|e| TransferError::Connection(format!("invalid address {}: {}", address, e)))?;
        url.path_segments_mut()
            .map_err(|_| TransferError::Connection(format!("invalid address {}", address)))?
            .extend(["internal", "replicate", key]);
        Ok(url)
    }
}

#[async_trait]
impl ReplicaTransport for HttpReplicaTransport {
    async fn push(&self, target: &Node, request: &PushRequest) -> Result<(), TransferError> {
        let url = Self::replicate_url(&target.address, &request.object_key)?;

        let response = self
            .client
            .put(url)
            .header(header::CONTENT_TYPE, &request.content_type)
            .header(HEADER_OBJECT_ID, &request.object_id)
            .header(HEADER_CHECKSUM, &request.checksum)
            .header(HEADER_REPLICATION_SOURCE, &request.source_node)
            .body(request.payload.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransferError::Timeout
                } else {
                    TransferError::Connection(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(TransferError::Rejected(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_url_escapes_key() {
        let url = HttpReplicaTransport::replicate_url("10.0.0.2:8080", "reports/q1 final.csv").unwrap();
        assert_eq!(
            url.as_str(),
            "http://10.0.0.2:8080/internal/replicate/reports%2Fq1%20final.csv"
        );
    }

    #[test]
    fn test_replicate_url_rejects_garbage_address() {
        assert!(HttpReplicaTransport::replicate_url("not a host", "k").is_err());
    }
}
