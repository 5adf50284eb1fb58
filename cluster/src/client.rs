use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::{ClusterError, ClusterStats, Node, NodeRegistration, Result};

/// Liveness check against a single peer.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, node: &Node) -> bool;
}

/// HTTP client for the peer endpoints: `GET /health` for liveness and
/// `POST /cluster/nodes` for announcing this node to a peer.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Registers `local` with the peer at `address`.
    pub async fn announce(&self, address: &str, local: &Node) -> Result<()> {
        if address.is_empty() {
            return Err(ClusterError::InvalidAddress(address.to_string()));
        }

        let response = self
            .client
            .post(format!("http://{}/cluster/nodes", address))
            .json(&NodeRegistration::from(local))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClusterError::Rejected(format!(
                "{} answered {}",
                address,
                response.status()
            )));
        }

        Ok(())
    }

    /// Fetches the membership table of the peer at `address`.
    pub async fn fetch_status(&self, address: &str) -> Result<ClusterStats> {
        let response = self
            .client
            .get(format!("http://{}/cluster/status", address))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClusterError::Rejected(format!(
                "{} answered {}",
                address,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl HealthProbe for HttpPeerClient {
    async fn probe(&self, node: &Node) -> bool {
        match self
            .client
            .get(format!("http://{}/health", node.address))
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!("Health probe to {} failed: {}", node.address, e);
                false
            }
        }
    }
}
