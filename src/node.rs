use crate::config::Config;
use crate::error::{PeerstoreError, Result};
use cluster::{HttpPeerClient, Membership, NodeRegistration, NodeStatus};
use replication::{HttpReplicaTransport, ReplicationCoordinator};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::ObjectStore;
use tracing::{debug, error, info, warn};

/// One storage node: the local store, the membership table, the replication
/// coordinator and the HTTP API, wired together.
pub struct Node {
    config: Config,
    store: Arc<ObjectStore>,
    membership: Arc<Membership>,
    replication: Arc<ReplicationCoordinator>,
    peer_client: HttpPeerClient,
    api_server: api::Server,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing node {} at {} (advertised as {})",
            config.node_id,
            config.bind_address(),
            config.advertise_address()
        );

        let store = Arc::new(
            ObjectStore::open(&config.storage_path, &config.node_id, (&config).into()).await?,
        );

        let local = cluster::Node::new(&config.node_id, &config.advertise_address(), config.capacity);

        let peer_client =
            HttpPeerClient::new(Duration::from_secs(config.probe_timeout_secs.max(1)))?;
        let membership = Arc::new(Membership::new(
            local,
            (&config).into(),
            Arc::new(peer_client.clone()),
        ));
        membership.update_self_usage(store.used_bytes()).await;

        let transport = HttpReplicaTransport::new(Duration::from_secs(config.push_timeout_secs))?;
        let replication = Arc::new(ReplicationCoordinator::new(
            membership.clone(),
            Arc::new(transport),
            (&config).into(),
        ));

        let app_state = Arc::new(api::AppState {
            store: store.clone(),
            membership: membership.clone(),
            replication: replication.clone(),
        });
        let api_server = api::Server::new((&config).into(), app_state);

        Ok(Self {
            config,
            store,
            membership,
            replication,
            peer_client,
            api_server,
        })
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn replication(&self) -> &Arc<ReplicationCoordinator> {
        &self.replication
    }

    /// Runs the node until `shutdown` resolves or a background service stops.
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting node services");

        let mut health_task = tokio::spawn(self.membership.clone().run_health_checks());

        let heartbeat_task = {
            let membership = self.membership.clone();
            let client = self.peer_client.clone();
            let seeds = self.config.peers.clone();
            let interval = Duration::from_secs(self.config.sweep_interval_secs);
            tokio::spawn(async move { heartbeat(membership, client, seeds, interval).await })
        };

        let result = tokio::select! {
            result = self.api_server.start(shutdown) => {
                match result {
                    Ok(()) => {
                        info!("API server shut down");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server stopped: {}", e);
                        Err(PeerstoreError::Api(e))
                    }
                }
            }
            result = &mut health_task => {
                error!("Health checks stopped: {:?}", result);
                Err(PeerstoreError::ServiceStopped("health checks".to_string()))
            }
        };

        health_task.abort();
        heartbeat_task.abort();

        if let Err(e) = self.store.compact().await {
            warn!("Final metadata compaction failed: {}", e);
        }

        result
    }
}

/// Announces this node to the seed peers and every known peer, then pulls
/// each seed's membership table. Runs once at startup and then every
/// `interval`, which keeps this node fresh in the peers' tables.
async fn heartbeat(
    membership: Arc<Membership>,
    client: HttpPeerClient,
    seeds: Vec<String>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let local = membership.self_node().await;
        let mut targets = seeds.clone();
        for node in membership.all_nodes().await {
            if node.id != local.id
                && node.status != NodeStatus::Removed
                && !targets.contains(&node.address)
            {
                targets.push(node.address);
            }
        }

        let announces = targets.iter().map(|address| {
            let client = &client;
            let local = &local;
            async move { (address, client.announce(address, local).await) }
        });
        for (address, result) in futures::future::join_all(announces).await {
            if let Err(e) = result {
                debug!("Announce to {} failed: {}", address, e);
            }
        }

        for seed in &seeds {
            match client.fetch_status(seed).await {
                Ok(status) => {
                    // Only peers the seed currently vouches for.
                    let vouched = status
                        .nodes
                        .iter()
                        .filter(|node| node.status == NodeStatus::Healthy);
                    for node in vouched {
                        membership.register_node(NodeRegistration::from(node)).await;
                    }
                }
                Err(e) => debug!("Failed to fetch membership from {}: {}", seed, e),
            }
        }
    }
}
