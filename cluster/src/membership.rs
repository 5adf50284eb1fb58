use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::client::HealthProbe;
use crate::{ClusterStats, MembershipConfig, Node, NodeRegistration, NodeStatus};

/// Counts from one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub stale: usize,
    pub expired: usize,
    pub reaped: usize,
}

/// Per-peer health and capacity table, including this node.
///
/// The table keeps registration order, which is the iteration order used to
/// break ties in placement. Self is pinned healthy and never probed.
pub struct Membership {
    self_id: String,
    nodes: RwLock<Vec<Node>>,
    probe: Arc<dyn HealthProbe>,
    config: MembershipConfig,
}

impl Membership {
    pub fn new(mut self_node: Node, config: MembershipConfig, probe: Arc<dyn HealthProbe>) -> Self {
        self_node.status = NodeStatus::Healthy;
        self_node.last_seen = Utc::now();
        self_node.unhealthy_since = None;

        tracing::info!("Membership initialised for {} ({})", self_node.id, self_node.address);

        Self {
            self_id: self_node.id.clone(),
            nodes: RwLock::new(vec![self_node]),
            probe,
            config,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub async fn self_node(&self) -> Node {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .find(|node| node.id == self.self_id)
            .cloned()
            .unwrap_or_else(|| Node::new(&self.self_id, "", 0))
    }

    /// Upserts a peer and refreshes its `last_seen`.
    ///
    /// New peers (and peers that had been removed) start out `Unknown`.
    /// Registrations that claim this node's ID are ignored.
    pub async fn register_node(&self, registration: NodeRegistration) {
        if registration.id == self.self_id {
            tracing::warn!("Ignoring registration that claims this node's id {}", registration.id);
            return;
        }

        let now = Utc::now();
        let mut nodes = self.nodes.write().await;

        match nodes.iter_mut().find(|node| node.id == registration.id) {
            Some(node) => {
                node.address = registration.address;
                node.load = registration.load;
                node.capacity = registration.capacity;
                node.used = registration.used;
                node.last_seen = now;
                if node.status == NodeStatus::Removed {
                    node.status = NodeStatus::Unknown;
                    node.unhealthy_since = None;
                }
                tracing::debug!("Node refreshed: {} ({})", node.id, node.address);
            }
            None => {
                tracing::info!("Node registered: {} ({})", registration.id, registration.address);
                nodes.push(Node {
                    id: registration.id,
                    address: registration.address,
                    status: NodeStatus::Unknown,
                    last_seen: now,
                    load: registration.load,
                    capacity: registration.capacity,
                    used: registration.used,
                    unhealthy_since: None,
                });
            }
        }
    }

    pub async fn get_node(&self, id: &str) -> Option<Node> {
        let nodes = self.nodes.read().await;
        nodes.iter().find(|node| node.id == id).cloned()
    }

    pub async fn all_nodes(&self) -> Vec<Node> {
        self.nodes.read().await.clone()
    }

    /// Every node currently eligible for placement, self included.
    pub async fn get_healthy_nodes(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes.iter().filter(|node| node.is_eligible()).cloned().collect()
    }

    /// The eligible node with the lowest used/capacity ratio; the first one
    /// wins a tie.
    pub async fn select_node_for_write(&self) -> Option<Node> {
        self.get_healthy_nodes()
            .await
            .into_iter()
            .fold(None, |best: Option<Node>, node| match best {
                Some(best) if best.utilization() <= node.utilization() => Some(best),
                _ => Some(node),
            })
    }

    /// Up to `count` eligible nodes in table order.
    pub async fn select_nodes_for_replication(&self, count: usize) -> Vec<Node> {
        let mut nodes = self.get_healthy_nodes().await;
        nodes.truncate(count);
        nodes
    }

    /// Like [`select_nodes_for_replication`](Self::select_nodes_for_replication)
    /// but never returns this node.
    pub async fn select_peers_for_replication(&self, count: usize) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .iter()
            .filter(|node| node.id != self.self_id && node.is_eligible())
            .take(count)
            .cloned()
            .collect()
    }

    /// Refreshes this node's reported usage; load is derived from capacity.
    pub async fn update_self_usage(&self, used: u64) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.iter_mut().find(|node| node.id == self.self_id) {
            node.used = used;
            node.load = if node.capacity == 0 {
                1.0
            } else {
                (used as f64 / node.capacity as f64).min(1.0)
            };
            node.last_seen = Utc::now();
        }
    }

    /// Totals over the whole table. `healthy_nodes` uses the same eligibility
    /// rule as [`get_healthy_nodes`](Self::get_healthy_nodes).
    pub async fn cluster_stats(&self) -> ClusterStats {
        let nodes = self.nodes.read().await;

        let total_capacity: u64 = nodes.iter().map(|node| node.capacity).sum();
        let total_used: u64 = nodes.iter().map(|node| node.used).sum();
        let utilization = if total_capacity == 0 {
            0.0
        } else {
            total_used as f64 / total_capacity as f64
        };

        ClusterStats {
            total_nodes: nodes.len(),
            healthy_nodes: nodes.iter().filter(|node| node.is_eligible()).count(),
            total_capacity,
            total_used,
            utilization,
            nodes: nodes.clone(),
        }
    }

    /// Runs one health sweep over every peer.
    ///
    /// Peers removed by the previous sweep are reaped first. Stale peers are
    /// marked unhealthy without a probe; the rest are probed one after another
    /// with the lock released, so registrations are not blocked by slow peers.
    pub async fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let now = Utc::now();

        let candidates: Vec<Node> = {
            let mut nodes = self.nodes.write().await;

            let before = nodes.len();
            nodes.retain(|node| node.status != NodeStatus::Removed);
            summary.reaped = before - nodes.len();

            let mut candidates = Vec::new();
            for node in nodes.iter_mut().filter(|node| node.id != self.self_id) {
                if node.status == NodeStatus::Unhealthy
                    && elapsed_since(node.unhealthy_since, now)
                        .map_or(false, |age| age >= self.config.expire_after)
                {
                    tracing::warn!("Node {} expired after a long unhealthy streak", node.id);
                    node.status = NodeStatus::Removed;
                    summary.expired += 1;
                } else if elapsed_since(Some(node.last_seen), now)
                    .map_or(false, |age| age > self.config.stale_after)
                {
                    if node.status != NodeStatus::Unhealthy {
                        tracing::warn!("Node marked unhealthy (stale): {}", node.id);
                    }
                    mark_unhealthy(node, now);
                    summary.stale += 1;
                } else {
                    candidates.push(node.clone());
                }
            }
            candidates
        };

        let mut results = Vec::with_capacity(candidates.len());
        for node in &candidates {
            let alive = tokio::time::timeout(self.config.probe_timeout, self.probe.probe(node))
                .await
                .unwrap_or(false);
            results.push((node.id.clone(), alive));
        }
        summary.probed = results.len();

        let mut nodes = self.nodes.write().await;
        for (id, alive) in results {
            let Some(node) = nodes.iter_mut().find(|node| node.id == id) else {
                continue;
            };
            if node.status == NodeStatus::Removed {
                continue;
            }
            if alive {
                if node.status != NodeStatus::Healthy {
                    tracing::info!("Node healthy: {}", node.id);
                }
                node.status = NodeStatus::Healthy;
                node.unhealthy_since = None;
                node.last_seen = node.last_seen.max(now);
                summary.healthy += 1;
            } else {
                if node.status != NodeStatus::Unhealthy {
                    tracing::warn!("Node failed health probe: {}", node.id);
                }
                mark_unhealthy(node, now);
                summary.unhealthy += 1;
            }
        }

        summary
    }

    /// Sweeps every `sweep_interval` until the task is dropped.
    pub async fn run_health_checks(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; peers get one interval of grace.
        interval.tick().await;

        loop {
            interval.tick().await;
            let summary = self.sweep().await;
            tracing::debug!("Health sweep finished: {:?}", summary);
        }
    }
}

fn mark_unhealthy(node: &mut Node, now: DateTime<Utc>) {
    node.status = NodeStatus::Unhealthy;
    if node.unhealthy_since.is_none() {
        node.unhealthy_since = Some(now);
    }
}

fn elapsed_since(then: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    then.and_then(|then| (now - then).to_std().ok())
}
