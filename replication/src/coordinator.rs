use bytes::Bytes;
use chrono::Utc;
use cluster::{Membership, Node};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use storage::{ReplicaInfo, ReplicaStatus, StorageObject};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::transport::{PushRequest, ReplicaTransport};
use crate::{
    ReplicationConfig, ReplicationError, ReplicationTask, Result, TargetOutcome, TaskStatus,
    TransferError, TransferStatus,
};

const CANCELLED: &str = "replication cancelled";

/// Best-effort propagation of stored objects to peers.
///
/// Target selection happens on the caller's task; buffering and the fan-out
/// run on a spawned task. A task counts as completed once at least one target
/// acknowledged the payload.
pub struct ReplicationCoordinator {
    membership: Arc<Membership>,
    transport: Arc<dyn ReplicaTransport>,
    tasks: Arc<DashMap<String, ReplicationTask>>,
    in_flight: Arc<Semaphore>,
    config: ReplicationConfig,
}

/// Caller-side handle on a running replication.
///
/// Dropping the handle detaches the replication; it keeps running and stays
/// observable through the coordinator.
pub struct ReplicationHandle {
    object_id: String,
    cancel: watch::Sender<bool>,
    join: JoinHandle<ReplicationTask>,
}

impl ReplicationHandle {
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Abandons in-flight pushes; the task ends `failed`.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the terminal task record.
    pub async fn wait(self) -> Result<ReplicationTask> {
        self.join
            .await
            .map_err(|e| ReplicationError::Aborted(e.to_string()))
    }
}

impl ReplicationCoordinator {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn ReplicaTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            membership,
            transport,
            tasks: Arc::new(DashMap::new()),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Starts replicating `object` with the bytes read from `payload`.
    ///
    /// Fails with [`ReplicationError::NoHealthyTargets`] before any I/O when no
    /// peer is eligible; in that case no task is recorded. Otherwise a pending
    /// task replaces any earlier record for the same object ID and the call
    /// returns without waiting for the network.
    pub async fn replicate_object<R>(
        &self,
        object: &StorageObject,
        payload: R,
    ) -> Result<ReplicationHandle>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let targets = self
            .membership
            .select_peers_for_replication(self.config.replication_factor)
            .await;
        if targets.is_empty() {
            tracing::warn!("No healthy peers to replicate {} to", object.key);
            return Err(ReplicationError::NoHealthyTargets);
        }

        let task = ReplicationTask {
            object_id: object.id.clone(),
            object_key: object.key.clone(),
            source_node: self.membership.self_id().to_string(),
            target_nodes: targets.iter().map(|node| node.id.clone()).collect(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            targets: targets
                .iter()
                .map(|node| TargetOutcome {
                    node_id: node.id.clone(),
                    address: node.address.clone(),
                    status: TransferStatus::Pending,
                    attempts: 0,
                    error: None,
                })
                .collect(),
            attempt_id: Uuid::new_v4(),
        };
        self.tasks.insert(object.id.clone(), task.clone());

        tracing::info!(
            "Replicating {} ({}) to {:?}",
            object.key,
            object.id,
            task.target_nodes
        );

        let (cancel, cancelled) = watch::channel(false);
        let job = ReplicationJob {
            tasks: self.tasks.clone(),
            transport: self.transport.clone(),
            in_flight: self.in_flight.clone(),
            config: self.config.clone(),
            task,
        };
        let request = PushRequest {
            object_id: object.id.clone(),
            object_key: object.key.clone(),
            content_type: object.content_type.clone(),
            checksum: object.checksum.clone(),
            source_node: self.membership.self_id().to_string(),
            payload: Bytes::new(),
        };
        let join = tokio::spawn(job.run(targets, request, payload, cancelled));

        Ok(ReplicationHandle {
            object_id: object.id.clone(),
            cancel,
            join,
        })
    }

    pub fn get_replication_status(&self, object_id: &str) -> Option<ReplicationTask> {
        self.tasks.get(object_id).map(|entry| entry.value().clone())
    }

    pub fn get_all_replication_tasks(&self) -> Vec<ReplicationTask> {
        self.tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Replica set of `object`: the copies listed on the descriptor plus one
    /// entry per replication target, `active` once acknowledged, `syncing`
    /// while pending and `failed` otherwise.
    pub fn replica_set(&self, object: &StorageObject) -> Vec<ReplicaInfo> {
        let mut replicas = object.replicas.clone();

        if let Some(task) = self.tasks.get(&object.id) {
            for target in &task.targets {
                let status = match target.status {
                    TransferStatus::Succeeded => ReplicaStatus::Active,
                    TransferStatus::Pending if !task.status.is_terminal() => ReplicaStatus::Syncing,
                    _ => ReplicaStatus::Failed,
                };
                replicas.push(ReplicaInfo {
                    node_id: target.node_id.clone(),
                    location: format!("http://{}/objects/{}", target.address, object.key),
                    status,
                });
            }
        }

        replicas
    }
}

/// State moved onto the spawned replication task.
struct ReplicationJob {
    tasks: Arc<DashMap<String, ReplicationTask>>,
    transport: Arc<dyn ReplicaTransport>,
    in_flight: Arc<Semaphore>,
    config: ReplicationConfig,
    task: ReplicationTask,
}

impl ReplicationJob {
    async fn run<R>(
        mut self,
        targets: Vec<Node>,
        mut request: PushRequest,
        payload: R,
        mut cancelled: watch::Receiver<bool>,
    ) -> ReplicationTask
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let permit = tokio::select! {
            permit = self.in_flight.clone().acquire_owned() => Some(permit),
            _ = wait_cancelled(&mut cancelled) => None,
        };
        let _permit = match permit {
            Some(Ok(permit)) => permit,
            Some(Err(_)) => return self.fail("replication queue closed".to_string()),
            None => return self.fail(CANCELLED.to_string()),
        };

        self.task.status = TaskStatus::InProgress;
        self.publish();

        // One buffer, replayed to every target.
        request.payload = match buffer_payload(payload).await {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(format!("Failed to buffer data: {}", e)),
        };

        let pushes = targets
            .iter()
            .map(|target| self.push_to_target(target, &request));
        let outcomes = tokio::select! {
            outcomes = join_all(pushes) => Some(outcomes),
            _ = wait_cancelled(&mut cancelled) => None,
        };
        let Some(outcomes) = outcomes else {
            return self.fail(CANCELLED.to_string());
        };

        self.task.targets = outcomes;
        let successes = self.task.successes();
        let total = self.task.targets.len();

        if successes > 0 {
            tracing::info!(
                "Replication completed for object {} ({}/{} nodes successful)",
                self.task.object_key,
                successes,
                total
            );
            self.task.status = TaskStatus::Completed;
            self.task.completed_at = Some(Utc::now());
            self.publish();
            self.task
        } else {
            self.fail(format!("Failed to replicate to any target node (0/{})", total))
        }
    }

    async fn push_to_target(&self, target: &Node, request: &PushRequest) -> TargetOutcome {
        let mut outcome = TargetOutcome {
            node_id: target.id.clone(),
            address: target.address.clone(),
            status: TransferStatus::Pending,
            attempts: 0,
            error: None,
        };

        let max_attempts = self.config.max_attempts.max(1);
        while outcome.attempts < max_attempts {
            outcome.attempts += 1;
            let result = tokio::time::timeout(
                self.config.push_timeout,
                self.transport.push(target, request),
            )
            .await
            .unwrap_or(Err(TransferError::Timeout));

            match result {
                Ok(()) => {
                    tracing::info!(
                        "Successfully replicated object {} to node {}",
                        request.object_key,
                        target.id
                    );
                    outcome.status = TransferStatus::Succeeded;
                    outcome.error = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to replicate object {} to node {} (attempt {}/{}): {}",
                        request.object_key,
                        target.id,
                        outcome.attempts,
                        max_attempts,
                        e
                    );
                    outcome.status = TransferStatus::Failed;
                    outcome.error = Some(e.to_string());
                }
            }
        }

        self.record_target(&outcome);
        outcome
    }

    /// Writes one target's outcome into the shared record as soon as it is
    /// known, so the replica set reflects progress before the task finishes.
    fn record_target(&self, outcome: &TargetOutcome) {
        if let Some(mut entry) = self.tasks.get_mut(&self.task.object_id) {
            if entry.attempt_id != self.task.attempt_id {
                return;
            }
            if let Some(slot) = entry
                .targets
                .iter_mut()
                .find(|target| target.node_id == outcome.node_id)
            {
                *slot = outcome.clone();
            }
        }
    }

    fn fail(mut self, error: String) -> ReplicationTask {
        tracing::error!("Replication failed for object {}: {}", self.task.object_key, error);
        self.merge_recorded_targets();
        self.task.status = TaskStatus::Failed;
        self.task.error = Some(error);
        self.task.completed_at = Some(Utc::now());
        self.publish();
        self.task
    }

    /// Pulls in target outcomes already written by `record_target`. Pushes
    /// that finished before a cancellation keep their result.
    fn merge_recorded_targets(&mut self) {
        let Some(entry) = self.tasks.get(&self.task.object_id) else {
            return;
        };
        if entry.attempt_id != self.task.attempt_id {
            return;
        }
        for target in self
            .task
            .targets
            .iter_mut()
            .filter(|target| target.status == TransferStatus::Pending)
        {
            if let Some(recorded) = entry
                .targets
                .iter()
                .find(|recorded| recorded.node_id == target.node_id)
            {
                *target = recorded.clone();
            }
        }
    }

    /// Stores the local copy of the task unless a newer attempt replaced it.
    fn publish(&self) {
        if let Some(mut entry) = self.tasks.get_mut(&self.task.object_id) {
            if entry.attempt_id == self.task.attempt_id {
                *entry = self.task.clone();
            }
        }
    }
}

async fn buffer_payload<R>(mut payload: R) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    payload.read_to_end(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

/// Resolves once cancellation is requested. A dropped handle never cancels.
async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow() {
            return;
        }
        if cancelled.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
