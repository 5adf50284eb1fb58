use async_trait::async_trait;
use cluster::{HealthProbe, Membership, MembershipConfig, Node, NodeRegistration};
use replication::{
    PushRequest, ReplicaTransport, ReplicationConfig, ReplicationCoordinator, ReplicationError,
    TaskStatus, TransferError, TransferStatus,
};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use storage::{ObjectStore, ReplicaStatus, StorageObject, StoreOptions};
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};

struct AlwaysUp;

#[async_trait]
impl HealthProbe for AlwaysUp {
    async fn probe(&self, _node: &Node) -> bool {
        true
    }
}

#[derive(Default)]
struct FakeTransport {
    failing: HashSet<String>,
    hanging: HashSet<String>,
    delay: Option<Duration>,
    received: Mutex<HashMap<String, Vec<PushRequest>>>,
}

impl FakeTransport {
    fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    fn received_by(&self, node_id: &str) -> Vec<PushRequest> {
        self.received
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReplicaTransport for FakeTransport {
    async fn push(&self, target: &Node, request: &PushRequest) -> Result<(), TransferError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.hanging.contains(&target.id) {
            std::future::pending::<()>().await;
        }
        self.received
            .lock()
            .unwrap()
            .entry(target.id.clone())
            .or_default()
            .push(request.clone());
        if self.failing.contains(&target.id) {
            return Err(TransferError::Rejected(500));
        }
        Ok(())
    }
}

struct BrokenReader;

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire")))
    }
}

async fn cluster_with_peers(peers: &[&str]) -> Arc<Membership> {
    let membership = Membership::new(
        Node::new("source", "source.local:8080", 1 << 30),
        MembershipConfig::default(),
        Arc::new(AlwaysUp),
    );
    for id in peers {
        membership
            .register_node(NodeRegistration {
                id: id.to_string(),
                address: format!("{}.local:8080", id),
                load: 0.0,
                capacity: 1 << 30,
                used: 0,
            })
            .await;
    }
    Arc::new(membership)
}

async fn stored_object(dir: &TempDir, key: &str, payload: &[u8]) -> (ObjectStore, StorageObject) {
    let store = ObjectStore::open(dir.path(), "source", StoreOptions::default())
        .await
        .unwrap();
    let object = store
        .put(key, Cursor::new(payload.to_vec()), "text/csv")
        .await
        .unwrap();
    (store, object)
}

fn coordinator(
    membership: Arc<Membership>,
    transport: Arc<FakeTransport>,
    config: ReplicationConfig,
) -> ReplicationCoordinator {
    ReplicationCoordinator::new(membership, transport, config)
}

#[tokio::test]
async fn test_no_healthy_peers_creates_no_task() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "lonely.csv", b"a,b\n").await;
    let transport = Arc::new(FakeTransport::default());
    let replication = coordinator(
        cluster_with_peers(&[]).await,
        transport.clone(),
        ReplicationConfig::default(),
    );

    let result = replication
        .replicate_object(&object, Cursor::new(b"a,b\n".to_vec()))
        .await;

    assert!(matches!(result, Err(ReplicationError::NoHealthyTargets)));
    assert!(replication.get_replication_status(&object.id).is_none());
    assert!(replication.get_all_replication_tasks().is_empty());
    assert!(transport.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_two_of_three_acknowledged_is_completed() {
    let dir = TempDir::new().unwrap();
    let payload = vec![7u8; 500];
    let (store, object) = stored_object(&dir, "report.csv", &payload).await;
    let transport = Arc::new(FakeTransport::failing(&["peer-b"]));
    let replication = coordinator(
        cluster_with_peers(&["peer-a", "peer-b", "peer-c"]).await,
        transport.clone(),
        ReplicationConfig::default(),
    );

    let file = store.open_payload(&object).await.unwrap();
    let handle = replication.replicate_object(&object, file).await.unwrap();
    assert_eq!(handle.object_id(), object.id);

    let task = handle.wait().await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.successes(), 2);
    assert!(task.completed_at.is_some());
    assert_eq!(task.source_node, "source");
    assert_eq!(task.target_nodes, vec!["peer-a", "peer-b", "peer-c"]);

    let polled = replication.get_replication_status(&object.id).unwrap();
    assert_eq!(polled.status, TaskStatus::Completed);

    let pushed = transport.received_by("peer-a");
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].payload.as_ref(), payload.as_slice());
    assert_eq!(pushed[0].checksum, object.checksum);
    assert_eq!(pushed[0].content_type, "text/csv");
    assert_eq!(pushed[0].source_node, "source");
    assert_eq!(pushed[0].object_id, object.id);
}

#[tokio::test]
async fn test_all_targets_failing_marks_task_failed() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport::failing(&["peer-a", "peer-b"]));
    let replication = coordinator(
        cluster_with_peers(&["peer-a", "peer-b"]).await,
        transport,
        ReplicationConfig::default(),
    );

    let handle = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap();
    let task = handle.wait().await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("any target node"));
    assert!(task
        .targets
        .iter()
        .all(|target| target.status == TransferStatus::Failed && target.error.is_some()));
}

#[tokio::test]
async fn test_buffer_failure_marks_task_failed() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport::default());
    let replication = coordinator(
        cluster_with_peers(&["peer-a"]).await,
        transport.clone(),
        ReplicationConfig::default(),
    );

    let task = replication
        .replicate_object(&object, BrokenReader)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("buffer"));
    assert!(transport.received_by("peer-a").is_empty());
}

#[tokio::test]
async fn test_replication_factor_bounds_targets() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport::default());
    let config = ReplicationConfig {
        replication_factor: 2,
        ..ReplicationConfig::default()
    };
    let replication = coordinator(
        cluster_with_peers(&["a", "b", "c", "d"]).await,
        transport.clone(),
        config,
    );

    let task = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(task.target_nodes, vec!["a", "b"]);
    assert!(transport.received_by("c").is_empty());
    assert!(!task.target_nodes.contains(&"source".to_string()));
}

#[tokio::test]
async fn test_retry_attempts_are_counted() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport::failing(&["flaky"]));
    let config = ReplicationConfig {
        max_attempts: 3,
        ..ReplicationConfig::default()
    };
    let replication = coordinator(cluster_with_peers(&["flaky"]).await, transport.clone(), config);

    let task = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(task.targets[0].attempts, 3);
    assert_eq!(transport.received_by("flaky").len(), 3);
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_push_timeout_is_a_target_failure() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport {
        hanging: ["stuck".to_string()].into_iter().collect(),
        ..FakeTransport::default()
    });
    let config = ReplicationConfig {
        push_timeout: Duration::from_millis(50),
        ..ReplicationConfig::default()
    };
    let replication = coordinator(
        cluster_with_peers(&["stuck", "fine"]).await,
        transport,
        config,
    );

    let task = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    let stuck = task.targets.iter().find(|t| t.node_id == "stuck").unwrap();
    assert_eq!(stuck.status, TransferStatus::Failed);
    assert_eq!(stuck.error.as_deref(), Some("timed out"));
}

#[tokio::test]
async fn test_cancel_fails_the_task() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport {
        hanging: ["stuck".to_string()].into_iter().collect(),
        ..FakeTransport::default()
    });
    let replication = coordinator(
        cluster_with_peers(&["stuck"]).await,
        transport,
        ReplicationConfig::default(),
    );

    let handle = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let task = handle.wait().await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("replication cancelled"));
    assert_eq!(
        replication.get_replication_status(&object.id).unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_cancel_keeps_finished_target_outcomes() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport {
        hanging: ["stuck".to_string()].into_iter().collect(),
        ..FakeTransport::default()
    });
    let replication = coordinator(
        cluster_with_peers(&["fine", "stuck"]).await,
        transport,
        ReplicationConfig::default(),
    );

    let handle = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let task = handle.wait().await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    let fine = task.targets.iter().find(|t| t.node_id == "fine").unwrap();
    assert_eq!(fine.status, TransferStatus::Succeeded);
    let stuck = task.targets.iter().find(|t| t.node_id == "stuck").unwrap();
    assert_eq!(stuck.status, TransferStatus::Pending);

    let polled = replication.get_replication_status(&object.id).unwrap();
    assert_eq!(polled.targets, task.targets);

    let replicas = replication.replica_set(&object);
    let status_of = |node: &str| {
        replicas
            .iter()
            .find(|replica| replica.node_id == node)
            .map(|replica| replica.status)
    };
    assert_eq!(status_of("fine"), Some(ReplicaStatus::Active));
    assert_eq!(status_of("stuck"), Some(ReplicaStatus::Failed));
}

#[tokio::test]
async fn test_in_flight_limit_queues_replications() {
    let dir = TempDir::new().unwrap();
    let (_store, first) = stored_object(&dir, "first", b"1").await;
    let dir2 = TempDir::new().unwrap();
    let (_store2, second) = stored_object(&dir2, "second", b"2").await;
    let transport = Arc::new(FakeTransport {
        hanging: ["stuck".to_string()].into_iter().collect(),
        ..FakeTransport::default()
    });
    let config = ReplicationConfig {
        max_in_flight: 1,
        ..ReplicationConfig::default()
    };
    let replication = coordinator(cluster_with_peers(&["stuck"]).await, transport, config);

    let blocker = replication
        .replicate_object(&first, Cursor::new(b"1".to_vec()))
        .await
        .unwrap();
    let queued = replication
        .replicate_object(&second, Cursor::new(b"2".to_vec()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        replication.get_replication_status(&first.id).unwrap().status,
        TaskStatus::InProgress
    );
    assert_eq!(
        replication.get_replication_status(&second.id).unwrap().status,
        TaskStatus::Pending
    );

    queued.cancel();
    blocker.cancel();
    assert_eq!(queued.wait().await.unwrap().status, TaskStatus::Failed);
    assert_eq!(blocker.wait().await.unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_reinitiating_overwrites_task_record() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport::failing(&["peer-a"]));
    let replication = coordinator(
        cluster_with_peers(&["peer-a"]).await,
        transport,
        ReplicationConfig::default(),
    );

    let first = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_ne!(first.attempt_id, second.attempt_id);
    let tasks = replication.get_all_replication_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempt_id, second.attempt_id);
}

#[tokio::test]
async fn test_replica_set_reflects_outcomes() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport::failing(&["peer-b"]));
    let replication = coordinator(
        cluster_with_peers(&["peer-a", "peer-b"]).await,
        transport,
        ReplicationConfig::default(),
    );

    // Before replication the descriptor's local copy is the whole set.
    let replicas = replication.replica_set(&object);
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].node_id, "source");

    replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let replicas = replication.replica_set(&object);
    let status_of = |id: &str| replicas.iter().find(|r| r.node_id == id).unwrap().status;
    assert_eq!(replicas.len(), 3);
    assert_eq!(status_of("source"), ReplicaStatus::Active);
    assert_eq!(status_of("peer-a"), ReplicaStatus::Active);
    assert_eq!(status_of("peer-b"), ReplicaStatus::Failed);

    // The stored descriptor itself is never rewritten.
    assert_eq!(object.replicas.len(), 1);
}

#[tokio::test]
async fn test_replicate_returns_before_pushes_finish() {
    let dir = TempDir::new().unwrap();
    let (_store, object) = stored_object(&dir, "x", b"x").await;
    let transport = Arc::new(FakeTransport {
        delay: Some(Duration::from_millis(200)),
        ..FakeTransport::default()
    });
    let replication = coordinator(
        cluster_with_peers(&["slow"]).await,
        transport,
        ReplicationConfig::default(),
    );

    let handle = replication
        .replicate_object(&object, Cursor::new(b"x".to_vec()))
        .await
        .unwrap();

    let status = replication.get_replication_status(&object.id).unwrap().status;
    assert!(!status.is_terminal());
    let replicas = replication.replica_set(&object);
    assert_eq!(replicas[1].status, ReplicaStatus::Syncing);

    assert_eq!(handle.wait().await.unwrap().status, TaskStatus::Completed);
}
