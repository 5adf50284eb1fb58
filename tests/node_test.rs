use peerstore::{Config, Node, PeerstoreError};
use std::io::Cursor;
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    let mut config = Config::new("node-a".to_string(), "127.0.0.1".parse().unwrap(), 0);
    config.storage_path = dir.path().to_path_buf();
    config.capacity = 1000;
    config
}

#[tokio::test]
async fn test_node_reports_existing_usage_on_startup() {
    let dir = TempDir::new().unwrap();

    {
        let node = Node::new(config(&dir)).await.unwrap();
        node.store()
            .put("seeded", Cursor::new(vec![0u8; 250]), "application/octet-stream")
            .await
            .unwrap();
    }

    let node = Node::new(config(&dir)).await.unwrap();
    let local = node.membership().self_node().await;
    assert_eq!(local.id, "node-a");
    assert_eq!(local.address, "127.0.0.1:0");
    assert_eq!(local.used, 250);
    assert!((local.load - 0.25).abs() < f64::EPSILON);
    assert!(node.replication().get_all_replication_tasks().is_empty());
}

#[tokio::test]
async fn test_node_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.peers = vec!["no-port".to_string()];

    assert!(matches!(
        Node::new(config).await,
        Err(PeerstoreError::InvalidConfig(_))
    ));
}
