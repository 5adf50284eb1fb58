use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use cluster::{ClusterStats, Membership, NodeRegistration};
use replication::{
    ReplicationCoordinator, ReplicationError, ReplicationTask, HEADER_CHECKSUM, HEADER_OBJECT_ID,
    HEADER_REPLICATION_SOURCE,
};
use futures::TryStreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use storage::{ObjectStore, ReplicaInfo, StorageObject, StoreStats, DEFAULT_CONTENT_TYPE};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::{ApiError, ApiResult, METADATA_HEADER_PREFIX};

const STREAM_CHUNK: usize = 64 * 1024;

pub struct AppState {
    pub store: Arc<ObjectStore>,
    pub membership: Arc<Membership>,
    pub replication: Arc<ReplicationCoordinator>,
}

impl AppState {
    /// Publishes the new disk usage of this node to the membership table.
    async fn refresh_usage(&self) {
        self.membership.update_self_usage(self.store.used_bytes()).await;
    }

    /// Kicks off replication of a freshly stored object. The local write has
    /// already succeeded, so failures here are logged and not surfaced.
    async fn start_replication(&self, object: &StorageObject) {
        let payload = match self.store.open_payload(object).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Cannot reopen {} for replication: {}", object.key, e);
                return;
            }
        };

        match self.replication.replicate_object(object, payload).await {
            Ok(handle) => {
                tracing::debug!("Replication started for {}", handle.object_id());
            }
            Err(ReplicationError::NoHealthyTargets) => {
                tracing::warn!("Object {} is stored on this node only", object.key);
            }
            Err(e) => {
                tracing::error!("Failed to start replication for {}: {}", object.key, e);
            }
        }
    }
}

pub async fn list_objects(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, StorageObject>> {
    Json(state.store.list())
}

pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<StorageObject>> {
    validate_key(&key)?;

    let content_type = content_type(&headers);
    let metadata = object_metadata(&headers);

    let object = state
        .store
        .put_with_metadata(&key, body_reader(body), &content_type, metadata)
        .await?;

    state.refresh_usage().await;
    state.start_replication(&object).await;

    Ok(Json(object))
}

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let (file, object) = state.store.get(&key).await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &object.content_type)
        .header(header::CONTENT_LENGTH, object.size)
        .header(header::ETAG, format!("\"{}\"", object.checksum))
        .header(HEADER_OBJECT_ID, &object.id);

    for (name, value) in &object.metadata {
        response = response.header(format!("{}{}", METADATA_HEADER_PREFIX, name), value);
    }

    response
        .body(file_body(file))
        .map_err(|e| ApiError::InternalError(format!("Failed to build response: {}", e)))
}

pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete(&key).await?;
    state.refresh_usage().await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn object_replicas(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<ReplicaInfo>>> {
    let object = state.store.head(&key)?;
    Ok(Json(state.replication.replica_set(&object)))
}

pub async fn store_stats(State(state): State<Arc<AppState>>) -> Json<StoreStats> {
    Json(state.store.stats())
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<NodeRegistration>,
) -> ApiResult<Json<Value>> {
    if registration.id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("Node id must not be empty".to_string()));
    }
    if registration.address.trim().is_empty() {
        return Err(ApiError::InvalidRequest("Node address must not be empty".to_string()));
    }

    state.membership.register_node(registration).await;
    Ok(Json(json!({ "status": "registered" })))
}

pub async fn cluster_status(State(state): State<Arc<AppState>>) -> Json<ClusterStats> {
    Json(state.membership.cluster_stats().await)
}

/// Accepts a copy pushed by a peer. The payload is only published if it
/// hashes to the sender's checksum, and it is never re-replicated.
pub async fn receive_replica(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<StorageObject>> {
    validate_key(&key)?;

    let source = header_str(&headers, HEADER_REPLICATION_SOURCE).unwrap_or("unknown");
    let mut metadata = object_metadata(&headers);
    metadata.insert("replicated_from".to_string(), source.to_string());
    if let Some(origin_id) = header_str(&headers, HEADER_OBJECT_ID) {
        metadata.insert("source_object_id".to_string(), origin_id.to_string());
    }

    let content_type = content_type(&headers);
    let payload = body_reader(body);
    let stored = match header_str(&headers, HEADER_CHECKSUM) {
        Some(expected) => {
            state
                .store
                .put_verified(&key, payload, &content_type, metadata, expected)
                .await
        }
        None => {
            state
                .store
                .put_with_metadata(&key, payload, &content_type, metadata)
                .await
        }
    };
    let object = match stored {
        Ok(object) => object,
        Err(e) => {
            tracing::warn!("Rejecting replica of {} from {}: {}", key, source, e);
            return Err(e.into());
        }
    };
    state.refresh_usage().await;

    tracing::info!("Stored replica of {} from {}", key, source);
    Ok(Json(object))
}

pub async fn list_replication_tasks(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ReplicationTask>> {
    Json(state.replication.get_all_replication_tasks())
}

pub async fn replication_status(
    State(state): State<Arc<AppState>>,
    Path(object_id): Path<String>,
) -> ApiResult<Json<ReplicationTask>> {
    state
        .replication
        .get_replication_status(&object_id)
        .map(Json)
        .ok_or(ApiError::NoSuchTask(object_id))
}

fn validate_key(key: &str) -> ApiResult<()> {
    if key.is_empty() {
        return Err(ApiError::InvalidRequest("Object key must not be empty".to_string()));
    }
    if key.len() > 1024 {
        return Err(ApiError::InvalidRequest("Object key too long".to_string()));
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn content_type(headers: &HeaderMap) -> String {
    header_str(headers, header::CONTENT_TYPE.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Collects `x-meta-*` headers, keyed without the prefix.
fn object_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix(METADATA_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Adapts a request body into a reader so payloads stream straight to disk.
fn body_reader(body: Body) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(
        body.into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
    )
}

fn file_body(file: File) -> Body {
    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut buffer = vec![0u8; STREAM_CHUNK];
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buffer.truncate(read);
        Ok(Some((Bytes::from(buffer), file)))
    });
    Body::from_stream(stream)
}
