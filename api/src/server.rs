use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::*;
use crate::{ApiError, ApiResult};

pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(config: crate::Config, app_state: Arc<AppState>) -> Self {
        Self { config, app_state }
    }

    /// Serves until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> ApiResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        let addr = self.config.bind_address();
        tracing::info!("Starting API server on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn router(&self) -> Router {
        create_router(self.app_state.clone())
    }
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        // Object operations
        .route("/objects", get(list_objects))
        .route(
            "/objects/:key",
            put(put_object).get(get_object).delete(delete_object),
        )
        .route("/objects/:key/replicas", get(object_replicas))
        .route("/stats", get(store_stats))
        // Cluster
        .route("/health", get(health_check))
        .route("/cluster/nodes", post(register_node))
        .route("/cluster/status", get(cluster_status))
        // Replication
        .route("/internal/replicate/:key", put(receive_replica))
        .route("/replication", get(list_replication_tasks))
        .route("/replication/:object_id", get(replication_status))
        .fallback(not_found)
        .with_state(app_state)
        // Payloads stream to disk; object size is bounded by capacity, not by the router.
        .layer(DefaultBodyLimit::disable())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn not_found() -> ApiError {
    ApiError::InvalidRequest("Not found".to_string())
}
