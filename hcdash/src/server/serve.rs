//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::options::ServerOptions;
use crate::errors::AppError;
use crate::server::handlers::*;
use crate::server::state::ServerState;
use crate::server::ws::{
    container_logs_ws, deploy_status_ws, docker_stats_ws, k8s_metrics_ws, pod_logs_ws,
};

/// Build the routes; `serve` binds them, tests drive them directly
pub fn router(state: Arc<ServerState>) -> Router {
    let cors = cors_layer(&state.options.cors_origins);

    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/version", get(version_handler))
        // Docker
        .route("/api/docker/containers", get(list_containers_handler))
        .route(
            "/api/docker/containers/{id}",
            get(get_container_handler).delete(delete_container_handler),
        )
        .route(
            "/api/docker/containers/{id}/restart",
            post(restart_container_handler),
        )
        .route("/api/docker/containers/{id}/stop", post(stop_container_handler))
        // Kubernetes
        .route("/api/k8s/clusters", get(list_clusters_handler))
        .route("/api/k8s/{cluster}/pods", get(list_pods_handler))
        .route("/api/k8s/{cluster}/deployments", get(list_deployments_handler))
        .route("/api/k8s/{cluster}/services", get(list_services_handler))
        .route(
            "/api/k8s/{cluster}/{namespace}/deployments/{name}/scale",
            post(scale_deployment_handler),
        )
        .route(
            "/api/k8s/{cluster}/{namespace}/pods/{name}/restart",
            post(restart_pod_handler),
        )
        // Deployments
        .route("/api/deploy/docker-to-k8s", post(submit_deploy_handler))
        .route("/api/deploy/active", get(active_deploys_handler))
        .route("/api/deploy/history", get(deploy_history_handler))
        .route("/api/deploy/{id}/status", get(deploy_status_handler))
        .route("/api/deploy/{id}/cancel", post(cancel_deploy_handler))
        // Configuration
        .route("/api/config/clusters", get(config_clusters_handler))
        .route("/api/config/ai", get(config_ai_handler))
        // Live streams
        .route("/ws/docker/stats", get(docker_stats_ws))
        .route("/ws/k8s/{cluster}/metrics", get(k8s_metrics_ws))
        .route("/ws/docker/{container_id}/logs", get(container_logs_ws))
        .route(
            "/ws/k8s/{cluster}/{namespace}/{pod}/logs",
            get(pod_logs_ws),
        )
        .route("/ws/deploy/{deploy_id}/status", get(deploy_status_ws))
        // State and middleware
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), AppError>>, AppError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| AppError::ServerError(e.to_string()))
    });

    Ok(handle)
}

