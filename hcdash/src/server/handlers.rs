//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use openapi_server::models::{
    ActionResponse, AiConfigResponse, CancelResponse, ClusterSummary, DeleteContainerQuery,
    DeployRequest, DeployResponse, HealthResponse, HistoryQuery, ListContainersQuery,
    ListResponse, NamespaceQuery, ReadyResponse, ScaleRequest, VersionResponse,
};
use tracing::info;

use crate::deploy::job::{DeployTarget, JobId};
use crate::server::error::{ApiError, ApiResult};
use crate::server::state::ServerState;
use crate::services::with_timeout;
use crate::utils::version_info;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

fn action(message: impl Into<String>) -> Json<ActionResponse> {
    Json(ActionResponse {
        success: true,
        message: message.into(),
    })
}

fn namespace_or_default(query: NamespaceQuery) -> String {
    query
        .namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

// ================================ HEALTH ========================================= //

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "hcdash".to_string(),
        version: state.app.version.clone(),
    })
}

/// Readiness: not ready once the server is draining
pub async fn ready_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let ready = !*state.shutdown.borrow();
    let orchestrator = &state.app.orchestrator;
    let body = ReadyResponse {
        ready,
        active_deployments: orchestrator.active_count(),
        max_deployments: orchestrator.options().admission.max_active,
        clusters: state.app.services.kubernetes.list_clusters().len(),
        topics: state.app.hub.topics().len(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================ DOCKER ========================================= //

pub async fn list_containers_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListContainersQuery>,
) -> ApiResult<impl IntoResponse> {
    let timeout = state.app.orchestrator.options().call_timeout;
    let containers = with_timeout(
        timeout,
        state
            .app
            .services
            .docker
            .list_containers(query.all.unwrap_or(true)),
    )
    .await?;
    Ok(Json(ListResponse::from(containers)))
}

pub async fn get_container_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let timeout = state.app.orchestrator.options().call_timeout;
    let info = with_timeout(timeout, state.app.services.docker.get_container(&id)).await?;
    Ok(Json(info))
}

pub async fn restart_container_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let timeout = state.app.orchestrator.options().call_timeout;
    with_timeout(timeout, state.app.services.docker.restart_container(&id)).await?;
    info!("Restarted container {}", id);
    Ok(action(format!("container {} restarted", id)))
}

pub async fn stop_container_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let timeout = state.app.orchestrator.options().call_timeout;
    with_timeout(timeout, state.app.services.docker.stop_container(&id)).await?;
    info!("Stopped container {}", id);
    Ok(action(format!("container {} stopped", id)))
}

pub async fn delete_container_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteContainerQuery>,
) -> ApiResult<impl IntoResponse> {
    let timeout = state.app.orchestrator.options().call_timeout;
    let force = query.force.unwrap_or(false);
    with_timeout(
        timeout,
        state.app.services.docker.delete_container(&id, force),
    )
    .await?;
    info!("Deleted container {} (force: {})", id, force);
    Ok(action(format!("container {} deleted", id)))
}

// ============================== KUBERNETES ======================================= //

fn cluster_summaries(state: &ServerState) -> Vec<ClusterSummary> {
    state
        .app
        .services
        .kubernetes
        .list_clusters()
        .into_iter()
        .map(|c| ClusterSummary {
            name: c.name,
            context: c.context,
            registry: c.registry,
        })
        .collect()
}

pub(crate) fn require_cluster(state: &ServerState, cluster: &str) -> ApiResult<()> {
    let known = state
        .app
        .services
        .kubernetes
        .list_clusters()
        .iter()
        .any(|c| c.name == cluster);
    if known {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("cluster {}", cluster)))
    }
}

pub async fn list_clusters_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(ListResponse::from(cluster_summaries(&state)))
}

pub async fn list_pods_handler(
    State(state): State<Arc<ServerState>>,
    Path(cluster): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    require_cluster(&state, &cluster)?;
    let namespace = namespace_or_default(query);
    let timeout = state.app.orchestrator.options().call_timeout;
    let pods = with_timeout(
        timeout,
        state.app.services.kubernetes.list_pods(&cluster, &namespace),
    )
    .await?;
    Ok(Json(ListResponse::from(pods)))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(cluster): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    require_cluster(&state, &cluster)?;
    let namespace = namespace_or_default(query);
    let timeout = state.app.orchestrator.options().call_timeout;
    let deployments = with_timeout(
        timeout,
        state
            .app
            .services
            .kubernetes
            .list_deployments(&cluster, &namespace),
    )
    .await?;
    Ok(Json(ListResponse::from(deployments)))
}

pub async fn list_services_handler(
    State(state): State<Arc<ServerState>>,
    Path(cluster): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    require_cluster(&state, &cluster)?;
    let namespace = namespace_or_default(query);
    let timeout = state.app.orchestrator.options().call_timeout;
    let services = with_timeout(
        timeout,
        state
            .app
            .services
            .kubernetes
            .list_services(&cluster, &namespace),
    )
    .await?;
    Ok(Json(ListResponse::from(services)))
}

pub async fn scale_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path((cluster, namespace, name)): Path<(String, String, String)>,
    Json(request): Json<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    require_cluster(&state, &cluster)?;
    let timeout = state.app.orchestrator.options().call_timeout;
    with_timeout(
        timeout,
        state.app.services.kubernetes.scale_deployment(
            &cluster,
            &namespace,
            &name,
            request.replicas,
        ),
    )
    .await?;
    info!(
        "Scaled deployment {}/{} on {} to {} replicas",
        namespace, name, cluster, request.replicas
    );
    Ok(action(format!(
        "deployment {} scaled to {}",
        name, request.replicas
    )))
}

pub async fn restart_pod_handler(
    State(state): State<Arc<ServerState>>,
    Path((cluster, namespace, name)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    require_cluster(&state, &cluster)?;
    let timeout = state.app.orchestrator.options().call_timeout;
    with_timeout(
        timeout,
        state
            .app
            .services
            .kubernetes
            .restart_pod(&cluster, &namespace, &name),
    )
    .await?;
    info!("Restarted pod {}/{} on {}", namespace, name, cluster);
    Ok(action(format!("pod {} restarted", name)))
}

// ================================ DEPLOY ========================================= //

/// Submit a container for rollout; answers 202 with the stream to follow
pub async fn submit_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.container_id.trim().is_empty() {
        return Err(ApiError::BadRequest("container_id is required".to_string()));
    }
    if request.cluster.trim().is_empty() {
        return Err(ApiError::BadRequest("cluster is required".to_string()));
    }
    let namespace = if request.namespace.trim().is_empty() {
        "default".to_string()
    } else {
        request.namespace
    };

    let target = DeployTarget::new(request.container_id, request.cluster, namespace);
    let submission = state.app.orchestrator.submit(target)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            stream: format!("/ws/deploy/{}/status", submission.deploy_id),
            deploy_id: submission.deploy_id.to_string(),
            status: submission.stage.to_string(),
        }),
    ))
}

pub async fn deploy_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = JobId::from(id);
    match state.app.orchestrator.status(&id).await? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::NotFound(format!("deployment {}", id))),
    }
}

pub async fn cancel_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = JobId::from(id);
    if state.app.orchestrator.cancel(&id) {
        return Ok(Json(CancelResponse {
            deploy_id: id.to_string(),
            cancelled: true,
        }));
    }
    // Finished jobs cannot be cancelled, unknown ones do not exist
    match state.app.orchestrator.status(&id).await? {
        Some(_) => Ok(Json(CancelResponse {
            deploy_id: id.to_string(),
            cancelled: false,
        })),
        None => Err(ApiError::NotFound(format!("deployment {}", id))),
    }
}

pub async fn deploy_history_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let history = state.app.orchestrator.history(limit).await?;
    Ok(Json(ListResponse::from(history)))
}

pub async fn active_deploys_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(ListResponse::from(state.app.orchestrator.active()))
}

// ================================ CONFIG ========================================= //

pub async fn config_clusters_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(ListResponse::from(cluster_summaries(&state)))
}

pub async fn config_ai_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let body = match &state.app.ai {
        Some(chat) => AiConfigResponse {
            provider: "openai-compatible".to_string(),
            model: Some(chat.model.clone()),
            base_url: Some(chat.base_url.clone()),
            api_key_configured: chat.api_key.is_some(),
        },
        None => AiConfigResponse {
            provider: "template".to_string(),
            model: None,
            base_url: None,
            api_key_configured: false,
        },
    };
    Json(body)
}
