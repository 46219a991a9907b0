//! Control plane API models

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub active_deployments: usize,
    pub max_deployments: usize,
    pub clusters: usize,
    pub topics: usize,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error envelope returned by every failing route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable upper-case code, e.g. `CAPACITY_EXCEEDED`
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Generic list wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            total: items.len(),
            items,
        }
    }
}

/// Result of a container, pod or deployment action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// `GET /api/docker/containers` query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListContainersQuery {
    #[serde(default)]
    pub all: Option<bool>,
}

/// `DELETE /api/docker/containers/{id}` query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteContainerQuery {
    #[serde(default)]
    pub force: Option<bool>,
}

/// Namespace filter for Kubernetes listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Scale request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

/// Deploy request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub container_id: String,
    pub cluster: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Accepted deploy request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub deploy_id: String,
    pub status: String,
    /// Live status stream for this deployment
    pub stream: String,
}

/// Cancel response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub deploy_id: String,
    pub cancelled: bool,
}

/// `GET /api/deploy/history` query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Configured cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// Manifest generator configuration, without secrets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfigResponse {
    /// `openai-compatible` or `template`
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub api_key_configured: bool,
}
