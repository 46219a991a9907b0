//! Manifest generation collaborator

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::deploy::job::Manifest;
use crate::errors::{AppError, ServiceError};
use crate::services::docker::ContainerInfo;
use crate::services::store::DeploymentRecord;
use crate::utils::dns_label;

/// Everything the generator gets to look at
#[derive(Debug, Clone, Serialize)]
pub struct ManifestRequest {
    pub container: ContainerInfo,
    /// Image reference the manifest must run
    pub image: String,
    pub namespace: String,
    pub history: Vec<DeploymentRecord>,
}

#[async_trait]
pub trait AiService: Send + Sync {
    async fn generate_manifest(&self, request: &ManifestRequest) -> Result<Manifest, ServiceError>;
}

/// Deterministic generator that renders a Deployment and a ClusterIP Service
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn render(request: &ManifestRequest) -> Result<Manifest, ServiceError> {
        let container = &request.container;
        let name = dns_label(&container.name);

        let env: Vec<Value> = container
            .env
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let ports: Vec<Value> = container
            .ports
            .iter()
            .map(|p| json!({ "containerPort": p.container_port, "protocol": p.protocol.to_uppercase() }))
            .collect();

        let mut spec_container = json!({
            "name": name,
            "image": request.image,
            "ports": ports,
            "env": env,
        });
        if !container.command.is_empty() {
            spec_container["args"] = json!(container.command);
        }
        if !container.working_dir.is_empty() {
            spec_container["workingDir"] = json!(container.working_dir);
        }

        let (volumes, mounts): (Vec<Value>, Vec<Value>) = container
            .volumes
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let volume = format!("data-{}", i);
                (
                    json!({ "name": volume, "emptyDir": {} }),
                    json!({ "name": volume, "mountPath": v.destination }),
                )
            })
            .unzip();
        if !mounts.is_empty() {
            spec_container["volumeMounts"] = json!(mounts);
        }

        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": request.namespace,
                "labels": { "app": name, "app.kubernetes.io/managed-by": "hcdash" },
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": { "containers": [spec_container], "volumes": volumes },
                },
            },
        });

        let service_ports: Vec<Value> = if container.ports.is_empty() {
            vec![json!({ "name": "http", "port": 80, "targetPort": 80 })]
        } else {
            container
                .ports
                .iter()
                .map(|p| {
                    json!({
                        "name": format!("{}-{}", p.protocol.to_lowercase(), p.container_port),
                        "port": p.host_port.unwrap_or(p.container_port),
                        "targetPort": p.container_port,
                        "protocol": p.protocol.to_uppercase(),
                    })
                })
                .collect()
        };

        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": request.namespace },
            "spec": { "type": "ClusterIP", "selector": { "app": name }, "ports": service_ports },
        });

        let to_yaml = |value: &Value| {
            serde_yaml::to_string(value).map_err(|e| ServiceError::InvalidResponse(e.to_string()))
        };

        Ok(Manifest {
            deployment: to_yaml(&deployment)?,
            service: to_yaml(&service)?,
            notes: Some(format!(
                "rendered from template with {} similar deployment(s) on record",
                request.history.len()
            )),
        })
    }
}

#[async_trait]
impl AiService for TemplateGenerator {
    async fn generate_manifest(&self, request: &ManifestRequest) -> Result<Manifest, ServiceError> {
        Self::render(request)
    }
}

/// Options for an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

/// Generator backed by an OpenAI-compatible chat completions API
pub struct ChatGenerator {
    http: reqwest::Client,
    endpoint: Url,
    options: ChatOptions,
}

impl ChatGenerator {
    pub fn new(options: ChatOptions) -> Result<Self, AppError> {
        let base = Url::parse(&format!("{}/", options.base_url.trim_end_matches('/')))
            .map_err(|e| AppError::ConfigError(format!("invalid AI base URL: {}", e)))?;
        let endpoint = base
            .join("chat/completions")
            .map_err(|e| AppError::ConfigError(format!("invalid AI base URL: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            options,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn prompt(request: &ManifestRequest) -> Result<String, ServiceError> {
        let history: Vec<Value> = request
            .history
            .iter()
            .map(|r| {
                json!({
                    "image": r.image,
                    "result": r.result,
                    "error": r.error.as_ref().map(|e| e.message.clone()),
                    "manifest": r.manifest,
                })
            })
            .collect();
        let body = json!({
            "container": request.container,
            "image": request.image,
            "namespace": request.namespace,
            "similar_deployments": history,
        });
        serde_json::to_string_pretty(&body).map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

const SYSTEM_PROMPT: &str = "You convert Docker containers into Kubernetes manifests. \
Reply with a JSON object with string fields \"deployment\" and \"service\" holding YAML \
documents, and an optional \"notes\" field. Use the given image reference verbatim.";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl AiService for ChatGenerator {
    async fn generate_manifest(&self, request: &ManifestRequest) -> Result<Manifest, ServiceError> {
        let body = json!({
            "model": self.options.model,
            "temperature": self.options.temperature,
            "max_tokens": self.options.max_tokens,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": Self::prompt(request)? },
            ],
        });

        debug!("Requesting manifest from {}", self.endpoint);
        let mut builder = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.options.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Rejected(format!("{}: {}", status, text)));
        }

        let response: ChatResponse = response.json().await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("empty completion".to_string()))?;
        parse_completion(&content)
    }
}

/// Pull the manifest out of a completion, tolerating a fenced code block
pub fn parse_completion(content: &str) -> Result<Manifest, ServiceError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced.trim())
        .map_err(|e| ServiceError::InvalidResponse(format!("manifest completion: {}", e)))
}
