//! Docker collaborator

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::ServiceError;
use crate::services::process::{run_command, spawn_lines};
use crate::telemetry::{parse_docker_size, ContainerStats, DockerStatsSnapshot};

/// Row of a container listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: String,
    pub created: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub destination: String,
    pub kind: String,
}

/// Container metadata handed to the manifest generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Image repository without the tag
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
}

impl ContainerInfo {
    /// `image:tag` reference
    pub fn image_ref(&self) -> String {
        if self.tag.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.tag)
        }
    }
}

/// Split `registry/repo:tag` into repo and tag; digests are kept on the repo
pub fn split_image_ref(reference: &str) -> (String, String) {
    if reference.contains('@') {
        return (reference.to_string(), String::new());
    }
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (reference[..split].to_string(), reference[split + 1..].to_string())
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}

#[async_trait]
pub trait DockerService: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ServiceError>;

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, ServiceError>;

    async fn restart_container(&self, id: &str) -> Result<(), ServiceError>;

    async fn stop_container(&self, id: &str) -> Result<(), ServiceError>;

    async fn delete_container(&self, id: &str, force: bool) -> Result<(), ServiceError>;

    async fn container_stats(&self) -> Result<DockerStatsSnapshot, ServiceError>;

    async fn follow_logs(
        &self,
        id: &str,
        tail: usize,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError>;
}

/// Docker through the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    host: Option<String>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, host: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            host,
        }
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.push("--host".to_string());
            args.push(host.clone());
        }
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    async fn docker<I, S>(&self, rest: I) -> Result<String, ServiceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        run_command(&self.binary, &self.args(rest), None).await
    }
}

#[async_trait]
impl DockerService for DockerCli {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, ServiceError> {
        let mut args = vec!["ps", "--no-trunc", "--format", "{{json .}}"];
        if all {
            args.push("--all");
        }
        let output = self.docker(args).await?;
        output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_ps_line)
            .collect()
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, ServiceError> {
        let output = self.docker(["inspect", "--type", "container", id]).await?;
        parse_inspect(&output)
    }

    async fn restart_container(&self, id: &str) -> Result<(), ServiceError> {
        self.docker(["restart", id]).await.map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<(), ServiceError> {
        self.docker(["stop", id]).await.map(|_| ())
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<(), ServiceError> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(id);
        self.docker(args).await.map(|_| ())
    }

    async fn container_stats(&self) -> Result<DockerStatsSnapshot, ServiceError> {
        let output = self
            .docker(["stats", "--no-stream", "--no-trunc", "--format", "{{json .}}"])
            .await?;
        Ok(DockerStatsSnapshot {
            timestamp: Utc::now(),
            containers: parse_stats_output(&output),
        })
    }

    async fn follow_logs(
        &self,
        id: &str,
        tail: usize,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
        let tail = tail.to_string();
        spawn_lines(
            &self.binary,
            &self.args(["logs", "--follow", "--tail", tail.as_str(), id]),
        )
    }
}

fn invalid(what: &str, err: impl std::fmt::Display) -> ServiceError {
    ServiceError::InvalidResponse(format!("{}: {}", what, err))
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_ps_line(line: &str) -> Result<ContainerSummary, ServiceError> {
    let row: Value = serde_json::from_str(line).map_err(|e| invalid("docker ps", e))?;
    Ok(ContainerSummary {
        id: str_field(&row, "ID"),
        name: str_field(&row, "Names"),
        image: str_field(&row, "Image"),
        state: str_field(&row, "State"),
        status: str_field(&row, "Status"),
        ports: str_field(&row, "Ports"),
        created: str_field(&row, "CreatedAt"),
    })
}

fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Split "used / total" pairs as printed by `docker stats`
fn parse_pair(s: &str) -> (u64, u64) {
    let mut parts = s.split('/');
    let first = parts.next().and_then(parse_docker_size).unwrap_or(0);
    let second = parts.next().and_then(parse_docker_size).unwrap_or(0);
    (first, second)
}

/// One entry per parsable line; an odd container must not blank the rest
fn parse_stats_output(output: &str) -> Vec<ContainerStats> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match parse_stats_line(line) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Skipping docker stats line: {}", e);
                None
            }
        })
        .collect()
}

fn parse_stats_line(line: &str) -> Result<ContainerStats, ServiceError> {
    let row: Value = serde_json::from_str(line).map_err(|e| invalid("docker stats", e))?;
    let (memory_usage, memory_limit) = parse_pair(&str_field(&row, "MemUsage"));
    let (network_rx, network_tx) = parse_pair(&str_field(&row, "NetIO"));
    Ok(ContainerStats {
        container_id: str_field(&row, "ID"),
        name: str_field(&row, "Name"),
        cpu_percent: parse_percent(&str_field(&row, "CPUPerc")),
        memory_usage,
        memory_limit,
        memory_percent: parse_percent(&str_field(&row, "MemPerc")),
        network_rx,
        network_tx,
    })
}

fn parse_port_key(key: &str) -> Option<(u16, String)> {
    let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
    Some((port.parse().ok()?, protocol.to_string()))
}

fn parse_inspect(output: &str) -> Result<ContainerInfo, ServiceError> {
    let parsed: Value = serde_json::from_str(output).map_err(|e| invalid("docker inspect", e))?;
    let container = parsed
        .as_array()
        .and_then(|items| items.first())
        .ok_or_else(|| ServiceError::NotFound("docker inspect returned no container".to_string()))?;

    let config = &container["Config"];
    let host_config = &container["HostConfig"];
    let (image, tag) = split_image_ref(config["Image"].as_str().unwrap_or_default());

    let strings = |value: &Value| -> Vec<String> {
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut ports: Vec<PortMapping> = config["ExposedPorts"]
        .as_object()
        .map(|exposed| {
            exposed
                .keys()
                .filter_map(|key| parse_port_key(key))
                .map(|(container_port, protocol)| PortMapping {
                    container_port,
                    host_port: None,
                    protocol,
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(bindings) = host_config["PortBindings"].as_object() {
        for (key, hosts) in bindings {
            let Some((container_port, protocol)) = parse_port_key(key) else {
                continue;
            };
            let host_port = hosts
                .as_array()
                .and_then(|h| h.first())
                .and_then(|h| h["HostPort"].as_str())
                .and_then(|p| p.parse().ok());
            match ports.iter_mut().find(|p| p.container_port == container_port) {
                Some(existing) => existing.host_port = host_port,
                None => ports.push(PortMapping {
                    container_port,
                    host_port,
                    protocol,
                }),
            }
        }
    }
    ports.sort_by_key(|p| p.container_port);

    let volumes = container["Mounts"]
        .as_array()
        .map(|mounts| {
            mounts
                .iter()
                .map(|m| VolumeMount {
                    source: str_field(m, "Source"),
                    destination: str_field(m, "Destination"),
                    kind: str_field(m, "Type"),
                })
                .collect()
        })
        .unwrap_or_default();

    let labels = config["Labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(ContainerInfo {
        id: str_field(container, "Id"),
        name: str_field(container, "Name").trim_start_matches('/').to_string(),
        image,
        tag,
        env: strings(&config["Env"]),
        ports,
        volumes,
        command: strings(&config["Cmd"]),
        working_dir: str_field(config, "WorkingDir"),
        network_mode: str_field(host_config, "NetworkMode"),
        labels,
        privileged: host_config["Privileged"].as_bool().unwrap_or(false),
    })
}
