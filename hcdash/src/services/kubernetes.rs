//! Kubernetes collaborator

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ServiceError;
use crate::services::process::{run_command, spawn_lines};
use crate::telemetry::{parse_cpu_quantity, parse_memory_quantity, ClusterMetricsSnapshot, PodMetrics};

/// A cluster the control plane can deploy to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Registry images are pushed to before rolling out on this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub ready: String,
    pub restarts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
    pub replicas: u64,
    pub ready_replicas: u64,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[async_trait]
pub trait KubernetesService: Send + Sync {
    fn list_clusters(&self) -> Vec<ClusterInfo>;

    async fn list_pods(&self, cluster: &str, namespace: &str) -> Result<Vec<PodSummary>, ServiceError>;

    async fn list_deployments(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<DeploymentSummary>, ServiceError>;

    async fn list_services(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<ServiceSummary>, ServiceError>;

    async fn scale_deployment(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<(), ServiceError>;

    async fn restart_pod(&self, cluster: &str, namespace: &str, name: &str) -> Result<(), ServiceError>;

    /// Create or update the resource described by `document`
    async fn apply_manifest(
        &self,
        cluster: &str,
        namespace: &str,
        document: &str,
    ) -> Result<String, ServiceError>;

    async fn cluster_metrics(&self, cluster: &str) -> Result<ClusterMetricsSnapshot, ServiceError>;

    async fn follow_pod_logs(
        &self,
        cluster: &str,
        namespace: &str,
        pod: &str,
        tail: usize,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError>;
}

/// Kubernetes through the `kubectl` CLI, one context per cluster
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    clusters: Vec<ClusterInfo>,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>, clusters: Vec<ClusterInfo>) -> Self {
        Self {
            binary: binary.into(),
            clusters,
        }
    }

    fn cluster(&self, name: &str) -> Result<&ClusterInfo, ServiceError> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ServiceError::NotFound(format!("cluster {} is not configured", name)))
    }

    fn args(&self, cluster: &str, rest: &[&str]) -> Result<Vec<String>, ServiceError> {
        let cluster = self.cluster(cluster)?;
        let mut args = Vec::new();
        if let Some(kubeconfig) = &cluster.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.clone());
        }
        if let Some(context) = &cluster.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend(rest.iter().map(|s| s.to_string()));
        Ok(args)
    }

    async fn kubectl(
        &self,
        cluster: &str,
        rest: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, ServiceError> {
        let args = self.args(cluster, rest)?;
        run_command(&self.binary, &args, stdin).await
    }

    async fn get_items(&self, cluster: &str, kind: &str, namespace: &str) -> Result<Vec<Value>, ServiceError> {
        let output = self
            .kubectl(cluster, &["get", kind, "--namespace", namespace, "--output", "json"], None)
            .await?;
        let list: Value = serde_json::from_str(&output)
            .map_err(|e| ServiceError::InvalidResponse(format!("kubectl get {}: {}", kind, e)))?;
        Ok(list["items"].as_array().cloned().unwrap_or_default())
    }
}

#[async_trait]
impl KubernetesService for Kubectl {
    fn list_clusters(&self) -> Vec<ClusterInfo> {
        self.clusters.clone()
    }

    async fn list_pods(&self, cluster: &str, namespace: &str) -> Result<Vec<PodSummary>, ServiceError> {
        let items = self.get_items(cluster, "pods", namespace).await?;
        Ok(items.iter().map(parse_pod).collect())
    }

    async fn list_deployments(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<DeploymentSummary>, ServiceError> {
        let items = self.get_items(cluster, "deployments", namespace).await?;
        Ok(items.iter().map(parse_deployment).collect())
    }

    async fn list_services(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<ServiceSummary>, ServiceError> {
        let items = self.get_items(cluster, "services", namespace).await?;
        Ok(items.iter().map(parse_service).collect())
    }

    async fn scale_deployment(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> Result<(), ServiceError> {
        let target = format!("deployment/{}", name);
        let replicas = format!("--replicas={}", replicas);
        self.kubectl(cluster, &["scale", &target, &replicas, "--namespace", namespace], None)
            .await
            .map(|_| ())
    }

    async fn restart_pod(&self, cluster: &str, namespace: &str, name: &str) -> Result<(), ServiceError> {
        self.kubectl(
            cluster,
            &["delete", "pod", name, "--namespace", namespace, "--wait=false"],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn apply_manifest(
        &self,
        cluster: &str,
        namespace: &str,
        document: &str,
    ) -> Result<String, ServiceError> {
        let output = self
            .kubectl(
                cluster,
                &["apply", "--namespace", namespace, "--filename", "-"],
                Some(document),
            )
            .await?;
        Ok(output.trim().to_string())
    }

    async fn cluster_metrics(&self, cluster: &str) -> Result<ClusterMetricsSnapshot, ServiceError> {
        let output = self
            .kubectl(cluster, &["top", "pods", "--all-namespaces", "--no-headers"], None)
            .await?;
        Ok(ClusterMetricsSnapshot {
            cluster: cluster.to_string(),
            timestamp: Utc::now(),
            pods: output.lines().filter_map(parse_top_line).collect(),
        })
    }

    async fn follow_pod_logs(
        &self,
        cluster: &str,
        namespace: &str,
        pod: &str,
        tail: usize,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
        let tail = format!("--tail={}", tail);
        let args = self.args(
            cluster,
            &["logs", "--follow", &tail, "--namespace", namespace, pod],
        )?;
        spawn_lines(&self.binary, &args)
    }
}

fn text(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

fn parse_pod(item: &Value) -> PodSummary {
    let statuses = item["status"]["containerStatuses"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let ready = statuses
        .iter()
        .filter(|s| s["ready"].as_bool().unwrap_or(false))
        .count();
    let restarts = statuses
        .iter()
        .filter_map(|s| s["restartCount"].as_u64())
        .sum();

    PodSummary {
        name: text(&item["metadata"]["name"]),
        namespace: text(&item["metadata"]["namespace"]),
        phase: text(&item["status"]["phase"]),
        ready: format!("{}/{}", ready, statuses.len()),
        restarts,
        node: item["spec"]["nodeName"].as_str().map(str::to_string),
    }
}

fn parse_deployment(item: &Value) -> DeploymentSummary {
    let images = item["spec"]["template"]["spec"]["containers"]
        .as_array()
        .map(|containers| containers.iter().map(|c| text(&c["image"])).collect())
        .unwrap_or_default();

    DeploymentSummary {
        name: text(&item["metadata"]["name"]),
        namespace: text(&item["metadata"]["namespace"]),
        replicas: item["spec"]["replicas"].as_u64().unwrap_or(0),
        ready_replicas: item["status"]["readyReplicas"].as_u64().unwrap_or(0),
        images,
    }
}

fn parse_service(item: &Value) -> ServiceSummary {
    let ports = item["spec"]["ports"]
        .as_array()
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p["port"].as_u64())
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default();

    ServiceSummary {
        name: text(&item["metadata"]["name"]),
        namespace: text(&item["metadata"]["namespace"]),
        service_type: text(&item["spec"]["type"]),
        cluster_ip: item["spec"]["clusterIP"].as_str().map(str::to_string),
        ports,
    }
}

/// `NAMESPACE NAME CPU(cores) MEMORY(bytes)`
fn parse_top_line(line: &str) -> Option<PodMetrics> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [namespace, name, cpu, memory] = fields.as_slice() else {
        return None;
    };
    Some(PodMetrics {
        name: name.to_string(),
        namespace: namespace.to_string(),
        cpu_usage: parse_cpu_quantity(cpu)?,
        memory_usage: parse_memory_quantity(memory)?,
    })
}
