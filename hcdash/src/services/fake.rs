//! In-memory collaborators with latency and failure injection

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};

use crate::deploy::job::{JobId, Manifest};
use crate::errors::ServiceError;
use crate::services::ai::{AiService, ManifestRequest, TemplateGenerator};
use crate::services::docker::{ContainerInfo, ContainerSummary, DockerService};
use crate::services::kubernetes::{
    ClusterInfo, DeploymentSummary, KubernetesService, PodSummary, ServiceSummary,
};
use crate::services::registry::RegistryService;
use crate::services::store::{rank_similar, DeployStore, DeploymentRecord};
use crate::telemetry::{ClusterMetricsSnapshot, ContainerStats, DockerStatsSnapshot, PodMetrics};

/// What an operation does before answering
#[derive(Debug, Clone, Default)]
pub struct Fault {
    pub latency: Duration,
    pub error: Option<ServiceError>,
}

impl Fault {
    pub fn delay(latency: Duration) -> Self {
        Self {
            latency,
            error: None,
        }
    }

    pub fn fail(error: ServiceError) -> Self {
        Self {
            latency: Duration::ZERO,
            error: Some(error),
        }
    }
}

/// Per-operation faults and the log of calls made
#[derive(Debug, Default)]
pub struct Faults {
    faults: Mutex<HashMap<String, Fault>>,
    calls: Mutex<Vec<String>>,
}

impl Faults {
    pub fn set(&self, op: &str, fault: Fault) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(op.to_string(), fault);
    }

    pub fn clear(&self, op: &str) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.remove(op);
    }

    /// Operations called so far, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == op).count()
    }

    async fn apply(&self, op: &str) -> Result<(), ServiceError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op.to_string());
        let fault = {
            let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            faults.get(op).cloned().unwrap_or_default()
        };
        if !fault.latency.is_zero() {
            tokio::time::sleep(fault.latency).await;
        }
        match fault.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Build a plain container description
pub fn container(name: &str, image: &str, tag: &str) -> ContainerInfo {
    ContainerInfo {
        id: format!("{}-id", name),
        name: name.to_string(),
        image: image.to_string(),
        tag: tag.to_string(),
        env: Vec::new(),
        ports: Vec::new(),
        volumes: Vec::new(),
        command: Vec::new(),
        working_dir: String::new(),
        network_mode: "bridge".to_string(),
        labels: Default::default(),
        privileged: false,
    }
}

#[derive(Debug, Default)]
pub struct FakeDocker {
    pub faults: Faults,
    containers: Mutex<HashMap<String, ContainerInfo>>,
    log_lines: Mutex<Vec<String>>,
}

impl FakeDocker {
    pub fn with_container(self, info: ContainerInfo) -> Self {
        self.insert(info);
        self
    }

    pub fn insert(&self, info: ContainerInfo) {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.insert(info.name.clone(), info);
    }

    pub fn set_log_lines(&self, lines: Vec<String>) {
        *self.log_lines.lock().unwrap_or_else(|e| e.into_inner()) = lines;
    }

    fn find(&self, id: &str) -> Result<ContainerInfo, ServiceError> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers
            .values()
            .find(|c| c.name == id || c.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("No such container: {}", id)))
    }
}

#[async_trait]
impl DockerService for FakeDocker {
    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, ServiceError> {
        self.faults.apply("list_containers").await?;
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ContainerSummary> = containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image_ref(),
                state: "running".to_string(),
                status: "Up".to_string(),
                ports: String::new(),
                created: String::new(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, ServiceError> {
        self.faults.apply("get_container").await?;
        self.find(id)
    }

    async fn restart_container(&self, id: &str) -> Result<(), ServiceError> {
        self.faults.apply("restart_container").await?;
        self.find(id).map(|_| ())
    }

    async fn stop_container(&self, id: &str) -> Result<(), ServiceError> {
        self.faults.apply("stop_container").await?;
        self.find(id).map(|_| ())
    }

    async fn delete_container(&self, id: &str, _force: bool) -> Result<(), ServiceError> {
        self.faults.apply("delete_container").await?;
        let info = self.find(id)?;
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.remove(&info.name);
        Ok(())
    }

    async fn container_stats(&self) -> Result<DockerStatsSnapshot, ServiceError> {
        self.faults.apply("container_stats").await?;
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(DockerStatsSnapshot {
            timestamp: Utc::now(),
            containers: containers
                .values()
                .map(|c| ContainerStats {
                    container_id: c.id.clone(),
                    name: c.name.clone(),
                    cpu_percent: 1.0,
                    memory_usage: 64 << 20,
                    memory_limit: 1 << 30,
                    memory_percent: 6.25,
                    network_rx: 0,
                    network_tx: 0,
                })
                .collect(),
        })
    }

    async fn follow_logs(
        &self,
        id: &str,
        tail: usize,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
        self.faults.apply("follow_logs").await?;
        self.find(id)?;
        let lines = self.log_lines.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let skip = lines.len().saturating_sub(tail);
        Ok(stream::iter(lines.into_iter().skip(skip).map(Ok)).boxed())
    }
}

/// Manifest applied through the fake cluster
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedManifest {
    pub cluster: String,
    pub namespace: String,
    pub document: String,
}

#[derive(Debug, Default)]
pub struct FakeKubernetes {
    pub faults: Faults,
    clusters: Vec<ClusterInfo>,
    applied: Mutex<Vec<AppliedManifest>>,
}

impl FakeKubernetes {
    pub fn new(clusters: &[&str]) -> Self {
        Self {
            faults: Faults::default(),
            clusters: clusters
                .iter()
                .map(|name| ClusterInfo {
                    name: name.to_string(),
                    context: None,
                    kubeconfig: None,
                    registry: None,
                })
                .collect(),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn applied(&self) -> Vec<AppliedManifest> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_cluster(&self, cluster: &str) -> Result<(), ServiceError> {
        if self.clusters.iter().any(|c| c.name == cluster) {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("cluster {} is not configured", cluster)))
        }
    }
}

#[async_trait]
impl KubernetesService for FakeKubernetes {
    fn list_clusters(&self) -> Vec<ClusterInfo> {
        self.clusters.clone()
    }

    async fn list_pods(&self, cluster: &str, namespace: &str) -> Result<Vec<PodSummary>, ServiceError> {
        self.faults.apply("list_pods").await?;
        self.check_cluster(cluster)?;
        Ok(vec![PodSummary {
            name: "app-0".to_string(),
            namespace: namespace.to_string(),
            phase: "Running".to_string(),
            ready: "1/1".to_string(),
            restarts: 0,
            node: None,
        }])
    }

    async fn list_deployments(
        &self,
        cluster: &str,
        _namespace: &str,
    ) -> Result<Vec<DeploymentSummary>, ServiceError> {
        self.faults.apply("list_deployments").await?;
        self.check_cluster(cluster)?;
        Ok(Vec::new())
    }

    async fn list_services(
        &self,
        cluster: &str,
        _namespace: &str,
    ) -> Result<Vec<ServiceSummary>, ServiceError> {
        self.faults.apply("list_services").await?;
        self.check_cluster(cluster)?;
        Ok(Vec::new())
    }

    async fn scale_deployment(
        &self,
        cluster: &str,
        _namespace: &str,
        _name: &str,
        _replicas: u32,
    ) -> Result<(), ServiceError> {
        self.faults.apply("scale_deployment").await?;
        self.check_cluster(cluster)
    }

    async fn restart_pod(&self, cluster: &str, _namespace: &str, _name: &str) -> Result<(), ServiceError> {
        self.faults.apply("restart_pod").await?;
        self.check_cluster(cluster)
    }

    async fn apply_manifest(
        &self,
        cluster: &str,
        namespace: &str,
        document: &str,
    ) -> Result<String, ServiceError> {
        self.faults.apply("apply_manifest").await?;
        self.check_cluster(cluster)?;
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.push(AppliedManifest {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            document: document.to_string(),
        });
        Ok("configured".to_string())
    }

    async fn cluster_metrics(&self, cluster: &str) -> Result<ClusterMetricsSnapshot, ServiceError> {
        self.faults.apply(&format!("cluster_metrics:{}", cluster)).await?;
        self.check_cluster(cluster)?;
        Ok(ClusterMetricsSnapshot {
            cluster: cluster.to_string(),
            timestamp: Utc::now(),
            pods: vec![PodMetrics {
                name: "app-0".to_string(),
                namespace: "default".to_string(),
                cpu_usage: 100,
                memory_usage: 32 << 20,
            }],
        })
    }

    async fn follow_pod_logs(
        &self,
        cluster: &str,
        _namespace: &str,
        pod: &str,
        _tail: usize,
    ) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
        self.faults.apply("follow_pod_logs").await?;
        self.check_cluster(cluster)?;
        let line = format!("{} started", pod);
        Ok(stream::iter(vec![Ok(line)]).boxed())
    }
}

/// Renders from the template unless told otherwise
#[derive(Debug, Default)]
pub struct FakeAi {
    pub faults: Faults,
    manifest: Mutex<Option<Manifest>>,
    requests: Mutex<Vec<ManifestRequest>>,
}

impl FakeAi {
    /// Always answer with this manifest
    pub fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.lock().unwrap_or_else(|e| e.into_inner()) = Some(manifest);
    }

    pub fn requests(&self) -> Vec<ManifestRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AiService for FakeAi {
    async fn generate_manifest(&self, request: &ManifestRequest) -> Result<Manifest, ServiceError> {
        self.faults.apply("generate_manifest").await?;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let fixed = self.manifest.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match fixed {
            Some(manifest) => Ok(manifest),
            None => TemplateGenerator::render(request),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeRegistry {
    pub faults: Faults,
    pushed: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RegistryService for FakeRegistry {
    async fn tag_image(&self, _source: &str, _target: &str) -> Result<(), ServiceError> {
        self.faults.apply("tag_image").await
    }

    async fn push_image(&self, _source: &str, target: &str) -> Result<(), ServiceError> {
        self.faults.apply("push_image").await?;
        self.pushed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(target.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub faults: Faults,
    records: Mutex<Vec<DeploymentRecord>>,
}

impl MemoryStore {
    pub fn records(&self) -> Vec<DeploymentRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn insert(&self, record: DeploymentRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

#[async_trait]
impl DeployStore for MemoryStore {
    async fn record_deployment(&self, record: &DeploymentRecord) -> Result<(), ServiceError> {
        self.faults.apply("record_deployment").await?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.retain(|r| r.id != record.id);
        records.push(record.clone());
        Ok(())
    }

    async fn get_deploy_history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, ServiceError> {
        self.faults.apply("get_deploy_history").await?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn find_similar(
        &self,
        info: &ContainerInfo,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, ServiceError> {
        self.faults.apply("find_similar").await?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rank_similar(&records, info, limit))
    }

    async fn get_deployment(&self, id: &JobId) -> Result<Option<DeploymentRecord>, ServiceError> {
        self.faults.apply("get_deployment").await?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.iter().find(|r| &r.id == id).cloned())
    }
}
