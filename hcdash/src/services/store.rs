//! Deployment history store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::deploy::fsm::Stage;
use crate::deploy::job::{DeployStep, DeployTarget, JobId, JobResult, JobSnapshot, Manifest};
use crate::errors::{AppError, JobError, ServiceError};
use crate::filesys::file::File;
use crate::services::docker::{split_image_ref, ContainerInfo};

/// Persisted outcome of one deployment job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: JobId,
    pub container: String,
    pub cluster: String,
    pub namespace: String,
    /// Source image reference
    #[serde(default)]
    pub image: String,
    pub service_name: String,
    pub stage: Stage,
    pub result: JobResult,
    pub ai_generated: bool,
    pub steps: Vec<DeployStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Build from a terminal snapshot
    pub fn from_snapshot(snapshot: &JobSnapshot) -> Option<Self> {
        let result = JobResult::from_stage(snapshot.stage)?;
        Some(Self {
            id: snapshot.deploy_id.clone(),
            container: snapshot.target.container.clone(),
            cluster: snapshot.target.cluster.clone(),
            namespace: snapshot.target.namespace.clone(),
            image: snapshot.image.clone().unwrap_or_default(),
            service_name: crate::utils::dns_label(&snapshot.target.container),
            stage: snapshot.stage,
            result,
            ai_generated: snapshot.manifest.is_some(),
            steps: snapshot.steps.clone(),
            error: snapshot.error.clone(),
            manifest: snapshot.manifest.clone(),
            created_at: snapshot.created_at,
            finished_at: snapshot.updated_at,
        })
    }

    pub fn success(&self) -> bool {
        self.result == JobResult::Success
    }

    pub fn to_snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            deploy_id: self.id.clone(),
            target: DeployTarget::new(&self.container, &self.cluster, &self.namespace),
            stage: self.stage,
            revision: 0,
            steps: self.steps.clone(),
            result: Some(self.result),
            error: self.error.clone(),
            image: Some(self.image.clone()).filter(|i| !i.is_empty()),
            manifest: self.manifest.clone(),
            similar_deployments: 0,
            created_at: self.created_at,
            updated_at: self.finished_at,
        }
    }

    /// How close this record is to `info`; zero means unrelated
    fn similarity(&self, info: &ContainerInfo) -> u8 {
        let (repo, _) = split_image_ref(&self.image);
        let mut score = 0;
        if !info.image.is_empty() && repo == info.image {
            score += 2;
        }
        if self.container == info.name {
            score += 1;
        }
        score
    }
}

#[async_trait]
pub trait DeployStore: Send + Sync {
    async fn record_deployment(&self, record: &DeploymentRecord) -> Result<(), ServiceError>;

    /// Newest first
    async fn get_deploy_history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, ServiceError>;

    /// Past deployments of the same image or container, best match first
    async fn find_similar(
        &self,
        info: &ContainerInfo,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, ServiceError>;

    async fn get_deployment(&self, id: &JobId) -> Result<Option<DeploymentRecord>, ServiceError>;
}

/// Rank records for `find_similar`
pub fn rank_similar(
    records: &[DeploymentRecord],
    info: &ContainerInfo,
    limit: usize,
) -> Vec<DeploymentRecord> {
    let mut scored: Vec<(u8, &DeploymentRecord)> = records
        .iter()
        .map(|r| (r.similarity(info), r))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|(sa, a), (sb, b)| {
        sb.cmp(sa)
            .then(b.success().cmp(&a.success()))
            .then(b.finished_at.cmp(&a.finished_at))
    });
    scored.into_iter().take(limit).map(|(_, r)| r.clone()).collect()
}

/// History kept as a JSON-lines file, mirrored in memory
pub struct JsonLinesStore {
    file: File,
    records: Mutex<Vec<DeploymentRecord>>,
}

impl JsonLinesStore {
    pub async fn open(file: File) -> Result<Self, AppError> {
        let records: Vec<DeploymentRecord> = file.read_json_lines().await?;
        info!(
            "Loaded {} deployment records from {}",
            records.len(),
            file.path().display()
        );
        Ok(Self {
            file,
            records: Mutex::new(records),
        })
    }
}

fn storage_error(err: AppError) -> ServiceError {
    ServiceError::Rejected(format!("history store: {}", err))
}

#[async_trait]
impl DeployStore for JsonLinesStore {
    async fn record_deployment(&self, record: &DeploymentRecord) -> Result<(), ServiceError> {
        let mut records = self.records.lock().await;
        self.file
            .append_json_line(record)
            .await
            .map_err(storage_error)?;
        records.retain(|r| r.id != record.id);
        records.push(record.clone());
        debug!("Recorded deployment {}", record.id);
        Ok(())
    }

    async fn get_deploy_history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, ServiceError> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn find_similar(
        &self,
        info: &ContainerInfo,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, ServiceError> {
        let records = self.records.lock().await;
        Ok(rank_similar(&records, info, limit))
    }

    async fn get_deployment(&self, id: &JobId) -> Result<Option<DeploymentRecord>, ServiceError> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().find(|r| &r.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::job::StepName;

    fn record(id: &str, container: &str, image: &str, result: JobResult) -> DeploymentRecord {
        let stage = match result {
            JobResult::Success => Stage::Succeeded,
            JobResult::Failure => Stage::Failed,
            JobResult::Cancelled => Stage::Cancelled,
        };
        DeploymentRecord {
            id: JobId::from(id),
            container: container.to_string(),
            cluster: "prod".to_string(),
            namespace: "default".to_string(),
            image: image.to_string(),
            service_name: container.to_string(),
            stage,
            result,
            ai_generated: true,
            steps: StepName::ORDER.iter().copied().map(DeployStep::pending).collect(),
            error: None,
            manifest: None,
            created_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn info(name: &str, image: &str) -> ContainerInfo {
        ContainerInfo {
            id: "abc".to_string(),
            name: name.to_string(),
            image: image.to_string(),
            tag: "latest".to_string(),
            env: vec![],
            ports: vec![],
            volumes: vec![],
            command: vec![],
            working_dir: String::new(),
            network_mode: String::new(),
            labels: Default::default(),
            privileged: false,
        }
    }

    #[test]
    fn test_rank_similar_prefers_image_then_success() {
        let records = vec![
            record("1", "other", "nginx:1.0", JobResult::Failure),
            record("2", "web", "redis:7", JobResult::Success),
            record("3", "other", "nginx:1.1", JobResult::Success),
            record("4", "db", "postgres:16", JobResult::Success),
        ];
        let ranked = rank_similar(&records, &info("web", "nginx"), 10);
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);

        assert_eq!(rank_similar(&records, &info("web", "nginx"), 1).len(), 1);
    }

    #[tokio::test]
    async fn test_json_lines_store_persists() {
        let path = std::env::temp_dir()
            .join(format!("hcdash-store-{}", uuid::Uuid::new_v4()))
            .join("deployments.jsonl");

        let store = JsonLinesStore::open(File::new(&path)).await.unwrap();
        store
            .record_deployment(&record("a", "web", "nginx:1", JobResult::Success))
            .await
            .unwrap();
        store
            .record_deployment(&record("b", "web", "nginx:2", JobResult::Failure))
            .await
            .unwrap();

        let reopened = JsonLinesStore::open(File::new(&path)).await.unwrap();
        let history = reopened.get_deploy_history(50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id.as_str(), "b");
        assert!(reopened
            .get_deployment(&JobId::from("a"))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_record_snapshot_roundtrip_keeps_result() {
        let rec = record("x", "web", "nginx:1", JobResult::Cancelled);
        let snapshot = rec.to_snapshot();
        assert_eq!(snapshot.stage, Stage::Cancelled);
        assert_eq!(DeploymentRecord::from_snapshot(&snapshot).unwrap().result, JobResult::Cancelled);
    }
}
