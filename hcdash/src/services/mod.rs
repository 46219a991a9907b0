//! External collaborators
//!
//! Each collaborator is a capability trait; the control plane only ever holds
//! `Arc<dyn Trait>` so the CLI/HTTP implementations can be swapped for the
//! in-memory ones in [`fake`].

pub mod ai;
pub mod docker;
pub mod fake;
pub mod kubernetes;
pub mod process;
pub mod registry;
pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ai::AiService;
use docker::DockerService;
use kubernetes::KubernetesService;
use registry::RegistryService;
use store::DeployStore;

use crate::errors::ServiceError;

/// Collaborators shared by the orchestrator, the sampler and the HTTP layer
#[derive(Clone)]
pub struct Services {
    pub docker: Arc<dyn DockerService>,
    pub kubernetes: Arc<dyn KubernetesService>,
    pub ai: Arc<dyn AiService>,
    pub registry: Arc<dyn RegistryService>,
    pub store: Arc<dyn DeployStore>,
}

/// Fakes plus a [`Services`] view over them, for tests and dry runs
pub struct FakeServices {
    pub docker: Arc<fake::FakeDocker>,
    pub kubernetes: Arc<fake::FakeKubernetes>,
    pub ai: Arc<fake::FakeAi>,
    pub registry: Arc<fake::FakeRegistry>,
    pub store: Arc<fake::MemoryStore>,
}

impl FakeServices {
    pub fn new(clusters: &[&str]) -> Self {
        Self {
            docker: Arc::new(fake::FakeDocker::default()),
            kubernetes: Arc::new(fake::FakeKubernetes::new(clusters)),
            ai: Arc::new(fake::FakeAi::default()),
            registry: Arc::new(fake::FakeRegistry::default()),
            store: Arc::new(fake::MemoryStore::default()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            docker: self.docker.clone(),
            kubernetes: self.kubernetes.clone(),
            ai: self.ai.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
        }
    }
}

/// Bound a collaborator call; running out of time is a [`ServiceError::Timeout`]
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(limit)),
    }
}
