//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::{AppOptions, CollaboratorOptions};
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::AppError;
use crate::events::EventHub;
use crate::filesys::file::File;
use crate::services::ai::{AiService, ChatGenerator, ChatOptions, TemplateGenerator};
use crate::services::docker::DockerCli;
use crate::services::kubernetes::Kubectl;
use crate::services::registry::DockerRegistry;
use crate::services::store::JsonLinesStore;
use crate::services::Services;

/// Main application state
pub struct AppState {
    /// Application version
    pub version: String,

    /// External collaborators
    pub services: Services,

    /// Live update hub
    pub hub: EventHub,

    /// Deployment jobs
    pub orchestrator: Arc<Orchestrator>,

    /// Manifest generator in use, when it is an endpoint
    pub ai: Option<ChatOptions>,
}

impl AppState {
    /// Build the state with the CLI and HTTP collaborators
    pub async fn init(version: String, options: &AppOptions) -> Result<Self, AppError> {
        info!("Initializing application state...");
        let services = init_services(&options.collaborators).await?;
        Ok(Self::with_services(
            version,
            services,
            options.collaborators.ai.clone(),
            options,
        ))
    }

    /// Build the state around already constructed collaborators
    pub fn with_services(
        version: String,
        services: Services,
        ai: Option<ChatOptions>,
        options: &AppOptions,
    ) -> Self {
        let hub = EventHub::new(options.hub.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            services.clone(),
            hub.clone(),
            options.orchestrator.clone(),
        ));
        Self {
            version,
            services,
            hub,
            orchestrator,
            ai,
        }
    }
}

async fn init_services(options: &CollaboratorOptions) -> Result<Services, AppError> {
    let ai: Arc<dyn AiService> = match &options.ai {
        Some(chat) => {
            info!("Generating manifests with {} at {}", chat.model, chat.base_url);
            Arc::new(ChatGenerator::new(chat.clone())?)
        }
        None => {
            info!("No AI endpoint configured, generating manifests from the built-in template");
            Arc::new(TemplateGenerator)
        }
    };

    let store = JsonLinesStore::open(File::new(&options.history_path)).await?;

    info!("Configured clusters: {}", options.clusters.len());
    Ok(Services {
        docker: Arc::new(DockerCli::new(
            options.docker_binary.clone(),
            options.docker_host.clone(),
        )),
        kubernetes: Arc::new(Kubectl::new(
            options.kubectl_binary.clone(),
            options.clusters.clone(),
        )),
        ai,
        registry: Arc::new(DockerRegistry::new(
            options.docker_binary.clone(),
            options.registry.clone(),
        )),
        store: Arc::new(store),
    })
}
