//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::admission::AdmissionOptions;
use crate::deploy::orchestrator::OrchestratorOptions;
use crate::hub::HubOptions;
use crate::services::ai::ChatOptions;
use crate::services::kubernetes::ClusterInfo;
use crate::services::registry::RegistryCredentials;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::{janitor, log_tail, sampler};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// HTTP server configuration
    pub server: ServerOptions,

    /// External collaborators
    pub collaborators: CollaboratorOptions,

    /// Broadcast hub
    pub hub: HubOptions,

    /// Deployment jobs
    pub orchestrator: OrchestratorOptions,

    /// Enable the metrics sampler
    pub enable_sampler: bool,

    /// Sampler worker options
    pub sampler: sampler::Options,

    /// Janitor worker options
    pub janitor: janitor::Options,

    /// Log tail options
    pub log_tail: log_tail::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions::default(),
            collaborators: CollaboratorOptions::default(),
            hub: HubOptions::default(),
            orchestrator: OrchestratorOptions::default(),
            enable_sampler: true,
            sampler: sampler::Options::default(),
            janitor: janitor::Options::default(),
            log_tail: log_tail::Options::default(),
        }
    }
}

impl AppOptions {
    /// Runtime options for the given settings; paths not set there live under `layout`
    pub fn from_settings(settings: &Settings, layout: &StorageLayout) -> Self {
        let ai = if settings.ai.enabled && settings.ai.api_key.is_some() {
            Some(ChatOptions {
                base_url: settings.ai.base_url.clone(),
                model: settings.ai.model.clone(),
                api_key: settings.ai.api_key.clone(),
                temperature: settings.ai.temperature,
                max_tokens: settings.ai.max_tokens,
                request_timeout: Duration::from_secs(settings.ai.timeout_secs),
            })
        } else {
            None
        };

        let history_path = match &settings.database_path {
            Some(path) => PathBuf::from(path),
            None => layout.history_file().path().to_path_buf(),
        };

        let idle_timeout = Duration::from_secs(settings.hub.idle_timeout_secs);

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.max_shutdown_delay_secs),
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                cors_origins: settings.server.cors_origins.clone(),
                ping_interval: Duration::from_secs(settings.hub.ping_interval_secs),
                max_connections: settings.hub.max_connections,
            },
            collaborators: CollaboratorOptions {
                docker_binary: settings.docker.binary.clone(),
                docker_host: settings.docker.host.clone(),
                kubectl_binary: settings.kubectl_binary.clone(),
                clusters: settings.clusters.clone(),
                registry: settings.registry.as_ref().map(|r| RegistryCredentials {
                    username: r.username.clone(),
                    password: r.password.clone(),
                }),
                ai,
                history_path,
            },
            hub: HubOptions {
                queue_capacity: settings.hub.queue_capacity,
            },
            orchestrator: OrchestratorOptions {
                job_timeout: Duration::from_secs(settings.deploy.job_timeout_secs),
                call_timeout: Duration::from_secs(settings.deploy.call_timeout_secs),
                similar_limit: settings.deploy.similar_limit,
                admission: AdmissionOptions {
                    max_active: settings.deploy.max_concurrent,
                },
                policy: settings.deploy.policy.clone(),
                ..Default::default()
            },
            enable_sampler: settings.sampler.enabled,
            sampler: sampler::Options {
                interval: Duration::from_millis(settings.sampler.interval_ms),
                call_timeout: Duration::from_millis(settings.sampler.call_timeout_ms),
                ..Default::default()
            },
            janitor: janitor::Options {
                interval: (idle_timeout / 3).max(Duration::from_secs(1)),
                idle_timeout,
            },
            log_tail: log_tail::Options {
                tail: settings.max_log_lines,
                ..Default::default()
            },
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,

    /// Interval between server pings on live streams
    pub ping_interval: Duration,

    /// Live streams open at once
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
            ping_interval: Duration::from_secs(30),
            max_connections: 1000,
        }
    }
}

/// How to reach the external collaborators
#[derive(Debug, Clone)]
pub struct CollaboratorOptions {
    pub docker_binary: String,

    /// Docker daemon address
    pub docker_host: Option<String>,

    pub kubectl_binary: String,

    pub clusters: Vec<ClusterInfo>,

    pub registry: Option<RegistryCredentials>,

    /// Chat completions endpoint; the built-in template is used when unset
    pub ai: Option<ChatOptions>,

    /// Deployment history file
    pub history_path: PathBuf,
}

impl Default for CollaboratorOptions {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            docker_host: None,
            kubectl_binary: "kubectl".to_string(),
            clusters: Vec::new(),
            registry: None,
            ai: None,
            history_path: StorageLayout::default().history_file().path().to_path_buf(),
        }
    }
}
