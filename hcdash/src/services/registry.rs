//! Image registry collaborator

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::ServiceError;
use crate::services::process::run_command;

#[async_trait]
pub trait RegistryService: Send + Sync {
    async fn tag_image(&self, source: &str, target: &str) -> Result<(), ServiceError>;

    /// Make `source` available in the registry as `target`
    async fn push_image(&self, source: &str, target: &str) -> Result<(), ServiceError>;
}

/// Registry credentials
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Registry operations through the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    binary: String,
    credentials: Option<RegistryCredentials>,
}

impl DockerRegistry {
    pub fn new(binary: impl Into<String>, credentials: Option<RegistryCredentials>) -> Self {
        Self {
            binary: binary.into(),
            credentials,
        }
    }

    async fn login(&self, image: &str) -> Result<(), ServiceError> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        let Some(host) = registry_host(image) else {
            debug!("{} has no registry host, skipping login", image);
            return Ok(());
        };

        debug!("Logging in to registry {}...", host);
        let args = vec![
            "login".to_string(),
            host,
            "--username".to_string(),
            credentials.username.clone(),
            "--password-stdin".to_string(),
        ];
        run_command(&self.binary, &args, Some(credentials.password.expose_secret()))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RegistryService for DockerRegistry {
    async fn tag_image(&self, source: &str, target: &str) -> Result<(), ServiceError> {
        let args = vec!["tag".to_string(), source.to_string(), target.to_string()];
        run_command(&self.binary, &args, None).await.map(|_| ())
    }

    async fn push_image(&self, source: &str, target: &str) -> Result<(), ServiceError> {
        if source != target {
            self.tag_image(source, target).await?;
        }
        self.login(target).await?;

        info!("Pushing image {}", target);
        let args = vec!["push".to_string(), target.to_string()];
        run_command(&self.binary, &args, None).await.map(|_| ())
    }
}

/// Registry host of an image reference, if it names one
pub fn registry_host(image: &str) -> Option<String> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first.to_string())
    } else {
        None
    }
}

/// Where an image lands when pushed to `registry`
pub fn target_image(registry: Option<&str>, image: &str, tag: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    let tag = if tag.is_empty() { "latest" } else { tag };
    match registry {
        Some(registry) if !registry.is_empty() => {
            format!("{}/{}:{}", registry.trim_end_matches('/'), name, tag)
        }
        _ => format!("{}:{}", image, tag),
    }
}
