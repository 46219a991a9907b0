//! Settings file management

use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use crate::deploy::policy::SecurityPolicy;
use crate::errors::AppError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::services::kubernetes::ClusterInfo;

/// Control plane settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write rolling log files to this directory
    #[serde(default)]
    pub log_dir: Option<String>,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Deployment history file; defaults to the storage layout's
    #[serde(default)]
    pub database_path: Option<String>,

    /// Docker CLI configuration
    #[serde(default)]
    pub docker: DockerSettings,

    /// kubectl binary
    #[serde(default = "default_kubectl_binary")]
    pub kubectl_binary: String,

    /// Clusters available as deploy targets
    #[serde(default)]
    pub clusters: Vec<ClusterInfo>,

    /// Credentials for pushing images
    #[serde(default)]
    pub registry: Option<RegistrySettings>,

    /// Manifest generator configuration
    #[serde(default)]
    pub ai: AiSettings,

    /// Deployment job configuration
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Live update configuration
    #[serde(default)]
    pub hub: HubSettings,

    /// Metrics sampling configuration
    #[serde(default)]
    pub sampler: SamplerSettings,

    /// Lines of history sent when a log tail starts
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,

    /// Maximum delay for graceful shutdown in seconds
    #[serde(default = "default_max_shutdown_delay")]
    pub max_shutdown_delay_secs: u64,
}

fn default_kubectl_binary() -> String {
    "kubectl".to_string()
}

fn default_max_log_lines() -> usize {
    100
}

fn default_max_shutdown_delay() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            database_path: None,
            docker: DockerSettings::default(),
            kubectl_binary: default_kubectl_binary(),
            clusters: Vec::new(),
            registry: None,
            ai: AiSettings::default(),
            deploy: DeploySettings::default(),
            hub: HubSettings::default(),
            sampler: SamplerSettings::default(),
            max_log_lines: default_max_log_lines(),
            max_shutdown_delay_secs: default_max_shutdown_delay(),
        }
    }
}

impl Settings {
    /// Read the settings file, or fall back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, AppError> {
        if !file.exists().await {
            warn!(
                "Settings file {} not found, using defaults",
                file.path().display()
            );
            return Ok(Self::default());
        }
        file.read_json::<Settings>().await
    }

    /// Apply environment overrides through `var`
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| AppError::ConfigError(format!("invalid PORT: {}", port)))?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level.parse().map_err(AppError::ConfigError)?;
        }
        if let Some(path) = var("DATABASE_PATH") {
            self.database_path = Some(path);
        }
        if let Some(binary) = var("DOCKER_BINARY") {
            self.docker.binary = binary;
        }
        if let Some(key) = var("AI_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.ai.api_key = Some(SecretString::from(key));
        }
        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins; `*` allows any
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Docker CLI settings
#[derive(Debug, Clone, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_docker_binary")]
    pub binary: String,

    /// Daemon address passed as `--host`
    #[serde(default)]
    pub host: Option<String>,
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            host: None,
        }
    }
}

/// Registry credentials
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    pub username: String,
    pub password: SecretString,
}

/// Manifest generator settings
#[derive(Debug, Clone, Deserialize)]
pub struct AiSettings {
    /// Use the chat completions endpoint; otherwise render the built-in template
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ai_base_url")]
    pub base_url: String,

    #[serde(default = "default_ai_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_ai_timeout() -> u64 {
    25
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_ai_base_url(),
            model: default_ai_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_ai_timeout(),
        }
    }
}

/// Deployment job settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeploySettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_similar_limit")]
    pub similar_limit: usize,

    #[serde(default)]
    pub policy: SecurityPolicy,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_job_timeout() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    10
}

fn default_similar_limit() -> usize {
    5
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            job_timeout_secs: default_job_timeout(),
            call_timeout_secs: default_call_timeout(),
            similar_limit: default_similar_limit(),
            policy: SecurityPolicy::default(),
        }
    }
}

/// Live update settings
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Server ping and janitor sweep interval
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Subscribers silent for longer are dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Cap on open WebSocket streams
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_max_connections() -> usize {
    1000
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Metrics sampling settings
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sample_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_sample_timeout")]
    pub call_timeout_ms: u64,
}

fn default_sample_interval() -> u64 {
    2000
}

fn default_sample_timeout() -> u64 {
    1500
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_sample_interval(),
            call_timeout_ms: default_sample_timeout(),
        }
    }
}
