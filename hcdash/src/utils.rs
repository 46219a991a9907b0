//! Utility functions

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::services::process::run_command;

/// Version information for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("HCDASH_GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("HCDASH_BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Turn a container name into a valid Kubernetes object name (RFC 1123 label)
pub fn dns_label(name: &str) -> String {
    let mut label = String::with_capacity(name.len());
    for c in name.trim_start_matches('/').chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            label.push(c);
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }
    let label: String = label.trim_matches('-').chars().take(63).collect();
    let label = label.trim_end_matches('-').to_string();
    if label.is_empty() {
        "app".to_string()
    } else {
        label
    }
}

/// Check that the CLI collaborators respond, printing one line per check
pub async fn run_diagnostic(docker_binary: &str, kubectl_binary: &str) -> bool {
    let version = version_info();
    println!("{} {}", "hcdash".bold(), version.version);

    let checks = [
        (
            "docker",
            docker_binary,
            vec!["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()],
        ),
        (
            "kubectl",
            kubectl_binary,
            vec!["version".to_string(), "--client".to_string(), "-o".to_string(), "json".to_string()],
        ),
    ];

    let mut healthy = true;
    for (name, binary, args) in checks {
        match run_command(binary, &args, None).await {
            Ok(_) => println!("  {} {} ({})", "ok".green(), name, binary),
            Err(e) => {
                healthy = false;
                println!("  {} {} ({}): {}", "failed".red(), name, binary, e);
            }
        }
    }
    healthy
}
