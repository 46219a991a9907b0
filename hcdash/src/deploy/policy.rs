//! Manifest validation and security policy

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::deploy::job::Manifest;

/// Pod capabilities a policy can deny
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    /// `securityContext.privileged: true`
    Privileged,
    /// `hostPath` volumes
    HostPath,
    /// `hostNetwork: true`
    HostNetwork,
    /// `hostPID: true`
    HostPid,
    /// `hostIPC: true`
    HostIpc,
    /// `securityContext.allowPrivilegeEscalation: true`
    PrivilegeEscalation,
}

/// Rules enforced on every generated manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default = "default_denied")]
    pub denied: Vec<PolicyRule>,
}

fn default_denied() -> Vec<PolicyRule> {
    vec![
        PolicyRule::Privileged,
        PolicyRule::HostPath,
        PolicyRule::HostNetwork,
    ]
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            denied: default_denied(),
        }
    }
}

impl SecurityPolicy {
    /// Policy that denies nothing
    pub fn permissive() -> Self {
        Self { denied: Vec::new() }
    }

    pub fn denies(&self, rule: PolicyRule) -> bool {
        self.denied.contains(&rule)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("container {0} runs privileged")]
    Privileged(String),

    #[error("volume {0} mounts a host path")]
    HostPath(String),

    #[error("pod uses the host network")]
    HostNetwork,

    #[error("pod shares the host PID namespace")]
    HostPid,

    #[error("pod shares the host IPC namespace")]
    HostIpc,

    #[error("container {0} allows privilege escalation")]
    PrivilegeEscalation(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("{document} document is not valid YAML: {message}")]
    Malformed { document: &'static str, message: String },

    #[error("expected a {expected} document, found {found}")]
    WrongKind { expected: &'static str, found: String },

    #[error("{0} document has no metadata.name")]
    MissingName(&'static str),

    #[error("security policy violated: {}", join_violations(.0))]
    Policy(Vec<PolicyViolation>),
}

fn join_violations(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ManifestError {
    pub fn is_policy(&self) -> bool {
        matches!(self, ManifestError::Policy(_))
    }
}

fn parse_document(
    document: &'static str,
    expected: &'static str,
    text: &str,
) -> Result<Value, ManifestError> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| ManifestError::Malformed {
        document,
        message: e.to_string(),
    })?;
    let kind = value["kind"].as_str().unwrap_or_default();
    if kind != expected {
        return Err(ManifestError::WrongKind {
            expected,
            found: if kind.is_empty() { "nothing".to_string() } else { kind.to_string() },
        });
    }
    let has_name = value["metadata"]["name"]
        .as_str()
        .map(|n| !n.trim().is_empty())
        .unwrap_or(false);
    if !has_name {
        return Err(ManifestError::MissingName(document));
    }
    Ok(value)
}

/// Check the documents are well formed and allowed by `policy`
pub fn validate_manifest(manifest: &Manifest, policy: &SecurityPolicy) -> Result<(), ManifestError> {
    let deployment = parse_document("deployment", "Deployment", &manifest.deployment)?;
    parse_document("service", "Service", &manifest.service)?;

    let violations = check_pod_spec(&deployment["spec"]["template"]["spec"], policy);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ManifestError::Policy(violations))
    }
}

/// Every denied capability the pod spec asks for
pub fn check_pod_spec(pod: &Value, policy: &SecurityPolicy) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();
    let flag = |key: &str| pod[key].as_bool().unwrap_or(false);

    if policy.denies(PolicyRule::HostNetwork) && flag("hostNetwork") {
        violations.push(PolicyViolation::HostNetwork);
    }
    if policy.denies(PolicyRule::HostPid) && flag("hostPID") {
        violations.push(PolicyViolation::HostPid);
    }
    if policy.denies(PolicyRule::HostIpc) && flag("hostIPC") {
        violations.push(PolicyViolation::HostIpc);
    }

    if policy.denies(PolicyRule::HostPath) {
        for volume in pod["volumes"].as_array().into_iter().flatten() {
            if !volume["hostPath"].is_null() {
                let name = volume["name"].as_str().unwrap_or("<unnamed>");
                violations.push(PolicyViolation::HostPath(name.to_string()));
            }
        }
    }

    let containers = ["initContainers", "containers"]
        .iter()
        .flat_map(|key| pod[*key].as_array().into_iter().flatten());
    for container in containers {
        let name = container["name"].as_str().unwrap_or("<unnamed>").to_string();
        let security = &container["securityContext"];
        if policy.denies(PolicyRule::Privileged) && security["privileged"].as_bool() == Some(true) {
            violations.push(PolicyViolation::Privileged(name.clone()));
        }
        if policy.denies(PolicyRule::PrivilegeEscalation)
            && security["allowPrivilegeEscalation"].as_bool() == Some(true)
        {
            violations.push(PolicyViolation::PrivilegeEscalation(name));
        }
    }

    violations
}
