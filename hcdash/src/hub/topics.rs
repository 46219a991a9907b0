//! Hub topic definitions

use std::fmt;

/// Topic name patterns
pub struct Topics;

impl Topics {
    /// Container stats topic
    pub const DOCKER_STATS: &'static str = "docker-stats";

    /// Deploy progress topic for one job
    pub fn deploy(job_id: &str) -> String {
        format!("deploy:{}", job_id)
    }

    /// Cluster metrics topic
    pub fn k8s_metrics(cluster: &str) -> String {
        format!("k8s-metrics:{}", cluster)
    }

    /// Log tail topic
    pub fn logs(source: &LogSource) -> String {
        format!("logs:{}", source)
    }

    /// Parse a topic to extract the job ID
    pub fn parse_job_id(topic: &str) -> Option<&str> {
        topic.strip_prefix("deploy:").filter(|id| !id.is_empty())
    }

    /// Parse a topic to extract the cluster name
    pub fn parse_cluster(topic: &str) -> Option<&str> {
        topic.strip_prefix("k8s-metrics:").filter(|c| !c.is_empty())
    }

    /// Parse a log topic to extract its source
    pub fn parse_log_source(topic: &str) -> Option<LogSource> {
        topic.strip_prefix("logs:").and_then(LogSource::parse)
    }

    /// Check if topic is a log topic
    pub fn is_log_topic(topic: &str) -> bool {
        topic.starts_with("logs:")
    }
}

/// Where a log stream comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogSource {
    Container {
        container: String,
    },
    Pod {
        cluster: String,
        namespace: String,
        pod: String,
    },
}

impl LogSource {
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["docker", container] if !container.is_empty() => Some(LogSource::Container {
                container: container.to_string(),
            }),
            ["k8s", cluster, namespace, pod]
                if !cluster.is_empty() && !namespace.is_empty() && !pod.is_empty() =>
            {
                Some(LogSource::Pod {
                    cluster: cluster.to_string(),
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Container { container } => write!(f, "docker:{}", container),
            LogSource::Pod {
                cluster,
                namespace,
                pod,
            } => write!(f, "k8s:{}:{}:{}", cluster, namespace, pod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_generation() {
        assert_eq!(Topics::deploy("abc"), "deploy:abc");
        assert_eq!(Topics::k8s_metrics("prod"), "k8s-metrics:prod");
        assert_eq!(
            Topics::logs(&LogSource::Pod {
                cluster: "prod".to_string(),
                namespace: "web".to_string(),
                pod: "api-0".to_string(),
            }),
            "logs:k8s:prod:web:api-0"
        );
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!(Topics::parse_job_id("deploy:abc"), Some("abc"));
        assert_eq!(Topics::parse_job_id("deploy:"), None);
        assert_eq!(Topics::parse_cluster("k8s-metrics:prod"), Some("prod"));
        assert_eq!(
            Topics::parse_log_source("logs:docker:web"),
            Some(LogSource::Container {
                container: "web".to_string()
            })
        );
        assert_eq!(Topics::parse_log_source("logs:k8s:prod"), None);
        assert!(Topics::is_log_topic("logs:docker:web"));
        assert!(!Topics::is_log_topic(Topics::DOCKER_STATS));
    }
}
