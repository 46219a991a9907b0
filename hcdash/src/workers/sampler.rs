//! Metrics sampler worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::events::{Event, EventHub};
use crate::hub::topics::Topics;
use crate::services::{with_timeout, Services};

/// Sampler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sampling interval
    pub interval: Duration,

    /// Limit for each source within a tick
    pub call_timeout: Duration,

    /// How long an in-flight tick may run once shutdown is signalled
    pub shutdown_grace: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            call_timeout: Duration::from_millis(1500),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Run the sampler worker
pub async fn run<S, F>(
    options: &Options,
    services: &Services,
    hub: &EventHub,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Metrics sampler starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Metrics sampler shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with tick
            }
        }

        let tick = sample_once(options, services, hub);
        tokio::pin!(tick);

        tokio::select! {
            published = &mut tick => {
                debug!("Sampler tick published {} snapshots", published);
            }
            _ = &mut shutdown_signal => {
                if tokio::time::timeout(options.shutdown_grace, &mut tick).await.is_err() {
                    warn!(
                        "Abandoning sampler tick still running after {:?}",
                        options.shutdown_grace
                    );
                }
                info!("Metrics sampler shutting down...");
                return;
            }
        }
    }
}

/// Query every source once and publish what came back. Returns the number of snapshots.
pub async fn sample_once(options: &Options, services: &Services, hub: &EventHub) -> usize {
    let docker = async {
        match with_timeout(options.call_timeout, services.docker.container_stats()).await {
            Ok(snapshot) => {
                hub.publish(Topics::DOCKER_STATS, Event::DockerStats(snapshot));
                1
            }
            Err(e) => {
                warn!("Skipping docker stats this tick: {}", e);
                0
            }
        }
    };

    let clusters = services.kubernetes.list_clusters();
    let kubernetes = join_all(clusters.iter().map(|cluster| async move {
        let call = services.kubernetes.cluster_metrics(&cluster.name);
        match with_timeout(options.call_timeout, call).await {
            Ok(snapshot) => {
                hub.publish(
                    &Topics::k8s_metrics(&cluster.name),
                    Event::K8sMetrics(snapshot),
                );
                1
            }
            Err(e) => {
                warn!("Skipping metrics for cluster {} this tick: {}", cluster.name, e);
                0
            }
        }
    }));

    let (docker, kubernetes) = tokio::join!(docker, kubernetes);
    docker + kubernetes.into_iter().sum::<usize>()
}
