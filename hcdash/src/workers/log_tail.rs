//! Log tail pumps
//!
//! The first subscriber to a `logs:` topic starts a pump that follows the
//! container or pod log and publishes each line. The pump is the topic's only
//! publisher; it stops once nobody listens and closes the topic if the log
//! itself ends.

use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::ServiceError;
use crate::events::{Event, EventHub, LogLine};
use crate::hub::topics::{LogSource, Topics};
use crate::hub::Publisher;
use crate::services::{with_timeout, Services};

/// Log tail options
#[derive(Debug, Clone)]
pub struct Options {
    /// Lines of history sent when a tail starts
    pub tail: usize,

    /// How often an idle pump checks for remaining subscribers
    pub idle_check: Duration,

    /// Limit for opening the log stream
    pub open_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tail: 100,
            idle_check: Duration::from_secs(5),
            open_timeout: Duration::from_secs(10),
        }
    }
}

enum Stop {
    /// Nobody is listening anymore
    Unobserved,
    /// The log stream ended or failed
    Ended,
}

/// Start a pump for `source` unless one is already running
pub fn ensure_pump(
    options: &Options,
    services: &Services,
    hub: &EventHub,
    source: LogSource,
) -> Option<JoinHandle<()>> {
    let topic = Topics::logs(&source);
    let publisher = hub.try_publisher(&topic)?;
    Some(tokio::spawn(pump(
        options.clone(),
        services.clone(),
        hub.clone(),
        publisher,
        source,
    )))
}

async fn pump(
    options: Options,
    services: Services,
    hub: EventHub,
    mut publisher: Publisher<Event>,
    source: LogSource,
) {
    let topic = publisher.topic().to_string();
    loop {
        info!("Starting log tail for {}", source);
        let stop = match open(&options, &services, &source).await {
            Ok(lines) => follow(&options, &publisher, &source, lines).await,
            Err(e) => {
                warn!("Unable to follow logs of {}: {}", source, e);
                Stop::Ended
            }
        };

        match stop {
            Stop::Ended => {
                publisher.close();
                break;
            }
            Stop::Unobserved => {
                drop(publisher);
                // Someone may have subscribed after the last check
                if hub.subscriber_count(&topic) == 0 {
                    break;
                }
                match hub.try_publisher(&topic) {
                    Some(next) => publisher = next,
                    None => break,
                }
            }
        }
    }
    info!("Stopped log tail for {}", source);
}

async fn open(
    options: &Options,
    services: &Services,
    source: &LogSource,
) -> Result<BoxStream<'static, Result<String, ServiceError>>, ServiceError> {
    match source {
        LogSource::Container { container } => {
            with_timeout(
                options.open_timeout,
                services.docker.follow_logs(container, options.tail),
            )
            .await
        }
        LogSource::Pod {
            cluster,
            namespace,
            pod,
        } => {
            with_timeout(
                options.open_timeout,
                services
                    .kubernetes
                    .follow_pod_logs(cluster, namespace, pod, options.tail),
            )
            .await
        }
    }
}

async fn follow(
    options: &Options,
    publisher: &Publisher<Event>,
    source: &LogSource,
    mut lines: BoxStream<'static, Result<String, ServiceError>>,
) -> Stop {
    let label = source.to_string();
    let mut idle_check = tokio::time::interval(options.idle_check);
    idle_check.tick().await;

    loop {
        tokio::select! {
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    publisher.publish(Event::Log(LogLine {
                        source: label.clone(),
                        timestamp: Utc::now(),
                        line,
                    }));
                }
                Some(Err(e)) => {
                    warn!("Log stream of {} failed: {}", source, e);
                    return Stop::Ended;
                }
                None => {
                    debug!("Log stream of {} ended", source);
                    return Stop::Ended;
                }
            },
            _ = idle_check.tick() => {
                if publisher.subscriber_count() == 0 {
                    debug!("No subscribers left on {}", publisher.topic());
                    return Stop::Unobserved;
                }
            }
        }
    }
}
