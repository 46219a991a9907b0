//! Hub janitor worker: reaps subscribers that stopped draining or pinging

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use crate::events::EventHub;

/// Janitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Subscribers idle longer than this are removed
    pub idle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Run the janitor worker
pub async fn run<S, F>(
    options: &Options,
    hub: &EventHub,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Hub janitor starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Hub janitor shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with sweep
            }
        }

        let reaped = hub.reap_idle(options.idle_timeout);
        if reaped > 0 {
            info!("Reaped {} idle subscribers", reaped);
        } else {
            debug!("No idle subscribers");
        }
    }
}
