//! Server state

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::app::options::ServerOptions;
use crate::app::state::AppState;
use crate::workers::log_tail;

/// Server state shared across handlers
pub struct ServerState {
    pub app: Arc<AppState>,
    pub options: ServerOptions,
    pub log_tail: log_tail::Options,
    /// Flipped to `true` once the server starts draining; live streams end on it
    pub shutdown: watch::Receiver<bool>,
    /// One permit per open live stream
    pub streams: Arc<Semaphore>,
}

impl ServerState {
    pub fn new(
        app: Arc<AppState>,
        options: ServerOptions,
        log_tail: log_tail::Options,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            app,
            streams: Arc::new(Semaphore::new(
                options.max_connections.min(Semaphore::MAX_PERMITS),
            )),
            options,
            log_tail,
            shutdown,
        }
    }
}
