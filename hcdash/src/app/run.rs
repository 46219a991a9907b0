//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::AppError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{janitor, sampler};

/// Run the control plane until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AppError> {
    info!("Initializing hcdash...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(version, &options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start hcdash: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    version: String,
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, AppError> {
    let app_state = Arc::new(AppState::init(version, options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_janitor_worker(
        options.janitor.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_sampler {
        init_sampler_worker(
            options.sampler.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    init_server(
        options,
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    Ok(app_state)
}

fn init_janitor_worker(
    options: janitor::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AppError> {
    info!("Initializing hub janitor...");

    let janitor_handle = tokio::spawn(async move {
        janitor::run(
            &options,
            &app_state.hub,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_janitor_worker_handle(janitor_handle)
}

fn init_sampler_worker(
    options: sampler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AppError> {
    info!("Initializing metrics sampler...");

    let sampler_handle = tokio::spawn(async move {
        sampler::run(
            &options,
            &app_state.services,
            &app_state.hub,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_sampler_worker_handle(sampler_handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AppError> {
    info!("Initializing HTTP server...");

    // Live streams watch this flag; the server flips it when it starts draining
    let (streams_tx, streams_rx) = watch::channel(false);
    let server_state = ServerState::new(
        app_state,
        options.server.clone(),
        options.log_tail.clone(),
        streams_rx,
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
        let _ = streams_tx.send(true);
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), AppError>>>,
    sampler_worker_handle: Option<JoinHandle<()>>,
    janitor_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            sampler_worker_handle: None,
            janitor_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), AppError> {
        if self.app_state.is_some() {
            return Err(AppError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_sampler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AppError> {
        if self.sampler_worker_handle.is_some() {
            return Err(AppError::ShutdownError("sampler_handle already set".to_string()));
        }
        self.sampler_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_janitor_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AppError> {
        if self.janitor_worker_handle.is_some() {
            return Err(AppError::ShutdownError("janitor_handle already set".to_string()));
        }
        self.janitor_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AppError>>,
    ) -> Result<(), AppError> {
        if self.server_handle.is_some() {
            return Err(AppError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AppError> {
        info!("Shutting down hcdash...");

        // 1. Janitor
        if let Some(handle) = self.janitor_worker_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))?;
        }

        // 2. Sampler (lets an in-flight tick finish within its grace period)
        if let Some(handle) = self.sampler_worker_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))?;
        }

        // 3. Deployment jobs
        if let Some(app_state) = self.app_state.take() {
            let grace = self.lifecycle_options.max_shutdown_delay / 2;
            app_state.orchestrator.shutdown(grace.max(Duration::from_secs(1))).await;
        }

        // 4. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
