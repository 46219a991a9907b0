//! hcdash - Entry Point
//!
//! Serves the dashboard API: container and cluster management, live streams,
//! and AI-assisted Docker to Kubernetes deployments.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use hcdash::app::options::AppOptions;
use hcdash::app::run::run;
use hcdash::filesys::file::File;
use hcdash::logs::{init_logging, LogOptions};
use hcdash::storage::layout::StorageLayout;
use hcdash::storage::settings::Settings;
use hcdash::utils::{run_diagnostic, version_info};

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Retrieve the settings
    let layout = StorageLayout::default();
    let settings_file = match cli_args
        .get("config")
        .cloned()
        .or_else(|| env::var("CONFIG_PATH").ok())
    {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let mut settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!(
                "Unable to read settings file {}: {}",
                settings_file.path().display(),
                e
            );
            return;
        }
    };
    if let Err(e) = settings.apply_env(|key| env::var(key).ok()) {
        eprintln!("Invalid environment override: {}", e);
        return;
    }

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        let healthy = run_diagnostic(&settings.docker.binary, &settings.kubectl_binary).await;
        if !healthy {
            std::process::exit(1);
        }
        return;
    }

    // Initialize logging; the guard flushes file output on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.as_ref().map(PathBuf::from),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the server
    let options = AppOptions::from_settings(&settings, &layout);

    info!("Running hcdash with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run hcdash: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    error!("Unable to install signal handlers, waiting for Ctrl+C only");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Ctrl+C received, shutting down...");
    }
}
