//! Portmap - TCP port-mapping supervisor
//!
//! Runs one external forwarder (socat by default) per local port and exposes
//! create/stop/status over a small HTTP control API.

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod api;
pub mod config;
pub mod forwarding;
pub mod logging;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::{ApiServer, ApiState};
use config::{ConfigError, ServiceConfig};
use forwarding::{ForwardingManager, ProcessSupervisor, RuleStore, TrafficSampler};
use logging::RotatingFile;

/// Roll the log file over once it grows past this size
const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const LOG_BACKUPS: usize = 5;

/// Fatal startup errors
#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open log file {path:?}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error("Failed to bind control API on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// Initialize the console log layer and, when configured, the file layer.
/// `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &ServiceConfig) -> Result<(), ServeError> {
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = RotatingFile::open(path, LOG_MAX_BYTES, LOG_BACKUPS).map_err(|source| {
                ServeError::LogFile {
                    path: path.clone(),
                    source,
                }
            })?;
            Some(fmt::layer().with_ansi(false).with_writer(file))
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_directive())),
        )
        .with(fmt::layer())
        .with(file_layer)
        .try_init();
    Ok(())
}

fn traffic_sampler(config: &ServiceConfig) -> Arc<dyn TrafficSampler> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(forwarding::ProcfsSampler::new(config.sample_timeout))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Arc::new(forwarding::NullSampler)
    }
}

/// Build the manager described by `config`
pub fn build_manager(config: &ServiceConfig) -> ForwardingManager {
    ForwardingManager::new(
        Arc::new(RuleStore::new(config.max_stopped_rules)),
        ProcessSupervisor::new(config.supervisor()),
        traffic_sampler(config),
    )
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Serve the control API until a shutdown signal, then stop every mapping.
pub async fn serve(config: ServiceConfig) -> Result<(), ServeError> {
    let addr = config.listen_addr()?;
    let manager = Arc::new(build_manager(&config));
    let state = Arc::new(ApiState::new(manager.clone(), config.allow_origins.clone()));

    let server = ApiServer::bind(addr, state)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    tracing::info!(
        "Portmap started on {} (forwarder: {})",
        server.local_addr(),
        config.forwarder.program
    );

    shutdown_signal().await;
    tracing::info!("Shutdown requested");

    server.shutdown().await;
    let stopped = manager.stop_all().await;
    tracing::info!("Stopped {} mappings, exiting", stopped);
    Ok(())
}

pub async fn run() -> ExitCode {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("portmapd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("portmapd: {}", e);
        return ExitCode::FAILURE;
    }

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
