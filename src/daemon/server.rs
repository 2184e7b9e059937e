//! HTTP server for the Deckhand daemon
//!
//! Serves the API over TCP and runs the graceful shutdown sequence: stop
//! taking new work, wait the pre-delay, close the listener, then wait for
//! in-flight deployments.

use super::api::{create_router, AppState};
use crate::auth::UserStore;
use crate::container::docker::{DEFAULT_API_VERSION, DEFAULT_DOCKER_HOST};
use crate::container::{DockerGateway, MemoryRuntime, RuntimeGateway};
use crate::deploy::{
    wait_for_signal, BackgroundTasks, DeployConfig, Deployer, ShutdownConfig,
    ShutdownCoordinator, ShutdownOutcome,
};
use crate::error::{DeckhandError, Result};
use axum::Router;
use regex::Regex;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default listening port
pub const DEFAULT_PORT: u16 = 1080;

/// Default WebSocket origin pattern
pub const DEFAULT_WS_ORIGIN: &str = "^dashboard";

/// Container engine backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Engine {
    /// Docker Engine API over TCP
    #[default]
    Docker,
    /// In-process engine, nothing is actually run
    Memory,
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// TCP port the API listens on
    pub port: u16,
    /// Users file
    pub auth_file: Option<PathBuf>,
    /// Pattern WebSocket origins must match
    pub ws_origin: String,
    /// Docker Engine address
    pub docker_host: String,
    /// Docker Engine API version
    pub docker_version: String,
    /// Container engine backend
    pub engine: Engine,
    /// Deployment timings
    pub deploy: DeployConfig,
    /// Shutdown timings
    pub shutdown: ShutdownConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auth_file: None,
            ws_origin: DEFAULT_WS_ORIGIN.to_string(),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            docker_version: DEFAULT_API_VERSION.to_string(),
            engine: Engine::Docker,
            deploy: DeployConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Deckhand daemon
pub struct Daemon {
    config: DaemonConfig,
    state: AppState,
    tasks: Arc<BackgroundTasks>,
}

impl Daemon {
    /// Create a daemon instance
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let gateway: Arc<dyn RuntimeGateway> = match config.engine {
            Engine::Docker => Arc::new(DockerGateway::new(
                &config.docker_host,
                &config.docker_version,
            )?),
            Engine::Memory => {
                warn!("Using the in-memory engine, containers are not run");
                Arc::new(MemoryRuntime::new())
            }
        };

        let users = match &config.auth_file {
            Some(path) => UserStore::load(path)?,
            None => UserStore::new(),
        };
        if users.is_empty() {
            warn!("No users configured, every authenticated request will be refused");
        }

        Self::with_gateway(config, gateway, users)
    }

    /// Create a daemon over an existing engine and user store
    pub fn with_gateway(
        config: DaemonConfig,
        gateway: Arc<dyn RuntimeGateway>,
        users: UserStore,
    ) -> Result<Self> {
        let ws_origin = Regex::new(&config.ws_origin).map_err(|e| {
            DeckhandError::InvalidConfig(format!("Invalid WebSocket origin pattern: {}", e))
        })?;

        let tasks = Arc::new(BackgroundTasks::new());
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&gateway),
            Arc::clone(&tasks),
            config.deploy,
        ));

        let state = AppState {
            gateway,
            deployer,
            users: Arc::new(users),
            closing: Arc::new(AtomicBool::new(false)),
            ws_origin,
        };

        Ok(Self {
            config,
            state,
            tasks,
        })
    }

    /// Shared handler state
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// API router over this daemon's state
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Listen on the configured port until SIGTERM or Ctrl-C
    pub async fn run(self) -> Result<ShutdownOutcome> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, "Deckhand listening");

        self.serve(listener, async {
            if let Err(e) = wait_for_signal().await {
                error!(error = %e, "Failed to listen for signals");
            }
        })
        .await
    }

    /// Serve on `listener` until `signal` resolves, then shut down
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<ShutdownOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let router = self.router();

        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        tokio::select! {
            _ = signal => {}
            result = &mut server => {
                return match result {
                    Ok(Ok(())) => Err(DeckhandError::Runtime("HTTP server stopped".to_string())),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(DeckhandError::Runtime(format!("HTTP server failed: {}", e))),
                };
            }
        }

        info!("Shutting down");
        self.state.closing.store(true, Ordering::SeqCst);

        let coordinator = ShutdownCoordinator::new(Arc::clone(&self.tasks), self.config.shutdown);
        coordinator.pre_delay().await;

        info!("Closing listener");
        let _ = stop_tx.send(true);

        let outcome = coordinator.wait_quiescent().await;

        // Long-lived log streams would keep the server open forever
        if tokio::time::timeout(self.config.shutdown.poll_interval, &mut server)
            .await
            .is_err()
        {
            server.abort();
        }

        info!(outcome = ?outcome, "Deckhand stopped");
        Ok(outcome)
    }
}
