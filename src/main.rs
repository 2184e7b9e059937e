//! Deckhand - a web control plane for Docker hosts
//!
//! This is the main CLI entry point for Deckhand.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use deckhand::auth::hash_password;
use deckhand::container::docker::{DEFAULT_API_VERSION, DEFAULT_DOCKER_HOST};
use deckhand::daemon::{Daemon, DaemonConfig, Engine, DEFAULT_WS_ORIGIN};
use deckhand::deploy::{DeployConfig, ShutdownConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Deckhand - web control plane for Docker hosts
#[derive(Parser)]
#[command(name = "deckhand")]
#[command(version)]
#[command(about = "A web control plane for Docker hosts with blue-green deployments", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, env = "DECKHAND_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane
    Serve(ServeArgs),

    /// Print a users file entry
    HashPassword {
        /// Username
        username: String,
        /// Password
        password: String,
        /// Comma separated roles (admin, multi)
        #[arg(long, default_value = "")]
        roles: String,
        /// bcrypt cost
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "DECKHAND_PORT", default_value_t = deckhand::daemon::DEFAULT_PORT)]
    port: u16,

    /// Users file (username:bcrypt-hash:roles per line)
    #[arg(long, env = "DECKHAND_AUTH_FILE")]
    auth_file: Option<PathBuf>,

    /// Pattern WebSocket origins must match
    #[arg(long, env = "DECKHAND_WS_ORIGIN", default_value = DEFAULT_WS_ORIGIN)]
    ws_origin: String,

    /// Docker Engine address
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    docker_host: String,

    /// Docker Engine API version
    #[arg(long, env = "DOCKER_VERSION", default_value = DEFAULT_API_VERSION)]
    docker_version: String,

    /// Container engine backend
    #[arg(long, env = "DECKHAND_ENGINE", value_enum, default_value_t = Engine::Docker)]
    engine: Engine,

    /// Seconds started services may take to become healthy
    #[arg(long, env = "DECKHAND_DEPLOY_TIMEOUT", default_value_t = 180)]
    deploy_timeout: u64,

    /// Seconds between two health checks
    #[arg(long, env = "DECKHAND_HEALTH_POLL", default_value_t = 5)]
    health_poll: u64,

    /// Seconds to keep serving after a shutdown signal
    #[arg(long, env = "DECKHAND_SHUTDOWN_DELAY", default_value_t = 30)]
    shutdown_delay: u64,

    /// Seconds between two background task checks during shutdown
    #[arg(long, env = "DECKHAND_SHUTDOWN_POLL", default_value_t = 10)]
    shutdown_poll: u64,

    /// Seconds to wait for background tasks during shutdown
    #[arg(long, env = "DECKHAND_SHUTDOWN_TIMEOUT", default_value_t = 120)]
    shutdown_timeout: u64,
}

impl From<ServeArgs> for DaemonConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            port: args.port,
            auth_file: args.auth_file,
            ws_origin: args.ws_origin,
            docker_host: args.docker_host,
            docker_version: args.docker_version,
            engine: args.engine,
            deploy: DeployConfig {
                deploy_timeout: Duration::from_secs(args.deploy_timeout),
                health_poll_interval: Duration::from_secs(args.health_poll),
            },
            shutdown: ShutdownConfig {
                pre_delay: Duration::from_secs(args.shutdown_delay),
                poll_interval: Duration::from_secs(args.shutdown_poll),
                timeout: Duration::from_secs(args.shutdown_timeout),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve(args) => {
            let daemon = Daemon::new(args.into()).context("Failed to start daemon")?;
            let outcome = daemon.run().await.context("Daemon failed")?;
            std::process::exit(outcome.exit_code());
        }

        Commands::HashPassword {
            username,
            password,
            roles,
            cost,
        } => {
            let hash = hash_password(&password, cost)?;
            println!("{}:{}:{}", username, hash, roles);
        }
    }

    Ok(())
}
