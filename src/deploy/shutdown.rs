//! Graceful shutdown
//!
//! On a termination signal the process keeps running until every
//! background task has finished, or a timeout forces it out.

use super::tasks::BackgroundTasks;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Shutdown timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Wait before draining, so load balancers stop routing to us
    pub pre_delay: Duration,
    /// Interval between two quiescence checks
    pub poll_interval: Duration,
    /// Give up waiting after this long
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            pre_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(120),
        }
    }
}

/// How the drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every task finished
    Clean,
    /// Tasks were still running at the timeout
    TimedOut,
}

impl ShutdownOutcome {
    /// Process exit status
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Clean => 0,
            ShutdownOutcome::TimedOut => 1,
        }
    }
}

/// Waits for background tasks before the process exits
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    tasks: Arc<BackgroundTasks>,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    /// Create a coordinator over a task registry
    pub fn new(tasks: Arc<BackgroundTasks>, config: ShutdownConfig) -> Self {
        Self { tasks, config }
    }

    /// Sleep the configured pre-delay
    pub async fn pre_delay(&self) {
        if !self.config.pre_delay.is_zero() {
            info!(delay = ?self.config.pre_delay, "Waiting before draining");
            tokio::time::sleep(self.config.pre_delay).await;
        }
    }

    /// Poll the registry until it is quiescent or the timeout elapses
    pub async fn wait_quiescent(&self) -> ShutdownOutcome {
        let poll = self.config.poll_interval.max(Duration::from_millis(1));
        let tasks = Arc::clone(&self.tasks);

        let wait = async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tasks.is_quiescent() {
                    return;
                }
                info!(tasks = ?tasks.active(), "Waiting for background tasks");
            }
        };

        match tokio::time::timeout(self.config.timeout, wait).await {
            Ok(()) => {
                info!("Background tasks finished");
                ShutdownOutcome::Clean
            }
            Err(_) => {
                warn!(tasks = ?self.tasks.active(), "Timed out waiting for background tasks");
                ShutdownOutcome::TimedOut
            }
        }
    }

    /// Pre-delay, then wait for quiescence
    pub async fn drain(&self) -> ShutdownOutcome {
        self.pre_delay().await;
        self.wait_quiescent().await
    }
}

/// Resolve on SIGTERM or Ctrl-C
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = terminate.recv() => info!("Received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received interrupt");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received interrupt");
    }

    Ok(())
}
