//! Application deployments
//!
//! Blue-green deployment of compose applications, the registry of
//! in-flight deployments and the graceful shutdown that waits for them.

pub mod orchestrator;
pub mod shutdown;
pub mod tasks;

pub use orchestrator::{DeployedService, Deployer, DeploymentResult, ServiceStage};
pub use shutdown::{wait_for_signal, ShutdownConfig, ShutdownCoordinator, ShutdownOutcome};
pub use tasks::{BackgroundTasks, TaskGuard};

use crate::error::DeckhandError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Deployment timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployConfig {
    /// How long started services may take to report healthy
    pub deploy_timeout: Duration,
    /// Interval between two health checks
    pub health_poll_interval: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            deploy_timeout: Duration::from_secs(180),
            health_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Compose file accepted, nothing done yet
    Pending,
    /// Pulling images
    Pulling,
    /// Creating and starting containers
    Starting,
    /// Renaming new containers over the live ones
    Swapping,
    /// Every service swapped in
    Completed,
    /// Failed and undone
    RolledBack,
}

impl DeploymentState {
    /// Whether `next` may follow this state
    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;

        matches!(
            (self, next),
            (Pending, Pulling)
                | (Pulling, Starting)
                | (Starting, Swapping)
                | (Swapping, Completed)
                | (Pulling, RolledBack)
                | (Starting, RolledBack)
        )
    }

    /// Whether the deployment is over
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentState::Completed | DeploymentState::RolledBack)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentState::Pending => write!(f, "pending"),
            DeploymentState::Pulling => write!(f, "pulling"),
            DeploymentState::Starting => write!(f, "starting"),
            DeploymentState::Swapping => write!(f, "swapping"),
            DeploymentState::Completed => write!(f, "completed"),
            DeploymentState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Deployment errors
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Error while parsing healthcheck {field}: {message}")]
    DurationParse { field: &'static str, message: String },

    #[error("Error while pulling image {image}: {source}")]
    Pull {
        image: String,
        source: DeckhandError,
    },

    #[error("Error while creating container {container}: {source}")]
    Create {
        container: String,
        source: DeckhandError,
    },

    #[error("Error while starting container {container}: {source}")]
    Start {
        container: String,
        source: DeckhandError,
    },

    #[error("Container {container} is not healthy: {reason}")]
    Unhealthy { container: String, reason: String },

    #[error("Error while swapping service {service} (swapped: {swapped:?}): {source}")]
    Swap {
        service: String,
        swapped: Vec<String>,
        source: DeckhandError,
    },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("A deployment of {0} is already in progress")]
    InProgress(String),

    #[error("Application {app} is owned by {owner}")]
    Forbidden { app: String, owner: String },

    #[error("Container {container} belongs to application '{owner_app}'")]
    NameConflict { container: String, owner_app: String },

    #[error("Invalid compose file: {0}")]
    InvalidCompose(String),

    #[error("Runtime error: {0}")]
    Runtime(DeckhandError),
}

impl From<DeckhandError> for DeployError {
    fn from(err: DeckhandError) -> Self {
        match err {
            DeckhandError::RuntimeUnavailable(message) => DeployError::RuntimeUnavailable(message),
            DeckhandError::ComposeParse(message) => DeployError::InvalidCompose(message),
            other => DeployError::Runtime(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use DeploymentState::*;

        let happy = [Pending, Pulling, Starting, Swapping, Completed];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }

        assert!(Pulling.can_transition_to(RolledBack));
        assert!(Starting.can_transition_to(RolledBack));
        assert!(!Swapping.can_transition_to(RolledBack));
        assert!(!Pending.can_transition_to(Starting));
        assert!(!Completed.can_transition_to(Pending));
        assert!(Completed.is_terminal());
        assert!(!Swapping.is_terminal());
    }

    #[test]
    fn test_unavailable_runtime() {
        let err = DeployError::from(DeckhandError::RuntimeUnavailable("refused".to_string()));
        assert!(matches!(err, DeployError::RuntimeUnavailable(_)));
    }
}
