//! Runtime gateway
//!
//! The capability surface Deckhand needs from a container engine.

use super::config::{
    ContainerDetails, ContainerEvent, ContainerSummary, HostConfig, ListFilters, NetworkConfig,
    ProcessConfig, RemoveOptions,
};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of container log lines
pub type LogStream = BoxStream<'static, Result<String>>;

/// Stream of container lifecycle events
pub type EventStream = BoxStream<'static, Result<ContainerEvent>>;

/// Container engine operations
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Check the engine answers
    async fn ping(&self) -> Result<()>;

    /// Engine information, as reported by the engine
    async fn info(&self) -> Result<serde_json::Value>;

    /// Pull an image; `image` carries an explicit tag
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Remove an image
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its ID
    async fn create_container(
        &self,
        name: &str,
        config: &ProcessConfig,
        host: &HostConfig,
        network: &NetworkConfig,
    ) -> Result<String>;

    /// Start a container
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Restart a container
    async fn restart_container(&self, id: &str) -> Result<()>;

    /// Remove a container
    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()>;

    /// Rename a container
    async fn rename_container(&self, id: &str, name: &str) -> Result<()>;

    /// Inspect a container by ID or name
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// List all containers, running or not, matching the filters
    async fn list_containers(&self, filters: &ListFilters) -> Result<Vec<ContainerSummary>>;

    /// Follow the logs of a container
    async fn stream_logs(&self, id: &str) -> Result<LogStream>;

    /// Follow lifecycle events of containers matching the filters
    async fn events(&self, filters: &ListFilters) -> Result<EventStream>;
}
