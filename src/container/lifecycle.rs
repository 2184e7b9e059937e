//! In-process container engine
//!
//! `MemoryRuntime` keeps container lifecycle state in memory. It backs the
//! `--engine memory` mode and the test suites, and can be told to fail
//! specific operations.

use super::config::{
    ContainerDetails, ContainerDetailsConfig, ContainerEvent, ContainerState, ContainerStatus,
    ContainerSummary, EventActor, HealthState, HostConfig, ListFilters, NetworkConfig,
    ProcessConfig, RemoveOptions,
};
use super::gateway::{EventStream, LogStream, RuntimeGateway};
use crate::compose::naming::image_reference;
use crate::error::{DeckhandError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use uuid::Uuid;

/// Events kept for slow subscribers before they start skipping
const EVENT_CAPACITY: usize = 256;

/// Engine operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Rename,
}

/// Container held by the in-process engine
#[derive(Debug, Clone)]
struct MemoryContainer {
    id: String,
    name: String,
    config: ProcessConfig,
    host: HostConfig,
    network: NetworkConfig,
    status: ContainerStatus,
    health: Option<String>,
    created_at: DateTime<Utc>,
    logs: Vec<String>,
}

impl MemoryContainer {
    fn details(&self) -> ContainerDetails {
        ContainerDetails {
            id: self.id.clone(),
            name: format!("/{}", self.name),
            image: image_reference(&self.config.image),
            created: self.created_at.to_rfc3339(),
            config: ContainerDetailsConfig {
                image: self.config.image.clone(),
                labels: self.config.labels.clone(),
            },
            state: ContainerState {
                status: self.status.to_string(),
                running: self.status == ContainerStatus::Running,
                health: self.health.clone().map(|status| HealthState { status }),
            },
        }
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            names: vec![format!("/{}", self.name)],
            image: self.config.image.clone(),
            labels: self.config.labels.clone(),
            state: self.status.to_string(),
            status: self.status.to_string(),
            created: self.created_at.timestamp(),
        }
    }

    fn event(&self, action: &str) -> ContainerEvent {
        let mut attributes = self.config.labels.clone();
        attributes.insert("name".to_string(), self.name.clone());
        attributes.insert("image".to_string(), self.config.image.clone());

        ContainerEvent {
            kind: "container".to_string(),
            action: action.to_string(),
            actor: EventActor {
                id: self.id.clone(),
                attributes,
            },
            time: Utc::now().timestamp(),
        }
    }
}

/// In-process container engine
#[derive(Debug)]
pub struct MemoryRuntime {
    /// All containers indexed by ID
    containers: RwLock<HashMap<String, MemoryContainer>>,
    /// Pulled image references
    images: RwLock<HashSet<String>>,
    /// Operations to fail, by image reference or container name
    failures: RwLock<HashSet<(Operation, String)>>,
    /// Health status reported after start, by image reference
    health: RwLock<HashMap<String, String>>,
    /// Lifecycle events fanned out to subscribers
    events: broadcast::Sender<ContainerEvent>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            containers: RwLock::default(),
            images: RwLock::default(),
            failures: RwLock::default(),
            health: RwLock::default(),
            events,
        }
    }
}

impl MemoryRuntime {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an operation fail for an image (pull) or a container name
    pub fn fail(&self, operation: Operation, target: &str) -> Result<()> {
        let mut failures = self
            .failures
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        failures.insert((operation, target.to_string()));
        Ok(())
    }

    /// Health status reported by containers of an image once started
    pub fn set_health(&self, image: &str, status: &str) -> Result<()> {
        let mut health = self
            .health
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        health.insert(image_reference(image), status.to_string());
        Ok(())
    }

    /// Append a line to a container's log
    pub fn append_log(&self, id: &str, line: &str) -> Result<()> {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        let container = find_mut(&mut containers, id)?;
        container.logs.push(line.to_string());
        Ok(())
    }

    /// Names of all containers, sorted
    pub fn container_names(&self) -> Result<Vec<String>> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        let mut names: Vec<String> = containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Host and network configuration a container was created with
    pub fn container_configs(&self, id: &str) -> Result<(HostConfig, NetworkConfig)> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        let container = find(&containers, id)?;
        Ok((container.host.clone(), container.network.clone()))
    }

    /// Whether an image has been pulled
    pub fn has_image(&self, image: &str) -> Result<bool> {
        let images = self
            .images
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(images.contains(&image_reference(image)))
    }

    fn check_failure(&self, operation: Operation, target: &str) -> Result<()> {
        let failures = self
            .failures
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        if failures.contains(&(operation, target.to_string())) {
            return Err(DeckhandError::Runtime(format!(
                "{:?} failed for {}",
                operation, target
            )));
        }

        Ok(())
    }

    fn reported_health(&self, image: &str) -> Result<String> {
        let health = self
            .health
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(health
            .get(&image_reference(image))
            .cloned()
            .unwrap_or_else(|| "healthy".to_string()))
    }

    fn emit(&self, event: ContainerEvent) {
        // Sending only fails when nobody listens
        let _ = self.events.send(event);
    }

    fn container_name(&self, id: &str) -> Result<String> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(find(&containers, id)?.name.clone())
    }
}

/// Look a container up by ID or name
fn find<'a>(
    containers: &'a HashMap<String, MemoryContainer>,
    id: &str,
) -> Result<&'a MemoryContainer> {
    containers
        .get(id)
        .or_else(|| containers.values().find(|c| c.name == id))
        .ok_or_else(|| DeckhandError::ContainerNotFound(id.to_string()))
}

fn find_mut<'a>(
    containers: &'a mut HashMap<String, MemoryContainer>,
    id: &str,
) -> Result<&'a mut MemoryContainer> {
    let key = find(containers, id)?.id.clone();
    containers
        .get_mut(&key)
        .ok_or_else(|| DeckhandError::ContainerNotFound(id.to_string()))
}

#[async_trait]
impl RuntimeGateway for MemoryRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn info(&self) -> Result<serde_json::Value> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;
        let running = containers
            .values()
            .filter(|c| c.status == ContainerStatus::Running)
            .count();
        let images = self
            .images
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(serde_json::json!({
            "Containers": containers.len(),
            "ContainersRunning": running,
            "Images": images.len(),
            "ServerVersion": "memory",
        }))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.check_failure(Operation::Pull, image)?;

        let mut images = self
            .images
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        images.insert(image_reference(image));
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let reference = image_reference(image);
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        if containers
            .values()
            .any(|c| image_reference(&c.config.image) == reference)
        {
            return Err(DeckhandError::Runtime(format!(
                "image {} is in use by a container",
                reference
            )));
        }

        let mut images = self
            .images
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        if !images.remove(&reference) {
            return Err(DeckhandError::ImageNotFound(reference));
        }

        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        config: &ProcessConfig,
        host: &HostConfig,
        network: &NetworkConfig,
    ) -> Result<String> {
        self.check_failure(Operation::Create, name)?;

        if !self.has_image(&config.image)? {
            return Err(DeckhandError::ImageNotFound(image_reference(&config.image)));
        }

        let mut containers = self
            .containers
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        if containers.values().any(|c| c.name == name) {
            return Err(DeckhandError::ContainerExists(name.to_string()));
        }

        let id = Uuid::new_v4().to_string().replace('-', "")[..12].to_string();
        let container = MemoryContainer {
            id: id.clone(),
            name: name.to_string(),
            config: config.clone(),
            host: host.clone(),
            network: network.clone(),
            status: ContainerStatus::Created,
            health: None,
            created_at: Utc::now(),
            logs: Vec::new(),
        };
        self.emit(container.event("create"));
        containers.insert(id.clone(), container);

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let name = self.container_name(id)?;
        self.check_failure(Operation::Start, &name)?;

        let image = {
            let containers = self
                .containers
                .read()
                .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;
            find(&containers, id)?.config.image.clone()
        };
        let health = self.reported_health(&image)?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        let container = find_mut(&mut containers, id)?;
        container.status = ContainerStatus::Running;
        if container.config.healthcheck.is_some() {
            container.health = Some(health);
        }
        self.emit(container.event("start"));

        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let name = self.container_name(id)?;
        self.check_failure(Operation::Stop, &name)?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        let container = find_mut(&mut containers, id)?;
        if container.status == ContainerStatus::Running {
            container.status = ContainerStatus::Exited;
            container.health = None;
            self.emit(container.event("die"));
        }
        self.emit(container.event("stop"));

        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.stop_container(id).await?;
        self.start_container(id).await?;

        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;
        self.emit(find(&containers, id)?.event("restart"));

        Ok(())
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let name = self.container_name(id)?;
        self.check_failure(Operation::Remove, &name)?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        let container = find(&containers, id)?;
        if container.status == ContainerStatus::Running && !options.force {
            return Err(DeckhandError::Runtime(format!(
                "cannot remove running container {}",
                name
            )));
        }

        self.emit(container.event("destroy"));
        let key = container.id.clone();
        containers.remove(&key);
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        let current = self.container_name(id)?;
        self.check_failure(Operation::Rename, &current)?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| DeckhandError::Lock("Failed to acquire write lock".to_string()))?;

        if containers.values().any(|c| c.name == name) {
            return Err(DeckhandError::ContainerExists(name.to_string()));
        }

        let container = find_mut(&mut containers, id)?;
        container.name = name.to_string();

        let mut event = container.event("rename");
        event
            .actor
            .attributes
            .insert("oldName".to_string(), format!("/{}", current));
        self.emit(event);

        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        find(&containers, id).map(MemoryContainer::details)
    }

    async fn list_containers(&self, filters: &ListFilters) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        let mut result: Vec<ContainerSummary> = containers
            .values()
            .filter(|c| filters.matches(&c.config.labels))
            .map(MemoryContainer::summary)
            .collect();
        result.sort_by(|a, b| a.names.cmp(&b.names));

        Ok(result)
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let containers = self
            .containers
            .read()
            .map_err(|_| DeckhandError::Lock("Failed to acquire read lock".to_string()))?;

        let lines = find(&containers, id)?.logs.clone();
        Ok(futures::stream::iter(lines.into_iter().map(Ok::<String, DeckhandError>)).boxed())
    }

    async fn events(&self, filters: &ListFilters) -> Result<EventStream> {
        let filters = filters.clone();
        let receiver = self.events.subscribe();

        let events = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber fell behind")
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(events
            .filter(move |event| futures::future::ready(filters.matches(&event.actor.attributes)))
            .map(Ok::<ContainerEvent, DeckhandError>)
            .boxed())
    }
}
