//! Container runtime access
//!
//! This module describes the container configuration Deckhand produces and
//! the engines it can drive: the Docker Engine API, or an in-process engine.

pub mod config;
pub mod docker;
pub mod gateway;
pub mod lifecycle;

pub use config::{
    ContainerDetails, ContainerEvent, ContainerStatus, ContainerSummary, EventActor, HealthConfig,
    HostConfig, ListFilters, NetworkConfig, ProcessConfig, RemoveOptions, EVENT_ACTIONS,
};
pub use docker::DockerGateway;
pub use gateway::{EventStream, LogStream, RuntimeGateway};
pub use lifecycle::{MemoryRuntime, Operation};
