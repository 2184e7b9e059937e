//! Deckhand daemon
//!
//! HTTP and WebSocket surface over the container engine and the
//! deployment orchestrator.

pub mod api;
mod events;
mod logs;
mod server;
mod socket;

pub use api::{create_router, ApiError, AppState};
pub use server::{Daemon, DaemonConfig, Engine, DEFAULT_PORT, DEFAULT_WS_ORIGIN};
