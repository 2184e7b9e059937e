//! Deckhand - a web control plane for Docker hosts
//!
//! Deckhand authenticates operators, lets them list, inspect and control the
//! containers they own, and deploys multi-service applications described in
//! a compose file using a blue-green strategy:
//!
//! - Compose translation into Docker Engine configuration
//! - Blue-green deployments with rollback on failure
//! - Background task tracking for graceful shutdown
//! - HTTP API with WebSocket log streaming

pub mod auth;
pub mod compose;
pub mod container;
pub mod daemon;
pub mod deploy;
pub mod error;

pub use error::{DeckhandError, Result};
