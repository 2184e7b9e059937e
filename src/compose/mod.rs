//! Compose-style application descriptions
//!
//! Parsing of the YAML a deployment carries, container naming, and the
//! translation of each service into engine configuration.

pub mod config;
pub mod duration;
pub mod naming;
pub mod parser;
pub mod translate;

pub use config::{ComposeFile, HealthcheckSpec, ServiceSpec};
pub use parser::ComposeParser;
