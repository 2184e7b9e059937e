//! Compose file model
//!
//! Only the keys Deckhand acts on are modelled. Unknown keys are ignored.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Compose file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Compose file version, informational only
    #[serde(default)]
    pub version: Option<String>,
    /// Services by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

/// One declared service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Image reference, tag optional
    #[serde(default)]
    pub image: String,
    /// Environment variables
    #[serde(default, deserialize_with = "string_map")]
    pub environment: BTreeMap<String, String>,
    /// Custom labels
    #[serde(default, deserialize_with = "string_map")]
    pub labels: BTreeMap<String, String>,
    /// Command
    #[serde(default, deserialize_with = "command")]
    pub command: Vec<String>,
    /// Health check
    #[serde(default)]
    pub healthcheck: Option<HealthcheckSpec>,
    /// CPU shares
    #[serde(default)]
    pub cpu_shares: i64,
    /// Memory limit in bytes
    #[serde(default)]
    pub mem_limit: i64,
    /// Read-only root filesystem
    #[serde(default)]
    pub read_only: bool,
    /// Links as `service` or `service:alias`
    #[serde(default)]
    pub links: Vec<String>,
}

/// Health check declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    /// Test command
    #[serde(default, deserialize_with = "health_test")]
    pub test: Vec<String>,
    /// Consecutive failures before unhealthy
    #[serde(default)]
    pub retries: u32,
    /// Interval as a duration string, e.g. `30s`
    #[serde(default)]
    pub interval: Option<String>,
    /// Timeout as a duration string, e.g. `10s`
    #[serde(default)]
    pub timeout: Option<String>,
}

fn scalar<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(E::custom("expected a scalar value")),
    }
}

/// Mapping form (`KEY: value`) or list form (`- KEY=value`)
fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(BTreeMap::new()),
        Value::Mapping(map) => map
            .into_iter()
            .map(|(key, value)| Ok((scalar::<D::Error>(key)?, scalar::<D::Error>(value)?)))
            .collect(),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| {
                let entry = scalar::<D::Error>(item)?;
                Ok(match entry.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (entry, String::new()),
                })
            })
            .collect(),
        _ => Err(de::Error::custom("expected a mapping or a list")),
    }
}

/// List form, or a single string split on whitespace
fn command<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(line) => Ok(line.split_whitespace().map(str::to_string).collect()),
        Value::Sequence(items) => items.into_iter().map(scalar::<D::Error>).collect(),
        _ => Err(de::Error::custom("expected a string or a list")),
    }
}

/// List form, or a shell line run through `CMD-SHELL`
fn health_test<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(line) => Ok(vec!["CMD-SHELL".to_string(), line]),
        Value::Sequence(items) => items.into_iter().map(scalar::<D::Error>).collect(),
        _ => Err(de::Error::custom("expected a string or a list")),
    }
}
