//! Container configuration
//!
//! These types mirror the Docker Engine API payloads so they can be sent to
//! the engine as-is.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container has exited
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Process and image configuration of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessConfig {
    /// Image name, as declared
    pub image: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Environment as `KEY=VALUE`
    pub env: Vec<String>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// Health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
}

/// Health check configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthConfig {
    /// Test command
    pub test: Vec<String>,
    /// Time between two checks
    #[serde(with = "nanoseconds")]
    pub interval: Duration,
    /// Time before a check is considered hung
    #[serde(with = "nanoseconds")]
    pub timeout: Duration,
    /// Consecutive failures before unhealthy
    pub retries: u32,
}

/// Host configuration of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// Logging driver
    pub log_config: LogConfig,
    /// Network mode
    pub network_mode: String,
    /// Restart policy
    pub restart_policy: RestartPolicy,
    /// Read-only root filesystem
    pub readonly_rootfs: bool,
    /// Security options
    pub security_opt: Vec<String>,
    /// CPU shares (relative weight)
    pub cpu_shares: i64,
    /// Memory limit in bytes
    pub memory: i64,
}

/// Logging driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Driver name
    #[serde(rename = "Type")]
    pub driver: String,
    /// Driver options
    #[serde(rename = "Config")]
    pub options: HashMap<String, String>,
}

/// Restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    /// Policy name
    pub name: String,
    /// Maximum restart attempts
    pub maximum_retry_count: u32,
}

/// Network configuration of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfig {
    /// Endpoints by network name
    pub endpoints_config: HashMap<String, EndpointSettings>,
}

/// Settings of one network endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointSettings {
    /// Links as `target:alias`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
}

/// Container list item
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created: i64,
}

impl ContainerSummary {
    /// Primary name without the leading slash
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_default()
    }
}

/// Container inspect details
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub config: ContainerDetailsConfig,
    #[serde(default)]
    pub state: ContainerState,
}

impl ContainerDetails {
    /// Container name without the leading slash
    pub fn name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Container labels
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.config.labels
    }

    /// Reported health status, if the container has a health check
    pub fn health_status(&self) -> Option<&str> {
        self.state.health.as_ref().map(|h| h.status.as_str())
    }
}

/// Configuration part of inspect details
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetailsConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Runtime state of a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
}

/// Health part of the runtime state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthState {
    #[serde(default)]
    pub status: String,
}

/// Label filters for container listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilters {
    /// Required `key=value` labels
    pub labels: Vec<(String, String)>,
}

impl ListFilters {
    /// No filtering
    pub fn none() -> Self {
        Self::default()
    }

    /// Require a label value
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    /// Check labels against every filter
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Engine representation: `{"label": ["key=value", ...]}`
    pub fn to_query(&self) -> String {
        serde_json::json!({ "label": self.label_values() }).to_string()
    }

    /// Engine representation for the event stream, restricted to container
    /// lifecycle events
    pub fn to_event_query(&self) -> String {
        serde_json::json!({
            "type": ["container"],
            "event": EVENT_ACTIONS,
            "label": self.label_values(),
        })
        .to_string()
    }

    fn label_values(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }
}

/// Container lifecycle actions forwarded to event subscribers
pub const EVENT_ACTIONS: [&str; 9] = [
    "create", "start", "stop", "restart", "rename", "update", "destroy", "die", "kill",
];

/// A container lifecycle event, as the engine reports it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    /// Unix seconds
    #[serde(default)]
    pub time: i64,
}

/// Object an event is about
///
/// For containers the attributes hold the labels plus `name` and `image`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ContainerEvent {
    /// Container name at the time of the event
    pub fn container_name(&self) -> &str {
        self.actor
            .attributes
            .get("name")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Container removal options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove anonymous volumes
    pub volumes: bool,
    /// Kill the container if it is running
    pub force: bool,
}

impl RemoveOptions {
    /// Forced removal including volumes
    pub fn forced() -> Self {
        Self {
            volumes: true,
            force: true,
        }
    }
}

/// Durations as integer nanoseconds, the engine's wire format
mod nanoseconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_config_serializes_nanoseconds() {
        let health = HealthConfig {
            test: vec!["CMD".to_string(), "true".to_string()],
            interval: Duration::from_secs(30),
            timeout: Duration::from_millis(1500),
            retries: 3,
        };

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["Interval"], 30_000_000_000u64);
        assert_eq!(json["Timeout"], 1_500_000_000u64);
        assert_eq!(json["Retries"], 3);
    }

    #[test]
    fn test_list_filters() {
        let filters = ListFilters::none().label("owner", "admin");

        let mut labels = HashMap::new();
        labels.insert("owner".to_string(), "admin".to_string());
        labels.insert("app".to_string(), "blog".to_string());
        assert!(filters.matches(&labels));

        labels.insert("owner".to_string(), "guest".to_string());
        assert!(!filters.matches(&labels));

        assert_eq!(filters.to_query(), r#"{"label":["owner=admin"]}"#);
        assert!(ListFilters::none().matches(&HashMap::new()));
    }

    #[test]
    fn test_event_query() {
        let query = ListFilters::none().label("owner", "alice").to_event_query();
        let value: serde_json::Value = serde_json::from_str(&query).unwrap();

        assert_eq!(value["type"], serde_json::json!(["container"]));
        assert_eq!(value["label"], serde_json::json!(["owner=alice"]));
        assert_eq!(value["event"].as_array().unwrap().len(), EVENT_ACTIONS.len());
        assert!(value["event"]
            .as_array()
            .unwrap()
            .iter()
            .any(|action| action == "destroy"));
    }

    #[test]
    fn test_event_from_engine() {
        let line = r#"{"status":"start","id":"4a1f","Type":"container","Action":"start","Actor":{"ID":"4a1f","Attributes":{"image":"nginx","name":"blog_web","owner":"alice"}},"scope":"local","time":1700000000,"timeNano":1700000000000000000}"#;
        let event: ContainerEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.action, "start");
        assert_eq!(event.actor.id, "4a1f");
        assert_eq!(event.container_name(), "blog_web");
        assert!(ListFilters::none()
            .label("owner", "alice")
            .matches(&event.actor.attributes));
    }

    #[test]
    fn test_summary_name_strips_slash() {
        let summary = ContainerSummary {
            names: vec!["/blog_web".to_string()],
            ..Default::default()
        };
        assert_eq!(summary.name(), "blog_web");
        assert_eq!(ContainerSummary::default().name(), "");
    }
}
