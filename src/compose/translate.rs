//! Service to container configuration
//!
//! Pure translation of a declared service into the three configuration
//! objects the engine needs to create its container.

use super::config::{HealthcheckSpec, ServiceSpec};
use super::duration::parse_duration;
use super::naming::resolve_link;
use crate::auth::Identity;
use crate::container::config::{
    EndpointSettings, HealthConfig, HostConfig, LogConfig, NetworkConfig, ProcessConfig,
    RestartPolicy,
};
use crate::deploy::{DeployError, DeployedService};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Network every deployed container joins
pub const NETWORK_MODE: &str = "traefik";

/// Memory floor, 16 MiB
pub const MIN_MEMORY: i64 = 16 * 1024 * 1024;

/// Memory ceiling, 512 MiB
pub const MAX_MEMORY: i64 = 512 * 1024 * 1024;

/// CPU shares when the service declares none
pub const DEFAULT_CPU_SHARES: i64 = 128;

/// Label naming the user who deployed a container
pub const OWNER_LABEL: &str = "owner";

/// Label naming the application a container belongs to
pub const APP_LABEL: &str = "app";

const LOG_DRIVER: &str = "json-file";
const LOG_MAX_SIZE: &str = "50m";
const RESTART_POLICY: &str = "on-failure";
const MAX_RESTARTS: u32 = 5;
const NO_NEW_PRIVILEGES: &str = "no-new-privileges";

/// Build the process configuration of a service
pub fn build_process_config(
    service: &ServiceSpec,
    identity: &Identity,
    app: &str,
) -> Result<ProcessConfig, DeployError> {
    let mut labels: HashMap<String, String> = service
        .labels
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    labels.insert(OWNER_LABEL.to_string(), identity.username.clone());
    labels.insert(APP_LABEL.to_string(), app.to_string());

    let env = service
        .environment
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    let healthcheck = match &service.healthcheck {
        Some(spec) => Some(build_health_config(spec)?),
        None => None,
    };

    Ok(ProcessConfig {
        image: service.image.clone(),
        labels,
        env,
        cmd: service.command.clone(),
        healthcheck,
    })
}

fn build_health_config(spec: &HealthcheckSpec) -> Result<HealthConfig, DeployError> {
    let interval = parse_field("interval", spec.interval.as_deref())?;
    let timeout = parse_field("timeout", spec.timeout.as_deref())?;

    Ok(HealthConfig {
        test: spec.test.clone(),
        interval,
        timeout,
        retries: spec.retries,
    })
}

/// An absent duration leaves the engine default in place
fn parse_field(field: &'static str, value: Option<&str>) -> Result<Duration, DeployError> {
    match value {
        None => Ok(Duration::ZERO),
        Some(value) => parse_duration(value).map_err(|e| DeployError::DurationParse {
            field,
            message: e.to_string(),
        }),
    }
}

/// Build the host configuration of a service
pub fn build_host_config(service: &ServiceSpec) -> HostConfig {
    let cpu_shares = if service.cpu_shares > 0 {
        service.cpu_shares
    } else {
        DEFAULT_CPU_SHARES
    };

    HostConfig {
        log_config: LogConfig {
            driver: LOG_DRIVER.to_string(),
            options: HashMap::from([("max-size".to_string(), LOG_MAX_SIZE.to_string())]),
        },
        network_mode: NETWORK_MODE.to_string(),
        restart_policy: RestartPolicy {
            name: RESTART_POLICY.to_string(),
            maximum_retry_count: MAX_RESTARTS,
        },
        readonly_rootfs: service.read_only,
        security_opt: vec![NO_NEW_PRIVILEGES.to_string()],
        cpu_shares,
        memory: service.mem_limit.clamp(MIN_MEMORY, MAX_MEMORY),
    }
}

/// Build the network configuration of a service
pub fn build_network_config(
    service: &ServiceSpec,
    peers: &BTreeMap<String, DeployedService>,
) -> NetworkConfig {
    let links = service
        .links
        .iter()
        .map(|link| resolve_link(link, peers))
        .collect();

    NetworkConfig {
        endpoints_config: HashMap::from([(NETWORK_MODE.to_string(), EndpointSettings { links })]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::ServiceStage;

    fn admin() -> Identity {
        Identity::new("admin", true, false)
    }

    fn with_health(interval: &str, timeout: &str) -> ServiceSpec {
        ServiceSpec {
            healthcheck: Some(HealthcheckSpec {
                interval: Some(interval.to_string()),
                timeout: Some(timeout.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_process_config_minimal() {
        let config = build_process_config(&ServiceSpec::default(), &admin(), "test").unwrap();

        assert_eq!(config.labels.len(), 2);
        assert_eq!(config.labels["owner"], "admin");
        assert_eq!(config.labels["app"], "test");
        assert!(config.env.is_empty());
        assert!(config.healthcheck.is_none());
    }

    #[test]
    fn test_process_config_full() {
        let service = ServiceSpec {
            image: "vibioh/dashboard".to_string(),
            environment: BTreeMap::from([
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("LANG".to_string(), "C".to_string()),
            ]),
            labels: BTreeMap::from([("CUSTOM_LABEL".to_string(), "testing".to_string())]),
            command: vec!["entrypoint.sh".to_string(), "start".to_string()],
            healthcheck: Some(HealthcheckSpec {
                test: vec!["CMD".to_string(), "alcotest".to_string()],
                retries: 10,
                interval: Some("30s".to_string()),
                timeout: Some("10s".to_string()),
            }),
            ..Default::default()
        };

        let config = build_process_config(&service, &admin(), "test").unwrap();
        assert_eq!(config.image, "vibioh/dashboard");
        assert_eq!(config.labels["CUSTOM_LABEL"], "testing");
        assert_eq!(config.env, vec!["LANG=C", "PATH=/usr/bin"]);
        assert_eq!(config.cmd, vec!["entrypoint.sh", "start"]);
        assert_eq!(
            config.healthcheck,
            Some(HealthConfig {
                test: vec!["CMD".to_string(), "alcotest".to_string()],
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(10),
                retries: 10,
            })
        );
    }

    #[test]
    fn test_reserved_labels_win() {
        let service = ServiceSpec {
            labels: BTreeMap::from([
                ("owner".to_string(), "mallory".to_string()),
                ("app".to_string(), "other".to_string()),
                ("tier".to_string(), "front".to_string()),
            ]),
            ..Default::default()
        };

        let guest = Identity::new("guest", false, false);
        let config = build_process_config(&service, &guest, "blog").unwrap();
        assert_eq!(config.labels.len(), 3);
        assert_eq!(config.labels["owner"], "guest");
        assert_eq!(config.labels["app"], "blog");
        assert_eq!(config.labels["tier"], "front");
    }

    #[test]
    fn test_invalid_interval() {
        let err = build_process_config(&with_health("abcd", "10s"), &admin(), "test").unwrap_err();
        assert!(matches!(
            err,
            DeployError::DurationParse {
                field: "interval",
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            r#"Error while parsing healthcheck interval: invalid duration "abcd""#
        );
    }

    #[test]
    fn test_invalid_timeout() {
        let err = build_process_config(&with_health("30s", "abcd"), &admin(), "test").unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Error while parsing healthcheck timeout: invalid duration "abcd""#
        );
    }

    #[test]
    fn test_host_config_defaults() {
        let config = build_host_config(&ServiceSpec::default());

        assert_eq!(config.log_config.driver, "json-file");
        assert_eq!(config.log_config.options["max-size"], "50m");
        assert_eq!(config.network_mode, "traefik");
        assert_eq!(config.restart_policy.name, "on-failure");
        assert_eq!(config.restart_policy.maximum_retry_count, 5);
        assert_eq!(config.security_opt, vec!["no-new-privileges"]);
        assert!(!config.readonly_rootfs);
        assert_eq!(config.cpu_shares, 128);
        assert_eq!(config.memory, MIN_MEMORY);
    }

    #[test]
    fn test_host_config_limits() {
        let mut service = ServiceSpec {
            read_only: true,
            cpu_shares: 512,
            mem_limit: 33554432,
            ..Default::default()
        };

        let config = build_host_config(&service);
        assert!(config.readonly_rootfs);
        assert_eq!(config.cpu_shares, 512);
        assert_eq!(config.memory, 33554432);

        service.mem_limit = 20973619200;
        assert_eq!(build_host_config(&service).memory, MAX_MEMORY);

        service.mem_limit = 1024;
        assert_eq!(build_host_config(&service).memory, MIN_MEMORY);

        service.mem_limit = MAX_MEMORY;
        assert_eq!(build_host_config(&service).memory, MAX_MEMORY);

        service.cpu_shares = -1;
        assert_eq!(build_host_config(&service).cpu_shares, 128);
    }

    #[test]
    fn test_network_config() {
        let none = build_network_config(&ServiceSpec::default(), &BTreeMap::new());
        assert_eq!(none.endpoints_config.len(), 1);
        assert!(none.endpoints_config["traefik"].links.is_empty());

        let service = ServiceSpec {
            links: vec!["db".to_string(), "cache:redis".to_string()],
            ..Default::default()
        };
        let peers = BTreeMap::from([(
            "db".to_string(),
            DeployedService {
                service: "db".to_string(),
                image: "postgres".to_string(),
                transitional_name: "test_postgres_deploy".to_string(),
                container_id: "abc".to_string(),
                final_name: None,
                stage: ServiceStage::Started,
            },
        )]);

        let config = build_network_config(&service, &peers);
        assert_eq!(
            config.endpoints_config["traefik"].links,
            vec!["test_postgres:db", "cache:redis"]
        );
    }
}
