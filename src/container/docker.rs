//! Docker Engine API client
//!
//! Talks to a Docker daemon exposed over TCP (`DOCKER_HOST=tcp://host:2375`).

use super::config::{
    ContainerDetails, ContainerEvent, ContainerSummary, HostConfig, ListFilters, NetworkConfig,
    ProcessConfig, RemoveOptions,
};
use super::gateway::{EventStream, LogStream, RuntimeGateway};
use crate::compose::naming::split_image_reference;
use crate::error::{DeckhandError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Default Docker Engine API version
pub const DEFAULT_API_VERSION: &str = "1.41";

/// Default engine address when `DOCKER_HOST` is unset
pub const DEFAULT_DOCKER_HOST: &str = "tcp://localhost:2375";

/// Container create request body
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerRequest<'a> {
    #[serde(flatten)]
    config: &'a ProcessConfig,
    host_config: &'a HostConfig,
    networking_config: &'a NetworkConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ErrorMessage {
    message: String,
}

/// Docker Engine gateway
#[derive(Debug, Clone)]
pub struct DockerGateway {
    client: Client,
    base_url: String,
}

impl DockerGateway {
    /// Create a gateway for `host` (`tcp://`, `http://` or `https://`)
    pub fn new(host: &str, api_version: &str) -> Result<Self> {
        let base_url = engine_url(host)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DeckhandError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("{}/v{}", base_url, api_version.trim_start_matches('v')),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Translate a `DOCKER_HOST` value into an HTTP base URL
fn engine_url(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('/');

    if host.is_empty() {
        return engine_url(DEFAULT_DOCKER_HOST);
    }
    if let Some(address) = host.strip_prefix("tcp://") {
        return Ok(format!("http://{}", address));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return Ok(host.to_string());
    }
    if host.starts_with("unix://") {
        return Err(DeckhandError::InvalidConfig(format!(
            "{} is a unix socket, expose the engine over TCP",
            host
        )));
    }

    Err(DeckhandError::InvalidConfig(format!(
        "unsupported engine address {}",
        host
    )))
}

/// Turn an engine error response into a Deckhand error
async fn check(response: Response, target: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorMessage>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    match status {
        StatusCode::NOT_FOUND => Err(DeckhandError::ContainerNotFound(format!(
            "{}: {}",
            target, message
        ))),
        StatusCode::CONFLICT => Err(DeckhandError::ContainerExists(format!(
            "{}: {}",
            target, message
        ))),
        _ => Err(DeckhandError::Runtime(format!("{}: {}", status, message))),
    }
}

#[async_trait]
impl RuntimeGateway for DockerGateway {
    async fn ping(&self) -> Result<()> {
        let response = self.client.get(self.url("/_ping")).send().await?;
        check(response, "ping").await?;
        Ok(())
    }

    async fn info(&self) -> Result<serde_json::Value> {
        let response = self.client.get(self.url("/info")).send().await?;
        Ok(check(response, "info").await?.json().await?)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (name, tag) = split_image_reference(image);
        debug!(image = %image, "pulling image");

        let response = self
            .client
            .post(self.url("/images/create"))
            .query(&[("fromImage", name), ("tag", tag)])
            .send()
            .await?;

        // The engine reports pull failures inside the progress stream
        let body = check(response, image).await?.text().await?;
        for line in body.lines() {
            if let Ok(progress) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(error) = progress.get("error").and_then(|e| e.as_str()) {
                    return Err(DeckhandError::Runtime(error.to_string()));
                }
            }
        }

        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/images/{}", image)))
            .send()
            .await?;
        check(response, image).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        config: &ProcessConfig,
        host: &HostConfig,
        network: &NetworkConfig,
    ) -> Result<String> {
        let request = CreateContainerRequest {
            config,
            host_config: host,
            networking_config: network,
        };

        let response = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", name)])
            .json(&request)
            .send()
            .await?;

        let created: CreateContainerResponse = check(response, name).await?.json().await?;
        for warning in created.warnings.unwrap_or_default() {
            tracing::warn!(container = %name, "{}", warning);
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/start", id)))
            .send()
            .await?;
        check(response, id).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/stop", id)))
            .send()
            .await?;
        check(response, id).await?;
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/restart", id)))
            .send()
            .await?;
        check(response, id).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/containers/{}", id)))
            .query(&[("v", options.volumes), ("force", options.force)])
            .send()
            .await?;
        check(response, id).await?;
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{}/rename", id)))
            .query(&[("name", name)])
            .send()
            .await?;
        check(response, id).await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{}/json", id)))
            .send()
            .await?;
        Ok(check(response, id).await?.json().await?)
    }

    async fn list_containers(&self, filters: &ListFilters) -> Result<Vec<ContainerSummary>> {
        let response = self
            .client
            .get(self.url("/containers/json"))
            .query(&[("all", "true".to_string()), ("filters", filters.to_query())])
            .send()
            .await?;
        Ok(check(response, "containers").await?.json().await?)
    }

    async fn stream_logs(&self, id: &str) -> Result<LogStream> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{}/logs", id)))
            .query(&[("follow", "true"), ("stdout", "true"), ("stderr", "true")])
            .send()
            .await?;

        let body = check(response, id).await?.bytes_stream();
        Ok(demultiplex(body))
    }

    async fn events(&self, filters: &ListFilters) -> Result<EventStream> {
        let response = self
            .client
            .get(self.url("/events"))
            .query(&[("filters", filters.to_event_query())])
            .send()
            .await?;

        let body = check(response, "events").await?.bytes_stream();
        Ok(decode_events(body))
    }
}

/// Split the engine's multiplexed log stream into lines
///
/// Every frame starts with an 8-byte header: stream type, three padding
/// bytes, then the payload size as a big-endian `u32`.
fn demultiplex<S, B>(body: S) -> LogStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
{
    futures::stream::unfold((body, Vec::new()), |(mut body, mut buffer)| async move {
        loop {
            if let Some(line) = take_frame(&mut buffer) {
                return Some((Ok(line), (body, buffer)));
            }

            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(DeckhandError::from(e)), (body, buffer))),
                None => return None,
            }
        }
    })
    .boxed()
}

/// Decode the engine's newline-delimited JSON event stream
fn decode_events<S, B>(body: S) -> EventStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
{
    futures::stream::unfold((body, Vec::new()), |(mut body, mut buffer)| async move {
        loop {
            while let Some(line) = take_line(&mut buffer) {
                match serde_json::from_slice::<ContainerEvent>(&line) {
                    Ok(event) => return Some((Ok(event), (body, buffer))),
                    Err(e) => warn!(error = %e, "Skipping undecodable engine event"),
                }
            }

            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(DeckhandError::from(e)), (body, buffer))),
                None => return None,
            }
        }
    })
    .boxed()
}

/// Pop one complete, non-empty line off the buffer
fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        let end = buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = buffer.drain(..=end).take(end).collect();
        if !line.iter().all(u8::is_ascii_whitespace) {
            return Some(line);
        }
    }
}

/// Pop one complete frame off the buffer
fn take_frame(buffer: &mut Vec<u8>) -> Option<String> {
    if buffer.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    if buffer.len() < 8 + size {
        return None;
    }

    let frame: Vec<u8> = buffer.drain(..8 + size).skip(8).collect();
    Some(
        String::from_utf8_lossy(&frame)
            .trim_end_matches(['\r', '\n'])
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &str) -> Vec<u8> {
        let mut bytes = vec![stream, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    #[test]
    fn test_engine_url() {
        assert_eq!(engine_url("tcp://docker:2375").unwrap(), "http://docker:2375");
        assert_eq!(engine_url("https://docker:2376/").unwrap(), "https://docker:2376");
        assert_eq!(engine_url("").unwrap(), "http://localhost:2375");
        assert!(engine_url("unix:///var/run/docker.sock").is_err());
        assert!(engine_url("ssh://docker").is_err());
    }

    #[test]
    fn test_gateway_base_url() {
        let gateway = DockerGateway::new("tcp://docker:2375", "v1.41").unwrap();
        assert_eq!(
            gateway.url("/containers/json"),
            "http://docker:2375/v1.41/containers/json"
        );
    }

    #[test]
    fn test_take_frame() {
        let mut buffer = frame(1, "hello\n");
        buffer.extend(frame(2, "oops\n"));
        buffer.extend_from_slice(&[1, 0, 0]);

        assert_eq!(take_frame(&mut buffer).as_deref(), Some("hello"));
        assert_eq!(take_frame(&mut buffer).as_deref(), Some("oops"));
        assert_eq!(take_frame(&mut buffer), None);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_take_frame_waits_for_payload() {
        let full = frame(1, "partial line");
        let mut buffer = full[..10].to_vec();

        assert_eq!(take_frame(&mut buffer), None);
        buffer.extend_from_slice(&full[10..]);
        assert_eq!(take_frame(&mut buffer).as_deref(), Some("partial line"));
    }

    #[test]
    fn test_take_line() {
        let mut buffer = b"{\"Action\":\"start\"}\n\n{\"Action\":\"st".to_vec();

        assert_eq!(take_line(&mut buffer).unwrap(), b"{\"Action\":\"start\"}");
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"{\"Action\":\"st");
    }

    #[tokio::test]
    async fn test_decode_events_across_chunks() {
        let chunks: Vec<reqwest::Result<&'static [u8]>> = vec![
            Ok(br#"{"Type":"container","Action":"create","Actor":{"ID":"a1","Attributes":{"name":"blog_web"}}}"#.as_slice()),
            Ok(b"\nnot json\n{\"Type\":\"container\",\"Action\":\"de".as_slice()),
            Ok(b"stroy\",\"Actor\":{\"ID\":\"a1\"}}\n".as_slice()),
        ];

        let events: Vec<ContainerEvent> = decode_events(futures::stream::iter(chunks))
            .map(|event| event.unwrap())
            .collect()
            .await;

        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["create", "destroy"]);
        assert_eq!(events[0].container_name(), "blog_web");
    }

    #[test]
    fn test_create_request_shape() {
        let config = ProcessConfig {
            image: "nginx".to_string(),
            ..Default::default()
        };
        let host = crate::compose::translate::build_host_config(&Default::default());
        let network = NetworkConfig::default();

        let request = CreateContainerRequest {
            config: &config,
            host_config: &host,
            networking_config: &network,
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["Image"], "nginx");
        assert_eq!(json["HostConfig"]["RestartPolicy"]["Name"], "on-failure");
        assert!(json["NetworkingConfig"]["EndpointsConfig"].is_object());
        assert!(json.get("Cmd").is_none());
    }
}
