//! WebSocket plumbing shared by the streaming routes
//!
//! Browsers cannot set headers on a WebSocket handshake. A socket opened
//! without an `Authorization` header authenticates with its first text
//! message instead, either `Basic <base64>` or the bare base64 credentials.

use super::api::{ApiError, AppState};
use crate::auth::Identity;
use crate::container::LogStream;
use crate::error::DeckhandError;
use axum::extract::ws::{close_code, CloseFrame, Message};
use axum::http::header::{AUTHORIZATION, HOST, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, warn};

/// How long an unauthenticated socket may wait before sending credentials
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How a socket proves who it is
#[derive(Debug)]
pub(super) enum Credentials {
    /// Authenticated from the handshake's `Authorization` header
    Verified(Identity),
    /// Expected as the first message
    FirstMessage,
}

impl Credentials {
    /// Check origin and header credentials before upgrading
    pub(super) async fn from_handshake(
        state: &AppState,
        headers: &HeaderMap,
    ) -> Result<Self, ApiError> {
        let origin = request_origin(headers);
        if !state.ws_origin.is_match(origin) {
            return Err(
                DeckhandError::Forbidden(format!("Origin {} is not allowed", origin)).into(),
            );
        }

        match headers.get(AUTHORIZATION) {
            Some(value) => {
                let header = value.to_str().ok().map(str::to_string);
                Ok(Credentials::Verified(state.authenticate(header).await?))
            }
            None => Ok(Credentials::FirstMessage),
        }
    }

    /// Resolve the identity, reading the first message when needed
    pub(super) async fn identify<St, E>(
        self,
        state: &AppState,
        incoming: &mut St,
    ) -> Result<Identity, ApiError>
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
    {
        let text = match self {
            Credentials::Verified(identity) => return Ok(identity),
            Credentials::FirstMessage => {
                match tokio::time::timeout(AUTH_TIMEOUT, incoming.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) => text.as_str().to_string(),
                    Ok(_) => return Err(unauthorized("Expected credentials as first message")),
                    Err(_) => return Err(unauthorized("No credentials received")),
                }
            }
        };

        state.authenticate(Some(authorization_value(&text))).await
    }
}

fn unauthorized(message: &str) -> ApiError {
    DeckhandError::Unauthorized(message.to_string()).into()
}

/// First-message credentials as an `Authorization` header value
fn authorization_value(message: &str) -> String {
    let message = message.trim();
    if message.contains(' ') {
        message.to_string()
    } else {
        format!("Basic {}", message)
    }
}

/// Origin host of a request, without its scheme
///
/// Falls back to the `Host` header for clients that send no `Origin`.
fn request_origin(headers: &HeaderMap) -> &str {
    let origin = headers
        .get(ORIGIN)
        .or_else(|| headers.get(HOST))
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    origin
        .split_once("://")
        .map(|(_, host)| host)
        .unwrap_or(origin)
}

/// Push every line of `feed` to the client until either side ends
pub(super) async fn forward<Si, St, E>(
    outgoing: &mut Si,
    incoming: &mut St,
    mut feed: LogStream,
    name: &str,
) where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, E>> + Unpin,
{
    loop {
        tokio::select! {
            line = feed.next() => match line {
                Some(Ok(line)) => {
                    if outgoing.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(stream = %name, error = %e, "Stream failed");
                    break;
                }
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = outgoing.send(Message::Close(None)).await;
    debug!(stream = %name, "Stream closed");
}

/// Close the socket with the reason it was refused
pub(super) async fn reject<Si>(outgoing: &mut Si, error: ApiError)
where
    Si: Sink<Message> + Unpin,
{
    let code = match error.status_code() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => close_code::POLICY,
        StatusCode::NOT_FOUND => close_code::NORMAL,
        _ => close_code::ERROR,
    };
    debug!(code, error = %error, "Socket refused");

    let frame = CloseFrame {
        code,
        reason: error.to_string().into(),
    };
    let _ = outgoing.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
pub(super) mod fixtures {
    use super::*;
    use crate::auth::{hash_password, UserStore};
    use crate::container::{MemoryRuntime, ProcessConfig, RuntimeGateway};
    use crate::daemon::{Daemon, DaemonConfig};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::sync::Arc;

    pub fn state(runtime: Arc<MemoryRuntime>) -> AppState {
        let mut users = UserStore::new();
        for (name, admin) in [("alice", false), ("bob", false), ("root", true)] {
            users.insert(
                Identity::new(name, admin, false),
                hash_password("secret", 4).unwrap(),
            );
        }

        Daemon::with_gateway(DaemonConfig::default(), runtime, users)
            .unwrap()
            .state()
            .clone()
    }

    /// Bare base64 credentials
    pub fn credentials(user: &str) -> String {
        STANDARD.encode(format!("{}:secret", user))
    }

    pub async fn container(runtime: &MemoryRuntime, name: &str, owner: &str) -> String {
        runtime.pull_image("nginx:latest").await.unwrap();
        let mut config = ProcessConfig {
            image: "nginx".to_string(),
            ..Default::default()
        };
        config.labels.insert("owner".to_string(), owner.to_string());

        let host = crate::compose::translate::build_host_config(&Default::default());
        runtime
            .create_container(name, &config, &host, &Default::default())
            .await
            .unwrap()
    }

    pub fn texts(messages: &[Message]) -> Vec<&str> {
        messages
            .iter()
            .filter_map(|message| match message {
                Message::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn close_code(messages: &[Message]) -> Option<u16> {
        match messages.last() {
            Some(Message::Close(Some(frame))) => Some(frame.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryRuntime;
    use axum::http::HeaderValue;
    use futures::channel::mpsc;
    use std::convert::Infallible;
    use std::sync::Arc;

    #[test]
    fn test_request_origin() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_origin(&headers), "");

        headers.insert(HOST, HeaderValue::from_static("dashboard.example.org"));
        assert_eq!(request_origin(&headers), "dashboard.example.org");

        headers.insert(ORIGIN, HeaderValue::from_static("https://evil.example.org"));
        assert_eq!(request_origin(&headers), "evil.example.org");
    }

    #[test]
    fn test_authorization_value() {
        assert_eq!(authorization_value("YWxpY2U6c2VjcmV0"), "Basic YWxpY2U6c2VjcmV0");
        assert_eq!(
            authorization_value(" Basic YWxpY2U6c2VjcmV0\n"),
            "Basic YWxpY2U6c2VjcmV0"
        );
    }

    #[tokio::test]
    async fn test_handshake_credentials() {
        let state = fixtures::state(Arc::new(MemoryRuntime::new()));
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static("http://dashboard.local"));

        let credentials = Credentials::from_handshake(&state, &headers).await.unwrap();
        assert!(matches!(credentials, Credentials::FirstMessage));

        let header = format!("Basic {}", fixtures::credentials("alice"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&header).unwrap());
        let credentials = Credentials::from_handshake(&state, &headers).await.unwrap();
        assert!(matches!(credentials, Credentials::Verified(identity) if identity.username == "alice"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Ym9iOndyb25n"));
        let err = Credentials::from_handshake(&state, &headers).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        headers.insert(ORIGIN, HeaderValue::from_static("https://evil.example.org"));
        let err = Credentials::from_handshake(&state, &headers).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_identify_from_first_message() {
        let state = fixtures::state(Arc::new(MemoryRuntime::new()));

        let (sender, receiver) = mpsc::unbounded();
        let mut incoming = receiver.map(Ok::<Message, Infallible>);
        sender
            .unbounded_send(Message::Text(fixtures::credentials("bob").into()))
            .unwrap();
        let identity = Credentials::FirstMessage
            .identify(&state, &mut incoming)
            .await
            .unwrap();
        assert_eq!(identity.username, "bob");

        sender
            .unbounded_send(Message::Text("Basic Ym9iOndyb25n".into()))
            .unwrap();
        let err = Credentials::FirstMessage
            .identify(&state, &mut incoming)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        drop(sender);
        let err = Credentials::FirstMessage
            .identify(&state, &mut incoming)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_times_out() {
        let state = fixtures::state(Arc::new(MemoryRuntime::new()));
        let (_sender, receiver) = mpsc::unbounded::<Message>();
        let mut incoming = receiver.map(Ok::<Message, Infallible>);

        let err = Credentials::FirstMessage
            .identify(&state, &mut incoming)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No credentials received"));
    }
}
