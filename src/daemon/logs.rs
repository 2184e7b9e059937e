//! Container log streaming over WebSocket

use super::api::{ApiError, AppState};
use super::socket::{forward, reject, Credentials};
use crate::container::LogStream;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{Sink, Stream, StreamExt};
use tracing::info;

/// Upgrade to a WebSocket that follows a container's logs
pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let credentials = Credentials::from_handshake(&state, &headers).await?;

    Ok(ws.on_upgrade(move |socket| {
        let (outgoing, incoming) = socket.split();
        follow_logs(state, id, credentials, outgoing, incoming)
    }))
}

async fn follow_logs<Si, St, E>(
    state: AppState,
    id: String,
    credentials: Credentials,
    mut outgoing: Si,
    mut incoming: St,
) where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, E>> + Unpin,
{
    match open_logs(&state, credentials, &mut incoming, &id).await {
        Ok((container, lines)) => forward(&mut outgoing, &mut incoming, lines, &container).await,
        Err(e) => reject(&mut outgoing, e).await,
    }
}

async fn open_logs<St, E>(
    state: &AppState,
    credentials: Credentials,
    incoming: &mut St,
    id: &str,
) -> Result<(String, LogStream), ApiError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
{
    let identity = credentials.identify(state, incoming).await?;
    let details = state.authorized_container(&identity, id).await?;
    let lines = state.gateway.stream_logs(&details.id).await?;

    info!(user = %identity.username, container = %details.name(), "Following logs");
    Ok((details.name().to_string(), lines))
}

#[cfg(test)]
mod tests {
    use super::super::socket::fixtures;
    use super::*;
    use crate::auth::Identity;
    use crate::container::{MemoryRuntime, RuntimeGateway};
    use axum::extract::ws::close_code;
    use futures::channel::mpsc;
    use std::convert::Infallible;
    use std::sync::Arc;

    /// Run a log session fed with `first`, returning what the client got
    async fn session(
        runtime: &Arc<MemoryRuntime>,
        credentials: Credentials,
        first: Option<String>,
    ) -> Vec<Message> {
        let state = fixtures::state(runtime.clone());
        let (outgoing, sent) = mpsc::unbounded();
        let (client, incoming) = mpsc::unbounded();
        if let Some(first) = first {
            client.unbounded_send(Message::Text(first.into())).unwrap();
        }

        follow_logs(
            state,
            "blog_web".to_string(),
            credentials,
            outgoing,
            incoming.map(Ok::<Message, Infallible>),
        )
        .await;

        // The client stays connected for the whole session
        drop(client);
        sent.collect().await
    }

    async fn blog_web(runtime: &MemoryRuntime) {
        fixtures::container(runtime, "blog_web", "alice").await;
        runtime.append_log("blog_web", "first").unwrap();
        runtime.append_log("blog_web", "second").unwrap();
    }

    #[tokio::test]
    async fn test_logs_after_first_message() {
        let runtime = Arc::new(MemoryRuntime::new());
        blog_web(&runtime).await;

        for first in [
            fixtures::credentials("alice"),
            format!("Basic {}", fixtures::credentials("alice")),
        ] {
            let sent = session(&runtime, Credentials::FirstMessage, Some(first)).await;

            assert_eq!(fixtures::texts(&sent), vec!["first", "second"]);
            assert!(matches!(sent.last(), Some(Message::Close(None))));
        }
    }

    #[tokio::test]
    async fn test_logs_with_header_credentials() {
        let runtime = Arc::new(MemoryRuntime::new());
        blog_web(&runtime).await;

        let alice = Identity::new("alice", false, false);
        let sent = session(&runtime, Credentials::Verified(alice), None).await;
        assert_eq!(fixtures::texts(&sent), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_logs_refused() {
        let runtime = Arc::new(MemoryRuntime::new());
        blog_web(&runtime).await;

        let wrong = "Basic Ym9iOndyb25n".to_string();
        let sent = session(&runtime, Credentials::FirstMessage, Some(wrong)).await;
        assert!(fixtures::texts(&sent).is_empty());
        assert_eq!(fixtures::close_code(&sent), Some(close_code::POLICY));

        let bob = fixtures::credentials("bob");
        let sent = session(&runtime, Credentials::FirstMessage, Some(bob)).await;
        assert!(fixtures::texts(&sent).is_empty());
        assert_eq!(fixtures::close_code(&sent), Some(close_code::POLICY));

        let root = Identity::new("root", true, false);
        runtime
            .remove_container("blog_web", Default::default())
            .await
            .unwrap();
        let sent = session(&runtime, Credentials::Verified(root), None).await;
        assert_eq!(fixtures::close_code(&sent), Some(close_code::NORMAL));
    }
}
