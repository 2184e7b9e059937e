//! Container lifecycle events over WebSocket
//!
//! Each message is one engine event as JSON, limited to the containers the
//! user may list.

use super::api::{ApiError, AppState};
use super::socket::{forward, reject, Credentials};
use crate::auth::{label_filters, Identity};
use crate::container::LogStream;
use crate::error::DeckhandError;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{Sink, Stream, StreamExt};
use tracing::info;

/// Upgrade to a WebSocket that follows container events
pub async fn container_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let credentials = Credentials::from_handshake(&state, &headers).await?;

    Ok(ws.on_upgrade(move |socket| {
        let (outgoing, incoming) = socket.split();
        follow_events(state, credentials, outgoing, incoming)
    }))
}

async fn follow_events<Si, St, E>(
    state: AppState,
    credentials: Credentials,
    mut outgoing: Si,
    mut incoming: St,
) where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, E>> + Unpin,
{
    let opened = match credentials.identify(&state, &mut incoming).await {
        Ok(identity) => open_events(&state, &identity)
            .await
            .map(|events| (identity.username, events)),
        Err(e) => Err(e),
    };

    match opened {
        Ok((user, events)) => {
            let name = format!("events for {}", user);
            forward(&mut outgoing, &mut incoming, events, &name).await
        }
        Err(e) => reject(&mut outgoing, e).await,
    }
}

/// Event feed for `identity`, serialized for the client
async fn open_events(state: &AppState, identity: &Identity) -> Result<LogStream, ApiError> {
    let events = state
        .gateway
        .events(&label_filters(identity, None))
        .await?;
    info!(user = %identity.username, "Following container events");

    Ok(events
        .map(|event| event.and_then(|event| serde_json::to_string(&event).map_err(DeckhandError::from)))
        .boxed())
}

#[cfg(test)]
mod tests {
    use super::super::socket::fixtures;
    use super::*;
    use crate::container::{MemoryRuntime, RuntimeGateway};
    use axum::extract::ws::close_code;
    use futures::channel::mpsc;
    use serde_json::Value;
    use std::convert::Infallible;
    use std::sync::Arc;

    async fn next_event(feed: &mut LogStream) -> Value {
        let line = feed.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_events_limited_to_owner() {
        let runtime = Arc::new(MemoryRuntime::new());
        let state = fixtures::state(runtime.clone());

        let mut alice = open_events(&state, &Identity::new("alice", false, false))
            .await
            .unwrap();
        let mut root = open_events(&state, &Identity::new("root", true, false))
            .await
            .unwrap();

        fixtures::container(&runtime, "shop_api", "bob").await;
        let id = fixtures::container(&runtime, "blog_web", "alice").await;
        runtime.start_container(&id).await.unwrap();

        let event = next_event(&mut alice).await;
        assert_eq!(event["Action"], "create");
        assert_eq!(event["Actor"]["ID"], id.as_str());
        assert_eq!(event["Actor"]["Attributes"]["name"], "blog_web");
        assert_eq!(next_event(&mut alice).await["Action"], "start");

        let event = next_event(&mut root).await;
        assert_eq!(event["Actor"]["Attributes"]["name"], "shop_api");
    }

    #[tokio::test]
    async fn test_events_refused_without_credentials() {
        let runtime = Arc::new(MemoryRuntime::new());
        let state = fixtures::state(runtime.clone());
        let (outgoing, sent) = mpsc::unbounded();
        let (client, incoming) = mpsc::unbounded();
        client
            .unbounded_send(Message::Text("not credentials".into()))
            .unwrap();

        follow_events(
            state,
            Credentials::FirstMessage,
            outgoing,
            incoming.map(Ok::<Message, Infallible>),
        )
        .await;
        drop(client);

        let sent: Vec<Message> = sent.collect().await;
        assert!(fixtures::texts(&sent).is_empty());
        assert_eq!(fixtures::close_code(&sent), Some(close_code::POLICY));
    }
}
