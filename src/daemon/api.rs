//! REST API
//!
//! Routes, request authentication and the mapping of errors to HTTP
//! responses.

use super::{events, logs};
use crate::auth::{can_manage, label_filters, Identity, UserStore};
use crate::compose::translate::APP_LABEL;
use crate::compose::ComposeParser;
use crate::container::{ContainerDetails, ContainerSummary, RemoveOptions, RuntimeGateway};
use crate::deploy::{DeployError, Deployer, DeploymentResult};
use crate::error::DeckhandError;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Container engine
    pub gateway: Arc<dyn RuntimeGateway>,
    /// Deployment orchestrator
    pub deployer: Arc<Deployer>,
    /// Known users
    pub users: Arc<UserStore>,
    /// Set once shutdown starts
    pub closing: Arc<AtomicBool>,
    /// Allowed WebSocket origins
    pub ws_origin: Regex,
}

impl AppState {
    /// Whether shutdown has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Authenticate an `Authorization` header value
    pub async fn authenticate(&self, header: Option<String>) -> Result<Identity, ApiError> {
        // bcrypt verification is CPU bound
        let users = Arc::clone(&self.users);
        let identity = tokio::task::spawn_blocking(move || users.authenticate(header.as_deref()))
            .await
            .map_err(|e| DeckhandError::Runtime(format!("Authentication task failed: {}", e)))??;

        Ok(identity)
    }

    /// Inspect a container the user is allowed to manage
    pub async fn authorized_container(
        &self,
        identity: &Identity,
        id: &str,
    ) -> Result<ContainerDetails, ApiError> {
        let details = self.gateway.inspect_container(id).await?;
        if !can_manage(identity, details.labels()) {
            return Err(DeckhandError::Forbidden(format!(
                "{} is not allowed to manage {}",
                identity.username, id
            ))
            .into());
        }
        Ok(details)
    }
}

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Deckhand(#[from] DeckhandError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl ApiError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Deckhand(err) => deckhand_status(err),
            ApiError::Deploy(err) => match err {
                DeployError::DurationParse { .. } | DeployError::InvalidCompose(_) => {
                    StatusCode::BAD_REQUEST
                }
                DeployError::Forbidden { .. } => StatusCode::FORBIDDEN,
                DeployError::InProgress(_) | DeployError::NameConflict { .. } => {
                    StatusCode::CONFLICT
                }
                DeployError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                DeployError::Runtime(inner) => deckhand_status(inner),
                DeployError::Pull { .. }
                | DeployError::Create { .. }
                | DeployError::Start { .. }
                | DeployError::Unhealthy { .. }
                | DeployError::Swap { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

fn deckhand_status(err: &DeckhandError) -> StatusCode {
    match err {
        DeckhandError::ContainerNotFound(_) | DeckhandError::ImageNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DeckhandError::ContainerExists(_) => StatusCode::CONFLICT,
        DeckhandError::ComposeParse(_) | DeckhandError::BadRequest(_) => StatusCode::BAD_REQUEST,
        DeckhandError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        DeckhandError::Forbidden(_) => StatusCode::FORBIDDEN,
        DeckhandError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = %status, error = %self, "Request failed");
        } else {
            debug!(status = %status, error = %self, "Request rejected");
        }

        let body = Json(json!({ "message": self.to_string() }));
        if status == StatusCode::UNAUTHORIZED {
            return (
                status,
                [(WWW_AUTHENTICATE, r#"Basic realm="deckhand", charset="UTF-8""#)],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        state.authenticate(header).await
    }
}

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/containers", get(list_containers))
        .route(
            "/containers/{id}",
            get(inspect_container)
                .post(deploy_app)
                .delete(remove_container),
        )
        .route("/containers/{id}/{action}", post(container_action))
        .route("/services", get(list_services))
        .route("/ws/containers/{id}/logs", get(logs::container_logs))
        .route("/ws/events", get(events::container_events))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> StatusCode {
    if state.is_closing() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.gateway.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Runtime is not answering");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn info(State(state): State<AppState>, _identity: Identity) -> Result<Json<Value>, ApiError> {
    let runtime = state.gateway.info().await?;

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "hostname": gethostname::gethostname().to_string_lossy(),
        "cpus": num_cpus::get(),
        "deployments": state.deployer.tasks().active(),
        "runtime": runtime,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    app: Option<String>,
}

async fn list_containers(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerSummary>>, ApiError> {
    let filters = label_filters(&identity, query.app.as_deref());
    Ok(Json(state.gateway.list_containers(&filters).await?))
}

async fn inspect_container(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<ContainerDetails>, ApiError> {
    Ok(Json(state.authorized_container(&identity, &id).await?))
}

async fn container_action(
    State(state): State<AppState>,
    identity: Identity,
    Path((id, action)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let details = state.authorized_container(&identity, &id).await?;

    match action.as_str() {
        "start" => state.gateway.start_container(&details.id).await?,
        "stop" => state.gateway.stop_container(&details.id).await?,
        "restart" => state.gateway.restart_container(&details.id).await?,
        other => {
            return Err(DeckhandError::BadRequest(format!("Unknown action {}", other)).into())
        }
    }

    info!(user = %identity.username, container = %details.name(), action = %action, "Container action");
    Ok(StatusCode::OK)
}

async fn remove_container(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let details = state.authorized_container(&identity, &id).await?;

    state
        .gateway
        .remove_container(&details.id, RemoveOptions::forced())
        .await?;
    info!(user = %identity.username, container = %details.name(), "Container removed");

    if let Err(e) = state.gateway.remove_image(&details.image).await {
        debug!(image = %details.image, error = %e, "Image kept");
    }

    Ok(StatusCode::OK)
}

async fn deploy_app(
    State(state): State<AppState>,
    identity: Identity,
    Path(app): Path<String>,
    body: String,
) -> Result<Json<DeploymentResult>, ApiError> {
    let compose = ComposeParser::load(&body)?;

    // Registered before the closing check so shutdown either sees this
    // deployment or refuses it
    let guard = state.deployer.register(&app)?;
    if state.is_closing() {
        return Err(ApiError::ShuttingDown);
    }

    // A dropped request must not abandon a half-done deployment
    let deployer = Arc::clone(&state.deployer);
    let result = tokio::spawn(async move {
        deployer
            .deploy_registered(guard, &compose, &identity)
            .await
    })
    .await
    .map_err(|e| DeckhandError::Runtime(format!("Deployment task failed: {}", e)))??;

    Ok(Json(result))
}

async fn list_services(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<BTreeMap<String, Vec<ContainerSummary>>>, ApiError> {
    let containers = state
        .gateway
        .list_containers(&label_filters(&identity, None))
        .await?;

    let mut services: BTreeMap<String, Vec<ContainerSummary>> = BTreeMap::new();
    for container in containers {
        if let Some(app) = container.labels.get(APP_LABEL).cloned() {
            services.entry(app).or_default().push(container);
        }
    }

    Ok(Json(services))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (
                ApiError::from(DeckhandError::ContainerNotFound("x".to_string())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(DeckhandError::Unauthorized("x".to_string())),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::from(DeployError::InProgress("blog".to_string())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(DeployError::DurationParse {
                    field: "interval",
                    message: "invalid duration \"abcd\"".to_string(),
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(DeployError::RuntimeUnavailable("down".to_string())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(DeployError::Unhealthy {
                    container: "blog_web_deploy".to_string(),
                    reason: "health check failed".to_string(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(DeployError::NameConflict {
                    container: "x_y_web".to_string(),
                    owner_app: "x_y".to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (ApiError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, status) in cases {
            assert_eq!(error.status_code(), status, "{}", error);
        }
    }

    #[test]
    fn test_unauthorized_challenge() {
        let response =
            ApiError::from(DeckhandError::Unauthorized("Missing credentials".to_string()))
                .into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));
    }
}
