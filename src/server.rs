// HTTP API - axum routes in front of the orchestrator

use crate::orchestration::types::{AgentInfo, AggregateResponse, RouteRequest, RouterEvent};
use crate::orchestration::{ClassificationError, Orchestrator, OrchestratorError};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub type SharedState = Arc<Orchestrator>;

/// Body accepted by `POST /route`. A missing or empty `id` gets a fresh one.
#[derive(Debug, Deserialize)]
pub struct RouteBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub request_type: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RouteBody {
    fn into_request(self) -> Result<RouteRequest, ApiError> {
        let mut request = RouteRequest::new(self.request_type, self.content);
        if request.request_type.is_empty() {
            return Err(ApiError::BadRequest("request type must not be empty".to_string()));
        }
        if let Some(id) = self.id.filter(|id| !id.trim().is_empty()) {
            request = request.with_id(id);
        }
        request.metadata = self.metadata;
        Ok(request)
    }
}

pub fn router(orchestrator: SharedState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/agents", get(agents_handler))
        .route("/route", post(route_handler))
        .route("/ws", get(ws_handler))
        .with_state(orchestrator)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn root_handler(State(orchestrator): State<SharedState>) -> Json<Value> {
    let agents: Vec<String> = orchestrator.registry().list().into_iter().map(|e| e.id).collect();
    Json(json!({
        "service": "moe-router",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "healthy",
        "agents": agents,
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn agents_handler(State(orchestrator): State<SharedState>) -> Json<BTreeMap<String, AgentInfo>> {
    let agents = orchestrator
        .registry()
        .snapshot()
        .experts()
        .iter()
        .map(|expert| (expert.id.clone(), AgentInfo::from(expert)))
        .collect();
    Json(agents)
}

async fn route_handler(
    State(orchestrator): State<SharedState>,
    payload: Result<Json<RouteBody>, JsonRejection>,
) -> Result<Json<AggregateResponse>, ApiError> {
    let Json(body) = payload?;
    let request = body.into_request()?;
    let response = orchestrator.process(request).await?;
    Ok(Json(response))
}

async fn ws_handler(ws: WebSocketUpgrade, State(orchestrator): State<SharedState>) -> Response {
    let events = orchestrator.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

/// Forwards router events to one client until either side goes away.
/// Any text frame from the client is answered with a `pong`.
async fn stream_events(mut socket: WebSocket, mut events: broadcast::Receiver<RouterEvent>) {
    tracing::debug!("WebSocket client connected");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("Failed to encode {} event: {}", event.event_type, e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("WebSocket client lagging, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(_))) => {
                    if socket.send(Message::Text(pong().into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // ping frames are answered by axum
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("WebSocket client disconnected");
}

fn pong() -> String {
    json!({
        "type": "pong",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Malformed(#[from] JsonRejection),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Malformed(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(OrchestratorError::Classification(ClassificationError::UnknownType(_))) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Orchestrator(OrchestratorError::Classification(ClassificationError::NoEligibleExpert(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Orchestrator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let message = match &self {
            ApiError::Malformed(rejection) => rejection.body_text(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": true, "message": message }))).into_response()
    }
}
