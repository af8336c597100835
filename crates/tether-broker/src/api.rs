//! HTTP and WebSocket handlers
//!
//! Directory routes map [`DirectoryError`] onto status codes; the `/socket`
//! route upgrades to a WebSocket session driven by the [`SignalingRelay`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use tether_core::{DirectoryError, ErrorCode};

use crate::directory::{ClaimRequest, Directory};
use crate::messages::ClientEvent;
use crate::relay::SignalingRelay;
use crate::session::SessionId;

/// Shared handler state
#[derive(Clone)]
pub struct BrokerState {
    pub relay: SignalingRelay,
    pub directory: Arc<Directory>,
    /// Prefix applied to directory ids before they reach the store
    pub namespace: Arc<str>,
    /// Take the rate-limit origin from `X-Forwarded-For` (behind a proxy only)
    pub trust_forwarded_for: bool,
}

impl BrokerState {
    fn namespaced(&self, id: &str) -> String {
        format!("{}{}", self.namespace, id.trim())
    }

    fn strip_namespace<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&*self.namespace).unwrap_or(key)
    }

    /// Report ids the way the client sent them
    fn public_error(&self, e: DirectoryError) -> ApiError {
        let e = match e {
            DirectoryError::Conflict(id) => {
                DirectoryError::Conflict(self.strip_namespace(&id).to_string())
            }
            DirectoryError::NotFound(id) => {
                DirectoryError::NotFound(self.strip_namespace(&id).to_string())
            }
            other => other,
        };
        ApiError(e)
    }
}

/// Build the broker's router
pub fn router(state: BrokerState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .route("/claim-id", post(claim_id))
        .route("/get-invite/:id", get(get_invite))
        .route("/get-id-by-pubkey/:pubkey", get(get_id_by_pubkey))
        .route("/delete-id", post(delete_id))
        .route("/socket", get(socket))
        .with_state(state)
}

/// Directory error as an HTTP response
#[derive(Debug)]
pub struct ApiError(DirectoryError);

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!("Rejected request body: {}", rejection.body_text());
        Self(DirectoryError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = ErrorCode::from(&self.0);
        let status =
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Storage details stay in the log
        let message = match &self.0 {
            DirectoryError::Storage(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        (
            status,
            Json(json!({ "success": false, "error": code, "message": message })),
        )
            .into_response()
    }
}

async fn liveness() -> &'static str {
    "tether broker is running"
}

async fn health(State(state): State<BrokerState>) -> Json<serde_json::Value> {
    let limiter = state.relay.limiter().stats();
    let entries = match state.directory.len().await {
        Ok(n) => Some(n),
        Err(e) => {
            error!("Health check could not count directory entries: {}", e);
            None
        }
    };

    Json(json!({
        "status": "healthy",
        "sessions": state.relay.session_count(),
        "registered": state.relay.registry().len(),
        "rooms": state.relay.room_count(),
        "relay": state.relay.stats(),
        "rate_limiter": {
            "tracked": limiter.total_tracked,
            "denied": limiter.total_denied,
        },
        "directory_entries": entries,
    }))
}

async fn claim_id(
    State(state): State<BrokerState>,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(mut request) = body?;
    request.custom_id = request
        .custom_id
        .filter(|id| !id.trim().is_empty())
        .map(|id| state.namespaced(&id));

    let record = state
        .directory
        .claim(request)
        .await
        .map_err(|e| state.public_error(e))?;
    Ok(Json(json!({
        "success": true,
        "id": state.strip_namespace(&record.id),
    })))
}

async fn get_invite(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invite = state
        .directory
        .resolve(&state.namespaced(&id))
        .await
        .map_err(|e| state.public_error(e))?;
    Ok(Json(json!({ "fullInviteCode": invite })))
}

async fn get_id_by_pubkey(
    State(state): State<BrokerState>,
    Path(pubkey): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state.directory.find_by_owner(&pubkey).await?;
    Ok(Json(json!({
        "id": state.strip_namespace(&record.id),
        "permanent": record.permanent(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    pub_key: Option<String>,
}

async fn delete_id(
    State(state): State<BrokerState>,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = body?;
    let pub_key = request
        .pub_key
        .ok_or_else(|| DirectoryError::validation("missing pubKey"))?;

    let removed = state.directory.delete_by_owner(&pub_key).await?;
    if removed == 0 {
        return Ok(Json(json!({ "success": true, "message": "No ID found for this key" })));
    }
    Ok(Json(json!({ "success": true })))
}

async fn socket(
    ws: WebSocketUpgrade,
    State(state): State<BrokerState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let origin = origin_address(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.trust_forwarded_for,
    );
    ws.on_upgrade(move |socket| run_session(socket, origin, state.relay))
}

/// Network origin used for rate limiting
///
/// The peer IP, or the first `X-Forwarded-For` hop when the broker sits
/// behind a trusted proxy.
pub fn origin_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    let forwarded = if trust_forwarded_for {
        headers.get("x-forwarded-for")
    } else {
        None
    };

    forwarded
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Drive one WebSocket session until it closes
async fn run_session(socket: WebSocket, origin: String, relay: SignalingRelay) {
    let id = match SessionId::generate() {
        Ok(id) => id,
        Err(e) => {
            error!("Could not allocate session id for {}: {}", origin, e);
            return;
        }
    };

    let (mut session, mut outbox) = relay.connect(id, origin);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!("Session {} opened from {}", session.id, session.origin);

    let writer_id = session.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode event for {}: {}", writer_id, e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error on {}: {:?}", session.id, e);
                break;
            }
        };

        match ClientEvent::from_json(&text) {
            Ok(event) => {
                let kind = event.kind();
                let outcome = relay.handle(&mut session, event);
                debug!("{} from {}: {:?}", kind, session.id, outcome);
            }
            Err(e) => debug!("Ignored malformed frame from {}: {}", session.id, e),
        }
    }

    info!("Session {} closed", session.id);
    relay.disconnect(session);
    writer.abort();
}
