use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::Method,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::types::UserId;
use courier_store::{ChatSummary, Conversation, StoredMessage};

use crate::config::ServerConfig;
use crate::delivery::{DeliveryEngine, SharedDb};
use crate::error::ServerError;
use crate::gateway::ConnectionHub;
use crate::presence::PresenceRegistry;
use crate::status::StatusPropagator;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedDb,
    pub presence: PresenceRegistry,
    pub hub: ConnectionHub,
    pub delivery: DeliveryEngine,
    pub propagator: StatusPropagator,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(crate::gateway::ws_handler))
        .route("/conversations/{user}/{peer}", get(fetch_conversation))
        .route("/chatlist/{user}", get(chat_list))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instance: String,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResponse {
    conversation: Conversation,
    messages: Vec<StoredMessage>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        instance: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Fetch (or lazily create) the conversation between two users along
/// with its full message log.  Opening a chat clears the viewer's own
/// hide marker.
async fn fetch_conversation(
    State(state): State<AppState>,
    Path((user, peer)): Path<(String, String)>,
) -> Result<Json<ConversationResponse>, ServerError> {
    let user = UserId::new(user);
    let peer = UserId::new(peer);
    if user.is_empty() || peer.is_empty() || user == peer {
        return Err(ServerError::BadRequest(
            "two distinct user ids are required".into(),
        ));
    }

    let db = state.store.lock().await;
    let conversation = db.find_or_create_conversation(&user, &peer)?;
    db.unhide_for_participant(conversation.id, &user)?;
    let messages = db.messages_for_conversation(conversation.id)?;

    Ok(Json(ConversationResponse {
        conversation,
        messages,
    }))
}

/// Chat-list summaries for a user, most recent activity first.
async fn chat_list(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<Vec<ChatSummary>>, ServerError> {
    let user = UserId::new(user);
    if user.is_empty() {
        return Err(ServerError::BadRequest("user id is required".into()));
    }

    let db = state.store.lock().await;
    let summaries = db.chat_list(&user)?;
    Ok(Json(summaries))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP/WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
