use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::queue::InboundEvent;
use crate::shared::models::{ConversationMessage, Ticket};
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TicketWithMessages {
    pub ticket: Ticket,
    pub messages: Vec<ConversationMessage>,
}

/// Read-only status projection plus the event ingress used by the embedded
/// queue configuration.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/tickets", get(list_tickets))
        .route("/tickets/:id", get(get_ticket))
        .with_state(state)
}

async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InboundEvent>,
) -> Result<StatusCode, (StatusCode, String)> {
    if event.identifier.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "identifier is required".to_string()));
    }
    if event.channel_message_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "channel_message_id is required".to_string(),
        ));
    }
    state.queue.publish(event).await;
    Ok(StatusCode::ACCEPTED)
}

async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Ticket>>, (StatusCode, String)> {
    let tickets = state
        .store
        .list_tickets(query.status.as_deref())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(tickets))
}

async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TicketWithMessages>, (StatusCode, String)> {
    let ticket = state
        .store
        .get_ticket(id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, format!("ticket {id} not found")))?;

    let messages = state
        .store
        .conversation_messages(ticket.conversation_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(TicketWithMessages { ticket, messages }))
}
