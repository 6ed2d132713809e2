use axum::{Json, extract::State, http::HeaderMap, http::StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::Update;
use crate::state::AppState;

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

// Acknowledge right away, handle the update on its own task
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            warn!(update = update.update_id, "Webhook call with bad secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    debug!(update = update.update_id, "Update received");
    let state = Arc::clone(&state);
    tokio::spawn(async move {
        let handled = state.dispatcher.handle_update(update).await;
        debug!(?handled, "Update handled");
    });

    StatusCode::OK
}
