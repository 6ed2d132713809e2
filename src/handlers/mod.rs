mod health;
mod metrics;
mod webhook;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use webhook::{SECRET_HEADER, webhook_handler};

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/telegram/webhook", post(webhook_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
