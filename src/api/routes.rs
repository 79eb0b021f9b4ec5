//! Route Definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::handlers::*;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Auditor endpoints
        .route("/audit", get(audit_handler))
        .route("/stats", get(stats_handler))
        .route("/verify", get(verify_handler))
        // Round lifecycle
        .route("/round/current", get(current_round_handler))
        .route("/round/start", post(start_round_handler))
        .route("/round/call", post(call_next_handler))
        .route("/round/end", post(end_round_handler))
        .route("/round/reset", post(reset_round_handler))
        // Cards
        .route("/cards", post(purchase_card_handler))
        .route("/cards/:id", get(card_handler))
        .route("/cards/:id/shield", post(purchase_shield_handler))
        // Scheduler
        .route("/scheduler", get(scheduler_handler))
        .route("/scheduler/tick", post(tick_handler))
        .with_state(state)
}
