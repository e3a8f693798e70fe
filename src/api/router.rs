//! Axum router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;

use super::handlers::{
    ApiDoc, accept_withdrawal_handler, cancel_withdrawal_handler, exchange_callback_handler,
    get_balance_handler, get_transaction_handler, health_check_handler, liveness_handler,
    readiness_handler, submit_withdrawal_handler,
};

/// Request handling timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the application router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/withdrawals", post(submit_withdrawal_handler))
        .route("/withdrawals/{id}/accept", post(accept_withdrawal_handler))
        .route("/withdrawals/{id}/cancel", post(cancel_withdrawal_handler))
        .route("/transactions/{id}", get(get_transaction_handler))
        .route(
            "/balances/{customer_id}/{currency}",
            get(get_balance_handler),
        )
        .route("/callbacks/exchange", post(exchange_callback_handler))
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
