//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::info;
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    AppError, BalanceResponse, ChainError, DatabaseError, ErrorDetail, ErrorResponse,
    ExchangeCallbackRequest, ExchangeError, HealthResponse, HealthStatus, SubmitWithdrawalRequest,
    Transaction,
};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Custody Settlement API",
        version = "0.1.0",
        description = "API for creating and tracking custodial withdrawal settlements",
        license(
            name = "MIT"
        )
    ),
    paths(
        submit_withdrawal_handler,
        accept_withdrawal_handler,
        cancel_withdrawal_handler,
        get_transaction_handler,
        get_balance_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
    ),
    components(
        schemas(
            Transaction,
            SubmitWithdrawalRequest,
            ExchangeCallbackRequest,
            crate::domain::TransactionStatus,
            crate::domain::TxAction,
            BalanceResponse,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
        )
    ),
    tags(
        (name = "withdrawals", description = "Withdrawal lifecycle endpoints"),
        (name = "ledger", description = "Transaction and balance queries"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Create a withdrawal transaction
///
/// Validates the request against chain/currency metadata and the
/// customer's ledger balance, then records the withdrawal in status
/// `created`. Settlement does not start until the transaction is
/// accepted via `POST /withdrawals/{id}/accept`.
#[utoipa::path(
    post,
    path = "/withdrawals",
    tag = "withdrawals",
    request_body = SubmitWithdrawalRequest,
    responses(
        (status = 200, description = "Withdrawal created, awaiting acceptance", body = Transaction),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse),
        (status = 503, description = "Service unavailable", body = ErrorResponse)
    )
)]
pub async fn submit_withdrawal_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitWithdrawalRequest>,
) -> Result<Json<Transaction>, AppError> {
    let transaction = state.service.submit_withdrawal(&payload).await?;
    Ok(Json(transaction))
}

/// Accept a withdrawal for settlement
///
/// The out-of-band verification gate: moves a `created` withdrawal to
/// `accepted` and queues it for the settlement workers. Poll
/// `GET /transactions/{id}` to track progression:
/// - `accepted` → queued for a worker
/// - `processing` → submission in flight or awaiting confirmations
/// - `completed` → settled and reflected in the balance
#[utoipa::path(
    post,
    path = "/withdrawals/{id}/accept",
    tag = "withdrawals",
    params(
        ("id" = String, Path, description = "Transaction ID")
    ),
    responses(
        (status = 200, description = "Withdrawal accepted and queued", body = Transaction),
        (status = 400, description = "Transaction is not awaiting acceptance", body = ErrorResponse),
        (status = 404, description = "Transaction not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn accept_withdrawal_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, AppError> {
    let transaction = state.service.accept_withdrawal(&id).await?;
    Ok(Json(transaction))
}

/// Cancel a withdrawal before settlement starts
#[utoipa::path(
    post,
    path = "/withdrawals/{id}/cancel",
    tag = "withdrawals",
    params(
        ("id" = String, Path, description = "Transaction ID")
    ),
    responses(
        (status = 200, description = "Withdrawal canceled", body = Transaction),
        (status = 400, description = "Transaction can no longer be canceled", body = ErrorResponse),
        (status = 404, description = "Transaction not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn cancel_withdrawal_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, AppError> {
    let transaction = state.service.cancel_withdrawal(&id).await?;
    Ok(Json(transaction))
}

/// Get a single transaction by ID
#[utoipa::path(
    get,
    path = "/transactions/{id}",
    tag = "ledger",
    params(
        ("id" = String, Path, description = "Transaction ID")
    ),
    responses(
        (status = 200, description = "Transaction found", body = Transaction),
        (status = 404, description = "Transaction not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_transaction_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, AppError> {
    let transaction = state
        .service
        .get_transaction(&id)
        .await?
        .ok_or(AppError::Database(DatabaseError::NotFound(id)))?;
    Ok(Json(transaction))
}

/// Get the current ledger balance for a customer and currency
#[utoipa::path(
    get,
    path = "/balances/{customer_id}/{currency}",
    tag = "ledger",
    params(
        ("customer_id" = String, Path, description = "Customer ID"),
        ("currency" = String, Path, description = "Currency code")
    ),
    responses(
        (status = 200, description = "Current balance", body = BalanceResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_balance_handler(
    State(state): State<Arc<AppState>>,
    Path((customer_id, currency)): Path<(String, String)>,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state.service.get_balance(&customer_id, &currency).await?;
    Ok(Json(balance))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Handle exchange venue settlement callbacks
///
/// Receives the terminal outcome of an exchange-routed withdrawal and
/// settles the corresponding transaction. Validates the Authorization
/// header against the configured CALLBACK_SECRET.
pub async fn exchange_callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ExchangeCallbackRequest>,
) -> Result<StatusCode, AppError> {
    // Validate callback secret if configured
    if let Some(expected_secret) = &state.callback_secret {
        let auth_header = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Authentication("Missing Authorization header".to_string()))?;

        if auth_header != expected_secret {
            return Err(AppError::Authentication(
                "Invalid callback secret".to_string(),
            ));
        }
    }

    let transaction = state.service.process_exchange_callback(&payload).await?;
    info!(
        id = %transaction.id,
        status = %transaction.status,
        "Exchange callback processed"
    );

    Ok(StatusCode::OK)
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type, message) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                DatabaseError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                DatabaseError::Duplicate(_) => {
                    (StatusCode::CONFLICT, "duplicate", self.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Chain(chain_err) => match chain_err {
                ChainError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "chain_error",
                    self.to_string(),
                ),
                ChainError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                ChainError::InvalidAddress(_) => (
                    StatusCode::BAD_REQUEST,
                    "invalid_address",
                    self.to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "chain_error",
                    self.to_string(),
                ),
            },
            AppError::Exchange(ex_err) => match ex_err {
                ExchangeError::Unavailable(_) => {
                    (StatusCode::BAD_GATEWAY, "exchange_error", self.to_string())
                }
                ExchangeError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                ExchangeError::Rejected(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "exchange_rejected",
                    self.to_string(),
                ),
            },
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}
