//! Error definitions for the settlement core.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain RPC error: {0}")]
    Chain(#[from] ChainError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// Drives the unified retry policy: transient failures are re-enqueued,
    /// permanent ones abort the attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(e, DatabaseError::Connection(_)),
            Self::Chain(e) => matches!(
                e,
                ChainError::Connection(_) | ChainError::Submission(_) | ChainError::Timeout(_)
            ),
            Self::Exchange(e) => matches!(
                e,
                ExchangeError::Unavailable(_) | ExchangeError::Timeout(_)
            ),
            Self::Validation(_) | Self::Config(_) | Self::Authentication(_) | Self::Internal(_) => {
                false
            }
        }
    }
}

/// Database-layer errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Self::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Duplicate(db.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Connection(e.to_string()),
            _ => Self::Query(e.to_string()),
        }
    }
}

/// Chain RPC collaborator errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Node unreachable: {0}")]
    Connection(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("RPC protocol error: {0}")]
    Protocol(String),

    /// The transfer executed and failed on-chain. Terminal: resubmitting
    /// the same transfer would double-spend.
    #[error("Transaction reverted: {0}")]
    Reverted(String),
}

/// Custodial exchange collaborator errors
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Withdrawal rejected: {0}")]
    Rejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Request/field validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Validation failed: {0}")]
    Multiple(String),
}

/// Startup configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration value for {0}")]
    Invalid(String),
}
