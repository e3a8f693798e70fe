//! Application service layer: the API-facing entry points of the
//! settlement pipeline.
//!
//! The service validates and persists requests, moves transactions
//! through the verification gate, and hands accepted work to the
//! settlement queue. It never talks to a chain or an exchange itself.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, BalanceResponse, ChainRpcClient, DatabaseError, ExchangeCallbackRequest,
    ExchangeOutcome, HealthResponse, HealthStatus, LedgerStore, MetadataStore, SettlementJob,
    StatusWrite, SubmitWithdrawalRequest, Transaction, TransactionStatus, ValidationError,
};

use super::queue::SettlementQueue;

/// Chain the health endpoint pings when none is configured
const DEFAULT_HEALTH_CHAIN: &str = "ETH";

/// API-facing settlement service.
pub struct SettlementService {
    store: Arc<dyn LedgerStore>,
    metadata: Arc<dyn MetadataStore>,
    chain_rpc: Arc<dyn ChainRpcClient>,
    queue: SettlementQueue,
    /// Chain used for the RPC half of the health check
    health_chain: String,
}

impl SettlementService {
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        metadata: Arc<dyn MetadataStore>,
        chain_rpc: Arc<dyn ChainRpcClient>,
        queue: SettlementQueue,
    ) -> Self {
        Self {
            store,
            metadata,
            chain_rpc,
            queue,
            health_chain: DEFAULT_HEALTH_CHAIN.to_string(),
        }
    }

    /// Override the chain pinged by the health check (builder pattern)
    #[must_use]
    pub fn with_health_chain(mut self, chain: impl Into<String>) -> Self {
        self.health_chain = chain.into();
        self
    }

    /// Create a withdrawal transaction in status `Created`.
    ///
    /// Validates the request, resolves chain/currency metadata, applies
    /// the configured fee and per-transaction cap, and checks the
    /// customer's ledger balance covers amount plus fee. No settlement
    /// work starts until the transaction is accepted.
    #[instrument(skip(self, request), fields(customer = %request.customer_id, currency = %request.currency, chain = %request.chain))]
    pub async fn submit_withdrawal(
        &self,
        request: &SubmitWithdrawalRequest,
    ) -> Result<Transaction, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        if request.amount <= Decimal::ZERO {
            return Err(invalid_field("amount", "Amount must be positive"));
        }

        let chain = self
            .metadata
            .chain_by_code(&request.chain)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| invalid_field("chain", "Unknown or inactive chain"))?;

        let currency = self
            .metadata
            .currency_by_code(&request.currency)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| invalid_field("currency", "Unknown or inactive currency"))?;

        let attr = self
            .metadata
            .currency_attr(&currency.code, &chain.code)
            .await?
            .ok_or_else(|| {
                invalid_field("currency", "Currency is not withdrawable on this chain")
            })?;

        if let Some(max) = attr.max_per_tx {
            if request.amount > max {
                return Err(invalid_field(
                    "amount",
                    &format!("Amount exceeds the per-transaction limit of {}", max),
                ));
            }
        }

        // Rolling 24-hour cap; canceled and failed rows do not count.
        if let Some(limit) = attr.daily_limit {
            let since = chrono::Utc::now() - chrono::Duration::hours(24);
            let used = self
                .store
                .withdrawn_since(&request.customer_id, &currency.code, since)
                .await?;
            if used + request.amount > limit {
                warn!(used = %used, requested = %request.amount, limit = %limit, "Daily withdrawal limit exceeded");
                return Err(invalid_field(
                    "amount",
                    &format!("Amount exceeds the rolling daily limit of {}", limit),
                ));
            }
        }

        let balance = self
            .store
            .balance(&request.customer_id, &currency.code)
            .await?;
        if request.amount + attr.fee > balance {
            warn!(balance = %balance, requested = %request.amount, fee = %attr.fee, "Insufficient balance");
            return Err(invalid_field(
                "amount",
                "Insufficient balance for amount plus fee",
            ));
        }

        let transaction = self.store.insert_withdrawal(request, attr.fee).await?;
        info!(id = %transaction.id, "Withdrawal created, awaiting acceptance");

        Ok(transaction)
    }

    /// Accept a created withdrawal and queue it for settlement.
    ///
    /// The out-of-band verification gate: only `Created` transactions
    /// are eligible. The status write and the enqueue are ordered so a
    /// crash between them is recovered by the reaper.
    #[instrument(skip(self))]
    pub async fn accept_withdrawal(&self, id: &str) -> Result<Transaction, AppError> {
        let write = self
            .store
            .update_status(
                id,
                TransactionStatus::Created,
                TransactionStatus::Accepted,
                &Default::default(),
            )
            .await?;
        if write == StatusWrite::Conflict {
            return Err(invalid_field(
                "status",
                "Transaction is not awaiting acceptance",
            ));
        }

        self.queue.enqueue(SettlementJob::SubmitWithdrawal {
            transaction_id: id.to_string(),
            retry: false,
            attempts: 0,
        });
        info!(id = %id, "Withdrawal accepted and queued for settlement");

        self.require_transaction(id).await
    }

    /// Cancel a withdrawal that has not entered settlement.
    #[instrument(skip(self))]
    pub async fn cancel_withdrawal(&self, id: &str) -> Result<Transaction, AppError> {
        let write = self.store.cancel_transaction(id).await?;
        if write == StatusWrite::Conflict {
            return Err(invalid_field(
                "status",
                "Transaction can no longer be canceled",
            ));
        }
        info!(id = %id, "Withdrawal canceled");

        self.require_transaction(id).await
    }

    /// Get a transaction by ID
    #[instrument(skip(self))]
    pub async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>, AppError> {
        self.store.transaction_by_id(id).await
    }

    /// Current ledger balance for a customer and currency.
    #[instrument(skip(self))]
    pub async fn get_balance(
        &self,
        customer_id: &str,
        currency: &str,
    ) -> Result<BalanceResponse, AppError> {
        let balance = self.store.balance(customer_id, currency).await?;
        Ok(BalanceResponse {
            customer_id: customer_id.to_string(),
            currency: currency.to_string(),
            balance,
        })
    }

    /// Settle an exchange-routed withdrawal from a venue callback.
    ///
    /// Venues report the terminal outcome asynchronously; the callback
    /// carries the ledger transaction id as the remark. Only
    /// `Processing` transactions with a recorded order reference are
    /// eligible, and a mismatched `order_ref` is rejected.
    #[instrument(skip(self, callback), fields(id = %callback.transaction_id, outcome = ?callback.outcome))]
    pub async fn process_exchange_callback(
        &self,
        callback: &ExchangeCallbackRequest,
    ) -> Result<Transaction, AppError> {
        callback.validate().map_err(|e| {
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        let transaction = self.require_transaction(&callback.transaction_id).await?;

        if transaction.status != TransactionStatus::Processing {
            warn!(status = %transaction.status, "Callback for a transaction not in flight");
            return Err(invalid_field("status", "Transaction is not in flight"));
        }
        match (&transaction.order_ref, &callback.order_ref) {
            (Some(persisted), Some(reported)) if persisted != reported => {
                warn!(persisted = %persisted, reported = %reported, "Callback order reference mismatch");
                return Err(invalid_field("order_ref", "Order reference mismatch"));
            }
            (None, _) => {
                return Err(invalid_field(
                    "order_ref",
                    "Transaction has no exchange order on record",
                ));
            }
            _ => {}
        }

        match callback.outcome {
            ExchangeOutcome::Completed => {
                let write = self
                    .store
                    .complete_withdrawal(&transaction.id, callback.tx_hash.as_deref(), None)
                    .await?;
                if write == StatusWrite::Conflict {
                    return Err(invalid_field("status", "Transaction is not in flight"));
                }
                info!(id = %transaction.id, "Exchange withdrawal completed");
            }
            ExchangeOutcome::Failed => {
                let reason = callback.reason.as_deref().unwrap_or("Rejected by venue");
                self.store.fail_transaction(&transaction.id, reason).await?;
                warn!(id = %transaction.id, reason = %reason, "Exchange withdrawal failed");
            }
        }

        self.require_transaction(&transaction.id).await
    }

    /// Perform a health check of downstream dependencies
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let db_health = match self.store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let rpc_health = match self.metadata.chain_by_code(&self.health_chain).await {
            Ok(Some(chain)) => match self.chain_rpc.health_check(&chain).await {
                Ok(()) => HealthStatus::Healthy,
                Err(_) => HealthStatus::Unhealthy,
            },
            // No chain provisioned yet: degraded rather than down
            Ok(None) => HealthStatus::Degraded,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(db_health, rpc_health)
    }

    async fn require_transaction(&self, id: &str) -> Result<Transaction, AppError> {
        self.store
            .transaction_by_id(id)
            .await?
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(id.to_string())))
    }
}

fn invalid_field(field: &str, message: &str) -> AppError {
    AppError::Validation(ValidationError::InvalidField {
        field: field.to_string(),
        message: message.to_string(),
    })
}
