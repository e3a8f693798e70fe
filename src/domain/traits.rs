//! Domain traits defining contracts for external collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::AppError;
use super::types::{
    Blockchain, ChainWallet, Currency, CurrencyAttr, StagedDeposit, SubmitWithdrawalRequest,
    Transaction, TransactionStatus,
};

/// Result of a status-guarded write.
///
/// `Conflict` means the persisted status no longer matched the expected
/// predecessor (a lost race, or a missing row); the caller must abort
/// without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Applied,
    Conflict,
}

/// Optional field updates applied together with a status transition.
///
/// `None` fields keep their persisted value.
#[derive(Debug, Clone, Default)]
pub struct TxUpdate {
    pub tx_hash: Option<String>,
    pub order_ref: Option<String>,
    pub explorer_link: Option<String>,
    pub note: Option<String>,
    /// `Some(..)` overwrites the retry schedule, including `Some(None)`
    /// to clear it
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
}

/// Outcome of a deposit promotion attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Promotion {
    /// A new ledger transaction was created and the balance credited
    Promoted(Transaction),
    /// The staging hash was already in the ledger; no-op
    AlreadyPromoted,
}

/// Ledger persistence: transactions, staged deposits, balances.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    async fn transaction_by_id(&self, id: &str) -> Result<Option<Transaction>, AppError>;

    /// Create a withdrawal transaction in status `Created`
    async fn insert_withdrawal(
        &self,
        request: &SubmitWithdrawalRequest,
        fee: Decimal,
    ) -> Result<Transaction, AppError>;

    /// Atomic conditional status update: applied only when the persisted
    /// status equals `expected`. Single-statement compare-and-swap; never
    /// a separate read plus write.
    async fn update_status(
        &self,
        id: &str,
        expected: TransactionStatus,
        new: TransactionStatus,
        fields: &TxUpdate,
    ) -> Result<StatusWrite, AppError>;

    /// Complete a withdrawal: `Processing -> Completed`, computing
    /// `balance_before`/`balance` from the customer's current ledger
    /// balance in the same database transaction. Sole writer of
    /// withdrawal balance fields. Hash/link are absent for
    /// exchange-routed settlements.
    async fn complete_withdrawal(
        &self,
        id: &str,
        tx_hash: Option<&str>,
        explorer_link: Option<&str>,
    ) -> Result<StatusWrite, AppError>;

    /// Move a non-terminal transaction to `Fail`, recording the reason.
    async fn fail_transaction(&self, id: &str, reason: &str) -> Result<(), AppError>;

    /// Cancel from `Created`/`Accepted` only.
    async fn cancel_transaction(&self, id: &str) -> Result<StatusWrite, AppError>;

    /// Increment the attempt counter and set the next retry time.
    /// Returns the new attempt count.
    async fn record_attempt(
        &self,
        id: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<i32, AppError>;

    /// Claim ownership of a due submission retry in one conditional
    /// write: applied only while the row is `Processing` with no
    /// transaction hash and an elapsed retry deadline, pushing the
    /// deadline to `next_attempt_at`. A conflict means the row was
    /// already submitted, parked, or claimed by a concurrent retry job.
    async fn claim_retry(
        &self,
        id: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<StatusWrite, AppError>;

    /// Current ledger balance: the latest completed transaction's
    /// `balance` for (customer, currency), zero when none exists.
    async fn balance(&self, customer_id: &str, currency: &str) -> Result<Decimal, AppError>;

    /// Sum of withdrawal amounts for (customer, currency) created at or
    /// after `since`, excluding canceled and failed rows. Feeds the
    /// rolling daily withdrawal cap.
    async fn withdrawn_since(
        &self,
        customer_id: &str,
        currency: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, AppError>;

    /// Transactions whose scheduled attempt is overdue (crash recovery
    /// scan; the in-process queue is only a fast path).
    async fn overdue_transactions(&self, limit: i64) -> Result<Vec<Transaction>, AppError>;

    /// Record a deposit observation awaiting promotion.
    async fn insert_staged_deposit(&self, staged: &StagedDeposit)
    -> Result<StagedDeposit, AppError>;

    /// Oldest-first staged deposits still awaiting promotion.
    async fn staged_deposits(&self, limit: i64) -> Result<Vec<StagedDeposit>, AppError>;

    /// Promote a staged deposit into the ledger, exactly once per
    /// transaction hash. Re-invocation with an already-promoted hash is a
    /// no-op (`Promotion::AlreadyPromoted`).
    async fn promote_deposit(&self, staged: &StagedDeposit) -> Result<Promotion, AppError>;
}

/// Read-only chain/currency metadata provisioned by administrators.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn chain_by_code(&self, code: &str) -> Result<Option<Blockchain>, AppError>;

    async fn currency_by_code(&self, code: &str) -> Result<Option<Currency>, AppError>;

    async fn currency_attr(
        &self,
        currency: &str,
        chain: &str,
    ) -> Result<Option<CurrencyAttr>, AppError>;
}

/// Exclusive leases over the shared hot-wallet pool.
#[async_trait]
pub trait WalletPool: Send + Sync {
    /// Claim the first active, unleased wallet for a chain and mark it
    /// leased, atomically. `Ok(None)` when the pool is exhausted: a
    /// retryable condition, not an error.
    async fn acquire(&self, chain: &str) -> Result<Option<ChainWallet>, AppError>;

    /// Clear the lease unconditionally. Must be called on every exit
    /// path of a settlement attempt.
    async fn release(&self, wallet_id: &str) -> Result<(), AppError>;
}

/// Parameters for an on-chain transfer submission.
#[derive(Debug, Clone)]
pub struct ChainTransfer<'a> {
    pub wallet: &'a ChainWallet,
    pub to_address: &'a str,
    /// Amount in the asset's base units (already scaled by decimals)
    pub amount_base_units: u128,
    /// Token contract; `None` transfers the chain's native asset
    pub contract: Option<&'a str>,
}

/// Chain RPC collaborator: submits signed transfers and reports
/// confirmation depth. A black box from the core's perspective.
#[async_trait]
pub trait ChainRpcClient: Send + Sync {
    /// Check node connectivity for a chain
    async fn health_check(&self, chain: &Blockchain) -> Result<(), AppError>;

    /// Submit a transfer from the leased wallet.
    /// Returns the transaction hash on success.
    async fn send_transfer(
        &self,
        chain: &Blockchain,
        transfer: &ChainTransfer<'_>,
    ) -> Result<String, AppError>;

    /// Confirmation depth of a submitted hash; `Ok(None)` while the
    /// transaction is still pending or unknown to the node.
    async fn confirmations(
        &self,
        chain: &Blockchain,
        tx_hash: &str,
    ) -> Result<Option<u64>, AppError>;
}

/// A withdrawal delegated to a custodial exchange.
#[derive(Debug, Clone)]
pub struct ExchangeWithdrawal {
    pub venue: String,
    pub currency: String,
    pub chain: String,
    pub address: String,
    pub tag: Option<String>,
    /// Amount in display units; exchanges take decimal amounts
    pub amount: Decimal,
    /// Idempotency remark: the ledger transaction id
    pub remark: String,
}

/// Custodial exchange withdrawal API. A black box from the core's
/// perspective; the `remark` field carries the idempotency key.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit a withdrawal request. Returns the exchange order id.
    async fn withdraw(&self, request: &ExchangeWithdrawal) -> Result<String, AppError>;
}

/// Fire-and-forget operator notifications. Implementations must never
/// fail the caller; delivery problems are logged and swallowed.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Operator-facing error channel
    async fn error(&self, message: &str);

    /// Withdrawal-specific channel
    async fn withdrawal(&self, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_update_default_keeps_everything() {
        let update = TxUpdate::default();
        assert!(update.tx_hash.is_none());
        assert!(update.order_ref.is_none());
        assert!(update.explorer_link.is_none());
        assert!(update.note.is_none());
        assert!(update.next_attempt_at.is_none());
    }

    #[test]
    fn test_status_write_equality() {
        assert_eq!(StatusWrite::Applied, StatusWrite::Applied);
        assert_ne!(StatusWrite::Applied, StatusWrite::Conflict);
    }
}
