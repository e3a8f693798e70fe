//! Withdrawal orchestrator: the state-driven controller that takes an
//! accepted withdrawal to a submitted transfer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use crate::domain::{
    AlertSink, AppError, Blockchain, ChainRpcClient, ChainTransfer, CurrencyAttr, ExchangeClient,
    ExchangeWithdrawal, LedgerStore, MetadataStore, SettlementJob, StatusWrite, Transaction,
    TransactionStatus, TxUpdate, ValidationError, WalletPool,
};

use super::queue::SettlementQueue;

/// Orchestrator tuning knobs; one explicit struct, no process-wide state.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backoff after wallet-pool exhaustion or missing metadata
    pub wallet_retry_delay: Duration,
    /// Backoff after a failed submission
    pub submit_retry_delay: Duration,
    /// Submission failures tolerated before the transaction fails
    pub max_attempts: i32,
    /// Consecutive wallet/metadata misses before the operator is alerted
    pub exhaustion_alert_threshold: u32,
    /// How long the reaper waits before considering a watch handoff lost
    pub watch_stale_after: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            wallet_retry_delay: Duration::from_secs(60),
            submit_retry_delay: Duration::from_secs(60),
            max_attempts: 10,
            exhaustion_alert_threshold: 5,
            watch_stale_after: Duration::from_secs(180),
        }
    }
}

/// Drives one withdrawal transaction per job through wallet allocation,
/// route selection, and submission. Never submits two live transfers for
/// one transaction id: transitions go through status-guarded writes, and
/// the job's `retry` flag distinguishes resume-after-exhaustion (row
/// still `Accepted`) from resume-after-failure (row already `Processing`).
pub struct WithdrawalOrchestrator {
    store: Arc<dyn LedgerStore>,
    meta: Arc<dyn MetadataStore>,
    wallets: Arc<dyn WalletPool>,
    chain_rpc: Arc<dyn ChainRpcClient>,
    exchange: Arc<dyn ExchangeClient>,
    alerts: Arc<dyn AlertSink>,
    queue: SettlementQueue,
    config: OrchestratorConfig,
}

impl WithdrawalOrchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        meta: Arc<dyn MetadataStore>,
        wallets: Arc<dyn WalletPool>,
        chain_rpc: Arc<dyn ChainRpcClient>,
        exchange: Arc<dyn ExchangeClient>,
        alerts: Arc<dyn AlertSink>,
        queue: SettlementQueue,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            meta,
            wallets,
            chain_rpc,
            exchange,
            alerts,
            queue,
            config,
        }
    }

    /// Process one `SubmitWithdrawal` job.
    #[instrument(skip(self), fields(id = %transaction_id, retry = retry))]
    pub async fn run(
        &self,
        transaction_id: &str,
        retry: bool,
        attempts: u32,
    ) -> Result<(), AppError> {
        let Some(tx) = self.store.transaction_by_id(transaction_id).await? else {
            warn!("Withdrawal job references unknown transaction");
            return Ok(());
        };

        // Stale-job guard: a fresh job expects Accepted, a submission
        // retry expects Processing. Anything else lost a race (completed,
        // canceled, or picked up elsewhere) and the job is a no-op.
        let expected = if retry {
            TransactionStatus::Processing
        } else {
            TransactionStatus::Accepted
        };
        if tx.status != expected {
            info!(status = %tx.status, "Skipping stale withdrawal job");
            return Ok(());
        }

        // A retry job must win the row before resubmitting: the reaper
        // and the delayed in-process job can both fire for the same
        // deadline. The claim pushes next_attempt_at forward in one
        // conditional write, so the loser sees a conflict and drops out.
        // Rows that already carry a hash belong to the watch path.
        if retry {
            if tx.tx_hash.is_some() {
                info!("Withdrawal already submitted; dropping retry job");
                return Ok(());
            }
            let delay = chrono::Duration::from_std(self.config.submit_retry_delay)
                .unwrap_or(chrono::Duration::seconds(60));
            let claimed = self
                .store
                .claim_retry(transaction_id, Utc::now() + delay)
                .await?;
            if claimed == StatusWrite::Conflict {
                info!("Retry not due or claimed elsewhere; dropping job");
                return Ok(());
            }
        }

        let Some((chain, attr)) = self.resolve_metadata(&tx).await? else {
            self.reschedule_for_metadata(&tx, expected, retry, attempts)
                .await?;
            return Ok(());
        };

        match attr.route.clone() {
            crate::domain::WithdrawRoute::OnChain => {
                self.settle_on_chain(&tx, &chain, &attr, expected, retry, attempts)
                    .await
            }
            crate::domain::WithdrawRoute::Exchange(venue) => {
                self.settle_via_exchange(&tx, &attr, venue, expected)
                    .await
            }
        }
    }

    /// Resolve chain, currency and per-chain attribute; `None` when any
    /// piece is not (yet) provisioned.
    async fn resolve_metadata(
        &self,
        tx: &Transaction,
    ) -> Result<Option<(Blockchain, CurrencyAttr)>, AppError> {
        let chain = self.meta.chain_by_code(&tx.chain).await?;
        let currency = self.meta.currency_by_code(&tx.currency).await?;
        let (Some(chain), Some(_currency)) = (chain, currency) else {
            return Ok(None);
        };
        let Some(attr) = self.meta.currency_attr(&tx.currency, &tx.chain).await? else {
            return Ok(None);
        };
        Ok(Some((chain, attr)))
    }

    /// Missing metadata is usually late provisioning; retry on the same
    /// fixed backoff as pool exhaustion instead of dropping the
    /// withdrawal, alerting once the miss streak passes the threshold.
    async fn reschedule_for_metadata(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
        retry: bool,
        attempts: u32,
    ) -> Result<(), AppError> {
        let misses = attempts.saturating_add(1);
        warn!(
            currency = %tx.currency,
            chain = %tx.chain,
            misses = misses,
            "Chain/currency metadata not provisioned; rescheduling withdrawal"
        );
        if misses == self.config.exhaustion_alert_threshold {
            self.alerts
                .error(&format!(
                    "Withdrawal {} stalled: no metadata for {}/{} after {} checks",
                    tx.id, tx.currency, tx.chain, misses
                ))
                .await;
        }
        self.schedule_recheck(&tx.id, expected, retry, misses).await
    }

    /// Persist the retry deadline (for the reaper) and re-enqueue the
    /// same job after the fixed backoff.
    async fn schedule_recheck(
        &self,
        id: &str,
        expected: TransactionStatus,
        retry: bool,
        attempts: u32,
    ) -> Result<(), AppError> {
        let delay = self.config.wallet_retry_delay;
        let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
        let fields = TxUpdate {
            next_attempt_at: Some(Some(due)),
            ..TxUpdate::default()
        };
        // CAS onto the same status; a conflict means the row moved on
        // and the job is obsolete.
        if self.store.update_status(id, expected, expected, &fields).await? == StatusWrite::Conflict
        {
            info!(id = %id, "Transaction moved on while rescheduling; dropping job");
            return Ok(());
        }
        self.queue.enqueue_after(
            SettlementJob::SubmitWithdrawal {
                transaction_id: id.to_string(),
                retry,
                attempts,
            },
            delay,
        );
        Ok(())
    }

    async fn settle_on_chain(
        &self,
        tx: &Transaction,
        chain: &Blockchain,
        attr: &CurrencyAttr,
        expected: TransactionStatus,
        retry: bool,
        attempts: u32,
    ) -> Result<(), AppError> {
        let Some(wallet) = self.wallets.acquire(&tx.chain).await? else {
            let misses = attempts.saturating_add(1);
            warn!(chain = %tx.chain, misses = misses, "Hot wallet pool exhausted; rescheduling");
            if misses == self.config.exhaustion_alert_threshold {
                self.alerts
                    .withdrawal(&format!(
                        "Withdrawal {} waiting on wallet pool for chain {} ({} misses)",
                        tx.id, tx.chain, misses
                    ))
                    .await;
            }
            return self.schedule_recheck(&tx.id, expected, retry, misses).await;
        };

        // Claim the transaction before spending from the wallet. A fresh
        // job moves Accepted -> Processing here; a retry was already
        // Processing when loaded.
        if !retry {
            let claimed = self
                .store
                .update_status(
                    &tx.id,
                    TransactionStatus::Accepted,
                    TransactionStatus::Processing,
                    &TxUpdate::default(),
                )
                .await;
            match claimed {
                Ok(StatusWrite::Applied) => {}
                Ok(StatusWrite::Conflict) => {
                    warn!(id = %tx.id, "Lost claim race; releasing wallet");
                    self.wallets.release(&wallet.id).await?;
                    return Ok(());
                }
                Err(e) => {
                    // The lease is in-memory only; give it back before
                    // surfacing the store error or the wallet stays
                    // parked until restart.
                    if let Err(release_err) = self.wallets.release(&wallet.id).await {
                        warn!(wallet = %wallet.id, error = %release_err, "Failed to release wallet after claim error");
                    }
                    return Err(e);
                }
            }
        }

        let to_address = match tx.to_address.as_deref() {
            Some(addr) => addr,
            None => {
                self.wallets.release(&wallet.id).await?;
                self.fail_permanently(tx, "withdrawal has no destination address")
                    .await?;
                return Ok(());
            }
        };

        let payout = attr.payout_amount(tx.amount);
        let base_units = match to_base_units(payout, attr.decimals) {
            Ok(units) => units,
            Err(e) => {
                self.wallets.release(&wallet.id).await?;
                self.fail_permanently(tx, &e.to_string()).await?;
                return Ok(());
            }
        };

        let transfer = ChainTransfer {
            wallet: &wallet,
            to_address,
            amount_base_units: base_units,
            contract: attr.contract.as_deref(),
        };

        match self.chain_rpc.send_transfer(chain, &transfer).await {
            Ok(tx_hash) => {
                // The lease covers the submission only; confirmation is
                // watched without holding the wallet.
                self.wallets.release(&wallet.id).await?;
                let stale = Utc::now()
                    + chrono::Duration::from_std(self.config.watch_stale_after)
                        .unwrap_or(chrono::Duration::seconds(180));
                let fields = TxUpdate {
                    tx_hash: Some(tx_hash.clone()),
                    next_attempt_at: Some(Some(stale)),
                    ..TxUpdate::default()
                };
                self.store
                    .update_status(
                        &tx.id,
                        TransactionStatus::Processing,
                        TransactionStatus::Processing,
                        &fields,
                    )
                    .await?;
                info!(id = %tx.id, tx_hash = %tx_hash, "Withdrawal submitted on-chain");
                self.queue.enqueue(SettlementJob::WatchConfirmation {
                    transaction_id: tx.id.clone(),
                    tx_hash,
                    polls: 0,
                });
                Ok(())
            }
            Err(e) => {
                // Release before anything else; a leaked lease starves
                // every later withdrawal on this chain.
                self.wallets.release(&wallet.id).await?;
                // The row was claimed to Processing above, so the retry
                // resumes with the explicit flag.
                self.handle_submission_failure(tx, e, true).await
            }
        }
    }

    async fn settle_via_exchange(
        &self,
        tx: &Transaction,
        attr: &CurrencyAttr,
        venue: String,
        expected: TransactionStatus,
    ) -> Result<(), AppError> {
        let Some(address) = tx.to_address.clone() else {
            self.fail_permanently(tx, "withdrawal has no destination address")
                .await?;
            return Ok(());
        };

        let withdrawal = ExchangeWithdrawal {
            venue,
            currency: tx.currency.clone(),
            chain: tx.chain.clone(),
            address,
            tag: tx.address_tag.clone(),
            amount: attr.payout_amount(tx.amount),
            // The transaction id travels as the idempotency remark so the
            // exchange can dedupe a re-sent request.
            remark: tx.id.clone(),
        };

        match self.exchange.withdraw(&withdrawal).await {
            Ok(order_id) => {
                let fields = TxUpdate {
                    order_ref: Some(order_id.clone()),
                    next_attempt_at: Some(None),
                    ..TxUpdate::default()
                };
                let written = self
                    .store
                    .update_status(&tx.id, expected, TransactionStatus::Processing, &fields)
                    .await?;
                if written == StatusWrite::Conflict {
                    // The order is already placed; operators must
                    // reconcile against the exchange ledger.
                    warn!(id = %tx.id, order = %order_id, "Exchange order placed but status race lost");
                    self.alerts
                        .error(&format!(
                            "Exchange order {} for withdrawal {} placed but transaction moved on",
                            order_id, tx.id
                        ))
                        .await;
                    return Ok(());
                }
                info!(id = %tx.id, order = %order_id, "Withdrawal routed to exchange");
                Ok(())
            }
            Err(e) => {
                // Same classification as the on-chain path: transient
                // exchange trouble retries, a rejection is final. The row
                // was never claimed here, so the retry resumes with
                // whatever status it still holds.
                self.handle_submission_failure(tx, e, expected == TransactionStatus::Processing)
                    .await
            }
        }
    }

    /// Unified submission-failure policy: transient errors retry on a
    /// fixed backoff until `max_attempts`, everything else (and an
    /// exhausted budget) fails the withdrawal. Always alerted.
    async fn handle_submission_failure(
        &self,
        tx: &Transaction,
        error: AppError,
        resume_as_retry: bool,
    ) -> Result<(), AppError> {
        let delay = self.config.submit_retry_delay;
        let due = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
        let count = self.store.record_attempt(&tx.id, Some(due)).await?;
        warn!(id = %tx.id, attempt = count, error = %error, "Withdrawal submission failed");
        self.alerts
            .error(&format!(
                "Withdrawal {} submission failed (attempt {}): {}",
                tx.id, count, error
            ))
            .await;

        if !error.is_transient() || count >= self.config.max_attempts {
            self.fail_permanently(tx, &error.to_string()).await?;
            return Ok(());
        }

        self.queue.enqueue_after(
            SettlementJob::SubmitWithdrawal {
                transaction_id: tx.id.clone(),
                retry: resume_as_retry,
                attempts: 0,
            },
            delay,
        );
        Ok(())
    }

    async fn fail_permanently(&self, tx: &Transaction, reason: &str) -> Result<(), AppError> {
        warn!(id = %tx.id, reason = %reason, "Failing withdrawal permanently");
        self.store.fail_transaction(&tx.id, reason).await?;
        self.alerts
            .withdrawal(&format!("Withdrawal {} failed: {}", tx.id, reason))
            .await;
        Ok(())
    }
}

/// Scale a display-unit amount to the asset's base units, truncating any
/// precision finer than `decimals`.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128, AppError> {
    if amount.is_sign_negative() {
        return Err(AppError::Validation(ValidationError::InvalidField {
            field: "amount".to_string(),
            message: "amount must not be negative".to_string(),
        }));
    }
    let normalized = amount.normalize();
    let mantissa = normalized.mantissa();
    let scale = normalized.scale();

    let value = if decimals >= scale {
        let factor = 10i128
            .checked_pow(decimals - scale)
            .ok_or_else(|| overflow_error(amount, decimals))?;
        mantissa
            .checked_mul(factor)
            .ok_or_else(|| overflow_error(amount, decimals))?
    } else {
        // More precision than the asset carries; truncate toward zero
        let factor = 10i128
            .checked_pow(scale - decimals)
            .ok_or_else(|| overflow_error(amount, decimals))?;
        mantissa / factor
    };

    u128::try_from(value).map_err(|_| overflow_error(amount, decimals))
}

fn overflow_error(amount: Decimal, decimals: u32) -> AppError {
    AppError::Validation(ValidationError::InvalidField {
        field: "amount".to_string(),
        message: format!("{} does not fit in {} base-unit decimals", amount, decimals),
    })
}
