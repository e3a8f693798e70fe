//! Confirmation watcher: cooperative, self-rescheduling polling of
//! submitted transaction hashes. No worker is held idle between polls;
//! each check re-enqueues itself as a cancellable delayed job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AlertSink, AppError, ChainError, ChainRpcClient, LedgerStore, MetadataStore, SettlementJob,
    StatusWrite, TransactionStatus, TxUpdate,
};

use super::queue::SettlementQueue;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Delay between confirmation checks
    pub poll_interval: Duration,
    /// Depth at which a transfer counts as settled
    pub required_confirmations: u64,
    /// Polls before the watcher gives up and pages an operator
    pub max_polls: u32,
    /// Reaper deadline extension written on each re-schedule
    pub stale_after: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            required_confirmations: 12,
            max_polls: 180,
            stale_after: Duration::from_secs(180),
        }
    }
}

/// Polls one (transaction, hash) pair per job and completes the ledger
/// entry once the chain reports enough confirmations.
pub struct ConfirmationWatcher {
    store: Arc<dyn LedgerStore>,
    meta: Arc<dyn MetadataStore>,
    chain_rpc: Arc<dyn ChainRpcClient>,
    alerts: Arc<dyn AlertSink>,
    queue: SettlementQueue,
    config: WatcherConfig,
}

impl ConfirmationWatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        meta: Arc<dyn MetadataStore>,
        chain_rpc: Arc<dyn ChainRpcClient>,
        alerts: Arc<dyn AlertSink>,
        queue: SettlementQueue,
        config: WatcherConfig,
    ) -> Self {
        Self {
            store,
            meta,
            chain_rpc,
            alerts,
            queue,
            config,
        }
    }

    /// Process one `WatchConfirmation` job.
    #[instrument(skip(self), fields(id = %transaction_id, polls = polls))]
    pub async fn poll(
        &self,
        transaction_id: &str,
        tx_hash: &str,
        polls: u32,
    ) -> Result<(), AppError> {
        let Some(tx) = self.store.transaction_by_id(transaction_id).await? else {
            warn!("Watch job references unknown transaction");
            return Ok(());
        };

        // Re-validate before acting: the transaction may have been failed
        // or completed by another path while this poll was scheduled.
        if tx.status != TransactionStatus::Processing {
            info!(status = %tx.status, "Transaction no longer processing; stopping watch");
            return Ok(());
        }

        let Some(chain) = self.meta.chain_by_code(&tx.chain).await? else {
            warn!(chain = %tx.chain, "Chain metadata missing during watch; rescheduling");
            self.reschedule(transaction_id, tx_hash, polls).await?;
            return Ok(());
        };

        let depth = match self.chain_rpc.confirmations(&chain, tx_hash).await {
            Ok(depth) => depth,
            Err(e @ AppError::Chain(ChainError::Reverted(_))) => {
                // A revert is terminal: the transfer executed and failed,
                // so waiting out the poll budget would only delay the
                // operator. No funds moved off the ledger.
                warn!(tx_hash = %tx_hash, error = %e, "Transfer reverted on-chain; failing withdrawal");
                self.store
                    .fail_transaction(transaction_id, &e.to_string())
                    .await?;
                self.alerts
                    .withdrawal(&format!(
                        "Withdrawal {} reverted on-chain (hash {})",
                        transaction_id, tx_hash
                    ))
                    .await;
                return Ok(());
            }
            Err(e) => {
                // Node trouble reads as "still pending"; the poll budget
                // bounds how long we keep trying.
                warn!(error = %e, "Confirmation check failed; treating as pending");
                None
            }
        };

        match depth {
            Some(depth) if depth >= self.config.required_confirmations => {
                let link = chain.explorer_tx_link(tx_hash);
                let written = self
                    .store
                    .complete_withdrawal(transaction_id, Some(tx_hash), Some(&link))
                    .await?;
                match written {
                    StatusWrite::Applied => {
                        info!(tx_hash = %tx_hash, depth = depth, "Withdrawal confirmed and completed");
                    }
                    StatusWrite::Conflict => {
                        // Another watcher or operator got there first.
                        debug!(tx_hash = %tx_hash, "Completion already applied elsewhere");
                    }
                }
                Ok(())
            }
            _ => {
                debug!(depth = ?depth, "Not yet confirmed");
                self.reschedule(transaction_id, tx_hash, polls).await
            }
        }
    }

    async fn reschedule(
        &self,
        transaction_id: &str,
        tx_hash: &str,
        polls: u32,
    ) -> Result<(), AppError> {
        let next = polls.saturating_add(1);
        if next >= self.config.max_polls {
            warn!(tx_hash = %tx_hash, polls = next, "Confirmation poll budget exhausted");
            self.alerts
                .error(&format!(
                    "Withdrawal {} unconfirmed after {} polls (hash {}); operator action required",
                    transaction_id, next, tx_hash
                ))
                .await;
            // Clear the reaper deadline so the row is not resurrected
            // into an endless watch loop; it stays Processing for
            // operators to settle or fail by hand.
            let fields = TxUpdate {
                next_attempt_at: Some(None),
                ..TxUpdate::default()
            };
            self.store
                .update_status(
                    transaction_id,
                    TransactionStatus::Processing,
                    TransactionStatus::Processing,
                    &fields,
                )
                .await?;
            return Ok(());
        }

        // Push the reaper deadline out past the next poll so a live
        // watch is not double-enqueued.
        let stale = Utc::now()
            + chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or(chrono::Duration::seconds(180));
        let fields = TxUpdate {
            next_attempt_at: Some(Some(stale)),
            ..TxUpdate::default()
        };
        if self
            .store
            .update_status(
                transaction_id,
                TransactionStatus::Processing,
                TransactionStatus::Processing,
                &fields,
            )
            .await?
            == StatusWrite::Conflict
        {
            info!("Transaction moved on while rescheduling watch; dropping");
            return Ok(());
        }

        self.queue.enqueue_after(
            SettlementJob::WatchConfirmation {
                transaction_id: transaction_id.to_string(),
                tx_hash: tx_hash.to_string(),
                polls: next,
            },
            self.config.poll_interval,
        );
        Ok(())
    }
}
