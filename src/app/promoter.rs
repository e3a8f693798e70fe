//! Deposit staging scanner: periodically promotes observed deposits into
//! the ledger, exactly once per on-chain transaction hash.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::domain::{AlertSink, AppError, LedgerStore, Promotion, TxAction};

#[derive(Debug, Clone)]
pub struct PromoterConfig {
    /// Scan cadence
    pub interval: Duration,
    /// Staged records promoted per cycle
    pub batch_size: i64,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 20,
        }
    }
}

/// Drains the staging table oldest-first and promotes each deposit
/// observation into a ledger transaction.
pub struct DepositPromoter {
    store: Arc<dyn LedgerStore>,
    alerts: Arc<dyn AlertSink>,
    config: PromoterConfig,
}

impl DepositPromoter {
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        alerts: Arc<dyn AlertSink>,
        config: PromoterConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            config,
        }
    }

    /// One scan cycle. Returns the number of records promoted.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let staged = self.store.staged_deposits(self.config.batch_size).await?;
        if staged.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0;
        for record in staged {
            if record.action != TxAction::Deposit {
                debug!(id = %record.id, action = %record.action, "Skipping non-deposit staging record");
                continue;
            }
            match self.store.promote_deposit(&record).await {
                Ok(Promotion::Promoted(tx)) => {
                    info!(
                        id = %tx.id,
                        tx_hash = %record.tx_hash,
                        amount = %record.amount,
                        "Deposit promoted into ledger"
                    );
                    promoted += 1;
                }
                Ok(Promotion::AlreadyPromoted) => {
                    // Re-observed hash; the uniqueness constraint makes
                    // this a no-op rather than a double credit.
                    debug!(tx_hash = %record.tx_hash, "Deposit already promoted");
                }
                Err(e) => {
                    error!(id = %record.id, error = %e, "Deposit promotion failed");
                    self.alerts
                        .error(&format!(
                            "Deposit promotion failed for hash {}: {}",
                            record.tx_hash, e
                        ))
                        .await;
                }
            }
        }
        Ok(promoted)
    }
}

/// Spawn the periodic promotion loop. Returns the task handle; the loop
/// exits when `shutdown` flips to true.
pub fn spawn_promoter(
    promoter: Arc<DepositPromoter>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval = ?promoter.config.interval,
            batch = promoter.config.batch_size,
            "Deposit promoter started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(promoter.config.interval) => {
                    if let Err(e) = promoter.run_once().await {
                        // A failed scan never kills the loop; the next
                        // cycle retries from the staging table.
                        error!(error = %e, "Deposit promotion cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Deposit promoter shutting down");
                        break;
                    }
                }
            }
        }
    })
}
