//! Settlement worker pool and crash-recovery reaper.
//!
//! A configurable number of workers drain the job queue concurrently.
//! Failures are caught at the job boundary: they are logged and alerted,
//! never allowed to crash a worker. The reaper periodically re-enqueues
//! transactions whose persisted retry deadline elapsed without a live
//! job, so scheduled work survives process restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::{LedgerStore, SettlementJob, TransactionStatus};

use super::orchestrator::WithdrawalOrchestrator;
use super::queue::SettlementQueue;
use super::watcher::ConfirmationWatcher;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent settlement workers. An admission-control tunable, not
    /// a correctness requirement.
    pub workers: usize,
    /// Reaper scan cadence
    pub reap_interval: Duration,
    /// Overdue rows re-enqueued per reaper cycle
    pub reap_batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            reap_interval: Duration::from_secs(30),
            reap_batch_size: 50,
        }
    }
}

/// Routes drained jobs to the orchestrator or the watcher.
pub struct JobRouter {
    orchestrator: Arc<WithdrawalOrchestrator>,
    watcher: Arc<ConfirmationWatcher>,
}

impl JobRouter {
    #[must_use]
    pub fn new(orchestrator: Arc<WithdrawalOrchestrator>, watcher: Arc<ConfirmationWatcher>) -> Self {
        Self {
            orchestrator,
            watcher,
        }
    }

    /// Execute one job; the error boundary for the worker pool.
    pub async fn execute(&self, job: SettlementJob) {
        let result = match &job {
            SettlementJob::SubmitWithdrawal {
                transaction_id,
                retry,
                attempts,
            } => {
                self.orchestrator
                    .run(transaction_id, *retry, *attempts)
                    .await
            }
            SettlementJob::WatchConfirmation {
                transaction_id,
                tx_hash,
                polls,
            } => self.watcher.poll(transaction_id, tx_hash, *polls).await,
        };
        if let Err(e) = result {
            error!(job = ?job, error = %e, "Settlement job failed at the worker boundary");
        }
    }
}

/// Spawn the worker pool draining `receiver`. Workers stop when the
/// shutdown flag flips or the queue closes.
pub fn spawn_workers(
    router: Arc<JobRouter>,
    receiver: mpsc::UnboundedReceiver<SettlementJob>,
    config: &WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    let mut handles = Vec::with_capacity(config.workers);
    info!(workers = config.workers, "Starting settlement worker pool");

    for worker_id in 0..config.workers {
        let router = Arc::clone(&router);
        let receiver = Arc::clone(&receiver);
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                // Lock only while waiting for a job; execution runs
                // without holding the receiver.
                let job = {
                    let mut rx = receiver.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = shutdown.changed() => continue,
                    }
                };
                match job {
                    Some(job) => router.execute(job).await,
                    None => break,
                }
            }
            info!(worker = worker_id, "Settlement worker stopped");
        }));
    }
    handles
}

/// Spawn the reaper: re-enqueues transactions whose scheduled attempt is
/// overdue. Accepted rows resume as fresh submissions; Processing rows
/// resume as a confirmation watch when a hash was recorded, or as a
/// submission retry when it was not.
pub fn spawn_reaper(
    store: Arc<dyn LedgerStore>,
    queue: SettlementQueue,
    config: &WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = config.reap_interval;
    let batch = config.reap_batch_size;
    tokio::spawn(async move {
        info!(interval = ?interval, "Settlement reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match store.overdue_transactions(batch).await {
                        Ok(overdue) => {
                            for tx in overdue {
                                let job = match (tx.status, tx.tx_hash.clone()) {
                                    (TransactionStatus::Accepted, _) => {
                                        SettlementJob::SubmitWithdrawal {
                                            transaction_id: tx.id.clone(),
                                            retry: false,
                                            attempts: 0,
                                        }
                                    }
                                    (TransactionStatus::Processing, Some(tx_hash)) => {
                                        SettlementJob::WatchConfirmation {
                                            transaction_id: tx.id.clone(),
                                            tx_hash,
                                            polls: 0,
                                        }
                                    }
                                    (TransactionStatus::Processing, None) => {
                                        SettlementJob::SubmitWithdrawal {
                                            transaction_id: tx.id.clone(),
                                            retry: true,
                                            attempts: 0,
                                        }
                                    }
                                    _ => continue,
                                };
                                warn!(id = %tx.id, status = %tx.status, "Reaper re-enqueueing overdue transaction");
                                queue.enqueue(job);
                            }
                        }
                        Err(e) => error!(error = %e, "Reaper scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Settlement reaper shutting down");
                        break;
                    }
                }
            }
        }
    })
}
