//! In-process settlement job queue.
//!
//! The queue is a fast path only: the durable source of truth is the
//! transaction row (status + `next_attempt_at`). A reaper re-enqueues
//! overdue rows after a crash, so nothing is lost with the channel.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::domain::SettlementJob;

/// Cloneable producer handle for the settlement job channel.
#[derive(Clone)]
pub struct SettlementQueue {
    tx: mpsc::UnboundedSender<SettlementJob>,
    shutdown: watch::Receiver<bool>,
}

impl SettlementQueue {
    /// Create the queue, its consumer end, and the shutdown trigger.
    #[must_use]
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<SettlementJob>,
        watch::Sender<bool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                tx,
                shutdown: shutdown_rx,
            },
            rx,
            shutdown_tx,
        )
    }

    /// Shutdown receiver for worker loops sharing this queue's lifecycle.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Enqueue a job for immediate pickup.
    pub fn enqueue(&self, job: SettlementJob) {
        debug!(job = ?job, "Enqueueing settlement job");
        if self.tx.send(job).is_err() {
            warn!("Settlement queue closed; job dropped (reaper will recover)");
        }
    }

    /// Enqueue a job after a delay without holding a worker.
    ///
    /// The delayed task is cancelled on shutdown; the reaper re-enqueues
    /// the row from its persisted `next_attempt_at` on the next start.
    pub fn enqueue_after(&self, job: SettlementJob, delay: Duration) {
        let queue = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.enqueue(job),
                _ = shutdown.changed() => {
                    debug!(job = ?job, "Shutdown during scheduled delay; job dropped");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_delivers_job() {
        let (queue, mut rx, _shutdown) = SettlementQueue::new();
        let job = SettlementJob::SubmitWithdrawal {
            transaction_id: "tx_1".to_string(),
            retry: false,
            attempts: 0,
        };
        queue.enqueue(job.clone());
        assert_eq!(rx.recv().await, Some(job));
    }

    #[tokio::test]
    async fn test_enqueue_after_delivers_after_delay() {
        let (queue, mut rx, _shutdown) = SettlementQueue::new();
        let job = SettlementJob::WatchConfirmation {
            transaction_id: "tx_2".to_string(),
            tx_hash: "0xhash".to_string(),
            polls: 1,
        };
        queue.enqueue_after(job.clone(), Duration::from_millis(10));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delayed job should arrive");
        assert_eq!(received, Some(job));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_delayed_job() {
        let (queue, mut rx, shutdown) = SettlementQueue::new();
        queue.enqueue_after(
            SettlementJob::SubmitWithdrawal {
                transaction_id: "tx_3".to_string(),
                retry: false,
                attempts: 0,
            },
            Duration::from_secs(60),
        );
        shutdown.send(true).unwrap();
        // The delayed task drops the job instead of delivering it
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err());
    }
}
