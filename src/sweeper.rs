use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DurationRound, Utc};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::sender::Sender;
use crate::storage::Storage;
use crate::telemetry::{metric_add, metric_inc};
use crate::types::DeliveryStatus;

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Deliveries claimed for an attempt.
    pub claimed: usize,
    pub succeeded: usize,
    /// Still retrying after this attempt.
    pub retrying: usize,
    pub failed: usize,
    /// Attempts whose outcome could not be persisted.
    pub errors: usize,
}

/// Re-drives deliveries whose retry time has come.
#[derive(Clone)]
pub struct RetrySweeper {
    storage: Arc<dyn Storage>,
    sender: Arc<Sender>,
    config: Arc<EngineConfig>,
}

impl RetrySweeper {
    pub fn new(storage: Arc<dyn Storage>, sender: Arc<Sender>, config: Arc<EngineConfig>) -> Self {
        Self {
            storage,
            sender,
            config,
        }
    }

    /// Claim up to `batch_size` due deliveries and attempt each once.
    ///
    /// Claims are leased for the effective claim TTL (see
    /// [`EngineConfig::effective_claim_ttl`]), so a concurrent sweep skips them.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sweep(&self, batch_size: usize) -> SweepReport {
        let mut report = SweepReport::default();
        if batch_size == 0 {
            return report;
        }

        let now = Utc::now();
        // Millisecond precision survives every backend unchanged, so the
        // holder can present the lease back verbatim.
        let lease_until = now + self.config.claim_ttl_chrono();
        let lease_until = lease_until
            .duration_trunc(chrono::Duration::milliseconds(1))
            .unwrap_or(lease_until);

        let due = match self.storage.claim_due_deliveries(now, lease_until, batch_size).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim due deliveries");
                metric_inc("webhook.sweep.claim_failed");
                return report;
            }
        };

        if due.is_empty() {
            tracing::debug!("No deliveries due for retry");
            return report;
        }

        report.claimed = due.len();
        tracing::info!(claimed = report.claimed, "Retrying due deliveries");
        metric_add("webhook.sweep.claimed", report.claimed as u64);

        let mut attempts = JoinSet::new();
        for delivery in due {
            let sender = self.sender.clone();
            attempts.spawn(async move { sender.attempt(delivery).await });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(delivery)) => match delivery.status {
                    DeliveryStatus::Success => report.succeeded += 1,
                    DeliveryStatus::Retrying => report.retrying += 1,
                    DeliveryStatus::Failed => report.failed += 1,
                    DeliveryStatus::Pending => {}
                },
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Retry attempt could not be recorded");
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Retry task aborted");
                    report.errors += 1;
                }
            }
        }

        report
    }

    /// Run [`RetrySweeper::sweep`] every `interval` until the handle is shut down.
    pub fn spawn(&self, interval: Duration) -> SweeperHandle {
        let sweeper = self.clone();
        let batch_size = self.config.sweep_batch_size;
        let is_running = Arc::new(AtomicBool::new(true));
        let notify = Arc::new(Notify::new());

        let loop_running = is_running.clone();
        let loop_notify = notify.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = loop_notify.notified() => {}
                }

                if !loop_running.load(Ordering::SeqCst) {
                    break;
                }

                let report = sweeper.sweep(batch_size).await;
                if report.claimed > 0 {
                    tracing::debug!(?report, "Sweep finished");
                }
            }

            tracing::debug!("Retry sweeper stopped");
        });

        SweeperHandle {
            is_running,
            notify,
            handle: Some(handle),
        }
    }
}

/// Handle to a background sweep loop.
pub struct SweeperHandle {
    is_running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop the loop; an in-progress sweep completes first.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
