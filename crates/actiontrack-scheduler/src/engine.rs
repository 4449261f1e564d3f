//! Notification worker — claims due jobs and hands them to the dispatcher.
//! Uses tokio::interval for ticking; sleeps between polls.

use std::sync::Arc;

use actiontrack_core::error::Result;
use actiontrack_core::traits::{JobQueue, JobState};
use chrono::{DateTime, Utc};

use crate::dispatch::{DispatchOutcome, TaskDispatcher};

/// How long a claimed job may stay `Running` before another round takes it back.
pub const DEFAULT_LEASE_SECS: u64 = 300;

/// Counters for one polling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Expired leases handed back to pending before claiming.
    pub reclaimed: usize,
    pub claimed: usize,
    pub sent: usize,
    pub suppressed: usize,
    /// Dispatch itself errored (store unavailable); the job is closed as suppressed.
    pub failed: usize,
}

pub struct NotificationWorker {
    queue: Arc<dyn JobQueue>,
    dispatcher: TaskDispatcher,
    batch_size: usize,
    lease: chrono::Duration,
}

impl NotificationWorker {
    pub fn new(queue: Arc<dyn JobQueue>, dispatcher: TaskDispatcher, batch_size: usize) -> Self {
        Self {
            queue,
            dispatcher,
            batch_size: batch_size.max(1),
            lease: chrono::Duration::seconds(DEFAULT_LEASE_SECS as i64),
        }
    }

    /// Lease length for claimed jobs. A worker that dies mid-dispatch loses
    /// its jobs to the next round after this long; they may then be mailed
    /// twice if the first send did go out.
    pub fn with_lease_secs(mut self, secs: u64) -> Self {
        self.lease = chrono::Duration::seconds(secs.max(1) as i64);
        self
    }

    /// Reclaim expired leases, then claim every job due at `now` (up to the
    /// batch size) and run it.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<WorkerStats> {
        let reclaimed = self.queue.reclaim_expired(now - self.lease)?;
        if reclaimed > 0 {
            tracing::warn!("⚠️ Reclaimed {reclaimed} job(s) left running past their lease");
        }
        let jobs = self.queue.claim_due(now, self.batch_size)?;
        let mut stats = WorkerStats {
            reclaimed,
            claimed: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            let state = match self.dispatcher.dispatch(&job.payload).await {
                Ok(outcome) => {
                    match outcome {
                        DispatchOutcome::Sent(_) => stats.sent += 1,
                        DispatchOutcome::Suppressed(_) => stats.suppressed += 1,
                    }
                    outcome.job_state()
                }
                Err(e) => {
                    tracing::warn!("⚠️ Job {} failed during dispatch: {e}", job.handle);
                    stats.failed += 1;
                    JobState::Suppressed
                }
            };
            if let Err(e) = self.queue.finish(&job.handle, state) {
                tracing::warn!("⚠️ Could not finish job {}: {e}", job.handle);
            }
        }

        if stats.claimed > 0 {
            tracing::info!(
                "📣 Worker round: {} claimed, {} sent, {} suppressed, {} failed",
                stats.claimed,
                stats.sent,
                stats.suppressed,
                stats.failed
            );
        }
        Ok(stats)
    }
}

/// Run the worker loop — call this in a tokio::spawn.
pub async fn spawn_worker(worker: Arc<NotificationWorker>, poll_interval_secs: u64) {
    let poll_interval_secs = poll_interval_secs.max(1);
    tracing::info!("⏰ Notification worker started (poll every {}s)", poll_interval_secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_interval_secs));

    loop {
        interval.tick().await;
        if let Err(e) = worker.run_due(Utc::now()).await {
            tracing::warn!("⚠️ Worker round failed: {e}");
        }
    }
}
