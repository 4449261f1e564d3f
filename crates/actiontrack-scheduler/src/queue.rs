//! In-process job queue — every operation runs under one lock.
//! Meant for tests and embedding; jobs do not survive the process and
//! finished ones stay until [`MemoryJobQueue::prune_finished`] is called.
//! `TrackerDb` is the durable one.

use std::sync::Mutex;
use std::time::Duration;

use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::traits::{
    JobFilter, JobHandle, JobPayload, JobQueue, JobState, NotificationJob,
};
use chrono::{DateTime, Utc};

pub struct MemoryJobQueue {
    jobs: Mutex<Vec<NotificationJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<NotificationJob>>> {
        self.jobs
            .lock()
            .map_err(|_| TrackerError::Queue("job queue lock poisoned".into()))
    }

    /// Total jobs in any state.
    pub fn len(&self) -> usize {
        self.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every job, including finished ones.
    pub fn snapshot(&self) -> Vec<NotificationJob> {
        self.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Drop cancelled, sent and suppressed jobs that finished before
    /// `finished_before`. Returns how many were removed.
    pub fn prune_finished(&self, finished_before: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|j| {
            !(j.state.is_terminal() && j.finished_at.is_some_and(|at| at < finished_before))
        });
        Ok(before - jobs.len())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn new_handle() -> JobHandle {
    JobHandle(format!("job-{}", uuid::Uuid::new_v4()))
}

pub(crate) fn fire_time(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay)
        .map_err(|e| TrackerError::Queue(format!("Invalid delay: {e}")))?;
    Ok(now + delay)
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(&self, delay: Duration, payload: JobPayload) -> Result<JobHandle> {
        let now = Utc::now();
        let job = NotificationJob {
            handle: new_handle(),
            payload,
            state: JobState::Pending,
            enqueued_at: now,
            fire_at: fire_time(now, delay)?,
            claimed_at: None,
            finished_at: None,
        };
        let handle = job.handle.clone();
        self.lock()?.push(job);
        Ok(handle)
    }

    fn list_pending(&self, filter: &JobFilter) -> Result<Vec<NotificationJob>> {
        let jobs = self.lock()?;
        let mut pending: Vec<NotificationJob> = jobs
            .iter()
            .filter(|j| j.state == JobState::Pending && filter.matches(&j.payload))
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.fire_at);
        Ok(pending)
    }

    fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let mut jobs = self.lock()?;
        match jobs.iter_mut().find(|j| &j.handle == handle) {
            Some(job) if job.state == JobState::Pending => {
                job.state = JobState::Cancelled;
                job.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<NotificationJob>> {
        let mut jobs = self.lock()?;
        let mut due: Vec<&mut NotificationJob> =
            jobs.iter_mut().filter(|j| j.is_due(now)).collect();
        due.sort_by_key(|j| j.fire_at);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Running;
                job.claimed_at = Some(now);
                job.clone()
            })
            .collect())
    }

    fn reclaim_expired(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.lock()?;
        let mut reclaimed = 0;
        for job in jobs.iter_mut().filter(|j| {
            j.state == JobState::Running && j.claimed_at.is_none_or(|at| at < claimed_before)
        }) {
            job.state = JobState::Pending;
            job.claimed_at = None;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn finish(&self, handle: &JobHandle, state: JobState) -> Result<()> {
        if !state.is_terminal() {
            return Err(TrackerError::Queue(format!(
                "{} is not a terminal state",
                state.as_str()
            )));
        }
        let mut jobs = self.lock()?;
        let job = jobs
            .iter_mut()
            .find(|j| &j.handle == handle)
            .ok_or_else(|| TrackerError::NotFound(format!("job {handle}")))?;
        if job.state != JobState::Running {
            return Err(TrackerError::Queue(format!(
                "job {handle} is {}, not running",
                job.state.as_str()
            )));
        }
        job.state = state;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    fn job(&self, handle: &JobHandle) -> Result<Option<NotificationJob>> {
        Ok(self.lock()?.iter().find(|j| &j.handle == handle).cloned())
    }
}
