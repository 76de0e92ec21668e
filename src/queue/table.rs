//! Local job metadata tables.
//!
//! Brokers know nothing about attempt counts, progress, logs or removal policies,
//! so every adapter keeps this bookkeeping in a [`JobTable`] per queue, owned by a
//! [`QueueRegistry`]. Each table serializes its mutations behind its own lock; there
//! is no table shared between queues.

use crate::{
    ConveyorError, Result,
    job::{Job, JobId, JobRange, JobStatus, RemovePolicy},
    queue::QueueMetrics,
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::debug;

/// A job plus the adapter-private fields that never leave the table.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub job: Job,
    /// Insertion order, used for FIFO dispatch within a priority.
    pub seq: u64,
    /// A handler is currently running for this job.
    pub in_flight: bool,
    /// Set while the job waits for a delay or backoff to elapse.
    pub delayed_until: Option<DateTime<Utc>>,
    /// Attempts made before the most recent manual retry.
    pub retry_offset: u32,
    pub logs: Vec<String>,
    /// Broker handle for the delivery currently being processed, such as an SQS
    /// receipt handle.
    pub receipt: Option<String>,
}

impl StoredJob {
    fn new(job: Job, seq: u64) -> Self {
        Self {
            job,
            seq,
            in_flight: false,
            delayed_until: None,
            retry_offset: 0,
            logs: Vec::new(),
            receipt: None,
        }
    }

    /// Derive the job's status from its fields and the queue's pause flag.
    pub fn status(&self, queue_paused: bool) -> JobStatus {
        if self.job.finished_on.is_some() {
            if self.job.failed_reason.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            }
        } else if self.in_flight {
            JobStatus::Active
        } else if self.delayed_until.is_some() {
            JobStatus::Delayed
        } else if queue_paused {
            JobStatus::Paused
        } else {
            JobStatus::Waiting
        }
    }

    fn can_retry(&self) -> bool {
        self.job.attempts_made.saturating_sub(self.retry_offset) < self.job.opts.attempts()
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Attempts remain; the job should be resubmitted after `delay_ms`.
    Retry { job: Job, delay_ms: u64 },
    /// No attempts remain; the job is now terminally failed.
    Exhausted { job: Job },
}

impl FailureOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FailureOutcome::Retry { job, .. } | FailureOutcome::Exhausted { job } => job,
        }
    }
}

/// Result of [`JobTable::insert`].
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    pub job: Job,
    /// False when a job with the same id already existed.
    pub inserted: bool,
}

#[derive(Debug, Default)]
struct TableInner {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

impl TableInner {
    fn get_mut(&mut self, id: &str) -> Result<&mut StoredJob> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| ConveyorError::JobNotFound { id: id.to_string() })
    }
}

/// The job metadata table of a single queue.
#[derive(Debug)]
pub struct JobTable {
    name: String,
    inner: RwLock<TableInner>,
    paused: AtomicBool,
    poisoned: AtomicU64,
}

impl JobTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(TableInner::default()),
            paused: AtomicBool::new(false),
            poisoned: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Count a broker message that could not be decoded and was discarded.
    pub fn record_poison(&self) -> u64 {
        self.poisoned.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Store a new job. When `delayed_until` is set the job is held back until
    /// [`promote`](Self::promote) or [`claim`](Self::claim) clears it.
    ///
    /// Adding a job whose id is already present leaves the table untouched and
    /// returns the existing job with `inserted == false`.
    pub async fn insert(&self, job: Job, delayed_until: Option<DateTime<Utc>>) -> Inserted {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.jobs.get(&job.id) {
            debug!(queue = %self.name, job_id = %job.id, "Job id already present, keeping existing job");
            return Inserted {
                job: existing.job.clone(),
                inserted: false,
            };
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut stored = StoredJob::new(job.clone(), seq);
        stored.delayed_until = delayed_until;
        inner.jobs.insert(job.id.clone(), stored);
        Inserted {
            job,
            inserted: true,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.read().await.jobs.get(id).map(|s| s.job.clone())
    }

    pub async fn get_stored(&self, id: &str) -> Option<StoredJob> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    pub async fn status_of(&self, id: &str) -> Option<JobStatus> {
        let paused = self.is_paused();
        self.inner
            .read()
            .await
            .jobs
            .get(id)
            .map(|stored| stored.status(paused))
    }

    /// List jobs in insertion order, optionally restricted to one status.
    pub async fn list(&self, status: Option<JobStatus>, range: JobRange) -> Vec<Job> {
        let paused = self.is_paused();
        let inner = self.inner.read().await;
        let mut matching: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|stored| status.is_none_or(|wanted| stored.status(paused) == wanted))
            .collect();
        matching.sort_by_key(|stored| stored.seq);
        range.apply(matching.into_iter().map(|s| s.job.clone()).collect())
    }

    /// Remove a job. Missing ids are ignored.
    pub async fn remove(&self, id: &str) -> Option<Job> {
        self.inner.write().await.jobs.remove(id).map(|s| s.job)
    }

    /// Number of jobs with a handler currently running.
    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|stored| stored.in_flight)
            .count()
    }

    /// Mark up to `limit` waiting jobs active and return them, highest priority
    /// first and FIFO within a priority. Returns nothing while the queue is paused.
    pub async fn claim_ready(&self, limit: usize) -> Vec<Job> {
        if limit == 0 || self.is_paused() {
            return Vec::new();
        }

        let mut inner = self.inner.write().await;
        let mut ready: Vec<(u8, u64, JobId)> = inner
            .jobs
            .values()
            .filter(|stored| stored.status(false) == JobStatus::Waiting)
            .map(|stored| (stored.job.opts.priority(), stored.seq, stored.job.id.clone()))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(limit.min(ready.len()));
        for (_, _, id) in ready.into_iter().take(limit) {
            if let Some(stored) = inner.jobs.get_mut(&id) {
                stored.in_flight = true;
                stored.job.processed_on = Some(now);
                claimed.push(stored.job.clone());
            }
        }
        claimed
    }

    /// Mark a specific job active because the broker delivered it.
    ///
    /// Returns `None` when the job is unknown, already finished or already active,
    /// which callers treat as a duplicate delivery.
    pub async fn claim(&self, id: &str, receipt: Option<String>) -> Option<Job> {
        let mut inner = self.inner.write().await;
        let stored = inner.jobs.get_mut(id)?;
        if stored.job.finished_on.is_some() || stored.in_flight {
            return None;
        }
        stored.in_flight = true;
        stored.delayed_until = None;
        stored.receipt = receipt;
        stored.job.processed_on = Some(Utc::now());
        Some(stored.job.clone())
    }

    /// Return an active job to waiting without counting an attempt.
    pub async fn release(&self, id: &str) {
        if let Some(stored) = self.inner.write().await.jobs.get_mut(id) {
            stored.in_flight = false;
            stored.receipt = None;
        }
    }

    /// Hold a job back until the given time.
    pub async fn set_delayed(&self, id: &str, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.get_mut(id)?.delayed_until = Some(until);
        Ok(())
    }

    /// Make a delayed job eligible for dispatch. Returns whether anything changed.
    ///
    /// Only the delay that ends at `until` is cleared, so a timer scheduled for a
    /// job that was since removed cannot release a newer job with the same id.
    pub async fn promote(&self, id: &str, until: DateTime<Utc>) -> bool {
        match self.inner.write().await.jobs.get_mut(id) {
            Some(stored) if stored.delayed_until == Some(until) && !stored.in_flight => {
                stored.delayed_until = None;
                true
            }
            _ => false,
        }
    }

    /// Record a successful attempt.
    pub async fn complete(&self, id: &str, return_value: serde_json::Value) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let stored = inner.get_mut(id)?;
        stored.in_flight = false;
        stored.receipt = None;
        stored.delayed_until = None;
        stored.job.attempts_made += 1;
        stored.job.finished_on = Some(Utc::now());
        stored.job.failed_reason = None;
        stored.job.return_value = Some(return_value);
        Ok(stored.job.clone())
    }

    /// Record a failed attempt and decide whether the job gets another one.
    ///
    /// A retried job keeps `failed_reason` from its last failure and is held as
    /// delayed for the backoff period when that period is non-zero.
    pub async fn fail(&self, id: &str, reason: &str) -> Result<FailureOutcome> {
        let mut inner = self.inner.write().await;
        let stored = inner.get_mut(id)?;
        stored.in_flight = false;
        stored.receipt = None;
        stored.job.attempts_made += 1;
        stored.job.failed_reason = Some(reason.to_string());

        if stored.can_retry() {
            let delay_ms = stored.job.opts.backoff_delay(stored.job.attempts_made);
            stored.delayed_until = if delay_ms > 0 {
                Some(deadline_after(delay_ms))
            } else {
                None
            };
            Ok(FailureOutcome::Retry {
                job: stored.job.clone(),
                delay_ms,
            })
        } else {
            stored.delayed_until = None;
            stored.job.finished_on = Some(Utc::now());
            Ok(FailureOutcome::Exhausted {
                job: stored.job.clone(),
            })
        }
    }

    /// Reset a failed job's terminal fields so it can be resubmitted.
    ///
    /// `attempts_made` keeps counting; the job is granted a fresh set of
    /// `opts.attempts` on top of what it has already used.
    pub async fn reset_for_retry(&self, id: &str) -> Result<Job> {
        let paused = self.is_paused();
        let mut inner = self.inner.write().await;
        let stored = inner.get_mut(id)?;
        if stored.status(paused) != JobStatus::Failed {
            return Err(ConveyorError::queue(format!(
                "job {} is {} and cannot be retried; only failed jobs can",
                id,
                stored.status(paused)
            )));
        }
        stored.retry_offset = stored.job.attempts_made;
        stored.delayed_until = None;
        stored.job.finished_on = None;
        stored.job.processed_on = None;
        stored.job.failed_reason = None;
        stored.job.return_value = None;
        stored.job.progress = 0;
        Ok(stored.job.clone())
    }

    pub async fn set_progress(&self, id: &str, progress: u8) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.get_mut(id)?.job.progress = progress.min(100);
        Ok(())
    }

    pub async fn append_log(&self, id: &str, line: String) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.get_mut(id)?.logs.push(line);
        Ok(())
    }

    pub async fn logs(&self, id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .jobs
            .get(id)
            .map(|stored| stored.logs.clone())
            .unwrap_or_default()
    }

    pub async fn receipt(&self, id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .jobs
            .get(id)
            .and_then(|stored| stored.receipt.clone())
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let paused = self.is_paused();
        let inner = self.inner.read().await;
        let mut metrics = QueueMetrics {
            poisoned: self.poisoned.load(Ordering::Relaxed),
            ..QueueMetrics::default()
        };
        for stored in inner.jobs.values() {
            metrics.record(stored.status(paused));
        }
        metrics
    }

    /// Remove jobs in `status` older than `grace`. Terminal jobs are aged by
    /// `finished_on`, everything else by `timestamp`. Active jobs are never removed.
    pub async fn clean(&self, grace: Duration, status: JobStatus) -> Vec<JobId> {
        if status == JobStatus::Active {
            return Vec::new();
        }

        let paused = self.is_paused();
        let cutoff = chrono::TimeDelta::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut inner = self.inner.write().await;
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|stored| stored.status(paused) == status)
            .filter(|stored| stored.job.finished_on.unwrap_or(stored.job.timestamp) <= cutoff)
            .map(|stored| stored.job.id.clone())
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        expired
    }

    /// Drop every job. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.jobs.len();
        inner.jobs.clear();
        count
    }

    /// Apply the job's `removeOnComplete` / `removeOnFail` policy after it reached
    /// a terminal state.
    pub async fn apply_remove_policy(self: &Arc<Self>, job: &Job) {
        let policy = if job.is_completed() {
            job.opts.remove_on_complete
        } else if job.is_failed() {
            job.opts.remove_on_fail
        } else {
            None
        };

        match policy.unwrap_or_default() {
            RemovePolicy::Keep => {}
            RemovePolicy::Immediately => {
                self.remove(&job.id).await;
                debug!(queue = %self.name, job_id = %job.id, "Removed finished job");
            }
            RemovePolicy::After(ms) => {
                let table = Arc::clone(self);
                let id = job.id.clone();
                let finished_on = job.finished_on;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let still_same = table
                        .get(&id)
                        .await
                        .is_some_and(|current| current.finished_on == finished_on);
                    if still_same {
                        table.remove(&id).await;
                        debug!(queue = %table.name, job_id = %id, "Removed finished job after delay");
                    }
                });
            }
        }
    }
}

/// `now + ms`, saturating at the latest representable instant.
pub fn deadline_after(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::TimeDelta::try_milliseconds)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Owner of every queue's job table within an adapter instance.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    tables: RwLock<HashMap<String, Arc<JobTable>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for `queue`, created on first use.
    pub async fn table(&self, queue: &str) -> Arc<JobTable> {
        if let Some(table) = self.tables.read().await.get(queue) {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write().await;
        Arc::clone(
            tables
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(JobTable::new(queue))),
        )
    }

    pub async fn get(&self, queue: &str) -> Option<Arc<JobTable>> {
        self.tables.read().await.get(queue).cloned()
    }

    pub async fn remove(&self, queue: &str) -> Option<Arc<JobTable>> {
        self.tables.write().await.remove(queue)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backoff::BackoffOptions, job::JobOptions};
    use serde_json::json;

    fn job(opts: JobOptions) -> Job {
        Job::new("table_test", "work", json!({"n": 1}), opts)
    }

    #[tokio::test]
    async fn test_insert_and_status_derivation() {
        let table = JobTable::new("table_test");
        let waiting = table.insert(job(JobOptions::new()), None).await.job;
        let delayed = table
            .insert(job(JobOptions::new()), Some(Utc::now() + chrono::Duration::hours(1)))
            .await.job;

        assert_eq!(table.status_of(&waiting.id).await, Some(JobStatus::Waiting));
        assert_eq!(table.status_of(&delayed.id).await, Some(JobStatus::Delayed));

        table.pause();
        assert_eq!(table.status_of(&waiting.id).await, Some(JobStatus::Paused));
        assert_eq!(table.status_of(&delayed.id).await, Some(JobStatus::Delayed));
    }

    #[tokio::test]
    async fn test_promote_matches_the_scheduled_delay() {
        let table = JobTable::new("table_test");
        let until = Utc::now() + chrono::Duration::hours(1);
        let delayed = table.insert(job(JobOptions::new()), Some(until)).await.job;

        let other = until + chrono::Duration::seconds(1);
        assert!(!table.promote(&delayed.id, other).await);
        assert_eq!(table.status_of(&delayed.id).await, Some(JobStatus::Delayed));

        assert!(table.promote(&delayed.id, until).await);
        assert_eq!(table.status_of(&delayed.id).await, Some(JobStatus::Waiting));
    }

    #[tokio::test]
    async fn test_poison_messages_are_counted_apart_from_jobs() {
        let table = JobTable::new("table_test");
        table.insert(job(JobOptions::new()), None).await;
        assert_eq!(table.record_poison(), 1);
        assert_eq!(table.record_poison(), 2);

        let metrics = table.metrics().await;
        assert_eq!(metrics.poisoned, 2);
        assert_eq!(metrics.total(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_existing() {
        let table = JobTable::new("table_test");
        let first = table
            .insert(
                Job::new("table_test", "a", json!(1), JobOptions::new().with_job_id("same")),
                None,
            )
            .await.job;
        let second = table
            .insert(
                Job::new("table_test", "b", json!(2), JobOptions::new().with_job_id("same")),
                None,
            )
            .await.job;

        assert_eq!(first, second);
        assert_eq!(table.metrics().await.total(), 1);
    }

    #[tokio::test]
    async fn test_claim_ready_orders_by_priority_then_fifo() {
        let table = JobTable::new("table_test");
        let low_a = table.insert(job(JobOptions::new()), None).await.job;
        let high = table.insert(job(JobOptions::new().with_priority(5)), None).await.job;
        let low_b = table.insert(job(JobOptions::new()), None).await.job;

        let claimed: Vec<JobId> = table.claim_ready(3).await.into_iter().map(|j| j.id).collect();
        assert_eq!(claimed, vec![high.id, low_a.id, low_b.id]);
        assert_eq!(table.active_count().await, 3);
        assert!(table.claim_ready(3).await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_ready_respects_pause_and_limit() {
        let table = JobTable::new("table_test");
        for _ in 0..4 {
            table.insert(job(JobOptions::new()), None).await;
        }

        table.pause();
        assert!(table.claim_ready(10).await.is_empty());

        table.resume();
        assert_eq!(table.claim_ready(2).await.len(), 2);
        assert_eq!(table.metrics().await.active, 2);
        assert_eq!(table.metrics().await.waiting, 2);
    }

    #[tokio::test]
    async fn test_fail_until_exhausted() {
        let table = JobTable::new("table_test");
        let stored = table
            .insert(
                job(JobOptions::new()
                    .with_attempts(3)
                    .with_backoff(BackoffOptions::exponential(100))),
                None,
            )
            .await.job;

        for (attempt, expected_delay) in [(1u32, 100u64), (2, 200)] {
            table.claim(&stored.id, None).await.unwrap();
            match table.fail(&stored.id, "boom").await.unwrap() {
                FailureOutcome::Retry { job, delay_ms } => {
                    assert_eq!(job.attempts_made, attempt);
                    assert_eq!(delay_ms, expected_delay);
                    assert!(job.finished_on.is_none());
                }
                other => panic!("expected retry, got {:?}", other),
            }
            assert_eq!(table.status_of(&stored.id).await, Some(JobStatus::Delayed));
        }

        table.claim(&stored.id, None).await.unwrap();
        let outcome = table.fail(&stored.id, "boom").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Exhausted { .. }));
        assert_eq!(outcome.job().attempts_made, 3);
        assert!(outcome.job().finished_on.is_some());
        assert_eq!(table.status_of(&stored.id).await, Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_complete_sets_terminal_fields() {
        let table = JobTable::new("table_test");
        let stored = table.insert(job(JobOptions::new()), None).await.job;
        table.claim(&stored.id, Some("receipt-1".to_string())).await.unwrap();
        assert_eq!(table.receipt(&stored.id).await.as_deref(), Some("receipt-1"));

        let done = table.complete(&stored.id, json!({"ok": true})).await.unwrap();
        assert_eq!(done.attempts_made, 1);
        assert!(done.finished_on.is_some());
        assert_eq!(done.return_value, Some(json!({"ok": true})));
        assert_eq!(table.status_of(&stored.id).await, Some(JobStatus::Completed));
        assert!(table.receipt(&stored.id).await.is_none());
    }

    #[tokio::test]
    async fn test_claim_rejects_duplicates() {
        let table = JobTable::new("table_test");
        let stored = table.insert(job(JobOptions::new()), None).await.job;

        assert!(table.claim(&stored.id, None).await.is_some());
        assert!(table.claim(&stored.id, None).await.is_none());
        table.complete(&stored.id, json!(null)).await.unwrap();
        assert!(table.claim(&stored.id, None).await.is_none());
        assert!(table.claim("missing", None).await.is_none());
    }

    #[tokio::test]
    async fn test_reset_for_retry_grants_new_attempts() {
        let table = JobTable::new("table_test");
        let stored = table.insert(job(JobOptions::new().with_attempts(1)), None).await.job;
        table.claim(&stored.id, None).await.unwrap();
        table.fail(&stored.id, "first").await.unwrap();

        let reset = table.reset_for_retry(&stored.id).await.unwrap();
        assert_eq!(reset.attempts_made, 1);
        assert!(reset.failed_reason.is_none());
        assert!(reset.finished_on.is_none());
        assert_eq!(table.status_of(&stored.id).await, Some(JobStatus::Waiting));

        table.claim(&stored.id, None).await.unwrap();
        let outcome = table.fail(&stored.id, "second").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Exhausted { .. }));
        assert_eq!(outcome.job().attempts_made, 2);
    }

    #[tokio::test]
    async fn test_reset_for_retry_rejects_non_failed() {
        let table = JobTable::new("table_test");
        let stored = table.insert(job(JobOptions::new()), None).await.job;
        assert!(table.reset_for_retry(&stored.id).await.is_err());
        assert!(matches!(
            table.reset_for_retry("missing").await,
            Err(ConveyorError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_filters_and_ranges() {
        let table = JobTable::new("table_test");
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(table.insert(job(JobOptions::new()), None).await.job.id);
        }
        table.claim(&ids[0], None).await.unwrap();
        table.complete(&ids[0], json!(null)).await.unwrap();

        let waiting = table.list(Some(JobStatus::Waiting), JobRange::all()).await;
        assert_eq!(waiting.len(), 4);
        assert_eq!(waiting[0].id, ids[1]);

        let window = table.list(None, JobRange::new(1, 3)).await;
        assert_eq!(window.iter().map(|j| j.id.clone()).collect::<Vec<_>>(), ids[1..3].to_vec());

        let completed = table.list(Some(JobStatus::Completed), JobRange::all()).await;
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_clean_removes_only_old_jobs_of_status() {
        let table = JobTable::new("table_test");
        let done = table.insert(job(JobOptions::new()), None).await.job;
        let pending = table.insert(job(JobOptions::new()), None).await.job;
        table.claim(&done.id, None).await.unwrap();
        table.complete(&done.id, json!(null)).await.unwrap();

        assert!(table.clean(Duration::from_secs(3600), JobStatus::Completed).await.is_empty());

        let removed = table.clean(Duration::ZERO, JobStatus::Completed).await;
        assert_eq!(removed, vec![done.id.clone()]);
        assert!(table.get(&done.id).await.is_none());
        assert!(table.get(&pending.id).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_policy_immediately() {
        let table = Arc::new(JobTable::new("table_test"));
        let stored = table
            .insert(job(JobOptions::new().with_remove_on_complete(RemovePolicy::Immediately)), None)
            .await.job;
        table.claim(&stored.id, None).await.unwrap();
        let done = table.complete(&stored.id, json!(null)).await.unwrap();

        table.apply_remove_policy(&done).await;
        assert!(table.get(&stored.id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_policy_after_delay() {
        let table = Arc::new(JobTable::new("table_test"));
        let stored = table
            .insert(job(JobOptions::new().with_remove_on_fail(RemovePolicy::After(30))), None)
            .await.job;
        table.claim(&stored.id, None).await.unwrap();
        let outcome = table.fail(&stored.id, "nope").await.unwrap();

        table.apply_remove_policy(outcome.job()).await;
        assert!(table.get(&stored.id).await.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(table.get(&stored.id).await.is_none());
    }

    #[tokio::test]
    async fn test_progress_and_logs() {
        let table = JobTable::new("table_test");
        let stored = table.insert(job(JobOptions::new()), None).await.job;

        table.set_progress(&stored.id, 150).await.unwrap();
        table.append_log(&stored.id, "step one".to_string()).await.unwrap();

        assert_eq!(table.get(&stored.id).await.unwrap().progress, 100);
        assert_eq!(table.logs(&stored.id).await, vec!["step one".to_string()]);
        assert!(table.set_progress("missing", 1).await.is_err());
    }

    #[test]
    fn test_deadline_after_saturates() {
        assert_eq!(deadline_after(u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(deadline_after(1_000) > Utc::now());
    }

    #[tokio::test]
    async fn test_registry_creates_tables_once() {
        let registry = QueueRegistry::new();
        let first = registry.table("emails").await;
        let second = registry.table("emails").await;
        assert!(Arc::ptr_eq(&first, &second));

        registry.table("reports").await;
        assert_eq!(registry.queue_names().await, vec!["emails".to_string(), "reports".to_string()]);

        assert!(registry.remove("emails").await.is_some());
        assert!(registry.get("emails").await.is_none());
    }
}
