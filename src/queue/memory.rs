//! In-process adapter.
//!
//! Jobs live only in the adapter's [`QueueRegistry`]. Each queue with a
//! registered handler runs a dispatch loop that ticks every `poll_interval`,
//! claims as many ready jobs as it has free concurrency permits and runs each in
//! its own task. Delays and retry backoff are tokio timers, so they are lost when
//! the process exits.

use crate::{
    ConveyorError, Result,
    job::{BulkJob, Job, JobId, JobOptions, JobRange, JobStatus},
    queue::{
        AdapterKind, Execution, JobHandler, QueueAdapter, QueueMetrics,
        consumer::{Consumers, ShutdownSignal, shutdown_requested},
        execute,
        table::{JobTable, QueueRegistry, deadline_after},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, time::MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct MemoryAdapter {
    registry: Arc<QueueRegistry>,
    poll_interval: Duration,
    consumers: Consumers,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            registry: Arc::new(QueueRegistry::new()),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            consumers: Consumers::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn existing_table(&self, queue: &str) -> Result<Arc<JobTable>> {
        self.registry
            .get(queue)
            .await
            .ok_or_else(|| ConveyorError::QueueNotFound {
                name: queue.to_string(),
            })
    }

    async fn enqueue(&self, table: &Arc<JobTable>, job: Job) -> Job {
        let delay_ms = job.opts.delay_ms();
        let delayed_until = (delay_ms > 0).then(|| deadline_after(delay_ms));
        let stored = table.insert(job, delayed_until).await;
        if let (true, Some(until)) = (stored.inserted, delayed_until) {
            schedule_promotion(Arc::clone(table), stored.job.id.clone(), until, delay_ms);
        }
        stored.job
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Make a delayed job ready once `delay_ms` has elapsed, provided it is still
/// held by the delay ending at `until`.
fn schedule_promotion(table: Arc<JobTable>, id: JobId, until: DateTime<Utc>, delay_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if table.promote(&id, until).await {
            debug!(queue = %table.name(), job_id = %id, "Delayed job is ready");
        }
    });
}

async fn dispatch_loop(
    table: Arc<JobTable>,
    handler: JobHandler,
    concurrency: usize,
    poll_interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                info!(queue = %table.name(), "In-memory consumer shutting down");
                break;
            }
            _ = ticker.tick() => {
                dispatch_ready(&table, &handler, &permits).await;
            }
        }
    }
}

async fn dispatch_ready(table: &Arc<JobTable>, handler: &JobHandler, permits: &Arc<Semaphore>) {
    let free = permits.available_permits();
    if free == 0 {
        return;
    }

    for job in table.claim_ready(free).await {
        let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
            table.release(&job.id).await;
            continue;
        };

        let table = Arc::clone(table);
        let handler = Arc::clone(handler);
        tokio::spawn(async move {
            let _permit = permit;
            let job_id = job.id.clone();
            match execute(&table, &handler, job).await {
                Ok(Execution::Retry { job, delay_ms }) if delay_ms > 0 => {
                    let until = table
                        .get_stored(&job.id)
                        .await
                        .and_then(|stored| stored.delayed_until);
                    if let Some(until) = until {
                        schedule_promotion(Arc::clone(&table), job.id, until, delay_ms);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(queue = %table.name(), job_id = %job_id, "Dropped job outcome: {}", e)
                }
            }
        });
    }
}

#[async_trait]
impl QueueAdapter for MemoryAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    async fn initialize(&self) -> Result<()> {
        debug!(poll_interval = ?self.poll_interval, "In-memory adapter initialized");
        Ok(())
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let table = self.registry.table(queue).await;
        let job = self.enqueue(&table, Job::new(queue, name, data, options)).await;
        debug!(queue, job_id = %job.id, name, "Added job");
        Ok(job)
    }

    async fn add_bulk_jobs(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        let table = self.registry.table(queue).await;
        let mut added = Vec::with_capacity(jobs.len());
        for bulk in jobs {
            let job = Job::new(queue, bulk.name, bulk.data, bulk.options);
            added.push(self.enqueue(&table, job).await);
        }
        debug!(queue, count = added.len(), "Added bulk jobs");
        Ok(added)
    }

    async fn process(&self, queue: &str, concurrency: usize, handler: JobHandler) -> Result<()> {
        let table = self.registry.table(queue).await;
        let concurrency = concurrency.max(1);
        let poll_interval = self.poll_interval;
        self.consumers
            .start(queue, move |shutdown| {
                dispatch_loop(table, handler, concurrency, poll_interval, shutdown)
            })
            .await?;
        info!(queue, concurrency, "Started in-memory consumer");
        Ok(())
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        Ok(match self.registry.get(queue).await {
            Some(table) => table.get(id).await,
            None => None,
        })
    }

    async fn get_jobs(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        range: JobRange,
    ) -> Result<Vec<Job>> {
        Ok(match self.registry.get(queue).await {
            Some(table) => table.list(status, range).await,
            None => Vec::new(),
        })
    }

    async fn get_job_logs(&self, queue: &str, id: &str) -> Result<Vec<String>> {
        Ok(match self.registry.get(queue).await {
            Some(table) => table.logs(id).await,
            None => Vec::new(),
        })
    }

    async fn remove_job(&self, queue: &str, id: &str) -> Result<()> {
        if let Some(table) = self.registry.get(queue).await {
            if table.remove(id).await.is_some() {
                debug!(queue, job_id = id, "Removed job");
            }
        }
        Ok(())
    }

    async fn retry_job(&self, queue: &str, id: &str) -> Result<Job> {
        let table = self.registry.get(queue).await.ok_or_else(|| ConveyorError::JobNotFound {
            id: id.to_string(),
        })?;
        let job = table.reset_for_retry(id).await?;
        info!(queue, job_id = id, "Retrying failed job");
        Ok(job)
    }

    async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.registry.table(queue).await.pause();
        info!(queue, "Paused queue");
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.registry.table(queue).await.resume();
        info!(queue, "Resumed queue");
        Ok(())
    }

    async fn get_metrics(&self, queue: &str) -> Result<QueueMetrics> {
        Ok(match self.registry.get(queue).await {
            Some(table) => table.metrics().await,
            None => QueueMetrics::default(),
        })
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobId>> {
        let table = self.existing_table(queue).await?;
        let removed = table
            .clean(grace, status.unwrap_or(JobStatus::Completed))
            .await;
        debug!(queue, count = removed.len(), "Cleaned jobs");
        Ok(removed)
    }

    async fn obliterate(&self, queue: &str) -> Result<()> {
        if let Some(table) = self.registry.get(queue).await {
            let removed = table.clear().await;
            info!(queue, removed, "Obliterated queue");
        } else {
            warn!(queue, "Obliterate requested for a queue with no jobs");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumers.stop_all().await;
        info!("In-memory adapter closed");
        Ok(())
    }
}
