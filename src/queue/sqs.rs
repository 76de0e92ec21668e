//! Amazon SQS adapter built on `aws-sdk-sqs`.
//!
//! One adapter serves one SQS queue URL. Consumers long-poll in batches of at
//! most ten messages, bounded by free concurrency. SQS caps message delays at 15
//! minutes. A longer delay or backoff travels as a `run_at` deadline in the
//! envelope: a consumer that receives the message early sends it again with the
//! remaining delay and deletes the copy it holds. Priority is carried in the
//! envelope but not enforced.
//!
//! A retried job is sent again with its updated attempt count and the original
//! message is deleted, so redeliveries after a restart still see the right count.

use crate::{
    ConveyorError, Result,
    job::{BulkJob, Job, JobId, JobOptions, JobRange, JobStatus},
    queue::{
        AdapterKind, Execution, JobHandler, QueueAdapter, QueueMetrics,
        consumer::{
            Claim, Consumers, PauseSwitches, ShutdownSignal, claim_delivery, shutdown_requested,
        },
        execute,
        table::{JobTable, QueueRegistry, deadline_after},
        wire::JobEnvelope,
    },
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::{
    Client,
    config::Region,
    types::{Message, QueueAttributeName, SendMessageBatchRequestEntry},
};
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

/// Largest `DelaySeconds` SQS accepts.
pub const MAX_DELAY_SECONDS: i32 = 900;
const MAX_DELAY_MS: u64 = MAX_DELAY_SECONDS as u64 * 1000;
/// Largest batch for `SendMessageBatch` and `ReceiveMessage`.
pub const MAX_BATCH_SIZE: usize = 10;
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct SqsSettings {
    pub queue_url: String,
    pub region: Option<String>,
    /// Custom endpoint, for local emulators.
    pub endpoint_url: Option<String>,
    /// Long-poll wait, 0 to 20 seconds.
    pub wait_time_seconds: i32,
    pub visibility_timeout_seconds: Option<i32>,
}

impl SqsSettings {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            region: None,
            endpoint_url: None,
            wait_time_seconds: 20,
            visibility_timeout_seconds: None,
        }
    }
}

/// `DelaySeconds` for a delay in milliseconds: rounded up, capped at 15 minutes.
pub fn delay_seconds(delay_ms: u64) -> i32 {
    let seconds = delay_ms.div_ceil(1000);
    i32::try_from(seconds)
        .unwrap_or(MAX_DELAY_SECONDS)
        .min(MAX_DELAY_SECONDS)
}

/// Milliseconds left until `run_at`; 0 when there is no deadline or it has passed.
pub fn remaining_delay_ms(run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    run_at
        .map(|at| (at - now).num_milliseconds())
        .and_then(|ms| u64::try_from(ms).ok())
        .unwrap_or(0)
}

/// Message body for `job` sent with `delay_ms`. A delay beyond what SQS can hold
/// is recorded as a deadline in the envelope.
fn message_body(job: &Job, delay_ms: u64) -> Result<String> {
    let mut envelope = JobEnvelope::from_job(job);
    if delay_ms > MAX_DELAY_MS {
        envelope = envelope.with_run_at(deadline_after(delay_ms));
    }
    encode_body(&envelope)
}

fn encode_body(envelope: &JobEnvelope) -> Result<String> {
    String::from_utf8(envelope.encode()?).map_err(ConveyorError::queue)
}

/// Messages to request when `available` handler slots are free.
pub fn receive_batch_size(available: usize) -> i32 {
    // Bounded by MAX_BATCH_SIZE, so the cast cannot truncate.
    available.clamp(1, MAX_BATCH_SIZE) as i32
}

pub struct SqsAdapter {
    settings: SqsSettings,
    registry: Arc<QueueRegistry>,
    client: OnceLock<Client>,
    pauses: PauseSwitches,
    consumers: Consumers,
}

impl SqsAdapter {
    pub fn new(settings: SqsSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(QueueRegistry::new()),
            client: OnceLock::new(),
            pauses: PauseSwitches::new(),
            consumers: Consumers::new(),
        }
    }

    pub fn settings(&self) -> &SqsSettings {
        &self.settings
    }

    fn client(&self) -> Result<&Client> {
        self.client.get().ok_or_else(|| ConveyorError::Initialization {
            message: "SQS adapter used before initialize()".to_string(),
        })
    }

    fn insert_delay(job: &Job) -> Option<chrono::DateTime<chrono::Utc>> {
        let delay_ms = job.opts.delay_ms();
        (delay_ms > 0).then(|| deadline_after(delay_ms))
    }
}

async fn send_body(client: &Client, queue_url: &str, body: String, delay_seconds: i32) -> Result<()> {
    client
        .send_message()
        .queue_url(queue_url)
        .message_body(body)
        .delay_seconds(delay_seconds)
        .send()
        .await
        .map_err(|e| ConveyorError::connection(aws_sdk_sqs::error::DisplayErrorContext(e)))?;
    Ok(())
}

async fn send(client: &Client, queue_url: &str, job: &Job, delay_ms: u64) -> Result<()> {
    let body = message_body(job, delay_ms)?;
    send_body(client, queue_url, body, delay_seconds(delay_ms)).await?;
    debug!(job_id = %job.id, delay_ms, "Sent job to SQS");
    Ok(())
}

/// Send up to [`MAX_BATCH_SIZE`] jobs in one request. Returns the positions of
/// the entries SQS rejected.
async fn send_batch(client: &Client, queue_url: &str, jobs: &[Job]) -> Result<Vec<usize>> {
    let mut entries = Vec::with_capacity(jobs.len());
    for (index, job) in jobs.iter().enumerate() {
        let body = message_body(job, job.opts.delay_ms())?;
        let entry = SendMessageBatchRequestEntry::builder()
            .id(index.to_string())
            .message_body(body)
            .delay_seconds(delay_seconds(job.opts.delay_ms()))
            .build()
            .map_err(ConveyorError::queue)?;
        entries.push(entry);
    }

    let output = client
        .send_message_batch()
        .queue_url(queue_url)
        .set_entries(Some(entries))
        .send()
        .await
        .map_err(|e| ConveyorError::connection(aws_sdk_sqs::error::DisplayErrorContext(e)))?;

    let mut rejected = Vec::with_capacity(output.failed().len());
    for failure in output.failed() {
        let index = failure.id().parse::<usize>().map_err(|_| ConveyorError::Queue {
            message: format!("SQS reported an unknown batch entry {}", failure.id()),
        })?;
        warn!(
            job_id = jobs.get(index).map(|job| job.id.as_str()).unwrap_or_default(),
            code = failure.code(),
            "SQS rejected batch entry: {}",
            failure.message().unwrap_or_default()
        );
        rejected.push(index);
    }
    Ok(rejected)
}

/// Send `jobs` in batches, stopping at the first batch that is not fully
/// accepted. Jobs that did not reach SQS are removed from `table`, so only
/// sent jobs stay visible locally.
async fn send_in_batches<F, Fut>(table: &JobTable, jobs: &[Job], mut send: F) -> Result<()>
where
    F: FnMut(Vec<Job>) -> Fut,
    Fut: Future<Output = Result<Vec<usize>>>,
{
    for (position, chunk) in jobs.chunks(MAX_BATCH_SIZE).enumerate() {
        let error = match send(chunk.to_vec()).await {
            Ok(rejected) if rejected.is_empty() => continue,
            Ok(rejected) => {
                for job in rejected.iter().filter_map(|index| chunk.get(*index)) {
                    table.remove(&job.id).await;
                }
                ConveyorError::Queue {
                    message: format!(
                        "SQS rejected {} of {} batch entries",
                        rejected.len(),
                        chunk.len()
                    ),
                }
            }
            Err(e) => {
                for job in chunk {
                    table.remove(&job.id).await;
                }
                e
            }
        };

        let unsent = jobs.get((position + 1) * MAX_BATCH_SIZE..).unwrap_or_default();
        for job in unsent {
            table.remove(&job.id).await;
        }
        return Err(error);
    }
    Ok(())
}

struct Worker {
    table: Arc<JobTable>,
    handler: JobHandler,
    client: Client,
    queue_url: String,
}

impl Worker {
    async fn handle(&self, message: Message) {
        let Some(receipt) = message.receipt_handle().map(str::to_string) else {
            warn!(queue = %self.table.name(), "Received a message without a receipt handle");
            return;
        };
        let body = message.body().unwrap_or_default();

        match JobEnvelope::decode(body.as_bytes()) {
            Err(e) => {
                let poisoned = self.table.record_poison();
                warn!(
                    queue = %self.table.name(),
                    message_id = message.message_id().unwrap_or_default(),
                    poisoned,
                    "Deleting poison message: {}",
                    e
                );
                self.delete(&receipt).await;
            }
            Ok(envelope) if remaining_delay_ms(envelope.run_at, Utc::now()) > 0 => {
                self.defer(envelope, &receipt).await;
            }
            Ok(envelope) => match claim_delivery(&self.table, envelope, Some(receipt.clone())).await {
                Claim::Run(job) => self.run(job, &receipt).await,
                Claim::Finished => {
                    debug!(queue = %self.table.name(), "Deleting duplicate of a finished job");
                    self.delete(&receipt).await;
                }
                // Reappears after its visibility timeout if the running attempt does not finish.
                Claim::Active => {
                    debug!(queue = %self.table.name(), "Job already running, leaving message")
                }
            },
        }
    }

    /// Send a message that arrived before its deadline back with the remaining
    /// delay, then delete the early copy.
    async fn defer(&self, envelope: JobEnvelope, receipt: &str) {
        let job_id = envelope.id.clone();
        match self.table.get_stored(&job_id).await {
            Some(stored) if stored.job.finished_on.is_some() => {
                debug!(
                    queue = %self.table.name(),
                    job_id = %job_id,
                    "Deleting deferred copy of a finished job"
                );
                self.delete(receipt).await;
                return;
            }
            Some(_) => {}
            None => {
                self.table
                    .insert(envelope.clone().into_job(), envelope.run_at)
                    .await;
            }
        }

        let remaining_ms = remaining_delay_ms(envelope.run_at, Utc::now());
        let sent = match encode_body(&envelope) {
            Ok(body) => {
                send_body(&self.client, &self.queue_url, body, delay_seconds(remaining_ms)).await
            }
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                debug!(queue = %self.table.name(), job_id = %job_id, remaining_ms, "Deferred job");
                self.delete(receipt).await;
            }
            Err(e) => warn!(
                queue = %self.table.name(),
                job_id = %job_id,
                "Failed to defer job, leaving message for redelivery: {}",
                e
            ),
        }
    }

    async fn run(&self, job: Job, receipt: &str) {
        let job_id = job.id.clone();
        match execute(&self.table, &self.handler, job).await {
            Ok(Execution::Retry { job, delay_ms }) => {
                match send(&self.client, &self.queue_url, &job, delay_ms).await {
                    Ok(()) => self.delete(receipt).await,
                    Err(e) => error!(
                        queue = %self.table.name(),
                        job_id = %job_id,
                        "Failed to resend job, leaving message for redelivery: {}",
                        e
                    ),
                }
            }
            Ok(_) => self.delete(receipt).await,
            Err(e) => {
                debug!(queue = %self.table.name(), job_id = %job_id, "Dropped job outcome: {}", e);
                self.delete(receipt).await;
            }
        }
    }

    async fn delete(&self, receipt: &str) {
        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await;
        if let Err(e) = result {
            warn!(
                queue = %self.table.name(),
                "Failed to delete message: {}",
                aws_sdk_sqs::error::DisplayErrorContext(e)
            );
        }
    }
}

async fn consume_loop(
    worker: Arc<Worker>,
    concurrency: usize,
    wait_time_seconds: i32,
    visibility_timeout_seconds: Option<i32>,
    mut paused: watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = paused.wait_for(|paused| !*paused) => {}
        }

        let first = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let mut slots: Vec<OwnedSemaphorePermit> = vec![first];
        while slots.len() < MAX_BATCH_SIZE {
            match Arc::clone(&permits).try_acquire_owned() {
                Ok(permit) => slots.push(permit),
                Err(_) => break,
            }
        }

        let request = worker
            .client
            .receive_message()
            .queue_url(&worker.queue_url)
            .max_number_of_messages(receive_batch_size(slots.len()))
            .wait_time_seconds(wait_time_seconds)
            .set_visibility_timeout(visibility_timeout_seconds)
            .send();
        let received = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            received = request => received,
        };
        let messages = match received {
            Ok(output) => output.messages.unwrap_or_default(),
            Err(e) => {
                warn!(
                    queue = %worker.table.name(),
                    "SQS receive failed: {}",
                    aws_sdk_sqs::error::DisplayErrorContext(e)
                );
                drop(slots);
                tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                continue;
            }
        };

        for message in messages {
            let Some(permit) = slots.pop() else {
                break;
            };
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let _permit = permit;
                worker.handle(message).await;
            });
        }
    }
    info!(queue = %worker.table.name(), "SQS consumer shutting down");
}

#[async_trait]
impl QueueAdapter for SqsAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sqs
    }

    async fn initialize(&self) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let client = Client::new(&loader.load().await);

        client
            .get_queue_attributes()
            .queue_url(&self.settings.queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| ConveyorError::Connection {
                message: format!(
                    "SQS queue {} unreachable: {}",
                    self.settings.queue_url,
                    aws_sdk_sqs::error::DisplayErrorContext(e)
                ),
            })?;

        let _ = self.client.set(client);
        info!(queue_url = %self.settings.queue_url, "SQS adapter initialized");
        Ok(())
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let client = self.client()?;
        let table = self.registry.table(queue).await;
        let job = Job::new(queue, name, data, options);
        let stored = table.insert(job.clone(), Self::insert_delay(&job)).await;
        if stored.inserted {
            if let Err(e) = send(client, &self.settings.queue_url, &job, job.opts.delay_ms()).await {
                table.remove(&job.id).await;
                return Err(e);
            }
        }
        debug!(queue, job_id = %stored.job.id, name, "Added job");
        Ok(stored.job)
    }

    async fn add_bulk_jobs(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        let client = self.client()?;
        let table = self.registry.table(queue).await;

        let mut added = Vec::with_capacity(jobs.len());
        let mut to_send = Vec::with_capacity(jobs.len());
        for bulk in jobs {
            let job = Job::new(queue, bulk.name, bulk.data, bulk.options);
            let stored = table.insert(job.clone(), Self::insert_delay(&job)).await;
            if stored.inserted {
                to_send.push(job);
            }
            added.push(stored.job);
        }

        let queue_url = self.settings.queue_url.as_str();
        send_in_batches(&table, &to_send, move |chunk| async move {
            send_batch(client, queue_url, &chunk).await
        })
        .await?;
        debug!(queue, count = added.len(), "Added bulk jobs");
        Ok(added)
    }

    async fn process(&self, queue: &str, concurrency: usize, handler: JobHandler) -> Result<()> {
        let worker = Arc::new(Worker {
            table: self.registry.table(queue).await,
            handler,
            client: self.client()?.clone(),
            queue_url: self.settings.queue_url.clone(),
        });
        let concurrency = concurrency.max(1);
        let wait_time_seconds = self.settings.wait_time_seconds.clamp(0, 20);
        let visibility_timeout_seconds = self.settings.visibility_timeout_seconds;
        let paused = self.pauses.watch(queue).await;
        self.consumers
            .start(queue, move |shutdown| {
                consume_loop(
                    worker,
                    concurrency,
                    wait_time_seconds,
                    visibility_timeout_seconds,
                    paused,
                    shutdown,
                )
            })
            .await?;
        info!(queue, concurrency, queue_url = %self.settings.queue_url, "Started SQS consumer");
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
            table.remove(id).await;
        }
        Ok(())
    }

    async fn retry_job(&self, queue: &str, id: &str) -> Result<Job> {
        let table = self.registry.get(queue).await.ok_or_else(|| ConveyorError::JobNotFound {
            id: id.to_string(),
        })?;
        let job = table.reset_for_retry(id).await?;
        send(self.client()?, &self.settings.queue_url, &job, 0).await?;
        info!(queue, job_id = id, "Retrying failed job");
        Ok(job)
    }

    async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.registry.table(queue).await.pause();
        self.pauses.set(queue, true).await;
        info!(queue, "Paused queue");
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.registry.table(queue).await.resume();
        self.pauses.set(queue, false).await;
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
        let table = self.registry.get(queue).await.ok_or_else(|| ConveyorError::QueueNotFound {
            name: queue.to_string(),
        })?;
        Ok(table.clean(grace, status.unwrap_or(JobStatus::Completed)).await)
    }

    async fn obliterate(&self, queue: &str) -> Result<()> {
        self.client()?
            .purge_queue()
            .queue_url(&self.settings.queue_url)
            .send()
            .await
            .map_err(|e| ConveyorError::connection(aws_sdk_sqs::error::DisplayErrorContext(e)))?;
        let removed = match self.registry.get(queue).await {
            Some(table) => table.clear().await,
            None => 0,
        };
        info!(queue, removed, "Obliterated queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumers.stop_all().await;
        info!("SQS adapter closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delay_seconds_rounds_up_and_caps() {
        assert_eq!(delay_seconds(0), 0);
        assert_eq!(delay_seconds(1), 1);
        assert_eq!(delay_seconds(1_000), 1);
        assert_eq!(delay_seconds(1_001), 2);
        assert_eq!(delay_seconds(3_600_000), MAX_DELAY_SECONDS);
        assert_eq!(delay_seconds(u64::MAX), MAX_DELAY_SECONDS);
    }

    #[test]
    fn test_receive_batch_size() {
        assert_eq!(receive_batch_size(0), 1);
        assert_eq!(receive_batch_size(4), 4);
        assert_eq!(receive_batch_size(64), 10);
    }

    #[test]
    fn test_remaining_delay_ms() {
        let now = Utc::now();
        assert_eq!(remaining_delay_ms(None, now), 0);
        assert_eq!(remaining_delay_ms(Some(now - chrono::Duration::seconds(5)), now), 0);
        assert_eq!(remaining_delay_ms(Some(now), now), 0);
        assert_eq!(
            remaining_delay_ms(Some(now + chrono::Duration::seconds(3_600)), now),
            3_600_000
        );
    }

    #[test]
    fn test_long_delays_carry_a_deadline() {
        let job = Job::new("q", "later", json!({}), JobOptions::new());

        let short = JobEnvelope::decode(message_body(&job, 60_000).unwrap().as_bytes()).unwrap();
        assert_eq!(short.run_at, None);
        let at_limit = JobEnvelope::decode(message_body(&job, 900_000).unwrap().as_bytes()).unwrap();
        assert_eq!(at_limit.run_at, None);

        let before = Utc::now();
        let long = JobEnvelope::decode(message_body(&job, 3_600_000).unwrap().as_bytes()).unwrap();
        let remaining = remaining_delay_ms(long.run_at, before);
        assert!(remaining > 3_590_000 && remaining <= 3_601_000);
        // The first hop waits the longest delay SQS allows.
        assert_eq!(delay_seconds(3_600_000), MAX_DELAY_SECONDS);
    }

    async fn queued_jobs(table: &JobTable, count: usize) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(count);
        for i in 0..count {
            let job = Job::new("q", format!("job-{}", i), json!(i), JobOptions::new());
            table.insert(job.clone(), None).await;
            jobs.push(job);
        }
        jobs
    }

    #[tokio::test]
    async fn test_failed_batch_drops_it_and_every_later_job() {
        let table = JobTable::new("q");
        let jobs = queued_jobs(&table, 25).await;

        let mut calls = 0;
        let result = send_in_batches(&table, &jobs, |_chunk| {
            calls += 1;
            let call = calls;
            async move {
                if call == 2 {
                    Err(ConveyorError::connection("connection reset"))
                } else {
                    Ok(Vec::new())
                }
            }
        })
        .await;

        assert!(matches!(result, Err(ConveyorError::Connection { .. })));
        assert_eq!(calls, 2);
        assert_eq!(table.metrics().await.waiting, 10);
        assert!(table.get(&jobs[9].id).await.is_some());
        assert!(table.get(&jobs[10].id).await.is_none());
        assert!(table.get(&jobs[24].id).await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_entries_are_dropped_and_accepted_ones_kept() {
        let table = JobTable::new("q");
        let jobs = queued_jobs(&table, 15).await;

        let result = send_in_batches(&table, &jobs, |chunk| async move {
            assert_eq!(chunk.len(), MAX_BATCH_SIZE);
            Ok(vec![3, 7])
        })
        .await;

        assert!(matches!(result, Err(ConveyorError::Queue { .. })));
        assert_eq!(table.metrics().await.waiting, 8);
        assert!(table.get(&jobs[0].id).await.is_some());
        assert!(table.get(&jobs[3].id).await.is_none());
        assert!(table.get(&jobs[7].id).await.is_none());
        assert!(table.get(&jobs[12].id).await.is_none());
    }

    #[tokio::test]
    async fn test_all_batches_accepted() {
        let table = JobTable::new("q");
        let jobs = queued_jobs(&table, 25).await;

        let mut sizes = Vec::new();
        send_in_batches(&table, &jobs, |chunk| {
            sizes.push(chunk.len());
            async { Ok(Vec::new()) }
        })
        .await
        .unwrap();

        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(table.metrics().await.waiting, 25);
    }

    #[tokio::test]
    async fn test_uninitialized_adapter_rejects_jobs() {
        let adapter = SqsAdapter::new(SqsSettings::new(
            "https://sqs.us-east-1.amazonaws.com/123456789012/emails",
        ));
        let result = adapter
            .add_job("emails", "welcome", json!({}), JobOptions::new())
            .await;
        assert!(matches!(result, Err(ConveyorError::Initialization { .. })));
        assert!(adapter.get_job("emails", "missing").await.unwrap().is_none());
    }
}
