//! Kafka adapter built on `rdkafka`.
//!
//! Each queue maps to one topic (`topic_prefix` + queue name) consumed by a
//! consumer group. Jobs are keyed by id so redeliveries of one job land on the
//! same partition.
//!
//! Kafka has no native delay or priority:
//!
//! - delayed jobs and retry backoff are held by an in-process timer and
//!   published once it fires, so they are lost if the process exits first
//! - priority is carried in the envelope but not enforced
//!
//! Messages of one partition may be handled concurrently, but an offset is stored
//! only once it and every earlier offset received from that partition have been
//! handled. The client's auto-commit then never moves past an unfinished message,
//! which gives at-least-once delivery.

use crate::{
    ConveyorError, Result,
    job::{BulkJob, Job, JobId, JobOptions, JobRange, JobStatus},
    queue::{
        AdapterKind, Execution, JobHandler, QueueAdapter, QueueMetrics,
        consumer::{Claim, Consumers, ShutdownSignal, claim_delivery, shutdown_requested},
        execute,
        table::{JobTable, QueueRegistry, deadline_after},
        wire::{JobEnvelope, encode_job},
    },
};
use async_trait::async_trait;
use futures_util::future::join_all;
use rdkafka::{
    ClientConfig, Message, Offset,
    consumer::{Consumer, StreamConsumer},
    message::OwnedMessage,
    producer::{FutureProducer, FutureRecord, Producer},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSettings {
    /// Comma separated `host:port` list.
    pub brokers: String,
    pub client_id: String,
    pub group_id: String,
    pub topic_prefix: Option<String>,
    /// Extra librdkafka properties applied to producer and consumers.
    pub extra: BTreeMap<String, String>,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: "conveyor".to_string(),
            group_id: "conveyor".to_string(),
            topic_prefix: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn topic(&self, queue: &str) -> String {
        format!("{}{}", self.topic_prefix.as_deref().unwrap_or(""), queue)
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id);
        for (key, value) in &self.extra {
            config.set(key, value);
        }
        config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config.set("message.timeout.ms", "30000");
        config
    }

    pub fn consumer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        config
    }
}

pub struct KafkaAdapter {
    settings: KafkaSettings,
    registry: Arc<QueueRegistry>,
    producer: OnceLock<FutureProducer>,
    /// Live consumer per queue, used to pause and resume its partitions.
    assignments: RwLock<HashMap<String, Arc<StreamConsumer>>>,
    consumers: Consumers,
}

impl KafkaAdapter {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            registry: Arc::new(QueueRegistry::new()),
            producer: OnceLock::new(),
            assignments: RwLock::new(HashMap::new()),
            consumers: Consumers::new(),
        }
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    fn producer(&self) -> Result<&FutureProducer> {
        self.producer.get().ok_or_else(|| ConveyorError::Initialization {
            message: "Kafka adapter used before initialize()".to_string(),
        })
    }

    /// Store `job` locally and publish it now, or after its delay.
    async fn enqueue(&self, table: &Arc<JobTable>, job: Job) -> Result<Job> {
        let producer = self.producer()?.clone();
        let topic = self.settings.topic(table.name());
        let delay_ms = job.opts.delay_ms();
        let delayed_until = (delay_ms > 0).then(|| deadline_after(delay_ms));
        let stored = table.insert(job, delayed_until).await;
        if !stored.inserted {
            return Ok(stored.job);
        }

        if delay_ms > 0 {
            publish_later(producer, topic, stored.job.clone(), delay_ms);
        } else if let Err(e) = publish(&producer, &topic, &stored.job).await {
            table.remove(&stored.job.id).await;
            return Err(e);
        }
        Ok(stored.job)
    }

    async fn set_partitions_paused(&self, queue: &str, paused: bool) -> Result<()> {
        let Some(consumer) = self.assignments.read().await.get(queue).cloned() else {
            return Ok(());
        };
        let assignment = consumer.assignment().map_err(ConveyorError::connection)?;
        if paused {
            consumer.pause(&assignment).map_err(ConveyorError::connection)?;
        } else {
            consumer.resume(&assignment).map_err(ConveyorError::connection)?;
        }
        Ok(())
    }
}

async fn publish(producer: &FutureProducer, topic: &str, job: &Job) -> Result<()> {
    let payload = encode_job(job)?;
    let record = FutureRecord::to(topic).key(job.id.as_str()).payload(&payload);
    producer
        .send(record, SEND_TIMEOUT)
        .await
        .map_err(|(e, _)| ConveyorError::connection(e))?;
    debug!(topic, job_id = %job.id, "Published job");
    Ok(())
}

/// Publish once `delay_ms` has elapsed.
fn publish_later(producer: FutureProducer, topic: String, job: Job, delay_ms: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if let Err(e) = publish(&producer, &topic, &job).await {
            error!(topic = %topic, job_id = %job.id, "Failed to publish delayed job: {}", e);
        }
    });
}

#[derive(Debug, Default)]
struct PartitionProgress {
    in_flight: BTreeSet<i64>,
    /// Handled offsets not yet covered by a stored offset.
    done: BTreeSet<i64>,
}

/// Tracks handled offsets per partition and reports the highest offset that is
/// safe to store: one with no unfinished offset at or below it.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionProgress>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was received and is being handled.
    pub fn begin(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Record that `offset` was handled. Returns the offset to store, if the
    /// safe point moved forward.
    pub fn finish(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let progress = self.partitions.get_mut(&partition)?;
        if !progress.in_flight.remove(&offset) {
            return None;
        }
        progress.done.insert(offset);

        let safe = match progress.in_flight.first() {
            Some(&earliest) => progress.done.range(..earliest).next_back().copied(),
            None => progress.done.last().copied(),
        }?;
        progress.done = progress.done.split_off(&(safe + 1));
        Some(safe)
    }
}

struct Worker {
    table: Arc<JobTable>,
    handler: JobHandler,
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
    topic: String,
    offsets: Mutex<OffsetTracker>,
}

impl Worker {
    async fn handle(&self, message: OwnedMessage) {
        let payload = message.payload().unwrap_or_default();
        match JobEnvelope::decode(payload) {
            Err(e) => {
                let poisoned = self.table.record_poison();
                warn!(
                    topic = %self.topic,
                    partition = message.partition(),
                    offset = message.offset(),
                    poisoned,
                    "Skipping poison message: {}",
                    e
                );
            }
            Ok(envelope) => match claim_delivery(&self.table, envelope, None).await {
                Claim::Run(job) => self.run(job).await,
                Claim::Finished | Claim::Active => {
                    debug!(topic = %self.topic, offset = message.offset(), "Skipping duplicate delivery")
                }
            },
        }

        let Some(offset) = self.tracker().finish(message.partition(), message.offset()) else {
            return;
        };
        if let Err(e) = self
            .consumer
            .store_offset(message.topic(), message.partition(), offset)
        {
            warn!(topic = %self.topic, offset, "Failed to store offset: {}", e);
        }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, OffsetTracker> {
        match self.offsets.lock() {
            Ok(tracker) => tracker,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run(&self, job: Job) {
        let job_id = job.id.clone();
        match execute(&self.table, &self.handler, job).await {
            Ok(Execution::Retry { job, delay_ms }) if delay_ms > 0 => {
                publish_later(self.producer.clone(), self.topic.clone(), job, delay_ms);
            }
            Ok(Execution::Retry { job, .. }) => {
                if let Err(e) = publish(&self.producer, &self.topic, &job).await {
                    error!(topic = %self.topic, job_id = %job_id, "Failed to republish job: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(topic = %self.topic, job_id = %job_id, "Dropped job outcome: {}", e),
        }
    }

    /// Hold the message's partition and rewind it so the message is delivered
    /// again after resume.
    fn hold(&self, message: &OwnedMessage) {
        if let Ok(assignment) = self.consumer.assignment() {
            if let Err(e) = self.consumer.pause(&assignment) {
                warn!(topic = %self.topic, "Failed to pause partitions: {}", e);
            }
        }
        if let Err(e) = self.consumer.seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            SEND_TIMEOUT,
        ) {
            warn!(topic = %self.topic, offset = message.offset(), "Failed to rewind paused partition: {}", e);
        }
    }
}

async fn consume_loop(worker: Arc<Worker>, concurrency: usize, mut shutdown: ShutdownSignal) {
    let permits = Arc::new(Semaphore::new(concurrency));
    loop {
        let permit = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            received = worker.consumer.recv() => received.map(|message| message.detach()),
        };
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %worker.topic, "Kafka receive failed: {}", e);
                tokio::time::sleep(RECV_ERROR_PAUSE).await;
                continue;
            }
        };

        if worker.table.is_paused() {
            worker.hold(&message);
            continue;
        }

        worker.tracker().begin(message.partition(), message.offset());
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            let _permit = permit;
            worker.handle(message).await;
        });
    }
    info!(topic = %worker.topic, "Kafka consumer shutting down");
}

#[async_trait]
impl QueueAdapter for KafkaAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Kafka
    }

    async fn initialize(&self) -> Result<()> {
        if self.producer.get().is_some() {
            return Ok(());
        }
        let producer: FutureProducer = self
            .settings
            .producer_config()
            .create()
            .map_err(ConveyorError::connection)?;

        let metadata_producer = producer.clone();
        tokio::task::spawn_blocking(move || {
            metadata_producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
            .map_err(ConveyorError::connection)?
            .map_err(|e| ConveyorError::Connection {
                message: format!("Kafka brokers {} unreachable: {}", self.settings.brokers, e),
            })?;

        // A concurrent initialize may have won; either producer is usable.
        let _ = self.producer.set(producer);
        info!(brokers = %self.settings.brokers, "Kafka adapter initialized");
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
        let job = self.enqueue(&table, Job::new(queue, name, data, options)).await?;
        debug!(queue, job_id = %job.id, name, "Added job");
        Ok(job)
    }

    async fn add_bulk_jobs(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        let table = self.registry.table(queue).await;
        let sends = jobs.into_iter().map(|bulk| {
            let job = Job::new(queue, bulk.name, bulk.data, bulk.options);
            self.enqueue(&table, job)
        });
        // Every publish runs to completion; a failed one removes only its own job.
        let added = join_all(sends)
            .await
            .into_iter()
            .collect::<Result<Vec<Job>>>()?;
        debug!(queue, count = added.len(), "Added bulk jobs");
        Ok(added)
    }

    async fn process(&self, queue: &str, concurrency: usize, handler: JobHandler) -> Result<()> {
        let producer = self.producer()?.clone();
        let topic = self.settings.topic(queue);
        let consumer: StreamConsumer = self
            .settings
            .consumer_config()
            .create()
            .map_err(ConveyorError::connection)?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(ConveyorError::connection)?;
        let consumer = Arc::new(consumer);

        let worker = Arc::new(Worker {
            table: self.registry.table(queue).await,
            handler,
            producer,
            consumer: Arc::clone(&consumer),
            topic: topic.clone(),
            offsets: Mutex::new(OffsetTracker::new()),
        });
        let concurrency = concurrency.max(1);
        self.consumers
            .start(queue, move |shutdown| consume_loop(worker, concurrency, shutdown))
            .await?;
        self.assignments
            .write()
            .await
            .insert(queue.to_string(), consumer);
        info!(queue, topic = %topic, concurrency, "Started Kafka consumer");
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
        publish(self.producer()?, &self.settings.topic(queue), &job).await?;
        info!(queue, job_id = id, "Retrying failed job");
        Ok(job)
    }

    async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.registry.table(queue).await.pause();
        self.set_partitions_paused(queue, true).await?;
        info!(queue, "Paused queue");
        Ok(())
    }

    async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.registry.table(queue).await.resume();
        self.set_partitions_paused(queue, false).await?;
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
        let removed = match self.registry.get(queue).await {
            Some(table) => table.clear().await,
            None => 0,
        };
        // Topic retention is managed by the cluster; records already written stay.
        warn!(
            queue,
            topic = %self.settings.topic(queue),
            removed,
            "Obliterated local job state; records remain in the topic until retention expires"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumers.stop_all().await;
        for (queue, consumer) in self.assignments.write().await.drain() {
            consumer.unsubscribe();
            debug!(queue = %queue, "Unsubscribed Kafka consumer");
        }
        if let Some(producer) = self.producer.get() {
            let producer = producer.clone();
            tokio::task::spawn_blocking(move || producer.flush(SEND_TIMEOUT))
                .await
                .map_err(ConveyorError::connection)?
                .map_err(ConveyorError::connection)?;
        }
        info!("Kafka adapter closed");
        Ok(())
    }
}
