//! RabbitMQ adapter built on `lapin`.
//!
//! Every queue is a durable AMQP queue declared with `x-max-priority`, so job
//! priority is honoured by the broker. Delays use a companion
//! `<queue>.delayed` queue with no consumers: messages sit there with a
//! per-message TTL and are dead-lettered into the main queue when it expires.
//! RabbitMQ only expires messages at the head of a queue, so a long delay can
//! hold back shorter ones published after it.
//!
//! The channel prefetch is the queue's concurrency. Pausing cancels the
//! consumer; unacknowledged messages stay with the broker.

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
        wire::{JobEnvelope, derived_name, encode_job},
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DELAYED_SUFFIX: &str = ".delayed";
const PERSISTENT: u8 = 2;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub struct RabbitMqSettings {
    pub url: String,
    /// Prefetch to use instead of the queue's concurrency.
    pub prefetch_override: Option<u16>,
    /// Declared `x-max-priority`. Zero disables broker priorities.
    pub max_priority: u8,
}

impl RabbitMqSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefetch_override: None,
            max_priority: 10,
        }
    }

    pub fn prefetch(&self, concurrency: usize) -> u16 {
        self.prefetch_override
            .unwrap_or_else(|| u16::try_from(concurrency.max(1)).unwrap_or(u16::MAX))
    }

    /// Arguments of the main queue.
    pub fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if self.max_priority > 0 {
            arguments.insert(
                ShortString::from("x-max-priority"),
                AMQPValue::LongInt(i32::from(self.max_priority)),
            );
        }
        arguments
    }

    /// Arguments of the delay queue: expired messages go to `queue` through the
    /// default exchange.
    pub fn delayed_queue_arguments(&self, queue: &str) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(queue)),
        );
        arguments
    }

    fn properties(&self, job: &Job) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from(job.id.as_str()));
        if self.max_priority > 0 {
            properties = properties.with_priority(job.opts.priority().min(self.max_priority));
        }
        properties
    }
}

/// Publishing side shared by the adapter and its consume loops.
#[derive(Clone)]
struct Publisher {
    channel: Channel,
    settings: Arc<RabbitMqSettings>,
}

impl Publisher {
    /// Publish `job` to `queue`, through the delay queue when `delay_ms > 0`.
    async fn publish(&self, queue: &str, job: &Job, delay_ms: u64) -> Result<()> {
        let payload = encode_job(job)?;
        let mut properties = self.settings.properties(job);
        let routing_key = if delay_ms > 0 {
            properties = properties.with_expiration(ShortString::from(delay_ms.to_string()));
            derived_name(queue, DELAYED_SUFFIX)
        } else {
            queue.to_string()
        };

        self.channel
            .basic_publish(
                "",
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(ConveyorError::connection)?
            .await
            .map_err(ConveyorError::connection)?;
        debug!(queue, routing_key = %routing_key, job_id = %job.id, "Published job");
        Ok(())
    }
}

struct Broker {
    connection: Connection,
    publisher: Publisher,
}

pub struct RabbitMqAdapter {
    settings: Arc<RabbitMqSettings>,
    registry: Arc<QueueRegistry>,
    broker: OnceLock<Broker>,
    declared: Mutex<HashSet<String>>,
    pauses: PauseSwitches,
    consumers: Consumers,
}

impl RabbitMqAdapter {
    pub fn new(settings: RabbitMqSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(QueueRegistry::new()),
            broker: OnceLock::new(),
            declared: Mutex::new(HashSet::new()),
            pauses: PauseSwitches::new(),
            consumers: Consumers::new(),
        }
    }

    pub fn settings(&self) -> &RabbitMqSettings {
        &self.settings
    }

    fn broker(&self) -> Result<&Broker> {
        self.broker.get().ok_or_else(|| ConveyorError::Initialization {
            message: "RabbitMQ adapter used before initialize()".to_string(),
        })
    }

    /// Declare the queue and its delay queue once per adapter.
    async fn declare(&self, queue: &str) -> Result<()> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }
        let channel = &self.broker()?.publisher.channel;
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .queue_declare(queue, options, self.settings.queue_arguments())
            .await
            .map_err(ConveyorError::connection)?;
        channel
            .queue_declare(
                &derived_name(queue, DELAYED_SUFFIX),
                options,
                self.settings.delayed_queue_arguments(queue),
            )
            .await
            .map_err(ConveyorError::connection)?;
        declared.insert(queue.to_string());
        debug!(queue, "Declared queue");
        Ok(())
    }

    async fn enqueue(&self, table: &Arc<JobTable>, job: Job) -> Result<Job> {
        let publisher = &self.broker()?.publisher;
        let delay_ms = job.opts.delay_ms();
        let delayed_until = (delay_ms > 0).then(|| deadline_after(delay_ms));
        let stored = table.insert(job, delayed_until).await;
        if !stored.inserted {
            return Ok(stored.job);
        }
        if let Err(e) = publisher.publish(table.name(), &stored.job, delay_ms).await {
            table.remove(&stored.job.id).await;
            return Err(e);
        }
        Ok(stored.job)
    }
}

struct Worker {
    table: Arc<JobTable>,
    handler: JobHandler,
    publisher: Publisher,
    queue: String,
}

impl Worker {
    async fn handle(&self, delivery: Delivery) {
        let receipt = delivery.delivery_tag.to_string();
        match JobEnvelope::decode(&delivery.data) {
            Err(e) => {
                let poisoned = self.table.record_poison();
                warn!(
                    queue = %self.queue,
                    delivery_tag = %receipt,
                    poisoned,
                    "Dropping poison message: {}",
                    e
                );
                self.ack(&delivery).await;
            }
            Ok(envelope) => match claim_delivery(&self.table, envelope, Some(receipt)).await {
                Claim::Run(job) => self.run(job, &delivery).await,
                Claim::Finished | Claim::Active => {
                    debug!(queue = %self.queue, "Acknowledging duplicate delivery");
                    self.ack(&delivery).await;
                }
            },
        }
    }

    async fn run(&self, job: Job, delivery: &Delivery) {
        let job_id = job.id.clone();
        match execute(&self.table, &self.handler, job).await {
            Ok(Execution::Retry { job, delay_ms }) => {
                // The retry carries the updated attempt count, so it is a new message.
                match self.publisher.publish(&self.queue, &job, delay_ms).await {
                    Ok(()) => self.ack(delivery).await,
                    Err(e) => {
                        error!(queue = %self.queue, job_id = %job_id, "Failed to republish job, requeueing: {}", e);
                        self.nack(delivery).await;
                    }
                }
            }
            Ok(_) => self.ack(delivery).await,
            Err(e) => {
                debug!(queue = %self.queue, job_id = %job_id, "Dropped job outcome: {}", e);
                self.ack(delivery).await;
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            warn!(queue = %self.queue, "Failed to acknowledge delivery: {}", e);
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        let options = BasicNackOptions {
            requeue: true,
            ..Default::default()
        };
        if let Err(e) = delivery.nack(options).await {
            warn!(queue = %self.queue, "Failed to reject delivery: {}", e);
        }
    }
}

/// How a consume session ended.
enum SessionEnd {
    Paused,
    Shutdown,
}

async fn consume_loop(
    worker: Arc<Worker>,
    channel: Channel,
    concurrency: usize,
    mut paused: watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = paused.wait_for(|paused| !*paused) => {}
        }

        match consume_session(&worker, &channel, &permits, &mut paused, &mut shutdown).await {
            Ok(SessionEnd::Paused) => info!(queue = %worker.queue, "Consumer paused"),
            Ok(SessionEnd::Shutdown) => break,
            Err(e) => {
                error!(queue = %worker.queue, "Consumer failed: {}", e);
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    if let Err(e) = channel.close(200, "consumer shutting down").await {
        debug!(queue = %worker.queue, "Failed to close consumer channel: {}", e);
    }
    info!(queue = %worker.queue, "RabbitMQ consumer shutting down");
}

async fn consume_session(
    worker: &Arc<Worker>,
    channel: &Channel,
    permits: &Arc<Semaphore>,
    paused: &mut watch::Receiver<bool>,
    shutdown: &mut ShutdownSignal,
) -> Result<SessionEnd> {
    let tag = format!("conveyor-{}-{}", worker.queue, Uuid::new_v4());
    let mut consumer = channel
        .basic_consume(
            &worker.queue,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(ConveyorError::connection)?;
    debug!(queue = %worker.queue, consumer_tag = %tag, "Consuming");

    let end = loop {
        let permit = tokio::select! {
            _ = shutdown_requested(shutdown) => break SessionEnd::Shutdown,
            _ = paused.wait_for(|paused| *paused) => break SessionEnd::Paused,
            permit = Arc::clone(permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break SessionEnd::Shutdown,
            },
        };

        let delivery = tokio::select! {
            _ = shutdown_requested(shutdown) => break SessionEnd::Shutdown,
            _ = paused.wait_for(|paused| *paused) => break SessionEnd::Paused,
            delivery = consumer.next() => delivery,
        };
        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return Err(ConveyorError::connection(e)),
            None => {
                return Err(ConveyorError::Connection {
                    message: format!("consumer {} was cancelled by the broker", tag),
                });
            }
        };

        let worker = Arc::clone(worker);
        tokio::spawn(async move {
            let _permit = permit;
            worker.handle(delivery).await;
        });
    };

    channel
        .basic_cancel(&tag, BasicCancelOptions::default())
        .await
        .map_err(ConveyorError::connection)?;

    // Deliveries that arrived before the cancel went through go back to the queue.
    let requeue = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };
    while let Ok(Some(Ok(delivery))) = tokio::time::timeout(DRAIN_TIMEOUT, consumer.next()).await {
        if let Err(e) = delivery.nack(requeue).await {
            warn!(queue = %worker.queue, "Failed to requeue prefetched delivery: {}", e);
        }
    }
    Ok(end)
}

#[async_trait]
impl QueueAdapter for RabbitMqAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::RabbitMq
    }

    async fn initialize(&self) -> Result<()> {
        if self.broker.get().is_some() {
            return Ok(());
        }
        let connection = Connection::connect(&self.settings.url, ConnectionProperties::default())
            .await
            .map_err(|e| ConveyorError::Connection {
                message: format!("RabbitMQ unreachable: {}", e),
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(ConveyorError::connection)?;

        let broker = Broker {
            connection,
            publisher: Publisher {
                channel,
                settings: Arc::clone(&self.settings),
            },
        };
        if let Err(Broker { connection, .. }) = self.broker.set(broker) {
            // Lost a race with a concurrent initialize.
            let _ = connection.close(200, "duplicate connection").await;
        }
        info!("RabbitMQ adapter initialized");
        Ok(())
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        self.declare(queue).await?;
        let table = self.registry.table(queue).await;
        let job = self.enqueue(&table, Job::new(queue, name, data, options)).await?;
        debug!(queue, job_id = %job.id, name, "Added job");
        Ok(job)
    }

    async fn add_bulk_jobs(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        self.declare(queue).await?;
        let table = self.registry.table(queue).await;
        let mut added = Vec::with_capacity(jobs.len());
        for bulk in jobs {
            let job = Job::new(queue, bulk.name, bulk.data, bulk.options);
            added.push(self.enqueue(&table, job).await?);
        }
        debug!(queue, count = added.len(), "Added bulk jobs");
        Ok(added)
    }

    async fn process(&self, queue: &str, concurrency: usize, handler: JobHandler) -> Result<()> {
        self.declare(queue).await?;
        let broker = self.broker()?;
        let concurrency = concurrency.max(1);
        let prefetch = self.settings.prefetch(concurrency);

        let channel = broker
            .connection
            .create_channel()
            .await
            .map_err(ConveyorError::connection)?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(ConveyorError::connection)?;

        let worker = Arc::new(Worker {
            table: self.registry.table(queue).await,
            handler,
            publisher: broker.publisher.clone(),
            queue: queue.to_string(),
        });
        let paused = self.pauses.watch(queue).await;
        self.consumers
            .start(queue, move |shutdown| {
                consume_loop(worker, channel, concurrency, paused, shutdown)
            })
            .await?;
        info!(queue, concurrency, prefetch, "Started RabbitMQ consumer");
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
        self.declare(queue).await?;
        self.broker()?.publisher.publish(queue, &job, 0).await?;
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
        self.declare(queue).await?;
        let channel = &self.broker()?.publisher.channel;
        let mut purged = 0;
        for name in [queue.to_string(), derived_name(queue, DELAYED_SUFFIX)] {
            purged += channel
                .queue_purge(&name, QueuePurgeOptions::default())
                .await
                .map_err(ConveyorError::connection)?;
        }
        let removed = match self.registry.get(queue).await {
            Some(table) => table.clear().await,
            None => 0,
        };
        info!(queue, purged, removed, "Obliterated queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.consumers.stop_all().await;
        if let Some(broker) = self.broker.get() {
            broker
                .connection
                .close(200, "adapter closed")
                .await
                .map_err(ConveyorError::connection)?;
        }
        info!("RabbitMQ adapter closed");
        Ok(())
    }
}
