//! The entry point applications use.
//!
//! A [`QueueManager`] owns every registered queue together with the adapter
//! that serves it. It merges queue-level default job options into each
//! submission, throttles handler starts when a limiter is configured, and wraps
//! handlers so lifecycle events are published without changing what the handler
//! returns.
//!
//! # Examples
//!
//! ```rust
//! use conveyor::{QueueManager, config::QueueOptions, job::JobOptions, queue::handler};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> conveyor::Result<()> {
//! let manager = QueueManager::new();
//! manager
//!     .register_queue("emails", QueueOptions::memory().with_concurrency(2))
//!     .await?;
//!
//! manager
//!     .process("emails", handler(|ctx| async move {
//!         ctx.log("sending").await?;
//!         Ok(json!({"sent_to": ctx.data()["to"]}))
//!     }))
//!     .await?;
//!
//! let job = manager
//!     .add_job("emails", "welcome", json!({"to": "a@example.com"}), JobOptions::new())
//!     .await?;
//! assert_eq!(job.queue_name, "emails");
//!
//! manager.close_all().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    ConveyorError, Result,
    config::{ConnectionConfig, ConveyorConfig, QueueOptions},
    events::{EventConfig, EventFilter, EventManager, EventSubscription, QueueEvent},
    job::{BulkJob, Job, JobContext, JobId, JobOptions, JobRange, JobStatus},
    queue::{JobHandler, QueueAdapter, QueueMetrics, memory::MemoryAdapter},
    rate_limit::RateLimiter,
};
use futures_util::FutureExt;
use std::{
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Clone)]
struct RegisteredQueue {
    options: QueueOptions,
    adapter: Arc<dyn QueueAdapter>,
    limiter: Option<RateLimiter>,
}

pub struct QueueManager {
    queues: RwLock<HashMap<String, RegisteredQueue>>,
    events: Arc<EventManager>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::with_event_config(EventConfig::default())
    }

    pub fn with_event_config(config: EventConfig) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            events: Arc::new(EventManager::new(config)),
        }
    }

    /// Build a manager and register every queue in `config`.
    pub async fn from_config(config: &ConveyorConfig) -> Result<Self> {
        let manager = Self::with_event_config(config.events.clone());
        for (name, options) in &config.queues {
            manager.register_queue(name, options.clone()).await?;
        }
        Ok(manager)
    }

    /// Create the adapter `options` describe, initialize it and register it
    /// under `name`.
    pub async fn register_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        options.validate()?;
        let adapter = create_adapter(&options.connection)?;
        self.register_queue_with_adapter(name, options, adapter).await
    }

    /// Register a queue served by a caller-supplied adapter.
    pub async fn register_queue_with_adapter(
        &self,
        name: &str,
        options: QueueOptions,
        adapter: Arc<dyn QueueAdapter>,
    ) -> Result<()> {
        if self.queues.read().await.contains_key(name) {
            return Err(ConveyorError::QueueAlreadyRegistered {
                name: name.to_string(),
            });
        }

        adapter.initialize().await?;

        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Err(ConveyorError::QueueAlreadyRegistered {
                name: name.to_string(),
            });
        }
        let limiter = options.limiter.clone().map(RateLimiter::new);
        info!(
            queue = name,
            adapter = %adapter.kind(),
            concurrency = options.concurrency,
            "Registered queue"
        );
        queues.insert(
            name.to_string(),
            RegisteredQueue {
                options,
                adapter,
                limiter,
            },
        );
        Ok(())
    }

    async fn queue(&self, name: &str) -> Result<RegisteredQueue> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ConveyorError::QueueNotFound {
                name: name.to_string(),
            })
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn queue_options(&self, name: &str) -> Result<QueueOptions> {
        Ok(self.queue(name).await?.options)
    }

    /// Submit a job. `options` take precedence over the queue's defaults.
    pub async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let registered = self.queue(queue).await?;
        let options = registered.options.default_job_options.merge(&options);
        let job = registered.adapter.add_job(queue, name, data, options).await?;
        self.events.publish_event(QueueEvent::added(&job));
        Ok(job)
    }

    pub async fn add_bulk_jobs(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        let registered = self.queue(queue).await?;
        let defaults = &registered.options.default_job_options;
        let jobs = jobs
            .into_iter()
            .map(|job| {
                let options = defaults.merge(&job.options);
                job.with_options(options)
            })
            .collect();
        let added = registered.adapter.add_bulk_jobs(queue, jobs).await?;
        for job in &added {
            self.events.publish_event(QueueEvent::added(job));
        }
        Ok(added)
    }

    /// Start consuming `queue` with its configured concurrency.
    pub async fn process(&self, queue: &str, handler: JobHandler) -> Result<()> {
        let registered = self.queue(queue).await?;
        let wrapped = wrap_handler(handler, Arc::clone(&self.events), registered.limiter.clone());
        registered
            .adapter
            .process(queue, registered.options.concurrency, wrapped)
            .await
    }

    pub async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        self.queue(queue).await?.adapter.get_job(queue, id).await
    }

    pub async fn get_jobs(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        range: JobRange,
    ) -> Result<Vec<Job>> {
        self.queue(queue)
            .await?
            .adapter
            .get_jobs(queue, status, range)
            .await
    }

    pub async fn get_job_logs(&self, queue: &str, id: &str) -> Result<Vec<String>> {
        self.queue(queue).await?.adapter.get_job_logs(queue, id).await
    }

    pub async fn remove_job(&self, queue: &str, id: &str) -> Result<()> {
        self.queue(queue).await?.adapter.remove_job(queue, id).await
    }

    pub async fn retry_job(&self, queue: &str, id: &str) -> Result<Job> {
        self.queue(queue).await?.adapter.retry_job(queue, id).await
    }

    pub async fn pause_queue(&self, queue: &str) -> Result<()> {
        self.queue(queue).await?.adapter.pause_queue(queue).await
    }

    pub async fn resume_queue(&self, queue: &str) -> Result<()> {
        self.queue(queue).await?.adapter.resume_queue(queue).await
    }

    pub async fn get_metrics(&self, queue: &str) -> Result<QueueMetrics> {
        self.queue(queue).await?.adapter.get_metrics(queue).await
    }

    /// Metrics for every registered queue, by name.
    pub async fn get_all_metrics(&self) -> Result<BTreeMap<String, QueueMetrics>> {
        let queues: Vec<(String, Arc<dyn QueueAdapter>)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(name, registered)| (name.clone(), Arc::clone(&registered.adapter)))
            .collect();

        let mut metrics = BTreeMap::new();
        for (name, adapter) in queues {
            let queue_metrics = adapter.get_metrics(&name).await?;
            metrics.insert(name, queue_metrics);
        }
        Ok(metrics)
    }

    pub async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobId>> {
        self.queue(queue)
            .await?
            .adapter
            .clean(queue, grace, status)
            .await
    }

    pub async fn obliterate(&self, queue: &str) -> Result<()> {
        self.queue(queue).await?.adapter.obliterate(queue).await
    }

    pub async fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.events.subscribe(filter).await
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// Close every adapter. One adapter failing to close does not stop the
    /// others; all failures are reported together.
    pub async fn close_all(&self) -> Result<()> {
        let queues: Vec<(String, RegisteredQueue)> = self.queues.write().await.drain().collect();

        let mut failures = Vec::new();
        for (name, registered) in queues {
            match registered.adapter.close().await {
                Ok(()) => info!(queue = %name, "Closed queue"),
                Err(e) => {
                    error!(queue = %name, "Failed to close queue: {}", e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConveyorError::Shutdown { failures })
        }
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantiate the adapter for a connection. Adapters whose cargo feature is
/// not compiled in are a configuration error.
pub fn create_adapter(connection: &ConnectionConfig) -> Result<Arc<dyn QueueAdapter>> {
    match connection {
        ConnectionConfig::Memory { poll_interval } => {
            Ok(Arc::new(MemoryAdapter::with_poll_interval(*poll_interval)))
        }
        #[cfg(feature = "kafka")]
        ConnectionConfig::Kafka {
            brokers,
            client_id,
            group_id,
            topic_prefix,
            extra,
        } => Ok(Arc::new(crate::queue::kafka::KafkaAdapter::new(
            crate::queue::kafka::KafkaSettings {
                brokers: brokers.clone(),
                client_id: client_id.clone(),
                group_id: group_id.clone(),
                topic_prefix: topic_prefix.clone(),
                extra: extra.clone(),
            },
        ))),
        #[cfg(feature = "rabbitmq")]
        ConnectionConfig::RabbitMq {
            url,
            prefetch_override,
            max_priority,
        } => Ok(Arc::new(crate::queue::rabbitmq::RabbitMqAdapter::new(
            crate::queue::rabbitmq::RabbitMqSettings {
                url: url.clone(),
                prefetch_override: *prefetch_override,
                max_priority: *max_priority,
            },
        ))),
        #[cfg(feature = "sqs")]
        ConnectionConfig::Sqs {
            queue_url,
            region,
            endpoint_url,
            wait_time_seconds,
            visibility_timeout_seconds,
        } => Ok(Arc::new(crate::queue::sqs::SqsAdapter::new(
            crate::queue::sqs::SqsSettings {
                queue_url: queue_url.clone(),
                region: region.clone(),
                endpoint_url: endpoint_url.clone(),
                wait_time_seconds: *wait_time_seconds,
                visibility_timeout_seconds: *visibility_timeout_seconds,
            },
        ))),
        #[allow(unreachable_patterns)]
        other => {
            let kind = other.adapter_kind();
            Err(ConveyorError::AdapterUnavailable {
                adapter: kind.to_string(),
                feature: kind.feature().unwrap_or_default().to_string(),
            })
        }
    }
}

/// Wrap a handler so each delivery publishes `job:active`, `job:progress` and
/// a terminal `job:completed` or `job:failed` event, after waiting for the
/// limiter when one is set.
fn wrap_handler(
    handler: JobHandler,
    events: Arc<EventManager>,
    limiter: Option<RateLimiter>,
) -> JobHandler {
    Arc::new(move |ctx: JobContext| {
        let handler = Arc::clone(&handler);
        let events = Arc::clone(&events);
        let limiter = limiter.clone();
        Box::pin(async move {
            if let Some(limiter) = &limiter {
                limiter.acquire().await?;
            }

            let job = ctx.job().clone();
            events.publish_event(QueueEvent::active(&job));

            let progress_events = Arc::clone(&events);
            let ctx = ctx.with_progress_listener(Arc::new(move |job: &Job, progress: u8| {
                progress_events.publish_event(QueueEvent::progress(job, progress));
            }));

            let result = AssertUnwindSafe(handler(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ConveyorError::handler("job handler panicked")));

            match &result {
                Ok(value) => {
                    events.publish_event(QueueEvent::completed(&job, value.clone()));
                }
                Err(e) => {
                    events.publish_event(QueueEvent::failed(&job, e.failure_reason()));
                }
            }
            result
        })
    })
}
