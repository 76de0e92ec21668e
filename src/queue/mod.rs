//! The queue adapter contract and its implementations.
//!
//! Every broker integration implements [`QueueAdapter`]. The
//! [`QueueManager`](crate::manager::QueueManager) only ever talks to adapters through
//! this trait, so a new broker becomes pluggable by implementing it. All adapters
//! keep a [`table::JobTable`] per queue for the attributes brokers do not track
//! themselves and run handlers through the same execution path, so attempt
//! counting, backoff and removal policies behave identically everywhere.
//!
//! Broker adapters are compiled in through cargo features:
//!
//! - `memory` - always available, see [`memory::MemoryAdapter`]
//! - `kafka` - partitioned-log adapter built on `rdkafka`
//! - `rabbitmq` - AMQP adapter built on `lapin`
//! - `sqs` - AWS SQS adapter built on `aws-sdk-sqs`

use crate::{
    ConveyorError, Result,
    job::{BulkJob, Job, JobContext, JobId, JobOptions, JobRange, JobStatus},
    queue::table::{FailureOutcome, JobTable},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::{future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc, time::Duration};
use tracing::{debug, warn};

mod consumer;
pub mod memory;
pub mod table;
pub mod wire;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "sqs")]
pub mod sqs;

/// An async job handler.
///
/// The returned value is stored as the job's `return_value` on success. Returning an
/// error marks the attempt as failed.
pub type JobHandler = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`JobHandler`].
///
/// ```rust
/// use conveyor::queue::handler;
/// use serde_json::json;
///
/// let handler = handler(|ctx| async move {
///     ctx.update_progress(50).await?;
///     Ok(json!({"handled": ctx.id()}))
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// The broker an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[default]
    Memory,
    Kafka,
    #[serde(alias = "amqp")]
    RabbitMq,
    Sqs,
}

impl AdapterKind {
    /// The cargo feature that compiles this adapter in, if any.
    pub fn feature(&self) -> Option<&'static str> {
        match self {
            AdapterKind::Memory => None,
            AdapterKind::Kafka => Some("kafka"),
            AdapterKind::RabbitMq => Some("rabbitmq"),
            AdapterKind::Sqs => Some("sqs"),
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Memory => write!(f, "memory"),
            AdapterKind::Kafka => write!(f, "kafka"),
            AdapterKind::RabbitMq => write!(f, "rabbitmq"),
            AdapterKind::Sqs => write!(f, "sqs"),
        }
    }
}

/// Job counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
    /// Undecodable broker messages discarded by this process. Not counted in
    /// [`total`](Self::total).
    #[serde(default)]
    pub poisoned: u64,
}

impl QueueMetrics {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Paused => self.paused += 1,
        }
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Active => self.active,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Delayed => self.delayed,
            JobStatus::Paused => self.paused,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }
}

/// The contract every broker-specific adapter satisfies.
///
/// Semantics are identical regardless of broker. Delivery is at-least-once; where a
/// broker has no native support for an option (priority on Kafka or SQS, for
/// example) the option is accepted and carried with the job but not enforced.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Establish broker connections. Fails fast when the broker is unreachable.
    async fn initialize(&self) -> Result<()>;

    /// Store a job locally and hand it to the broker, honouring `delay` and
    /// `priority` where the broker supports them.
    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job>;

    /// Submit many jobs, chunking transparently where the broker caps batch sizes.
    async fn add_bulk_jobs(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>>;

    /// Register the queue's handler and start consuming with at most
    /// `concurrency` jobs in flight. Only one handler per queue is allowed.
    async fn process(&self, queue: &str, concurrency: usize, handler: JobHandler) -> Result<()>;

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>>;

    async fn get_jobs(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        range: JobRange,
    ) -> Result<Vec<Job>>;

    async fn get_job_logs(&self, queue: &str, id: &str) -> Result<Vec<String>>;

    /// Remove a job from the local table. Unknown ids are a no-op.
    async fn remove_job(&self, queue: &str, id: &str) -> Result<()>;

    /// Reset a failed job's terminal fields and resubmit it.
    async fn retry_job(&self, queue: &str, id: &str) -> Result<Job>;

    /// Stop starting new jobs. Messages already enqueued at the broker are kept and
    /// handlers already running are not interrupted.
    async fn pause_queue(&self, queue: &str) -> Result<()>;

    async fn resume_queue(&self, queue: &str) -> Result<()>;

    async fn get_metrics(&self, queue: &str) -> Result<QueueMetrics>;

    /// Remove jobs in `status` (completed by default) older than `grace`.
    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobId>>;

    /// Remove every job of the queue, locally and at the broker where possible.
    async fn obliterate(&self, queue: &str) -> Result<()>;

    /// Stop consumers and release broker connections.
    async fn close(&self) -> Result<()>;
}

/// What happened to a job after one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Execution {
    Completed(Job),
    Retry { job: Job, delay_ms: u64 },
    Failed(Job),
}

/// Run `handler` for a claimed job and record the outcome in `table`.
///
/// Handler errors and panics are converted into a failed attempt and never
/// propagate to the caller's consume loop. The returned error only reports table
/// bookkeeping failures, such as the job having been removed while it ran.
pub(crate) async fn execute(
    table: &Arc<JobTable>,
    handler: &JobHandler,
    job: Job,
) -> Result<Execution> {
    let job_id = job.id.clone();
    let ctx = JobContext::new(job, Arc::clone(table));

    let result = AssertUnwindSafe(handler(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ConveyorError::handler("job handler panicked")));

    match result {
        Ok(value) => {
            let job = table.complete(&job_id, value).await?;
            debug!(queue = %table.name(), job_id = %job_id, "Job completed");
            table.apply_remove_policy(&job).await;
            Ok(Execution::Completed(job))
        }
        Err(error) => {
            let reason = error.failure_reason();
            match table.fail(&job_id, &reason).await? {
                FailureOutcome::Retry { job, delay_ms } => {
                    warn!(
                        queue = %table.name(),
                        job_id = %job_id,
                        attempts_made = job.attempts_made,
                        delay_ms,
                        "Job failed, retrying: {}",
                        reason
                    );
                    Ok(Execution::Retry { job, delay_ms })
                }
                FailureOutcome::Exhausted { job } => {
                    warn!(
                        queue = %table.name(),
                        job_id = %job_id,
                        attempts_made = job.attempts_made,
                        "Job failed with no attempts left: {}",
                        reason
                    );
                    table.apply_remove_policy(&job).await;
                    Ok(Execution::Failed(job))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_metrics_record_and_total() {
        let mut metrics = QueueMetrics::default();
        for status in JobStatus::ALL {
            metrics.record(status);
        }
        metrics.record(JobStatus::Waiting);

        assert_eq!(metrics.waiting, 2);
        assert_eq!(metrics.count(JobStatus::Paused), 1);
        assert_eq!(metrics.total(), 7);
    }

    #[test]
    fn test_adapter_kind_serde() {
        let kind: AdapterKind = serde_json::from_value(json!("rabbitmq")).unwrap();
        assert_eq!(kind, AdapterKind::RabbitMq);
        let kind: AdapterKind = serde_json::from_value(json!("amqp")).unwrap();
        assert_eq!(kind, AdapterKind::RabbitMq);
        assert_eq!(serde_json::to_value(AdapterKind::Sqs).unwrap(), json!("sqs"));
        assert_eq!(AdapterKind::Kafka.feature(), Some("kafka"));
        assert_eq!(AdapterKind::Memory.feature(), None);
    }

    #[tokio::test]
    async fn test_execute_records_success() {
        let table = Arc::new(JobTable::new("exec"));
        let job = table
            .insert(Job::new("exec", "ok", json!({"x": 2}), JobOptions::new()), None)
            .await.job;
        let job = table.claim(&job.id, None).await.unwrap();

        let handler = handler(|ctx| async move {
            let x = ctx.data()["x"].as_i64().unwrap_or(0);
            Ok(json!(x * 2))
        });

        match execute(&table, &handler, job).await.unwrap() {
            Execution::Completed(job) => assert_eq!(job.return_value, Some(json!(4))),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_converts_panics_into_failures() {
        let table = Arc::new(JobTable::new("exec"));
        let job = table
            .insert(Job::new("exec", "panics", json!(null), JobOptions::new()), None)
            .await.job;
        let job = table.claim(&job.id, None).await.unwrap();

        let handler = handler(|_ctx| async move {
            if true {
                panic!("handler blew up");
            }
            Ok(json!(null))
        });

        match execute(&table, &handler, job).await.unwrap() {
            Execution::Failed(job) => {
                assert_eq!(job.failed_reason.as_deref(), Some("job handler panicked"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_requests_retry_with_backoff() {
        let table = Arc::new(JobTable::new("exec"));
        let job = table
            .insert(
                Job::new(
                    "exec",
                    "flaky",
                    json!(null),
                    JobOptions::new()
                        .with_attempts(2)
                        .with_backoff(crate::backoff::BackoffOptions::fixed(50)),
                ),
                None,
            )
            .await.job;
        let job = table.claim(&job.id, None).await.unwrap();

        let handler = handler(|_ctx| async move {
            Err::<serde_json::Value, _>(ConveyorError::handler("try again"))
        });

        match execute(&table, &handler, job).await.unwrap() {
            Execution::Retry { job, delay_ms } => {
                assert_eq!(delay_ms, 50);
                assert_eq!(job.attempts_made, 1);
                assert_eq!(job.failed_reason.as_deref(), Some("try again"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
