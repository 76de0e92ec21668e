//! # Conveyor
//!
//! A broker-agnostic job queue for Rust. Application code adds jobs to named
//! queues and registers async handlers; the broker behind each queue is chosen by
//! configuration and can be swapped without touching that code.
//!
//! ## Features
//!
//! - **Pluggable brokers**: in-process memory adapter, plus Kafka, RabbitMQ and
//!   Amazon SQS adapters behind the `kafka`, `rabbitmq` and `sqs` features
//! - **Retries with backoff**: fixed, linear and exponential strategies with a
//!   per-job attempt budget
//! - **Delays and priorities**: honoured natively where the broker supports them
//! - **Lifecycle events**: `job:added`, `job:active`, `job:progress`,
//!   `job:completed` and `job:failed` on a broadcast channel
//! - **Rate limiting**: token-bucket limiter per queue
//! - **Execution state**: [`JobStateManager`] persists execution counters and
//!   history for named jobs and detects executions interrupted by a crash
//! - **Async/await**: built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conveyor::{JobOptions, QueueManager, QueueOptions, queue::handler};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> conveyor::Result<()> {
//!     let manager = QueueManager::new();
//!     manager
//!         .register_queue("emails", QueueOptions::memory().with_concurrency(4))
//!         .await?;
//!
//!     manager
//!         .process(
//!             "emails",
//!             handler(|ctx| async move {
//!                 ctx.log(format!("sending to {}", ctx.data()["to"])).await?;
//!                 ctx.update_progress(100).await?;
//!                 Ok(json!({"sent": true}))
//!             }),
//!         )
//!         .await?;
//!
//!     manager
//!         .add_job(
//!             "emails",
//!             "welcome",
//!             json!({"to": "user@example.com"}),
//!             JobOptions::new().with_attempts(3),
//!         )
//!         .await?;
//!
//!     manager.close_all().await
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] belongs to one queue and carries a name, a JSON payload and its
//! [`JobOptions`]. Its [`JobStatus`] is derived from its fields: a job with a
//! handler running is `active`, one waiting out a delay or backoff is `delayed`,
//! and a finished job is `completed` or `failed` depending on whether a failure
//! reason is recorded.
//!
//! ### Adapters
//!
//! Every broker integration implements [`queue::QueueAdapter`]. Delivery is
//! at-least-once, so handlers should be idempotent. Adapters keep job metadata
//! (progress, logs, return values) in process memory; brokers only carry the
//! message.
//!
//! ### Queue manager
//!
//! [`QueueManager`] is the facade applications use. It owns one adapter per
//! registered queue, merges queue-level default job options into every job,
//! applies the queue's rate limiter and publishes lifecycle events.
//!
//! ### Job state
//!
//! [`JobStateManager`] is independent of queues. It tracks logical jobs such as
//! scheduled tasks, writes their state to a JSON file and reports executions
//! that were still running when the previous process stopped.

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod rate_limit;
pub mod state;

pub use backoff::{BackoffOptions, BackoffStrategy};
pub use config::{
    ConnectionConfig, ConveyorConfig, LimiterOptions, LoggingConfig, QueueOptions, StateConfig,
};
pub use error::ConveyorError;
pub use events::{
    EventConfig, EventFilter, EventManager, EventSubscription, QueueEvent, QueueEventKind,
};
pub use job::{BulkJob, Job, JobContext, JobId, JobOptions, JobRange, JobStatus, RemovePolicy};
pub use logging::init_logging;
pub use manager::QueueManager;
pub use queue::{AdapterKind, JobHandler, QueueAdapter, QueueMetrics, memory::MemoryAdapter};
pub use rate_limit::RateLimiter;
pub use state::{
    ExecutionRecord, ExecutionStatus, JobMetrics, JobState, JobStateManager, StateEvent,
};

/// Convenient type alias for Results with [`ConveyorError`] as the error type.
pub type Result<T> = std::result::Result<T, ConveyorError>;
