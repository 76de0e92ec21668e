//! Job lifecycle notifications.
//!
//! The [`QueueManager`](crate::manager::QueueManager) wraps every handler so that
//! each queue publishes `job:added`, `job:active`, `job:progress`,
//! `job:completed` and `job:failed` events through an [`EventManager`]. Events go
//! out on a broadcast channel; publishing never blocks and never fails when
//! nobody is listening.
//!
//! # Examples
//!
//! ```rust
//! use conveyor::events::{EventFilter, EventManager, QueueEvent, QueueEventKind};
//! use conveyor::job::{Job, JobOptions};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let events = EventManager::new_default();
//! let mut subscription = events
//!     .subscribe(EventFilter::new().with_kinds(vec![QueueEventKind::Added]))
//!     .await;
//!
//! let job = Job::new("emails", "welcome", json!({}), JobOptions::new());
//! events.publish_event(QueueEvent::added(&job));
//!
//! let event = subscription.recv().await.unwrap();
//! assert_eq!(event.kind.as_str(), "job:added");
//! # Ok(())
//! # }
//! ```

use crate::job::{Job, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueEventKind {
    #[serde(rename = "job:added")]
    Added,
    #[serde(rename = "job:active")]
    Active,
    #[serde(rename = "job:progress")]
    Progress,
    #[serde(rename = "job:completed")]
    Completed,
    #[serde(rename = "job:failed")]
    Failed,
}

impl QueueEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventKind::Added => "job:added",
            QueueEventKind::Active => "job:active",
            QueueEventKind::Progress => "job:progress",
            QueueEventKind::Completed => "job:completed",
            QueueEventKind::Failed => "job:failed",
        }
    }
}

impl fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle notification for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub event_id: Uuid,
    pub kind: QueueEventKind,
    pub queue_name: String,
    pub job_id: JobId,
    pub job_name: String,
    pub timestamp: DateTime<Utc>,
    /// Attempts counted for the job once this event's attempt is recorded.
    pub attempts_made: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

impl QueueEvent {
    fn for_job(kind: QueueEventKind, job: &Job, attempts_made: u32) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            queue_name: job.queue_name.clone(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            timestamp: Utc::now(),
            attempts_made,
            progress: None,
            return_value: None,
            failed_reason: None,
        }
    }

    pub fn added(job: &Job) -> Self {
        Self::for_job(QueueEventKind::Added, job, job.attempts_made)
    }

    pub fn active(job: &Job) -> Self {
        Self::for_job(QueueEventKind::Active, job, job.attempts_made)
    }

    pub fn progress(job: &Job, progress: u8) -> Self {
        let mut event = Self::for_job(QueueEventKind::Progress, job, job.attempts_made);
        event.progress = Some(progress);
        event
    }

    /// `job` is the snapshot handed to the handler, before the attempt was counted.
    pub fn completed(job: &Job, return_value: serde_json::Value) -> Self {
        let mut event = Self::for_job(QueueEventKind::Completed, job, job.attempts_made + 1);
        event.return_value = Some(return_value);
        event
    }

    /// `job` is the snapshot handed to the handler, before the attempt was counted.
    pub fn failed(job: &Job, reason: impl Into<String>) -> Self {
        let mut event = Self::for_job(QueueEventKind::Failed, job, job.attempts_made + 1);
        event.failed_reason = Some(reason.into());
        event
    }
}

/// Subscription filter. Empty lists match everything; conditions are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub kinds: Vec<QueueEventKind>,
    pub queue_names: Vec<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kinds(mut self, kinds: Vec<QueueEventKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_queue_names(mut self, queue_names: Vec<String>) -> Self {
        self.queue_names = queue_names;
        self
    }

    pub fn matches(&self, event: &QueueEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.queue_names.is_empty() && !self.queue_names.contains(&event.queue_name) {
            return false;
        }
        true
    }
}

/// A filtered view of the event stream.
#[derive(Debug)]
pub struct EventSubscription {
    pub id: Uuid,
    pub filter: EventFilter,
    pub receiver: broadcast::Receiver<QueueEvent>,
}

impl EventSubscription {
    /// Wait for the next event that matches the filter. Returns `None` once the
    /// manager is gone. Events dropped because this subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.id, skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Capacity of the broadcast channel.
    pub max_buffer_size: usize,
    /// Log every published event at debug level.
    pub log_events: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 10_000,
            log_events: false,
        }
    }
}

/// Fan-out hub for [`QueueEvent`]s.
pub struct EventManager {
    sender: broadcast::Sender<QueueEvent>,
    subscriptions: RwLock<HashMap<Uuid, EventFilter>>,
    config: EventConfig,
}

impl EventManager {
    pub fn new(config: EventConfig) -> Self {
        let (sender, _) = broadcast::channel(config.max_buffer_size.max(1));
        Self {
            sender,
            subscriptions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn new_default() -> Self {
        Self::new(EventConfig::default())
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish_event(&self, event: QueueEvent) -> usize {
        if self.config.log_events {
            debug!(
                queue = %event.queue_name,
                job_id = %event.job_id,
                "Publishing {}",
                event.kind
            );
        }
        // No receivers is not an error.
        self.sender.send(event).unwrap_or(0)
    }

    pub async fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let id = Uuid::new_v4();
        let receiver = self.sender.subscribe();
        self.subscriptions.write().await.insert(id, filter.clone());
        EventSubscription {
            id,
            filter,
            receiver,
        }
    }

    pub async fn unsubscribe(&self, subscription_id: Uuid) {
        self.subscriptions.write().await.remove(&subscription_id);
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn get_stats(&self) -> EventManagerStats {
        EventManagerStats {
            active_subscriptions: self.subscriptions.read().await.len(),
            buffer_capacity: self.config.max_buffer_size,
            buffer_current_size: self.sender.len(),
        }
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventManagerStats {
    pub active_subscriptions: usize,
    pub buffer_capacity: usize,
    pub buffer_current_size: usize,
}
