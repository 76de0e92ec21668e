use crate::{Result, backoff::BackoffOptions, queue::table::JobTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, sync::Arc};
use uuid::Uuid;

/// Identifier of a job, unique within its queue.
///
/// Generated as a UUID unless the caller supplies `job_id` in the options.
pub type JobId = String;

/// Classification of a job at a point in time.
///
/// Statuses are derived from a job's fields and its queue's pause flag rather than
/// stored, so they cannot drift from the data they describe. The classifications
/// are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
        JobStatus::Paused,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Paused => "paused",
        };
        f.write_str(name)
    }
}

impl FromStr for JobStatus {
    type Err = crate::ConveyorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "delayed" => Ok(JobStatus::Delayed),
            "paused" => Ok(JobStatus::Paused),
            other => Err(crate::ConveyorError::queue(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// What to do with a job once it reaches a terminal state.
///
/// Serializes as `false` (keep), `true` (remove immediately) or a number of
/// milliseconds to wait before removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovePolicy {
    #[default]
    Keep,
    Immediately,
    After(u64),
}

impl Serialize for RemovePolicy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            RemovePolicy::Keep => serializer.serialize_bool(false),
            RemovePolicy::Immediately => serializer.serialize_bool(true),
            RemovePolicy::After(ms) => serializer.serialize_u64(*ms),
        }
    }
}

impl<'de> Deserialize<'de> for RemovePolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Millis(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => RemovePolicy::Keep,
            Raw::Flag(true) => RemovePolicy::Immediately,
            Raw::Millis(ms) => RemovePolicy::After(ms),
        })
    }
}

/// Options controlling how a job is scheduled, retried and cleaned up.
///
/// Every field is optional so that queue-level defaults can be layered under
/// call-level options with [`JobOptions::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Higher values are dispatched first where the adapter supports priorities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Milliseconds to wait before the job becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Total number of attempts, including the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffOptions>,
    /// Accepted and carried with the job, but not enforced by any adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<RemovePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<RemovePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_remove_on_complete(mut self, policy: RemovePolicy) -> Self {
        self.remove_on_complete = Some(policy);
        self
    }

    pub fn with_remove_on_fail(mut self, policy: RemovePolicy) -> Self {
        self.remove_on_fail = Some(policy);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Layer `overrides` on top of `self`; any field set in `overrides` wins.
    ///
    /// `job_id` is never inherited from defaults.
    pub fn merge(&self, overrides: &JobOptions) -> JobOptions {
        JobOptions {
            priority: overrides.priority.or(self.priority),
            delay: overrides.delay.or(self.delay),
            attempts: overrides.attempts.or(self.attempts),
            backoff: overrides.backoff.or(self.backoff),
            timeout: overrides.timeout.or(self.timeout),
            remove_on_complete: overrides.remove_on_complete.or(self.remove_on_complete),
            remove_on_fail: overrides.remove_on_fail.or(self.remove_on_fail),
            job_id: overrides.job_id.clone(),
        }
    }

    /// Total attempts allowed, at least one.
    pub fn attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.unwrap_or(0)
    }

    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(0)
    }

    /// Milliseconds to wait before retrying after `attempts_made` attempts.
    pub fn backoff_delay(&self, attempts_made: u32) -> u64 {
        self.backoff
            .map(|backoff| backoff.calculate_delay(attempts_made))
            .unwrap_or(0)
    }
}

/// A unit of work tracked by id within a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub name: String,
    pub data: serde_json::Value,
    /// Percentage in `0..=100`.
    pub progress: u8,
    /// Attempts that have run to completion or failure. Never decreases.
    pub attempts_made: u32,
    pub timestamp: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    /// Set if and only if the job reached a terminal state.
    pub finished_on: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub opts: JobOptions,
}

impl Job {
    pub fn new(
        queue_name: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Self {
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            queue_name: queue_name.into(),
            name: name.into(),
            data,
            progress: 0,
            attempts_made: 0,
            timestamp: Utc::now(),
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            return_value: None,
            opts,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_on.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.finished_on.is_some() && self.failed_reason.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.finished_on.is_some() && self.failed_reason.is_some()
    }

    /// Whether another attempt is allowed after the attempts made so far.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts()
    }
}

/// A job description used for bulk submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkJob {
    pub name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}

impl BulkJob {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// A window over a job listing: `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl JobRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn all() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    pub(crate) fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let end = self.end.unwrap_or(usize::MAX);
        items
            .into_iter()
            .skip(self.start)
            .take(end.saturating_sub(self.start))
            .collect()
    }
}

impl Default for JobRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Callback invoked whenever a handler reports progress.
pub type ProgressListener = Arc<dyn Fn(&Job, u8) + Send + Sync>;

/// The view of a job handed to its handler for one delivery.
///
/// A fresh context is built for every delivery. Progress and log lines written
/// through it land in the owning queue's job table.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    table: Arc<JobTable>,
    progress_listener: Option<ProgressListener>,
}

impl JobContext {
    pub(crate) fn new(job: Job, table: Arc<JobTable>) -> Self {
        Self {
            job,
            table,
            progress_listener: None,
        }
    }

    /// Attach a callback notified after each successful progress update.
    pub fn with_progress_listener(mut self, listener: ProgressListener) -> Self {
        self.progress_listener = Some(listener);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    /// Record progress as a percentage; values above 100 are clamped.
    pub async fn update_progress(&self, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        self.table.set_progress(&self.job.id, progress).await?;
        if let Some(listener) = &self.progress_listener {
            listener(&self.job, progress);
        }
        Ok(())
    }

    /// Append a line to the job's log.
    pub async fn log(&self, message: impl Into<String>) -> Result<()> {
        self.table.append_log(&self.job.id, message.into()).await
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("queue", &self.table.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffOptions;
    use serde_json::json;

    #[test]
    fn test_job_creation_generates_id() {
        let first = Job::new("emails", "welcome", json!({"to": "a@example.com"}), JobOptions::new());
        let second = Job::new("emails", "welcome", json!({}), JobOptions::new());

        assert_ne!(first.id, second.id);
        assert_eq!(first.queue_name, "emails");
        assert_eq!(first.attempts_made, 0);
        assert!(first.finished_on.is_none());
    }

    #[test]
    fn test_job_creation_uses_caller_id() {
        let job = Job::new("emails", "welcome", json!({}), JobOptions::new().with_job_id("custom-1"));
        assert_eq!(job.id, "custom-1");
    }

    #[test]
    fn test_merge_call_level_wins() {
        let defaults = JobOptions::new()
            .with_attempts(5)
            .with_priority(3)
            .with_backoff(BackoffOptions::fixed(1000))
            .with_job_id("should-not-inherit");
        let overrides = JobOptions::new().with_attempts(2).with_delay(500);

        let merged = defaults.merge(&overrides);

        assert_eq!(merged.attempts, Some(2));
        assert_eq!(merged.priority, Some(3));
        assert_eq!(merged.delay, Some(500));
        assert_eq!(merged.backoff, Some(BackoffOptions::fixed(1000)));
        assert_eq!(merged.job_id, None);
    }

    #[test]
    fn test_option_accessors() {
        let options = JobOptions::new();
        assert_eq!(options.attempts(), 1);
        assert_eq!(options.delay_ms(), 0);
        assert_eq!(options.backoff_delay(3), 0);

        let options = JobOptions::new()
            .with_attempts(0)
            .with_backoff(BackoffOptions::exponential(100));
        assert_eq!(options.attempts(), 1);
        assert_eq!(options.backoff_delay(3), 400);
    }

    #[test]
    fn test_remove_policy_serialization() {
        assert_eq!(serde_json::to_value(RemovePolicy::Keep).unwrap(), json!(false));
        assert_eq!(serde_json::to_value(RemovePolicy::Immediately).unwrap(), json!(true));
        assert_eq!(serde_json::to_value(RemovePolicy::After(5000)).unwrap(), json!(5000));

        let parsed: RemovePolicy = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(parsed, RemovePolicy::Immediately);
        let parsed: RemovePolicy = serde_json::from_value(json!(250)).unwrap();
        assert_eq!(parsed, RemovePolicy::After(250));
    }

    #[test]
    fn test_options_camel_case() {
        let options = JobOptions::new()
            .with_remove_on_complete(RemovePolicy::Immediately)
            .with_job_id("abc");
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json, json!({"removeOnComplete": true, "jobId": "abc"}));
    }

    #[test]
    fn test_terminal_helpers() {
        let mut job = Job::new("q", "n", json!(null), JobOptions::new().with_attempts(2));
        assert!(job.can_retry());

        job.attempts_made = 2;
        job.finished_on = Some(Utc::now());
        job.failed_reason = Some("boom".to_string());
        assert!(job.is_failed());
        assert!(!job.is_completed());
        assert!(!job.can_retry());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("sleeping".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::Delayed.to_string(), "delayed");
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn test_job_range() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(JobRange::new(2, 5).apply(items.clone()), vec![2, 3, 4]);
        assert_eq!(JobRange::all().apply(items.clone()).len(), 10);
        assert!(JobRange::new(8, 3).apply(items).is_empty());
    }
}
