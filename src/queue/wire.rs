//! The message format broker adapters publish.
//!
//! A job travels as a JSON [`JobEnvelope`]. The envelope carries everything needed
//! to rebuild the job's local metadata, so a consumer that has never seen the job
//! (after a restart, for instance) can still process it with the right attempt
//! count and options. Payloads that fail to decode are poison messages.

use crate::{
    ConveyorError, Result,
    job::{Job, JobId, JobOptions},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version written into every envelope.
pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub version: u8,
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub attempts_made: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub opts: JobOptions,
    /// Earliest time the job may run, for brokers that cannot hold the whole delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    pub fn from_job(job: &Job) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            id: job.id.clone(),
            queue: job.queue_name.clone(),
            name: job.name.clone(),
            data: job.data.clone(),
            attempts_made: job.attempts_made,
            timestamp: job.timestamp,
            opts: job.opts.clone(),
            run_at: None,
        }
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a broker payload. Any failure is reported as
    /// [`ConveyorError::PoisonMessage`].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let envelope: JobEnvelope =
            serde_json::from_slice(payload).map_err(|e| ConveyorError::PoisonMessage {
                message: format!("undecodable job envelope: {}", e),
            })?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(ConveyorError::PoisonMessage {
                message: format!("unsupported envelope version {}", envelope.version),
            });
        }
        if envelope.id.is_empty() {
            return Err(ConveyorError::PoisonMessage {
                message: "job envelope has an empty id".to_string(),
            });
        }
        Ok(envelope)
    }

    /// Rebuild a job for a consumer that has no local record of it.
    pub fn into_job(self) -> Job {
        let mut job = Job::new(self.queue, self.name, self.data, self.opts);
        job.id = self.id;
        job.attempts_made = self.attempts_made;
        job.timestamp = self.timestamp;
        job
    }
}

pub fn encode_job(job: &Job) -> Result<Vec<u8>> {
    JobEnvelope::from_job(job).encode()
}

/// Build `<queue><suffix>` names for auxiliary broker resources.
pub fn derived_name(queue: &str, suffix: &str) -> String {
    format!("{}{}", queue, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_rebuilds_job() {
        let mut job = Job::new(
            "emails",
            "welcome",
            json!({"to": "a@example.com"}),
            JobOptions::new().with_attempts(4),
        );
        job.attempts_made = 2;

        let decoded = JobEnvelope::decode(&encode_job(&job).unwrap()).unwrap();
        let rebuilt = decoded.into_job();

        assert_eq!(rebuilt.id, job.id);
        assert_eq!(rebuilt.queue_name, "emails");
        assert_eq!(rebuilt.attempts_made, 2);
        assert_eq!(rebuilt.opts.attempts, Some(4));
        assert_eq!(rebuilt.timestamp, job.timestamp);
        assert!(rebuilt.finished_on.is_none());
    }

    #[test]
    fn test_run_at_is_optional() {
        let job = Job::new("q", "n", json!(null), JobOptions::new());
        let plain = encode_job(&job).unwrap();
        assert!(!String::from_utf8_lossy(&plain).contains("runAt"));
        assert_eq!(JobEnvelope::decode(&plain).unwrap().run_at, None);

        let run_at = Utc::now() + chrono::Duration::hours(2);
        let held = JobEnvelope::from_job(&job).with_run_at(run_at).encode().unwrap();
        assert_eq!(JobEnvelope::decode(&held).unwrap().run_at, Some(run_at));
    }

    #[test]
    fn test_garbage_is_poison() {
        let error = JobEnvelope::decode(b"not json at all").unwrap_err();
        assert!(matches!(error, ConveyorError::PoisonMessage { .. }));
    }

    #[test]
    fn test_wrong_shape_is_poison() {
        let payload = serde_json::to_vec(&json!({"hello": "world"})).unwrap();
        assert!(matches!(
            JobEnvelope::decode(&payload),
            Err(ConveyorError::PoisonMessage { .. })
        ));
    }

    #[test]
    fn test_unknown_version_is_poison() {
        let job = Job::new("q", "n", json!(null), JobOptions::new());
        let mut envelope = JobEnvelope::from_job(&job);
        envelope.version = 9;
        let payload = envelope.encode().unwrap();
        assert!(matches!(
            JobEnvelope::decode(&payload),
            Err(ConveyorError::PoisonMessage { .. })
        ));
    }

    #[test]
    fn test_derived_name() {
        assert_eq!(derived_name("emails", ".delayed"), "emails.delayed");
    }
}
