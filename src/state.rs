//! Durable execution state for named jobs.
//!
//! [`JobStateManager`] tracks logical jobs (scheduled tasks, for instance)
//! independently of any queue. Each job carries execution counters and its most
//! recent [`ExecutionRecord`]; a bounded, most-recent-first history of finished
//! executions is kept in memory for metrics.
//!
//! State is persisted as a single JSON document of the shape
//! `{"jobs": {"<jobId>": JobState}}`, written atomically (temp file then rename)
//! on an interval and on [`shutdown`](JobStateManager::shutdown).
//!
//! # Crash recovery
//!
//! An execution that was still `running` when the state was last persisted
//! means the process died mid-execution. [`load_state`](JobStateManager::load_state)
//! publishes a [`StateEvent::RecoveryNeeded`] for each one and tracks it as
//! running again. Nothing is resumed or failed automatically; the caller decides
//! and closes the execution with [`end_execution`](JobStateManager::end_execution).
//!
//! ```rust
//! use conveyor::{config::StateConfig, state::{ExecutionStatus, JobStateManager}};
//!
//! # #[tokio::main]
//! # async fn main() -> conveyor::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let config = StateConfig {
//!     state_file: dir.path().join("state.json"),
//!     auto_persist: false,
//!     ..Default::default()
//! };
//! let manager = JobStateManager::new(config);
//!
//! manager.register_job("nightly-report", "Nightly report", Default::default()).await?;
//! manager.start_execution("nightly-report", "run-1").await?;
//! manager.end_execution("run-1", ExecutionStatus::Completed, None).await?;
//!
//! let state = manager.get_state("nightly-report").await.unwrap();
//! assert_eq!(state.execution_count, 1);
//! # Ok(())
//! # }
//! ```

use crate::{ConveyorError, Result, config::StateConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::{
    sync::{Mutex as AsyncMutex, RwLock, broadcast, watch},
    task::JoinHandle,
};
use uuid::Uuid;
use tracing::{debug, error, info, warn};

/// Number of most recent executions counted by [`JobMetrics::recent_failures`].
pub const RECENT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running && self.end_time.is_none()
    }
}

/// Persisted state of one logical job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub name: String,
    pub enabled: bool,
    /// Finished executions, successful or not.
    pub execution_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_execution: Option<ExecutionRecord>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl JobState {
    fn new(job_id: &str, name: &str, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            enabled: true,
            execution_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_execution: None,
            next_run: None,
            metadata,
        }
    }
}

/// The document written to the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobState>,
}

impl StateFile {
    /// Read a state file without starting a manager.
    pub async fn read(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read(path.as_ref()).await?;
        serde_json::from_slice(&content).map_err(|e| ConveyorError::State {
            message: format!("corrupt state file {}: {}", path.as_ref().display(), e),
        })
    }
}

/// Rolling metrics for one job, computed over its in-memory history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub job_id: String,
    /// Lifetime finished executions.
    pub total_executions: u64,
    /// Records currently held in history.
    pub recorded_executions: usize,
    /// Percentage of recorded executions that completed.
    pub success_rate: f64,
    /// Percentage of recorded executions that failed.
    pub failure_rate: f64,
    /// Failures among the last [`RECENT_WINDOW`] recorded executions.
    pub recent_failures: usize,
    pub consecutive_failures: u32,
    pub average_duration_ms: Option<f64>,
}

/// Notifications published by [`JobStateManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    JobRegistered { job_id: String },
    JobUnregistered { job_id: String },
    ExecutionStarted { record: ExecutionRecord },
    ExecutionEnded { record: ExecutionRecord },
    StatePersisted { path: PathBuf, jobs: usize },
    StateLoaded { path: PathBuf, jobs: usize },
    /// An execution was still running when the state was persisted.
    RecoveryNeeded { job_id: String, execution: ExecutionRecord },
}

/// Result of [`JobStateManager::load_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub jobs: usize,
    pub recovery_candidates: Vec<ExecutionRecord>,
}

#[derive(Debug, Default)]
struct StateInner {
    jobs: BTreeMap<String, JobState>,
    /// Finished executions per job, most recent at the front.
    history: HashMap<String, VecDeque<ExecutionRecord>>,
    /// Running executions by execution id.
    running: HashMap<String, ExecutionRecord>,
}

impl StateInner {
    fn job_mut(&mut self, job_id: &str) -> Result<&mut JobState> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| ConveyorError::JobNotFound {
                id: job_id.to_string(),
            })
    }
}

/// The background auto-persist task and the switch that stops it between writes.
struct PersistTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

pub struct JobStateManager {
    config: StateConfig,
    inner: RwLock<StateInner>,
    events: broadcast::Sender<StateEvent>,
    /// Held across snapshot, write and rename so state file writes never interleave.
    persist_lock: AsyncMutex<()>,
    persist_task: Mutex<Option<PersistTask>>,
}

impl JobStateManager {
    pub fn new(config: StateConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            inner: RwLock::new(StateInner::default()),
            events,
            persist_lock: AsyncMutex::new(()),
            persist_task: Mutex::new(None),
        }
    }

    /// Create a manager, load any existing state file and start auto-persist.
    pub async fn open(config: StateConfig) -> Result<Arc<Self>> {
        let manager = Arc::new(Self::new(config));
        manager.load_state().await?;
        manager.start_auto_persist();
        Ok(manager)
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn state_file(&self) -> &Path {
        &self.config.state_file
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StateEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Register a job, or update the name and merge the metadata of an already
    /// registered one. Counters of an existing job are kept.
    pub async fn register_job(
        &self,
        job_id: &str,
        name: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobState> {
        let state = {
            let mut inner = self.inner.write().await;
            match inner.jobs.get_mut(job_id) {
                Some(existing) => {
                    existing.name = name.to_string();
                    existing.metadata.extend(metadata);
                    existing.clone()
                }
                None => {
                    let state = JobState::new(job_id, name, metadata);
                    inner.jobs.insert(job_id.to_string(), state.clone());
                    state
                }
            }
        };
        debug!(job_id, name, "Registered job");
        self.emit(StateEvent::JobRegistered {
            job_id: job_id.to_string(),
        });
        Ok(state)
    }

    /// Forget a job, its history and any executions still tracked as running.
    pub async fn unregister_job(&self, job_id: &str) -> Option<JobState> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.history.remove(job_id);
            inner.running.retain(|_, record| record.job_id != job_id);
            inner.jobs.remove(job_id)
        };
        if removed.is_some() {
            debug!(job_id, "Unregistered job");
            self.emit(StateEvent::JobUnregistered {
                job_id: job_id.to_string(),
            });
        }
        removed
    }

    pub async fn enable_job(&self, job_id: &str) -> Result<JobState> {
        self.update_job(job_id, |state| state.enabled = true).await
    }

    pub async fn disable_job(&self, job_id: &str) -> Result<JobState> {
        self.update_job(job_id, |state| state.enabled = false).await
    }

    pub async fn set_next_run(&self, job_id: &str, next_run: Option<DateTime<Utc>>) -> Result<JobState> {
        self.update_job(job_id, |state| state.next_run = next_run).await
    }

    /// Merge `metadata` into the job's metadata. A `null` value removes the key.
    pub async fn update_metadata(
        &self,
        job_id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<JobState> {
        self.update_job(job_id, |state| {
            for (key, value) in metadata {
                if value.is_null() {
                    state.metadata.remove(&key);
                } else {
                    state.metadata.insert(key, value);
                }
            }
        })
        .await
    }

    async fn update_job<F>(&self, job_id: &str, update: F) -> Result<JobState>
    where
        F: FnOnce(&mut JobState),
    {
        let mut inner = self.inner.write().await;
        let state = inner.job_mut(job_id)?;
        update(state);
        Ok(state.clone())
    }

    pub async fn get_state(&self, job_id: &str) -> Option<JobState> {
        self.inner.read().await.jobs.get(job_id).cloned()
    }

    /// Every job state, ordered by job id.
    pub async fn get_all_states(&self) -> Vec<JobState> {
        self.inner.read().await.jobs.values().cloned().collect()
    }

    /// Begin an execution of a registered job.
    pub async fn start_execution(&self, job_id: &str, execution_id: &str) -> Result<ExecutionRecord> {
        let record = {
            let mut inner = self.inner.write().await;
            if inner.running.contains_key(execution_id) {
                return Err(ConveyorError::State {
                    message: format!("execution {} is already running", execution_id),
                });
            }
            let record = ExecutionRecord {
                execution_id: execution_id.to_string(),
                job_id: job_id.to_string(),
                status: ExecutionStatus::Running,
                start_time: Utc::now(),
                end_time: None,
                duration: None,
                error: None,
            };
            inner.job_mut(job_id)?.last_execution = Some(record.clone());
            inner.running.insert(execution_id.to_string(), record.clone());
            record
        };
        debug!(job_id, execution_id, "Execution started");
        self.emit(StateEvent::ExecutionStarted {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Finish a running execution.
    ///
    /// `consecutive_failures` resets to zero on `Completed` and grows on
    /// `Failed`. The record is added to the front of the job's history, which is
    /// trimmed to `history_size`.
    pub async fn end_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionRecord> {
        if status == ExecutionStatus::Running {
            return Err(ConveyorError::State {
                message: "an execution cannot end in the running status".to_string(),
            });
        }

        let record = {
            let mut inner = self.inner.write().await;
            let mut record = inner.running.remove(execution_id).ok_or_else(|| ConveyorError::State {
                message: format!("execution {} is not running", execution_id),
            })?;

            let end_time = Utc::now();
            record.status = status;
            record.end_time = Some(end_time);
            record.duration = Some(
                u64::try_from((end_time - record.start_time).num_milliseconds()).unwrap_or(0),
            );
            record.error = error;

            if let Some(state) = inner.jobs.get_mut(&record.job_id) {
                state.execution_count += 1;
                match status {
                    ExecutionStatus::Completed => state.consecutive_failures = 0,
                    _ => {
                        state.failure_count += 1;
                        state.consecutive_failures += 1;
                    }
                }
                state.last_execution = Some(record.clone());

                let history = inner.history.entry(record.job_id.clone()).or_default();
                history.push_front(record.clone());
                history.truncate(self.config.history_size);
            } else {
                warn!(
                    job_id = %record.job_id,
                    execution_id,
                    "Execution ended for a job that is no longer registered"
                );
            }
            record
        };

        match status {
            ExecutionStatus::Failed => warn!(
                job_id = %record.job_id,
                execution_id,
                "Execution failed: {}",
                record.error.as_deref().unwrap_or("no error given")
            ),
            _ => debug!(job_id = %record.job_id, execution_id, "Execution completed"),
        }
        self.emit(StateEvent::ExecutionEnded {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Finished executions, most recent first, capped at `limit` when given.
    pub async fn get_history(&self, job_id: &str, limit: Option<usize>) -> Vec<ExecutionRecord> {
        let inner = self.inner.read().await;
        inner
            .history
            .get(job_id)
            .map(|history| {
                history
                    .iter()
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Executions started but not yet ended, oldest first.
    pub async fn running_executions(&self) -> Vec<ExecutionRecord> {
        let mut running: Vec<ExecutionRecord> =
            self.inner.read().await.running.values().cloned().collect();
        running.sort_by_key(|record| record.start_time);
        running
    }

    pub async fn get_metrics(&self, job_id: &str) -> Option<JobMetrics> {
        let inner = self.inner.read().await;
        let state = inner.jobs.get(job_id)?;
        let empty = VecDeque::new();
        let history = inner.history.get(job_id).unwrap_or(&empty);

        let recorded = history.len();
        let completed = history
            .iter()
            .filter(|record| record.status == ExecutionStatus::Completed)
            .count();
        let failed = history
            .iter()
            .filter(|record| record.status == ExecutionStatus::Failed)
            .count();
        let percentage = |count: usize| {
            if recorded == 0 {
                0.0
            } else {
                count as f64 / recorded as f64 * 100.0
            }
        };
        let durations: Vec<u64> = history.iter().filter_map(|record| record.duration).collect();
        let average_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
        };

        Some(JobMetrics {
            job_id: job_id.to_string(),
            total_executions: state.execution_count,
            recorded_executions: recorded,
            success_rate: percentage(completed),
            failure_rate: percentage(failed),
            recent_failures: history
                .iter()
                .take(RECENT_WINDOW)
                .filter(|record| record.status == ExecutionStatus::Failed)
                .count(),
            consecutive_failures: state.consecutive_failures,
            average_duration_ms,
        })
    }

    /// Write every job state to the state file atomically.
    ///
    /// Concurrent calls are serialized; each writes its own temp file and renames
    /// it over the state file, so the file always holds one complete snapshot.
    pub async fn persist_state(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let document = StateFile {
            jobs: self.inner.read().await.jobs.clone(),
        };
        let jobs = document.jobs.len();
        let payload = serde_json::to_vec_pretty(&document)?;

        let path = self.config.state_file.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = temp_path_for(&path);
        if let Err(e) = write_and_rename(&temp_path, &path, &payload).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        debug!(path = %path.display(), jobs, "Persisted job state");
        self.emit(StateEvent::StatePersisted { path, jobs });
        Ok(())
    }

    /// Replace in-memory state with the contents of the state file.
    ///
    /// A missing file is treated as empty state. Executions recorded as running
    /// become recovery candidates: they are reported through
    /// [`StateEvent::RecoveryNeeded`] and tracked as running so they can be closed
    /// with [`end_execution`](Self::end_execution). Their jobs' counters are left
    /// untouched.
    pub async fn load_state(&self) -> Result<LoadedState> {
        let path = self.config.state_file.clone();
        let document = match StateFile::read(&path).await {
            Ok(document) => document,
            Err(ConveyorError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting empty");
                StateFile::default()
            }
            Err(e) => return Err(e),
        };

        let mut recovery_candidates = Vec::new();
        let jobs = document.jobs.len();
        {
            let mut inner = self.inner.write().await;
            inner.history.clear();
            inner.running.clear();
            for (job_id, state) in &document.jobs {
                match &state.last_execution {
                    Some(execution) if execution.is_running() => {
                        inner
                            .running
                            .insert(execution.execution_id.clone(), execution.clone());
                        recovery_candidates.push(execution.clone());
                    }
                    Some(execution) if self.config.history_size > 0 => {
                        inner
                            .history
                            .entry(job_id.clone())
                            .or_default()
                            .push_front(execution.clone());
                    }
                    _ => {}
                }
            }
            inner.jobs = document.jobs;
        }

        info!(
            path = %path.display(),
            jobs,
            recovery = recovery_candidates.len(),
            "Loaded job state"
        );
        self.emit(StateEvent::StateLoaded { path, jobs });
        for execution in &recovery_candidates {
            warn!(
                job_id = %execution.job_id,
                execution_id = %execution.execution_id,
                started = %execution.start_time,
                "Execution was running when state was last saved; recovery needed"
            );
            self.emit(StateEvent::RecoveryNeeded {
                job_id: execution.job_id.clone(),
                execution: execution.clone(),
            });
        }

        Ok(LoadedState {
            jobs,
            recovery_candidates,
        })
    }

    /// Persist on `persist_interval` in the background when `auto_persist` is
    /// enabled. Calling this again while the task runs has no effect.
    pub fn start_auto_persist(self: &Arc<Self>) {
        if !self.config.auto_persist {
            return;
        }
        let mut slot = match self.persist_task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.persist_interval.max(Duration::from_millis(1));
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.persist_state().await {
                    error!("Failed to auto-persist job state: {}", e);
                }
            }
        });
        *slot = Some(PersistTask { handle, stop });
        debug!(interval = ?interval, "Started job state auto-persist");
    }

    fn take_persist_task(&self) -> Option<PersistTask> {
        match self.persist_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Stop auto-persist and, when it was enabled, persist one final time.
    ///
    /// A write already in progress on the background task is allowed to finish
    /// before the final one starts.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.take_persist_task() {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!("Auto-persist task ended abnormally: {}", e);
            }
        }
        if self.config.auto_persist {
            self.persist_state().await?;
        }
        info!("Job state manager shut down");
        Ok(())
    }
}

impl Drop for JobStateManager {
    fn drop(&mut self) {
        if let Some(task) = self.take_persist_task() {
            task.handle.abort();
        }
    }
}

async fn write_and_rename(temp_path: &Path, path: &Path, payload: &[u8]) -> Result<()> {
    tokio::fs::write(temp_path, payload).await?;
    tokio::fs::rename(temp_path, path).await?;
    Ok(())
}

/// A temp file next to `path`, unique per write.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "job-state.json".into());
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StateConfig {
        StateConfig {
            state_file: dir.join("state.json"),
            auto_persist: false,
            persist_interval: Duration::from_secs(30),
            history_size: 100,
        }
    }

    #[tokio::test]
    async fn test_register_and_reregister() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));

        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), json!("ops"));
        let state = manager.register_job("j1", "Test", metadata).await.unwrap();
        assert!(state.enabled);
        assert_eq!(state.execution_count, 0);

        manager.start_execution("j1", "e1").await.unwrap();
        manager
            .end_execution("e1", ExecutionStatus::Completed, None)
            .await
            .unwrap();

        let mut more = BTreeMap::new();
        more.insert("team".to_string(), json!("core"));
        let state = manager.register_job("j1", "Renamed", more).await.unwrap();
        assert_eq!(state.name, "Renamed");
        assert_eq!(state.execution_count, 1);
        assert_eq!(state.metadata.len(), 2);
    }

    #[tokio::test]
    async fn test_start_requires_registration() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        assert!(matches!(
            manager.start_execution("ghost", "e1").await,
            Err(ConveyorError::JobNotFound { .. })
        ));
        assert!(manager.running_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_end_execution_errors() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();
        manager.start_execution("j1", "e1").await.unwrap();

        assert!(manager.start_execution("j1", "e1").await.is_err());
        assert!(manager
            .end_execution("e1", ExecutionStatus::Running, None)
            .await
            .is_err());
        assert!(manager
            .end_execution("unknown", ExecutionStatus::Completed, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failure_counters() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();

        for i in 0..3 {
            let id = format!("f{}", i);
            manager.start_execution("j1", &id).await.unwrap();
            manager
                .end_execution(&id, ExecutionStatus::Failed, Some("boom".to_string()))
                .await
                .unwrap();
        }
        let state = manager.get_state("j1").await.unwrap();
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.failure_count, 3);

        manager.start_execution("j1", "ok").await.unwrap();
        manager
            .end_execution("ok", ExecutionStatus::Completed, None)
            .await
            .unwrap();

        let state = manager.get_state("j1").await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.failure_count, 3);
        assert_eq!(state.execution_count, 4);
        assert_eq!(
            state.last_execution.as_ref().map(|record| record.status),
            Some(ExecutionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_metrics() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();
        assert_eq!(manager.get_metrics("j1").await.unwrap().success_rate, 0.0);

        for (i, status) in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
        ]
        .into_iter()
        .enumerate()
        {
            let id = format!("e{}", i);
            manager.start_execution("j1", &id).await.unwrap();
            manager.end_execution(&id, status, None).await.unwrap();
        }

        let metrics = manager.get_metrics("j1").await.unwrap();
        assert_eq!(metrics.total_executions, 4);
        assert_eq!(metrics.success_rate, 75.0);
        assert_eq!(metrics.failure_rate, 25.0);
        assert_eq!(metrics.recent_failures, 1);
        assert!(metrics.average_duration_ms.is_some());
        assert!(manager.get_metrics("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_enable_disable_and_metadata() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();

        assert!(!manager.disable_job("j1").await.unwrap().enabled);
        assert!(manager.enable_job("j1").await.unwrap().enabled);

        let next = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(manager.set_next_run("j1", Some(next)).await.unwrap().next_run, Some(next));

        let mut metadata = BTreeMap::new();
        metadata.insert("a".to_string(), json!(1));
        metadata.insert("b".to_string(), json!(2));
        manager.update_metadata("j1", metadata).await.unwrap();
        let mut removal = BTreeMap::new();
        removal.insert("a".to_string(), serde_json::Value::Null);
        let state = manager.update_metadata("j1", removal).await.unwrap();
        assert_eq!(state.metadata.keys().collect::<Vec<_>>(), vec!["b"]);

        assert!(matches!(
            manager.disable_job("missing").await,
            Err(ConveyorError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unregister_drops_running_executions() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();
        manager.start_execution("j1", "e1").await.unwrap();

        assert!(manager.unregister_job("j1").await.is_some());
        assert!(manager.unregister_job("j1").await.is_none());
        assert!(manager.running_executions().await.is_empty());
        assert!(manager.get_state("j1").await.is_none());
    }

    #[tokio::test]
    async fn test_persist_writes_expected_shape() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();
        manager.start_execution("j1", "e1").await.unwrap();
        manager
            .end_execution("e1", ExecutionStatus::Failed, Some("disk full".to_string()))
            .await
            .unwrap();
        manager.persist_state().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("state.json")).unwrap()).unwrap();
        let job = &raw["jobs"]["j1"];
        assert_eq!(job["jobId"], json!("j1"));
        assert_eq!(job["executionCount"], json!(1));
        assert_eq!(job["consecutiveFailures"], json!(1));
        assert_eq!(job["lastExecution"]["status"], json!("failed"));
        assert_eq!(job["lastExecution"]["error"], json!("disk full"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        let loaded = manager.load_state().await.unwrap();
        assert_eq!(loaded.jobs, 0);
        assert!(loaded.recovery_candidates.is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), b"{ not json").unwrap();
        let manager = JobStateManager::new(config(dir.path()));
        assert!(matches!(
            manager.load_state().await,
            Err(ConveyorError::State { .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_persist_writes_periodically() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.auto_persist = true;
        config.persist_interval = Duration::from_millis(20);

        let manager = JobStateManager::open(config).await.unwrap();
        let mut events = manager.subscribe();
        manager.register_job("j1", "Test", BTreeMap::new()).await.unwrap();

        let persisted = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(StateEvent::StatePersisted { jobs, .. }) = events.recv().await {
                    break jobs;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(persisted, 1);
        assert!(dir.path().join("state.json").exists());

        manager.shutdown().await.unwrap();
    }

    #[test]
    fn test_temp_path() {
        let first = temp_path_for(Path::new("/var/lib/state.json"));
        let second = temp_path_for(Path::new("/var/lib/state.json"));
        assert_eq!(first.parent(), Some(Path::new("/var/lib")));
        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("state.json."));
        assert!(name.ends_with(".tmp"));
        assert_ne!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_persists_all_succeed() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(JobStateManager::new(config(dir.path())));
        for i in 0..200 {
            manager
                .register_job(&format!("job-{}", i), "Bulk", BTreeMap::new())
                .await
                .unwrap();
        }

        let writers: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.persist_state().await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let written = StateFile::read(dir.path().join("state.json")).await.unwrap();
        assert_eq!(written.jobs.len(), 200);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_auto_persist() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.auto_persist = true;
        config.persist_interval = Duration::from_millis(1);

        let manager = JobStateManager::open(config).await.unwrap();
        for i in 0..50 {
            manager
                .register_job(&format!("job-{}", i), "Busy", BTreeMap::new())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await.unwrap();

        let written = StateFile::read(dir.path().join("state.json")).await.unwrap();
        assert_eq!(written.jobs.len(), 50);
    }
}
