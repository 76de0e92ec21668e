//! Job state persistence across manager restarts

use conveyor::{ExecutionStatus, JobStateManager, StateConfig, StateEvent};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

fn state_config(path: &Path, history_size: usize) -> StateConfig {
    StateConfig {
        state_file: path.to_path_buf(),
        auto_persist: false,
        history_size,
        ..StateConfig::default()
    }
}

#[tokio::test]
async fn test_interrupted_execution_is_reported_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let manager = JobStateManager::new(state_config(&path, 10));
        manager
            .register_job("nightly", "Nightly report", BTreeMap::new())
            .await
            .unwrap();
        manager.start_execution("nightly", "run-1").await.unwrap();
        manager
            .end_execution("run-1", ExecutionStatus::Completed, None)
            .await
            .unwrap();
        manager.start_execution("nightly", "run-2").await.unwrap();
        manager.persist_state().await.unwrap();
        // Dropped without ending run-2.
    }

    let restarted = JobStateManager::new(state_config(&path, 10));
    let mut events = restarted.subscribe();
    let loaded = restarted.load_state().await.unwrap();

    assert_eq!(loaded.jobs, 1);
    assert_eq!(loaded.recovery_candidates.len(), 1);
    assert_eq!(loaded.recovery_candidates[0].execution_id, "run-2");

    assert!(matches!(events.recv().await.unwrap(), StateEvent::StateLoaded { jobs: 1, .. }));
    match events.recv().await.unwrap() {
        StateEvent::RecoveryNeeded { job_id, execution } => {
            assert_eq!(job_id, "nightly");
            assert_eq!(execution.execution_id, "run-2");
            assert_eq!(execution.status, ExecutionStatus::Running);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let state = restarted.get_state("nightly").await.unwrap();
    assert_eq!(state.execution_count, 1);
    assert_eq!(state.failure_count, 0);
    assert_eq!(restarted.running_executions().await.len(), 1);

    let closed = restarted
        .end_execution("run-2", ExecutionStatus::Failed, Some("interrupted".to_string()))
        .await
        .unwrap();
    assert_eq!(closed.error.as_deref(), Some("interrupted"));

    let state = restarted.get_state("nightly").await.unwrap();
    assert_eq!(state.execution_count, 2);
    assert_eq!(state.failure_count, 1);
    assert_eq!(state.consecutive_failures, 1);
    assert!(restarted.running_executions().await.is_empty());
}

#[tokio::test]
async fn test_history_keeps_most_recent_records() {
    let dir = TempDir::new().unwrap();
    let manager = JobStateManager::new(state_config(&dir.path().join("state.json"), 5));
    manager
        .register_job("sync", "Sync", BTreeMap::new())
        .await
        .unwrap();

    for i in 0..10 {
        let execution_id = format!("run-{}", i);
        manager.start_execution("sync", &execution_id).await.unwrap();
        manager
            .end_execution(&execution_id, ExecutionStatus::Completed, None)
            .await
            .unwrap();
    }

    let history = manager.get_history("sync", None).await;
    let ids: Vec<&str> = history.iter().map(|r| r.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["run-9", "run-8", "run-7", "run-6", "run-5"]);
    assert_eq!(manager.get_history("sync", Some(2)).await.len(), 2);

    let metrics = manager.get_metrics("sync").await.unwrap();
    assert_eq!(metrics.total_executions, 10);
    assert_eq!(metrics.recorded_executions, 5);
    assert_eq!(metrics.success_rate, 100.0);
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let dir = TempDir::new().unwrap();
    let manager = JobStateManager::new(state_config(&dir.path().join("state.json"), 10));
    manager
        .register_job("flaky", "Flaky", BTreeMap::new())
        .await
        .unwrap();

    let outcomes = [
        ExecutionStatus::Failed,
        ExecutionStatus::Failed,
        ExecutionStatus::Failed,
        ExecutionStatus::Completed,
    ];
    for (i, status) in outcomes.iter().enumerate() {
        let execution_id = format!("run-{}", i);
        manager.start_execution("flaky", &execution_id).await.unwrap();
        manager
            .end_execution(&execution_id, *status, None)
            .await
            .unwrap();
        if i == 2 {
            let state = manager.get_state("flaky").await.unwrap();
            assert_eq!(state.consecutive_failures, 3);
        }
    }

    let state = manager.get_state("flaky").await.unwrap();
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.failure_count, 3);
    assert_eq!(state.execution_count, 4);
}

#[tokio::test]
async fn test_open_round_trips_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("state.json");

    let first = JobStateManager::open(state_config(&path, 10)).await.unwrap();
    let mut metadata = BTreeMap::new();
    metadata.insert("owner".to_string(), json!("billing"));
    first
        .register_job("invoices", "Invoices", metadata)
        .await
        .unwrap();
    first.disable_job("invoices").await.unwrap();
    first.start_execution("invoices", "run-1").await.unwrap();
    first
        .end_execution("run-1", ExecutionStatus::Failed, Some("timeout".to_string()))
        .await
        .unwrap();
    first.persist_state().await.unwrap();
    assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);

    let second = JobStateManager::open(state_config(&path, 10)).await.unwrap();
    let state = second.get_state("invoices").await.unwrap();
    assert!(!state.enabled);
    assert_eq!(state.metadata["owner"], json!("billing"));
    assert_eq!(state.failure_count, 1);

    let last = state.last_execution.unwrap();
    assert_eq!(last.status, ExecutionStatus::Failed);
    assert_eq!(last.error.as_deref(), Some("timeout"));

    // The last finished execution seeds the history.
    let history = second.get_history("invoices", None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].execution_id, "run-1");
}

#[tokio::test]
async fn test_shutdown_persists_when_auto_persist_enabled() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let config = StateConfig {
        auto_persist: true,
        ..state_config(&path, 10)
    };

    let manager = JobStateManager::open(config).await.unwrap();
    manager
        .register_job("cleanup", "Cleanup", BTreeMap::new())
        .await
        .unwrap();
    manager.shutdown().await.unwrap();

    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written["jobs"]["cleanup"]["name"], json!("Cleanup"));
    assert_eq!(written["jobs"]["cleanup"]["executionCount"], json!(0));
}

#[tokio::test]
async fn test_zero_history_size_keeps_no_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    let manager = JobStateManager::new(state_config(&path, 0));
    manager
        .register_job("quiet", "Quiet", BTreeMap::new())
        .await
        .unwrap();
    manager.start_execution("quiet", "run-1").await.unwrap();
    manager
        .end_execution("run-1", ExecutionStatus::Completed, None)
        .await
        .unwrap();
    assert!(manager.get_history("quiet", None).await.is_empty());
    manager.persist_state().await.unwrap();

    let reloaded = JobStateManager::new(state_config(&path, 0));
    reloaded.load_state().await.unwrap();
    assert!(reloaded.get_history("quiet", None).await.is_empty());
    let state = reloaded.get_state("quiet").await.unwrap();
    assert_eq!(state.last_execution.unwrap().execution_id, "run-1");
    assert_eq!(state.execution_count, 1);
}
