//! Bookkeeping for the consume loops an adapter runs, one per queue, and the
//! delivery handling broker adapters share.

use crate::{
    ConveyorError, Result,
    job::Job,
    queue::{table::JobTable, wire::JobEnvelope},
};
use std::{collections::HashMap, future::Future};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Receiver side of an adapter's shutdown signal.
pub(crate) type ShutdownSignal = watch::Receiver<bool>;

/// Resolves once the adapter has been asked to shut down.
pub(crate) async fn shutdown_requested(signal: &mut ShutdownSignal) {
    // A dropped sender also means shutdown.
    let _ = signal.wait_for(|stop| *stop).await;
}

pub(crate) struct Consumers {
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Consumers {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            running: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Spawn the consume loop for `queue`. A queue gets at most one loop.
    pub async fn start<F, Fut>(&self, queue: &str, consume: F) -> Result<()>
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running.contains_key(queue) {
            return Err(ConveyorError::HandlerAlreadyRegistered {
                name: queue.to_string(),
            });
        }
        if *self.shutdown.borrow() {
            return Err(ConveyorError::queue(format!(
                "cannot consume queue {}: adapter is closed",
                queue
            )));
        }

        let handle = tokio::spawn(consume(self.shutdown.subscribe()));
        running.insert(queue.to_string(), handle);
        Ok(())
    }

    /// Signal every loop to stop and wait for them to exit. Handlers already
    /// running in their own tasks are left to finish.
    pub async fn stop_all(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<(String, JoinHandle<()>)> = self.running.lock().await.drain().collect();
        for (queue, handle) in handles {
            match handle.await {
                Ok(()) => debug!(queue = %queue, "Consumer stopped"),
                Err(e) if e.is_cancelled() => debug!(queue = %queue, "Consumer cancelled"),
                Err(e) => error!(queue = %queue, "Consumer task failed: {}", e),
            }
        }
    }
}

/// Per-queue pause flags that broker consume loops wait on.
#[derive(Default)]
pub(crate) struct PauseSwitches {
    switches: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl PauseSwitches {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn watch(&self, queue: &str) -> watch::Receiver<bool> {
        self.switches
            .lock()
            .await
            .entry(queue.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub async fn set(&self, queue: &str, paused: bool) {
        self.switches
            .lock()
            .await
            .entry(queue.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(paused);
    }
}

/// What a consumer should do with a message the broker delivered.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Claim {
    /// The job is now active and its handler should run.
    Run(Job),
    /// The job already reached a terminal state; the message is a duplicate.
    Finished,
    /// Another delivery of the same job is being handled right now.
    Active,
}

/// Match a delivered envelope with the local table and mark the job active.
///
/// A job the table has never seen (published by another process, or before a
/// restart) is rebuilt from the envelope first.
pub(crate) async fn claim_delivery(
    table: &JobTable,
    envelope: JobEnvelope,
    receipt: Option<String>,
) -> Claim {
    let id = envelope.id.clone();
    match table.get_stored(&id).await {
        Some(stored) if stored.job.finished_on.is_some() => return Claim::Finished,
        Some(stored) if stored.in_flight => return Claim::Active,
        Some(_) => {}
        None => {
            table.insert(envelope.into_job(), None).await;
        }
    }
    match table.claim(&id, receipt).await {
        Some(job) => Claim::Run(job),
        None => Claim::Active,
    }
}
