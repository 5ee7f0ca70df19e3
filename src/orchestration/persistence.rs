//! Background persistence of request results
//!
//! Jobs go through a bounded queue to a single worker task. Delivery is
//! at-most-once: a job is dropped when the queue is full, and a job that
//! fails to persist is logged and never retried.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use super::metrics;
use crate::core::{MemoryEntry, MemorySystem, MemoryType, PipelineResult, UserContext};

/// Query and final response of one successful request
#[derive(Debug, Clone)]
pub struct PersistenceJob {
    pub request_id: String,
    pub user_context: UserContext,
    pub query: String,
    pub response: String,
}

impl PersistenceJob {
    fn entries(self) -> [MemoryEntry; 2] {
        let query = MemoryEntry::new(self.query, MemoryType::Episodic, self.user_context.clone())
            .with_metadata("kind", "user_query")
            .with_metadata("request_id", self.request_id.clone());
        let response = MemoryEntry::new(self.response, MemoryType::Episodic, self.user_context)
            .with_metadata("kind", "system_response")
            .with_metadata("request_id", self.request_id);
        [query, response]
    }
}

pub struct PersistenceQueue {
    sender: Mutex<Option<mpsc::Sender<PersistenceJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceQueue {
    /// Spawn the worker on the current tokio runtime
    pub fn start(memory: Arc<dyn MemorySystem>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(drain(receiver, memory));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a job without waiting. Returns false when it was dropped.
    pub fn enqueue(&self, job: PersistenceJob) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            debug!("Persistence queue closed, dropping job {}", job.request_id);
            metrics::count_dropped_job();
            return false;
        };

        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!("Persistence queue full, dropping job {}", job.request_id);
                metrics::count_dropped_job();
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!("Persistence worker gone, dropping job {}", job.request_id);
                metrics::count_dropped_job();
                false
            }
        }
    }

    /// Stop accepting jobs and wait up to `wait` for queued ones to finish
    pub async fn close(&self, wait: Duration) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();

        if let Some(worker) = worker {
            match tokio::time::timeout(wait, worker).await {
                Ok(_) => info!("Persistence worker drained"),
                Err(_) => warn!("Persistence worker still busy after {wait:?}, leaving it"),
            }
        }
    }
}

async fn drain(mut receiver: mpsc::Receiver<PersistenceJob>, memory: Arc<dyn MemorySystem>) {
    while let Some(job) = receiver.recv().await {
        let request_id = job.request_id.clone();
        match persist(memory.as_ref(), job).await {
            Ok(()) => debug!("Persisted results of request {request_id}"),
            Err(e) => warn!("Failed to persist results of request {request_id}: {e}"),
        }
    }
    debug!("Persistence queue closed, worker exiting");
}

async fn persist(memory: &dyn MemorySystem, job: PersistenceJob) -> PipelineResult<()> {
    for entry in job.entries() {
        memory.add_memory(entry).await?;
    }
    Ok(())
}
