//! ============================================================================
//! Dispatcher Module - Fire-and-forget memory writes
//! ============================================================================
//! Moves history and vector persistence off the chat response path.
//!
//! ```text
//! enqueue() ──commit──▶ [redb job table] ──id──▶ channel ──▶ WorkerPool
//!                                                              │
//!                          HistoryStore::persist_message ◀─────┤ (1)
//!                          MemoryManager::remember       ◀─────┘ (2)
//! ```
//!
//! Delivery is at-least-once: jobs still enqueued or running at shutdown are
//! picked up again by the next `WorkerPool::start`.
//! ============================================================================

mod queue;
mod types;
mod worker;

pub use queue::JobQueue;
pub use types::{JobId, JobOutcome, JobRecord, JobState, QueueStats, RememberJob};
pub use worker::{JobHandler, RememberWorker, WorkerPool, MEMORY_NOT_INITIALIZED, USER_ID_MISSING};

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

use crate::db::blocking;
use crate::error::Result;

/// Cloneable handle used by request handlers to submit jobs
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<JobId>>>>,
}

impl Dispatcher {
    /// Create a dispatcher and the receiver to hand to `WorkerPool::start`
    pub fn new(queue: Arc<JobQueue>) -> (Self, mpsc::UnboundedReceiver<JobId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            queue,
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        (dispatcher, rx)
    }

    /// Persist the job and wake a worker; never waits for execution
    pub fn enqueue(&self, job: RememberJob) -> Result<JobId> {
        let id = self.queue.enqueue(job)?;

        let delivered = match self.sender.lock() {
            Ok(guard) => guard.as_ref().map_or(false, |tx| tx.send(id).is_ok()),
            Err(_) => false,
        };
        if !delivered {
            warn!("Dispatcher closed; job {} left for the next start", id);
        }
        Ok(id)
    }

    /// `enqueue` on the blocking pool, for callers on async worker threads
    pub async fn submit(&self, job: RememberJob) -> Result<JobId> {
        let dispatcher = self.clone();
        blocking(move || dispatcher.enqueue(job)).await
    }

    /// Stop accepting deliveries so workers exit once the channel drains
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}
