//! ============================================================================
//! Worker Pool - Executes remember jobs off the request path
//! ============================================================================
//! N tokio tasks share one receiver. Each job runs in its own task so a panic
//! only fails that job; the worker that picked it up keeps going.
//! ============================================================================

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::types::{JobId, JobOutcome, RememberJob};
use crate::db::{blocking, HistoryStore, MessageWrite, PersistOutcome};
use crate::error::Result;
use crate::memory::MemoryManager;

pub const MEMORY_NOT_INITIALIZED: &str = "memory backend not initialized";
pub const USER_ID_MISSING: &str = "user_id missing";

/// Something that can run a job to a terminal outcome
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, id: JobId, job: RememberJob) -> JobOutcome;
}

struct Inbox {
    backlog: VecDeque<JobId>,
    receiver: mpsc::UnboundedReceiver<JobId>,
}

impl Inbox {
    async fn next(&mut self) -> Option<JobId> {
        match self.backlog.pop_front() {
            Some(id) => Some(id),
            None => self.receiver.recv().await,
        }
    }
}

/// Fixed set of worker tasks draining the dispatcher channel
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers.
    ///
    /// Unfinished jobs from a previous run are delivered before anything
    /// arriving on `receiver`.
    pub fn start(
        queue: Arc<JobQueue>,
        receiver: mpsc::UnboundedReceiver<JobId>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<Self> {
        let backlog: VecDeque<JobId> = queue.recoverable()?.into();
        let inbox = Arc::new(Mutex::new(Inbox { backlog, receiver }));
        let concurrency = concurrency.max(1);

        let workers = (0..concurrency)
            .map(|n| {
                let queue = Arc::clone(&queue);
                let inbox = Arc::clone(&inbox);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        let next = inbox.lock().await.next().await;
                        let Some(id) = next else { break };
                        run_job(Arc::clone(&queue), &handler, id).await;
                    }
                    debug!("Worker {} stopped", n);
                })
            })
            .collect();

        info!("Started {} dispatcher workers", concurrency);
        Ok(Self { workers })
    }

    /// Wait until every worker has drained the channel and exited
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }
}

async fn run_job(queue: Arc<JobQueue>, handler: &Arc<dyn JobHandler>, id: JobId) {
    let claim = {
        let queue = Arc::clone(&queue);
        blocking(move || queue.mark_running(id)).await
    };
    let record = match claim {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!("Job {} already claimed or finished, skipping", id);
            return;
        }
        Err(e) => {
            error!("Failed to claim job {}: {}", id, e);
            return;
        }
    };

    let task = {
        let handler = Arc::clone(handler);
        tokio::spawn(async move { handler.handle(id, record.job).await })
    };

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => JobOutcome::Failed("worker panicked".to_string()),
        Err(e) => JobOutcome::Failed(format!("worker cancelled: {}", e)),
    };

    match &outcome {
        JobOutcome::Completed(message) => info!("Job {} completed: {}", id, message),
        JobOutcome::Failed(reason) => warn!("Job {} failed: {}", id, reason),
    }

    let finished = {
        let outcome = outcome.clone();
        blocking(move || queue.mark_finished(id, &outcome)).await
    };
    if let Err(e) = finished {
        error!("Failed to record outcome of job {}: {}", id, e);
    }
}

/// History then vector persistence of one utterance
pub struct RememberWorker {
    history: Arc<HistoryStore>,
    memory: Option<Arc<MemoryManager>>,
}

impl RememberWorker {
    pub fn new(history: Arc<HistoryStore>, memory: Option<Arc<MemoryManager>>) -> Self {
        Self { history, memory }
    }

    async fn persist(&self, id: JobId, job: &RememberJob) -> Result<PersistOutcome> {
        let history = Arc::clone(&self.history);
        let write = MessageWrite {
            conversation_id: job.conversation_id,
            role: job.role,
            content: job.text.clone(),
            user_id: job.user_id.clone(),
            job_id: Some(id),
        };

        blocking(move || history.persist_message(&write)).await
    }
}

#[async_trait]
impl JobHandler for RememberWorker {
    async fn handle(&self, id: JobId, job: RememberJob) -> JobOutcome {
        match self.persist(id, &job).await {
            Ok(PersistOutcome::Inserted { message_id, title_set }) => {
                debug!(
                    "Job {} stored message {} (title set: {})",
                    id, message_id, title_set
                );
            }
            Ok(PersistOutcome::Duplicate { message_id }) => {
                debug!("Job {} redelivered; message {} already stored", id, message_id);
            }
            Err(e) => {
                error!("History persist for job {} rolled back: {}", id, e);
                return JobOutcome::Failed(format!("history persist failed: {}", e));
            }
        }

        let Some(memory) = &self.memory else {
            return JobOutcome::Failed(MEMORY_NOT_INITIALIZED.to_string());
        };
        let Some(user_id) = job.user_id.as_deref().filter(|u| !u.trim().is_empty()) else {
            return JobOutcome::Failed(USER_ID_MISSING.to_string());
        };

        match memory.remember(&job.text, Some(user_id), job.role).await {
            Ok(Some(_)) => {
                let preview: String = job.text.trim().chars().take(20).collect();
                JobOutcome::Completed(format!("Saved: {}... for user {}", preview, user_id))
            }
            Ok(None) => JobOutcome::Completed("Skipped empty text".to_string()),
            Err(e) => JobOutcome::Failed(format!("memory persist failed: {}", e)),
        }
    }
}
