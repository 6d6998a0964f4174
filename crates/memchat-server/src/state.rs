//! ============================================================================
//! Application State - Process-wide services built once at startup
//! ============================================================================

use std::sync::Arc;
use tracing::{info, warn};

use memchat_core::memory::{
    Embedder, HashingEmbedder, HttpEmbedder, IndexSpec, InMemoryIndex, Metric, QdrantIndex,
    VectorIndex,
};
use memchat_core::{
    AppConfig, ChatModel, ChatService, Dispatcher, GroqClient, HistoryStore, JobQueue,
    MemoryManager, RememberWorker, Result, VectorBackend, WorkerPool,
};

/// Shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub history: Arc<HistoryStore>,
    pub memory: Option<Arc<MemoryManager>>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(chat: Arc<ChatService>, dispatcher: Dispatcher) -> Self {
        Self {
            history: Arc::clone(chat.history()),
            memory: chat.memory().cloned(),
            chat,
            dispatcher,
        }
    }
}

/// Running services plus the handles needed to shut them down
pub struct Services {
    pub state: AppState,
    pub pool: WorkerPool,
}

impl Services {
    /// Stop the dispatcher and wait for in-flight jobs
    pub async fn shutdown(self) {
        self.state.dispatcher.close();
        self.pool.join().await;
        info!("Dispatcher drained");
    }
}

/// Wire every component from configuration.
///
/// Stores that cannot open and misconfigured memory abort startup; an
/// unreachable vector backend only disables memory.
pub async fn bootstrap(config: &AppConfig) -> Result<Services> {
    let history = Arc::new(HistoryStore::open(config.db_path.as_deref())?);
    info!("History database initialized at: {}", history.path().display());

    let queue = Arc::new(JobQueue::open(&config.broker_path)?);

    let memory = match init_memory(config).await {
        Ok(manager) => Some(Arc::new(manager)),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!("Failed to init memory: {} - running without memory", e);
            None
        }
    };

    let model: Arc<dyn ChatModel> = Arc::new(GroqClient::new(
        config.groq_api_key.clone(),
        config.chat_model.clone(),
    ));
    info!("Chat model: {}", config.chat_model);

    let (dispatcher, receiver) = Dispatcher::new(Arc::clone(&queue));
    let worker = Arc::new(RememberWorker::new(Arc::clone(&history), memory.clone()));
    let pool = WorkerPool::start(queue, receiver, worker, config.worker_concurrency)?;

    let chat = Arc::new(ChatService::new(
        history,
        memory,
        dispatcher.clone(),
        model,
        config.chat_settings(),
    ));

    Ok(Services {
        state: AppState::new(chat, dispatcher),
        pool,
    })
}

async fn init_memory(config: &AppConfig) -> Result<MemoryManager> {
    let spec = IndexSpec::new(&config.index_name, config.embedding_dim, Metric::Cosine);

    let index: Arc<dyn VectorIndex> = match config.vector_backend {
        VectorBackend::Qdrant => Arc::new(QdrantIndex::connect(
            &config.qdrant_url,
            config.vector_api_key.clone(),
            spec,
        )?),
        VectorBackend::Memory => {
            warn!("Using in-process vector index; memories are lost on restart");
            Arc::new(InMemoryIndex::new(spec))
        }
    };

    let embedder: Arc<dyn Embedder> = match &config.embedding_api_key {
        Some(key) => Arc::new(HttpEmbedder::new_custom(
            key.clone(),
            config.embedding_base_url.clone(),
            config.embedding_model.clone(),
            config.embedding_dim,
        )),
        None => {
            warn!("No embedding API key; falling back to local hashing embedder");
            Arc::new(HashingEmbedder::new(config.embedding_dim))
        }
    };

    MemoryManager::new(index, embedder).await
}
