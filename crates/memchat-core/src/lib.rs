//! ============================================================================
//! MEMCHAT-CORE: Memory-augmented chat backend
//! ============================================================================
//! Everything behind the HTTP surface:
//! - Per-user semantic memory over a namespaced vector index (Qdrant)
//! - Durable conversation/message history (redb)
//! - Durable fire-and-forget job dispatcher with a tokio worker pool
//! - Streaming chat orchestration against Groq
//! ============================================================================

pub mod chat;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod memory;

// Re-export main types for convenience
pub use chat::{ChatModel, ChatService, ChatSettings, ChatTurn, GroqClient, TurnRequest};
pub use config::{AppConfig, VectorBackend};
pub use db::HistoryStore;
pub use dispatcher::{Dispatcher, JobQueue, RememberWorker, WorkerPool};
pub use error::{MemchatError, Result};
pub use memory::{MemoryManager, Role};
