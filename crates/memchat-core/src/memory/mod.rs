//! ============================================================================
//! Memory Module - Persistent per-user semantic memory
//! ============================================================================
//! Provides vector-based memory storage for semantic recall of past turns.
//!
//! ## Features
//! - Remember user and assistant utterances with vector embeddings
//! - Recall the closest past utterances for a new query
//! - Per-user namespace isolation
//! - Qdrant backend for production, in-process backend for development
//!
//! ## Architecture
//! ```text
//! User Message → Embed → Namespaced Vector Search → Scored Memories
//!                                                       ↓ (score > 0.70)
//!                              [System Prompt] + [Memory Context] + [Turns]
//!                                                       ↓
//!                                                  Groq (streamed)
//!                                                       ↓
//!                                   Dispatcher → Worker → Remember answer
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use memchat_core::memory::{HttpEmbedder, IndexSpec, Metric, MemoryManager, QdrantIndex, Role};
//!
//! let spec = IndexSpec::new("persistent-memory", 1536, Metric::Cosine);
//! let index = Arc::new(QdrantIndex::connect("http://localhost:6334", Some(key), spec)?);
//! let manager = MemoryManager::new(index, Arc::new(HttpEmbedder::new_openai(api_key))).await?;
//!
//! manager.remember("I deploy on Kubernetes", Some("u1"), Role::User).await?;
//! let relevant = manager.recall("where do I deploy?", Some("u1"), 3).await;
//! ```
//! ============================================================================

mod embeddings;
mod index;
mod local;
mod manager;
mod store;
mod types;

// Re-export public types
pub use embeddings::{Embedder, HttpEmbedder, DEFAULT_EMBEDDING_MODEL, EMBEDDING_DIM, OPENAI_BASE_URL};
pub use index::{IndexSpec, Metric, VectorIndex};
pub use local::{cosine_similarity, HashingEmbedder, InMemoryIndex};
pub use manager::{MemoryManager, DEFAULT_RELEVANCE_THRESHOLD, DEFAULT_TOP_K};
pub use store::{point_id, QdrantIndex};
pub use types::{
    filter_relevant, namespace_for, MemoryMetadata, MemoryRecord, RecalledMemory, Role,
    ScoredMatch, DEFAULT_NAMESPACE,
};
