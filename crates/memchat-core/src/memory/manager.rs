//! ============================================================================
//! Memory Manager - Orchestrates memory storage and retrieval
//! ============================================================================
//! Single point of contact for "remember" (embed + upsert) and "recall"
//! (embed + namespaced similarity search). Relevance thresholding is left to
//! the caller so the same recall serves any threshold.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::embeddings::Embedder;
use super::index::VectorIndex;
use super::types::{namespace_for, MemoryRecord, RecalledMemory, Role};
use crate::error::{MemchatError, Result};

/// Default number of memories recalled per query
pub const DEFAULT_TOP_K: u64 = 3;

/// Default minimum score for a memory to be used as prompt context
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.70;

/// Memory manager combining index and embeddings
pub struct MemoryManager {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryManager {
    /// Build a manager and make sure the index exists.
    ///
    /// Fails with `DimensionMismatch` when the embedder and index disagree on
    /// vector length.
    pub async fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let expected = index.spec().dimension;
        if embedder.dimension() != expected {
            return Err(MemchatError::DimensionMismatch {
                expected,
                actual: embedder.dimension(),
            });
        }

        index.ensure_index().await?;

        info!(
            "Memory manager ready (index {}, {} dims)",
            index.spec().name,
            expected
        );
        Ok(Self { index, embedder })
    }

    /// Store an utterance under the user's namespace.
    ///
    /// Blank text is skipped and yields `Ok(None)` without touching the index.
    pub async fn remember(
        &self,
        text: &str,
        user_id: Option<&str>,
        role: Role,
    ) -> Result<Option<MemoryRecord>> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Skipping empty {} memory", role);
            return Ok(None);
        }

        let namespace = namespace_for(user_id);
        debug!("Storing new {} memory in namespace {}", role, namespace);

        let embedding = self.embedder.embed_single(text).await?;
        let record = MemoryRecord::new(namespace, text.to_string(), role).with_embedding(embedding);

        if let Err(e) = self
            .index
            .upsert(
                &record.namespace,
                &record.id,
                record.embedding.clone(),
                record.metadata(),
            )
            .await
        {
            if e.is_fatal() {
                error!("Memory {} rejected by index: {}", record.id, e);
            }
            return Err(e);
        }

        info!("Stored memory {} ({})", record.id, role);
        Ok(Some(record))
    }

    /// Recall the `top_k` memories closest to `query` in the user's namespace.
    ///
    /// Never fails: any backend problem is logged and yields an empty list.
    pub async fn recall(
        &self,
        query: &str,
        user_id: Option<&str>,
        top_k: u64,
    ) -> Vec<RecalledMemory> {
        let namespace = namespace_for(user_id);
        let top_k = top_k.max(1);

        match self.try_recall(query, &namespace, top_k).await {
            Ok(memories) => {
                debug!(
                    "Recalled {} memories from namespace {}",
                    memories.len(),
                    namespace
                );
                memories
            }
            Err(e) if e.is_fatal() => {
                error!("Memory recall misconfigured: {}", e);
                vec![]
            }
            Err(e) => {
                warn!("Memory recall failed for namespace {}: {}", namespace, e);
                vec![]
            }
        }
    }

    async fn try_recall(
        &self,
        query: &str,
        namespace: &str,
        top_k: u64,
    ) -> Result<Vec<RecalledMemory>> {
        let query_embedding = self.embedder.embed_single(query).await?;
        let matches = self.index.query(namespace, query_embedding, top_k).await?;

        Ok(matches
            .into_iter()
            .filter(|m| !m.metadata.text.is_empty())
            .map(|m| RecalledMemory {
                text: m.metadata.text,
                score: m.score,
            })
            .collect())
    }

    /// Delete every memory belonging to a user
    pub async fn purge_namespace(&self, user_id: &str) -> Result<()> {
        let namespace = namespace_for(Some(user_id));
        self.index.delete_namespace(&namespace).await?;
        info!("Purged memory namespace {}", namespace);
        Ok(())
    }

    /// Check if the memory backend is reachable
    pub async fn health_check(&self) -> bool {
        self.index.health_check().await
    }

    /// Name of the backing index
    pub fn index_name(&self) -> &str {
        &self.index.spec().name
    }
}
