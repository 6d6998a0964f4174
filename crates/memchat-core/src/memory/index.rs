//! Vector index abstraction: namespaced upsert + similarity query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{MemoryMetadata, ScoredMatch};
use crate::error::{MemchatError, Result};

/// Similarity metric the index ranks by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    Dot,
    Euclid,
}

/// Shape of a vector index; fixed for the lifetime of the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, dimension: usize, metric: Metric) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
        }
    }

    /// Reject vectors that do not match the index dimension
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemchatError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// A nearest-neighbour index partitioned by namespace.
///
/// Every read and write names exactly one namespace; implementations must never
/// return a record from a namespace other than the one queried.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn spec(&self) -> &IndexSpec;

    /// Create the index if absent and wait until it accepts traffic.
    /// Calling it again on an existing index is a no-op.
    async fn ensure_index(&self) -> Result<()>;

    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: Vec<f32>,
        metadata: MemoryMetadata,
    ) -> Result<()>;

    /// Top-k matches in descending score order
    async fn query(&self, namespace: &str, vector: Vec<f32>, top_k: u64)
        -> Result<Vec<ScoredMatch>>;

    /// Remove every record in a namespace
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    async fn health_check(&self) -> bool;
}
