//! ============================================================================
//! Local Backends - Process-local vector index and hashing embedder
//! ============================================================================
//! Used for development without Qdrant or an embedding API key, and as the
//! backends of the test suites. Neither survives a restart.
//! ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::embeddings::Embedder;
use super::index::{IndexSpec, Metric, VectorIndex};
use super::types::{MemoryMetadata, ScoredMatch};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredPoint {
    id: String,
    vector: Vec<f32>,
    metadata: MemoryMetadata,
}

/// Brute-force nearest-neighbour index partitioned by namespace
pub struct InMemoryIndex {
    spec: IndexSpec,
    namespaces: RwLock<HashMap<String, Vec<StoredPoint>>>,
    upserts: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            namespaces: RwLock::new(HashMap::new()),
            upserts: AtomicUsize::new(0),
        }
    }

    /// Number of upsert calls served so far
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of records held in a namespace
    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|points| points.len())
            .unwrap_or(0)
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.spec.metric {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => a.iter().zip(b).map(|(x, y)| x * y).sum(),
            Metric::Euclid => -a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    async fn ensure_index(&self) -> Result<()> {
        debug!("In-memory index {} ready", self.spec.name);
        Ok(())
    }

    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: Vec<f32>,
        metadata: MemoryMetadata,
    ) -> Result<()> {
        self.spec.check_dimension(&vector)?;
        self.upserts.fetch_add(1, Ordering::SeqCst);

        let mut namespaces = self.namespaces.write().await;
        let points = namespaces.entry(namespace.to_string()).or_default();
        let point = StoredPoint {
            id: id.to_string(),
            vector,
            metadata,
        };
        match points.iter_mut().find(|p| p.id == id) {
            Some(existing) => *existing = point,
            None => points.push(point),
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: Vec<f32>,
        top_k: u64,
    ) -> Result<Vec<ScoredMatch>> {
        self.spec.check_dimension(&vector)?;

        let namespaces = self.namespaces.read().await;
        let Some(points) = namespaces.get(namespace) else {
            return Ok(vec![]);
        };

        let mut matches: Vec<ScoredMatch> = points
            .iter()
            .map(|p| ScoredMatch {
                metadata: p.metadata.clone(),
                score: self.score(&vector, &p.vector),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k as usize);
        Ok(matches)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces.write().await.remove(namespace);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Cosine similarity; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Feature-hashing bag-of-words embedder.
///
/// Texts sharing words land close together, which is enough for offline
/// development; it is not a semantic model.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
