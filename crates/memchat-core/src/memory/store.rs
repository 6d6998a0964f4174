//! ============================================================================
//! Memory Store - Qdrant vector database operations
//! ============================================================================
//! One collection holds every user's memories. The owning namespace is a
//! keyword payload field with its own payload index, and every search or
//! delete carries a `namespace == x` filter so users never see each other's
//! records.
//! ============================================================================

use async_trait::async_trait;
use qdrant_client::qdrant::{
    points_selector::PointsSelectorOneOf, vectors_config, CollectionStatus, Condition, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParams,
    VectorParamsBuilder, VectorsConfig,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::index::{IndexSpec, Metric, VectorIndex};
use super::types::{MemoryMetadata, Role, ScoredMatch};
use crate::error::{MemchatError, Result};

/// Payload key holding the owning namespace
const NAMESPACE_FIELD: &str = "namespace";

/// How many times to poll a freshly created collection before giving up
const READY_POLL_ATTEMPTS: u32 = 30;

/// Delay between readiness polls
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Vector index backed by a Qdrant collection
pub struct QdrantIndex {
    client: Qdrant,
    spec: IndexSpec,
}

impl QdrantIndex {
    /// Connect to Qdrant. Does not touch the collection; call `ensure_index`.
    pub fn connect(url: &str, api_key: Option<String>, spec: IndexSpec) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .build()
            .map_err(|e| MemchatError::storage("Failed to create Qdrant client", e))?;

        Ok(Self { client, spec })
    }

    async fn wait_until_ready(&self) -> Result<()> {
        for attempt in 1..=READY_POLL_ATTEMPTS {
            let info = self
                .client
                .collection_info(&self.spec.name)
                .await
                .map_err(|e| MemchatError::storage("Failed to get collection info", e))?;

            let status = info.result.map(|r| r.status).unwrap_or_default();
            if status == CollectionStatus::Green as i32 {
                debug!("Collection {} ready after {} poll(s)", self.spec.name, attempt);
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        warn!(
            "Collection {} not reported ready after {} polls, continuing anyway",
            self.spec.name, READY_POLL_ATTEMPTS
        );
        Ok(())
    }
}

fn distance(metric: Metric) -> Distance {
    match metric {
        Metric::Cosine => Distance::Cosine,
        Metric::Dot => Distance::Dot,
        Metric::Euclid => Distance::Euclid,
    }
}

/// An existing collection must match the configured dimension and metric
fn check_vectors_config(spec: &IndexSpec, vectors: Option<&VectorsConfig>) -> Result<()> {
    let params: &VectorParams = match vectors.and_then(|v| v.config.as_ref()) {
        Some(vectors_config::Config::Params(params)) => params,
        Some(vectors_config::Config::ParamsMap(_)) => {
            return Err(MemchatError::Configuration(format!(
                "Collection {} uses named vectors; expected a single unnamed vector",
                spec.name
            )))
        }
        None => {
            return Err(MemchatError::Configuration(format!(
                "Collection {} reports no vector configuration",
                spec.name
            )))
        }
    };

    if params.size as usize != spec.dimension {
        return Err(MemchatError::DimensionMismatch {
            expected: spec.dimension,
            actual: params.size as usize,
        });
    }
    if params.distance != distance(spec.metric) as i32 {
        return Err(MemchatError::Configuration(format!(
            "Collection {} uses distance {:?}, configured {:?}",
            spec.name,
            Distance::try_from(params.distance).unwrap_or(Distance::UnknownDistance),
            spec.metric
        )));
    }
    Ok(())
}

/// Qdrant only accepts UUID or integer point ids
pub fn point_id(record_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes()).to_string()
}

fn namespace_filter(namespace: &str) -> Filter {
    Filter::must([Condition::matches(NAMESPACE_FIELD, namespace.to_string())])
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    async fn ensure_index(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.spec.name)
            .await
            .map_err(|e| MemchatError::storage("Failed to check collection existence", e))?;

        if exists {
            let info = self
                .client
                .collection_info(&self.spec.name)
                .await
                .map_err(|e| MemchatError::storage("Failed to get collection info", e))?;
            let vectors = info
                .result
                .and_then(|r| r.config)
                .and_then(|c| c.params)
                .and_then(|p| p.vectors_config);
            check_vectors_config(&self.spec, vectors.as_ref())?;

            debug!("Collection {} already exists", self.spec.name);
            return Ok(());
        }

        info!(
            "Creating collection {} ({} dims, {:?})",
            self.spec.name, self.spec.dimension, self.spec.metric
        );

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.spec.name).vectors_config(
                    VectorParamsBuilder::new(self.spec.dimension as u64, distance(self.spec.metric)),
                ),
            )
            .await
            .map_err(|e| MemchatError::storage("Failed to create collection", e))?;

        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                &self.spec.name,
                NAMESPACE_FIELD,
                FieldType::Keyword,
            ))
            .await
            .map_err(|e| MemchatError::storage("Failed to index namespace field", e))?;

        self.wait_until_ready().await?;
        info!("Collection {} created successfully", self.spec.name);
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

        let payload: HashMap<String, Value> = [
            (NAMESPACE_FIELD.to_string(), Value::from(namespace.to_string())),
            ("record_id".to_string(), Value::from(id.to_string())),
            ("text".to_string(), Value::from(metadata.text)),
            ("role".to_string(), Value::from(metadata.role.as_str().to_string())),
            ("timestamp".to_string(), Value::from(metadata.timestamp)),
        ]
        .into_iter()
        .collect();

        let point = PointStruct::new(point_id(id), vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.spec.name, vec![point]).wait(true))
            .await
            .map_err(|e| MemchatError::storage("Failed to upsert memory", e))?;

        debug!("Memory {} stored in namespace {}", id, namespace);
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: Vec<f32>,
        top_k: u64,
    ) -> Result<Vec<ScoredMatch>> {
        self.spec.check_dimension(&vector)?;

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.spec.name, vector, top_k)
                    .filter(namespace_filter(namespace))
                    .with_payload(true),
            )
            .await
            .map_err(|e| MemchatError::storage("Failed to search memories", e))?;

        let matches: Vec<ScoredMatch> = search_result
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload;
                // Never hand back another namespace's record
                if get_string(&payload, NAMESPACE_FIELD)? != namespace {
                    return None;
                }
                Some(ScoredMatch {
                    metadata: MemoryMetadata {
                        text: get_string(&payload, "text")?,
                        role: get_string(&payload, "role")?.parse().unwrap_or(Role::User),
                        timestamp: get_f64(&payload, "timestamp").unwrap_or(0.0),
                    },
                    score: point.score,
                })
            })
            .collect();

        debug!("Found {} matches in namespace {}", matches.len(), namespace);
        Ok(matches)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        info!("Deleting all memories in namespace {}", namespace);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.spec.name)
                    .points(PointsSelectorOneOf::Filter(namespace_filter(namespace)))
                    .wait(true),
            )
            .await
            .map_err(|e| MemchatError::storage("Failed to delete memories", e))?;

        Ok(())
    }

    async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn get_f64(payload: &HashMap<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(|v| v.as_double())
}
