//! ============================================================================
//! Configuration - Environment-driven settings for server, worker and CLI
//! ============================================================================
//! Required credentials are checked up front so a misconfigured deployment
//! fails at startup instead of on the first chat turn.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::chat::ChatSettings;
use crate::error::{MemchatError, Result};
use crate::memory::{DEFAULT_EMBEDDING_MODEL, EMBEDDING_DIM, OPENAI_BASE_URL};

/// Default Qdrant gRPC endpoint
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";

/// Default vector index (collection) name
pub const DEFAULT_INDEX_NAME: &str = "persistent-memory";

/// Default Groq chat model
pub const DEFAULT_CHAT_MODEL: &str = "llama-3.1-8b-instant";

/// Which vector backend holds the memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackend {
    Qdrant,
    /// Process-local index, for development without a Qdrant instance
    Memory,
}

impl FromStr for VectorBackend {
    type Err = MemchatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "qdrant" => Ok(VectorBackend::Qdrant),
            "memory" | "in-memory" | "in_memory" => Ok(VectorBackend::Memory),
            _ => Err(MemchatError::Configuration(format!(
                "Unknown MEMCHAT_VECTOR_BACKEND '{}' (expected qdrant or memory)",
                s
            ))),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind_addr: String,
    pub cors_origin: String,
    pub vector_backend: VectorBackend,
    pub qdrant_url: String,
    pub vector_api_key: Option<String>,
    pub index_name: String,
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub groq_api_key: String,
    pub chat_model: String,
    pub db_path: Option<PathBuf>,
    pub broker_path: PathBuf,
    pub worker_concurrency: usize,
    pub recall_top_k: u64,
    pub relevance_threshold: f32,
    pub history_turns: usize,
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let vector_backend = match get("MEMCHAT_VECTOR_BACKEND") {
            Some(v) => v.parse()?,
            None => VectorBackend::Qdrant,
        };

        let vector_api_key = get("QDRANT_API_KEY");
        if vector_backend == VectorBackend::Qdrant && vector_api_key.is_none() {
            return Err(MemchatError::Configuration(
                "Missing vector store API key (QDRANT_API_KEY)".to_string(),
            ));
        }

        let groq_api_key = get("GROQ_API_KEY").ok_or_else(|| {
            MemchatError::Configuration("Missing Groq API key (GROQ_API_KEY)".to_string())
        })?;

        let broker_path = get("MEMCHAT_BROKER_URL")
            .map(|url| parse_broker_url(&url))
            .transpose()?
            .ok_or_else(|| {
                MemchatError::Configuration(
                    "Missing task queue broker (MEMCHAT_BROKER_URL)".to_string(),
                )
            })?;

        let worker_concurrency: usize = parse_or(&get, "MEMCHAT_WORKERS", 4)?;
        if worker_concurrency == 0 {
            return Err(MemchatError::Configuration(
                "MEMCHAT_WORKERS must be at least 1".to_string(),
            ));
        }

        let embedding_dim: usize = parse_or(&get, "EMBEDDING_DIM", EMBEDDING_DIM)?;
        if embedding_dim == 0 {
            return Err(MemchatError::Configuration(
                "EMBEDDING_DIM must be positive".to_string(),
            ));
        }

        let relevance_threshold: f32 = parse_or(&get, "MEMCHAT_RELEVANCE_THRESHOLD", 0.70)?;
        if !relevance_threshold.is_finite() || !(-1.0..=1.0).contains(&relevance_threshold) {
            return Err(MemchatError::Configuration(format!(
                "MEMCHAT_RELEVANCE_THRESHOLD must be within [-1, 1], got {}",
                relevance_threshold
            )));
        }

        Ok(Self {
            bind_addr: get("MEMCHAT_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            cors_origin: get("MEMCHAT_CORS_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            vector_backend,
            qdrant_url: get("QDRANT_URL").unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string()),
            vector_api_key,
            index_name: get("MEMCHAT_INDEX_NAME")
                .unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
            embedding_api_key: get("EMBEDDING_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            embedding_base_url: get("EMBEDDING_BASE_URL")
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            embedding_dim,
            groq_api_key,
            chat_model: get("GROQ_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            db_path: get("MEMCHAT_DB_PATH").map(PathBuf::from),
            broker_path,
            worker_concurrency,
            recall_top_k: parse_or::<u64, _>(&get, "MEMCHAT_RECALL_TOP_K", 3)?.max(1),
            relevance_threshold,
            history_turns: parse_or(&get, "MEMCHAT_HISTORY_TURNS", 10)?,
        })
    }

    /// Prompt-assembly settings for the chat service
    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            recall_top_k: self.recall_top_k,
            relevance_threshold: self.relevance_threshold,
            history_turns: self.history_turns,
        }
    }
}

/// Accepts `redb:///abs/path`, `redb://rel/path` or a bare file path
pub fn parse_broker_url(url: &str) -> Result<PathBuf> {
    let path = match url.split_once("://") {
        Some(("redb", rest)) => rest,
        Some((scheme, _)) => {
            return Err(MemchatError::Configuration(format!(
                "Unsupported broker scheme '{}' (expected redb://)",
                scheme
            )))
        }
        None => url,
    };
    if path.is_empty() {
        return Err(MemchatError::Configuration(
            "Broker URL has an empty path".to_string(),
        ));
    }
    Ok(PathBuf::from(path))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e| {
            MemchatError::Configuration(format!("Invalid {} '{}': {}", key, raw, e))
        }),
        None => Ok(default),
    }
}
