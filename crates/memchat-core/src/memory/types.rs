//! ============================================================================
//! Memory Types - Data structures for conversation memory
//! ============================================================================
//! Defines remembered utterances, the metadata carried by the vector index and
//! the scored matches handed back to the chat orchestrator.
//! ============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace used when a caller has no user identifier
pub const DEFAULT_NAMESPACE: &str = "guest_session";

/// Who said the remembered utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Resolve the namespace for a possibly missing user id
pub fn namespace_for(user_id: Option<&str>) -> String {
    match user_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_NAMESPACE.to_string(),
    }
}

/// A single remembered utterance stored in the vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// `mem-{namespace}-{unix_millis}-{suffix}`
    pub id: String,
    /// Owning user id; never changes once written
    pub namespace: String,
    pub text: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    /// Fractional unix seconds
    pub timestamp: f64,
}

impl MemoryRecord {
    /// Create a new record stamped with the current time
    pub fn new(namespace: String, text: String, role: Role) -> Self {
        let now = chrono::Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("mem-{}-{}-{}", namespace, now.timestamp_millis(), &suffix[..8]),
            namespace,
            text,
            role,
            embedding: Vec::new(),
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    /// Attach a pre-computed embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// The metadata the index carries alongside the vector
    pub fn metadata(&self) -> MemoryMetadata {
        MemoryMetadata {
            text: self.text.clone(),
            role: self.role,
            timestamp: self.timestamp,
        }
    }
}

/// Metadata carried verbatim by the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    pub text: String,
    pub role: Role,
    pub timestamp: f64,
}

/// A nearest-neighbour hit from the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    pub metadata: MemoryMetadata,
    pub score: f32,
}

/// A recalled memory as seen by the chat orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub text: String,
    pub score: f32,
}

/// Keep memories scoring strictly above `threshold`, preserving order
pub fn filter_relevant(results: &[RecalledMemory], threshold: f32) -> Vec<String> {
    results
        .iter()
        .filter(|m| m.score > threshold)
        .map(|m| m.text.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let record = MemoryRecord::new(
            "u1".to_string(),
            "Explain gradient descent".to_string(),
            Role::User,
        );

        assert!(record.id.starts_with("mem-u1-"));
        assert_eq!(record.namespace, "u1");
        assert_eq!(record.role, Role::User);
        assert!(record.embedding.is_empty());
        assert!(record.timestamp > 0.0);
    }

    #[test]
    fn test_record_ids_do_not_collide() {
        let a = MemoryRecord::new("u1".into(), "same".into(), Role::User);
        let b = MemoryRecord::new("u1".into(), "same".into(), Role::User);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_namespace_fallback() {
        assert_eq!(namespace_for(Some("u1")), "u1");
        assert_eq!(namespace_for(Some("  ")), DEFAULT_NAMESPACE);
        assert_eq!(namespace_for(None), DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_threshold_filtering() {
        let results = vec![
            RecalledMemory { text: "a".into(), score: 0.95 },
            RecalledMemory { text: "b".into(), score: 0.70 },
            RecalledMemory { text: "c".into(), score: 0.71 },
            RecalledMemory { text: "d".into(), score: 0.2 },
        ];

        assert_eq!(filter_relevant(&results, 0.70), vec!["a", "c"]);
        assert!(filter_relevant(&results, 0.99).is_empty());
    }
}
