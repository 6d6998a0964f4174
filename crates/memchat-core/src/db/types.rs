//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::Role;

/// Title every conversation starts with until its first user message
pub const DEFAULT_TITLE: &str = "New Chat";

/// Number of leading words of the first user message used as title
pub const TITLE_WORDS: usize = 5;

/// A chat session owned by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: u64,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every new message; listing order key
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: u64, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }
}

/// One user or assistant turn within a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Global insertion sequence; breaks created_at ties
    pub id: u64,
    pub conversation_id: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Dispatcher job that wrote this row, if any
    pub job_id: Option<u64>,
}

/// Input of the worker's relational step
#[derive(Debug, Clone)]
pub struct MessageWrite {
    pub conversation_id: u64,
    pub role: Role,
    pub content: String,
    pub user_id: Option<String>,
    pub job_id: Option<u64>,
}

/// Result of persisting a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted { message_id: u64, title_set: bool },
    /// The job id was already applied; nothing written
    Duplicate { message_id: u64 },
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub applied_jobs: usize,
}

/// First five whitespace-delimited words, or `None` for blank text
pub fn title_from(text: &str) -> Option<String> {
    let title = text
        .split_whitespace()
        .take(TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}
