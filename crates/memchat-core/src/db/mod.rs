// ============================================================================
// HistoryStore - Conversation/Message Ledger (redb)
// ============================================================================
// Durable chat history, independent of the vector memory.
// Default path: ~/.memchat/history.redb (override via MEMCHAT_DB_PATH)
// ============================================================================

pub mod types;

pub use types::{
    title_from, Conversation, DbStats, Message, MessageWrite, PersistOutcome, DEFAULT_TITLE,
    TITLE_WORDS,
};

use chrono::Utc;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition, TableHandle,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{MemchatError, Result};
use crate::memory::Role;

// Table definitions
const CONVERSATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("conversations");
/// Keyed by (conversation_id, message_id) so a conversation is one range scan
const MESSAGES: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("messages");
/// job_id → message_id for every job already applied
const APPLIED_JOBS: TableDefinition<u64, u64> = TableDefinition::new("applied_jobs");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const CONVERSATION_SEQ: &str = "conversation_seq";
const MESSAGE_SEQ: &str = "message_seq";

/// Embedded conversation/message store
pub struct HistoryStore {
    db: Database,
    path: PathBuf,
}

impl HistoryStore {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses ~/.memchat/history.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_path("history.redb")?,
        };

        info!("Opening history database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| MemchatError::storage("Failed to open history database", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| MemchatError::storage("Failed to begin write", e))?;
        {
            write_txn
                .open_table(CONVERSATIONS)
                .map_err(|e| MemchatError::storage("Failed to create conversations table", e))?;
            write_txn
                .open_table(MESSAGES)
                .map_err(|e| MemchatError::storage("Failed to create messages table", e))?;
            write_txn
                .open_table(APPLIED_JOBS)
                .map_err(|e| MemchatError::storage("Failed to create applied_jobs table", e))?;
            write_txn
                .open_table(COUNTERS)
                .map_err(|e| MemchatError::storage("Failed to create counters table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| MemchatError::storage("Failed to commit init", e))?;

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Conversation Operations
    // ========================================================================

    /// Create a fresh conversation titled "New Chat"
    pub fn create_conversation(&self, user_id: &str) -> Result<Conversation> {
        let write_txn = self.begin_write()?;
        let conversation = {
            let mut counters = open_table(&write_txn, COUNTERS)?;
            let id = next_id(&mut counters, CONVERSATION_SEQ)?;
            let conversation = Conversation::new(id, user_id.to_string());

            let mut table = open_table(&write_txn, CONVERSATIONS)?;
            table
                .insert(id, encode(&conversation)?.as_slice())
                .map_err(|e| MemchatError::storage("Failed to insert conversation", e))?;
            conversation
        };
        commit(write_txn)?;

        debug!("Created conversation {} for {}", conversation.id, user_id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: u64) -> Result<Option<Conversation>> {
        let read_txn = self.begin_read()?;
        let table = read_txn
            .open_table(CONVERSATIONS)
            .map_err(|e| MemchatError::storage("Failed to open conversations table", e))?;

        match table
            .get(id)
            .map_err(|e| MemchatError::storage("Failed to get conversation", e))?
        {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Conversations by most recent activity; `None` lists every user's
    pub fn list_conversations(&self, user_id: Option<&str>) -> Result<Vec<Conversation>> {
        let read_txn = self.begin_read()?;
        let table = read_txn
            .open_table(CONVERSATIONS)
            .map_err(|e| MemchatError::storage("Failed to open conversations table", e))?;

        let mut results = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| MemchatError::storage("Failed to iterate conversations", e))?;
        for entry in iter {
            let (_key, value) =
                entry.map_err(|e| MemchatError::storage("Failed to read entry", e))?;
            let conversation: Conversation = decode(value.value())?;
            if user_id.map_or(true, |u| conversation.user_id == u) {
                results.push(conversation);
            }
        }

        results.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(results)
    }

    /// Delete a conversation and all of its messages
    pub fn delete_conversation(&self, id: u64) -> Result<bool> {
        let write_txn = self.begin_write()?;
        let removed;
        {
            let mut conversations = open_table(&write_txn, CONVERSATIONS)?;
            removed = conversations
                .remove(id)
                .map_err(|e| MemchatError::storage("Failed to remove conversation", e))?
                .is_some();

            let mut messages = open_table(&write_txn, MESSAGES)?;
            let keys: Vec<(u64, u64)> = messages
                .range((id, 0)..=(id, u64::MAX))
                .map_err(|e| MemchatError::storage("Failed to iterate messages", e))?
                .map(|entry| entry.map(|(key, _)| key.value()))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| MemchatError::storage("Failed to read entry", e))?;
            for key in keys {
                messages
                    .remove(key)
                    .map_err(|e| MemchatError::storage("Failed to remove message", e))?;
            }
        }
        commit(write_txn)?;

        if removed {
            debug!("Deleted conversation: {}", id);
        }
        Ok(removed)
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    /// Full history in chronological order.
    ///
    /// A conversation without messages is reported as `NotFound`, the same as
    /// one that never existed.
    pub fn get_history(&self, conversation_id: u64) -> Result<Vec<Message>> {
        let messages = self.read_messages(conversation_id)?;
        if messages.is_empty() {
            return Err(MemchatError::NotFound(format!(
                "No history for conversation {}",
                conversation_id
            )));
        }
        Ok(messages)
    }

    /// The last `limit` messages in chronological order (empty when none)
    pub fn recent_messages(&self, conversation_id: u64, limit: usize) -> Result<Vec<Message>> {
        let mut messages = self.read_messages(conversation_id)?;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    fn read_messages(&self, conversation_id: u64) -> Result<Vec<Message>> {
        let read_txn = self.begin_read()?;
        let table = read_txn
            .open_table(MESSAGES)
            .map_err(|e| MemchatError::storage("Failed to open messages table", e))?;

        let mut results = Vec::new();
        let iter = table
            .range((conversation_id, 0)..=(conversation_id, u64::MAX))
            .map_err(|e| MemchatError::storage("Failed to iterate messages", e))?;
        for entry in iter {
            let (_key, value) =
                entry.map_err(|e| MemchatError::storage("Failed to read entry", e))?;
            results.push(decode::<Message>(value.value())?);
        }

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    /// Insert a message and update its conversation in one transaction.
    ///
    /// The first user message replaces the default title with its first five
    /// words and claims the conversation for its user. A job id that was
    /// already applied is reported as `Duplicate` and nothing is written. Any
    /// error drops the transaction uncommitted.
    pub fn persist_message(&self, write: &MessageWrite) -> Result<PersistOutcome> {
        let write_txn = self.begin_write()?;
        let outcome = {
            let mut applied = open_table(&write_txn, APPLIED_JOBS)?;
            if let Some(job_id) = write.job_id {
                let existing = applied
                    .get(job_id)
                    .map_err(|e| MemchatError::storage("Failed to check applied jobs", e))?
                    .map(|v| v.value());
                if let Some(message_id) = existing {
                    debug!("Job {} already applied as message {}", job_id, message_id);
                    return Ok(PersistOutcome::Duplicate { message_id });
                }
            }

            let mut conversations = open_table(&write_txn, CONVERSATIONS)?;
            let mut conversation: Conversation = match conversations
                .get(write.conversation_id)
                .map_err(|e| MemchatError::storage("Failed to get conversation", e))?
            {
                Some(value) => decode(value.value())?,
                None => {
                    return Err(MemchatError::NotFound(format!(
                        "Conversation {}",
                        write.conversation_id
                    )))
                }
            };

            let mut counters = open_table(&write_txn, COUNTERS)?;
            let message_id = next_id(&mut counters, MESSAGE_SEQ)?;
            let now = Utc::now();

            let message = Message {
                id: message_id,
                conversation_id: write.conversation_id,
                role: write.role,
                content: write.content.clone(),
                created_at: now,
                job_id: write.job_id,
            };
            let mut messages = open_table(&write_txn, MESSAGES)?;
            messages
                .insert((write.conversation_id, message_id), encode(&message)?.as_slice())
                .map_err(|e| MemchatError::storage("Failed to insert message", e))?;

            let mut title_set = false;
            if write.role == Role::User && conversation.has_default_title() {
                if let Some(title) = title_from(&write.content) {
                    conversation.title = title;
                    if let Some(user_id) = &write.user_id {
                        conversation.user_id = user_id.clone();
                    }
                    title_set = true;
                }
            }
            conversation.updated_at = now;
            conversations
                .insert(conversation.id, encode(&conversation)?.as_slice())
                .map_err(|e| MemchatError::storage("Failed to update conversation", e))?;

            if let Some(job_id) = write.job_id {
                applied
                    .insert(job_id, message_id)
                    .map_err(|e| MemchatError::storage("Failed to record applied job", e))?;
            }

            PersistOutcome::Inserted {
                message_id,
                title_set,
            }
        };
        commit(write_txn)?;

        debug!(
            "Persisted {} message in conversation {}",
            write.role, write.conversation_id
        );
        Ok(outcome)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let read_txn = self.begin_read()?;
        let count = |def: &str, len: std::result::Result<u64, redb::StorageError>| {
            len.map(|n| n as usize)
                .map_err(|e| MemchatError::storage(&format!("Failed to count {}", def), e))
        };

        let conversations = read_txn
            .open_table(CONVERSATIONS)
            .map_err(|e| MemchatError::storage("Failed to open conversations table", e))?;
        let messages = read_txn
            .open_table(MESSAGES)
            .map_err(|e| MemchatError::storage("Failed to open messages table", e))?;
        let applied = read_txn
            .open_table(APPLIED_JOBS)
            .map_err(|e| MemchatError::storage("Failed to open applied_jobs table", e))?;

        Ok(DbStats {
            total_conversations: count("conversations", conversations.len())?,
            total_messages: count("messages", messages.len())?,
            applied_jobs: count("applied jobs", applied.len())?,
        })
    }

    fn begin_write(&self) -> Result<redb::WriteTransaction> {
        self.db
            .begin_write()
            .map_err(|e| MemchatError::storage("Failed to begin write", e))
    }

    fn begin_read(&self) -> Result<redb::ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| MemchatError::storage("Failed to begin read", e))
    }
}

/// `~/.memchat/<file>`, creating the directory if needed
pub fn default_path(file: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        MemchatError::Configuration("Cannot determine home directory".to_string())
    })?;
    let dir = home.join(".memchat");
    std::fs::create_dir_all(&dir)
        .map_err(|e| MemchatError::storage("Failed to create .memchat directory", e))?;
    Ok(dir.join(file))
}

pub(crate) fn open_table<'txn, K: redb::Key + 'static, V: redb::Value + 'static>(
    txn: &'txn redb::WriteTransaction,
    def: TableDefinition<K, V>,
) -> Result<Table<'txn, K, V>> {
    txn.open_table(def)
        .map_err(|e| MemchatError::storage(&format!("Failed to open {} table", def.name()), e))
}

pub(crate) fn next_id(counters: &mut Table<'_, &'static str, u64>, key: &str) -> Result<u64> {
    let current = counters
        .get(key)
        .map_err(|e| MemchatError::storage("Failed to read counter", e))?
        .map(|v| v.value())
        .unwrap_or(0);
    let next = current + 1;
    counters
        .insert(key, next)
        .map_err(|e| MemchatError::storage("Failed to bump counter", e))?;
    Ok(next)
}

pub(crate) fn commit(txn: redb::WriteTransaction) -> Result<()> {
    txn.commit()
        .map_err(|e| MemchatError::storage("Failed to commit", e))
}

/// Run a redb transaction on the blocking pool; commits fsync
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemchatError::StorageUnavailable(format!("storage task failed: {}", e)))?
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| MemchatError::storage("Failed to serialize record", e))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| MemchatError::storage("Failed to deserialize record", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (HistoryStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::open(Some(&dir.path().join("history.redb"))).unwrap();
        (store, dir)
    }

    fn write(conversation_id: u64, role: Role, content: &str, job_id: Option<u64>) -> MessageWrite {
        MessageWrite {
            conversation_id,
            role,
            content: content.to_string(),
            user_id: Some("u1".to_string()),
            job_id,
        }
    }

    #[test]
    fn test_create_and_get_conversation() {
        let (store, _dir) = store();
        let a = store.create_conversation("u1").unwrap();
        let b = store.create_conversation("u1").unwrap();

        assert_eq!(a.title, DEFAULT_TITLE);
        assert_ne!(a.id, b.id);
        assert_eq!(store.get_conversation(a.id).unwrap().unwrap(), a);
        assert!(store.get_conversation(999_999).unwrap().is_none());
    }

    #[test]
    fn test_first_user_message_sets_title_once() {
        let (store, _dir) = store();
        let convo = store.create_conversation("guest_session").unwrap();

        let first = store
            .persist_message(&write(convo.id, Role::User, "Explain gradient descent like I am five please", None))
            .unwrap();
        assert!(matches!(first, PersistOutcome::Inserted { title_set: true, .. }));

        let second = store
            .persist_message(&write(convo.id, Role::User, "Now explain backpropagation", None))
            .unwrap();
        assert!(matches!(second, PersistOutcome::Inserted { title_set: false, .. }));

        let convo = store.get_conversation(convo.id).unwrap().unwrap();
        assert_eq!(convo.title, "Explain gradient descent like I");
        assert_eq!(convo.user_id, "u1");
    }

    #[test]
    fn test_assistant_message_does_not_set_title() {
        let (store, _dir) = store();
        let convo = store.create_conversation("u1").unwrap();

        store
            .persist_message(&write(convo.id, Role::Assistant, "Hello! How can I help?", None))
            .unwrap();

        let convo = store.get_conversation(convo.id).unwrap().unwrap();
        assert_eq!(convo.title, DEFAULT_TITLE);
    }

    #[test]
    fn test_history_order() {
        let (store, _dir) = store();
        let convo = store.create_conversation("u1").unwrap();
        let other = store.create_conversation("u1").unwrap();

        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .persist_message(&write(convo.id, role, &format!("turn {}", i), None))
                .unwrap();
            store
                .persist_message(&write(other.id, role, &format!("other {}", i), None))
                .unwrap();
        }

        let history = store.get_history(convo.id).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 0", "turn 1", "turn 2", "turn 3", "turn 4"]);
        assert!(history.iter().all(|m| m.conversation_id == convo.id));
    }

    #[test]
    fn test_concurrent_writers_keep_total_order() {
        let (store, _dir) = store();
        let store = Arc::new(store);
        let convo = store.create_conversation("u1").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .persist_message(&write(convo.id, Role::User, &format!("m{}", i), None))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = store.get_history(convo.id).unwrap();
        assert_eq!(history.len(), 8);
        assert!(history.windows(2).all(|w| {
            (w[0].created_at, w[0].id) < (w[1].created_at, w[1].id)
        }));
    }

    #[test]
    fn test_empty_history_is_not_found() {
        let (store, _dir) = store();
        let convo = store.create_conversation("u1").unwrap();

        assert!(matches!(store.get_history(convo.id), Err(MemchatError::NotFound(_))));
        assert!(matches!(store.get_history(999_999), Err(MemchatError::NotFound(_))));
        assert!(store.recent_messages(convo.id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_recent_messages_limit() {
        let (store, _dir) = store();
        let convo = store.create_conversation("u1").unwrap();
        for i in 0..4 {
            store
                .persist_message(&write(convo.id, Role::User, &format!("m{}", i), None))
                .unwrap();
        }

        let recent = store.recent_messages(convo.id, 2).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
        assert!(store.recent_messages(convo.id, 0).unwrap().is_empty());
    }

    #[test]
    fn test_redelivered_job_is_not_duplicated() {
        let (store, _dir) = store();
        let convo = store.create_conversation("u1").unwrap();

        let first = store
            .persist_message(&write(convo.id, Role::User, "hello", Some(42)))
            .unwrap();
        let again = store
            .persist_message(&write(convo.id, Role::User, "hello", Some(42)))
            .unwrap();

        let PersistOutcome::Inserted { message_id, .. } = first else {
            panic!("expected insert, got {:?}", first);
        };
        assert_eq!(again, PersistOutcome::Duplicate { message_id });
        assert_eq!(store.get_history(convo.id).unwrap().len(), 1);
        assert_eq!(store.stats().unwrap().applied_jobs, 1);
    }

    #[test]
    fn test_missing_conversation_rolls_back() {
        let (store, _dir) = store();

        let err = store
            .persist_message(&write(12345, Role::User, "orphan", Some(7)))
            .unwrap_err();
        assert!(matches!(err, MemchatError::NotFound(_)));

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.applied_jobs, 0);
    }

    #[test]
    fn test_list_orders_by_recency_and_filters_user() {
        let (store, _dir) = store();
        let older = store.create_conversation("u1").unwrap();
        let newer = store.create_conversation("u1").unwrap();
        let foreign = store.create_conversation("u2").unwrap();

        // A new message bumps the older conversation to the top
        store
            .persist_message(&write(older.id, Role::Assistant, "bump", None))
            .unwrap();

        let ids: Vec<_> = store
            .list_conversations(Some("u1"))
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![older.id, newer.id]);

        let all = store.list_conversations(None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|c| c.id == foreign.id));
    }

    #[test]
    fn test_delete_conversation_cascades() {
        let (store, _dir) = store();
        let convo = store.create_conversation("u1").unwrap();
        let kept = store.create_conversation("u1").unwrap();
        store.persist_message(&write(convo.id, Role::User, "a", None)).unwrap();
        store.persist_message(&write(kept.id, Role::User, "b", None)).unwrap();

        assert!(store.delete_conversation(convo.id).unwrap());
        assert!(!store.delete_conversation(convo.id).unwrap());

        assert!(store.get_conversation(convo.id).unwrap().is_none());
        assert_eq!(store.stats().unwrap().total_messages, 1);
        assert_eq!(store.get_history(kept.id).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.redb");
        let id = {
            let store = HistoryStore::open(Some(&path)).unwrap();
            let convo = store.create_conversation("u1").unwrap();
            store.persist_message(&write(convo.id, Role::User, "persist me", None)).unwrap();
            convo.id
        };

        let store = HistoryStore::open(Some(&path)).unwrap();
        assert_eq!(store.get_history(id).unwrap()[0].content, "persist me");
        assert!(store.create_conversation("u1").unwrap().id > id);
    }
}
