//! ============================================================================
//! Chat Module - Memory-augmented streaming chat turns
//! ============================================================================
//! A turn is: resolve the conversation, hand the user message to the
//! dispatcher, recall relevant memories, build the prompt, then relay the
//! model's token stream to the caller while accumulating the answer. When the
//! stream ends (or the caller goes away) the answer goes back to the
//! dispatcher.
//! ============================================================================

mod groq;
mod prompt;
mod service;

pub use groq::{parse_sse_line, GroqClient, GROQ_API_URL};
pub use prompt::{build_messages, MEMORY_CONTEXT_HEADER, SYSTEM_PROMPT};
pub use service::{ChatService, ChatSettings, ChatTurn, TurnRequest, APOLOGY};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One entry of an OpenAI-style `messages` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Incremental answer fragments; an `Err` item ends the answer
pub type TokenStream = BoxStream<'static, Result<String>>;

/// A streaming chat-completion provider
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model(&self) -> &str;

    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream>;
}
