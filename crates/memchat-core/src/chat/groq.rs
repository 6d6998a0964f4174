//! ============================================================================
//! Groq Client - Streaming chat completions
//! ============================================================================
//! OpenAI-compatible `/chat/completions` with `stream: true`. The response is
//! an SSE body of `data: {chunk}` lines terminated by `data: [DONE]`; each
//! chunk's `choices[0].delta.content` is forwarded as one token.
//! ============================================================================

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{ChatMessage, ChatModel, TokenStream};
use crate::error::{MemchatError, Result};

/// API endpoint for Groq chat completions
pub const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 2048;
const TOP_P: f32 = 1.0;

pub struct GroqClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl GroqClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_url(api_key, model, GROQ_API_URL.to_string())
    }

    /// Point at any OpenAI-compatible endpoint
    pub fn with_url(api_key: String, model: String, url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            url,
        }
    }
}

#[async_trait]
impl ChatModel for GroqClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        debug!("Calling {} with {} messages", self.model, messages.len());

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            top_p: TOP_P,
            stream: true,
        };

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MemchatError::Generation(format!("Failed to call chat API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MemchatError::Generation(format!(
                "Chat API error {}: {}",
                status, body
            )));
        }

        info!("Streaming response from {}", self.model);

        let (tx, rx) = mpsc::channel(64);
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(MemchatError::Generation(format!(
                                "Stream interrupted: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };
                lines.extend(&bytes);

                loop {
                    let line = match lines.next_line() {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    let Some(data) = parse_sse_line(&line) else {
                        continue;
                    };
                    match parse_chunk(data) {
                        Ok(Some(token)) => {
                            if tx.send(Ok(token)).await.is_err() {
                                debug!("Token receiver dropped; abandoning stream");
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Accumulates raw body bytes and yields complete lines.
///
/// Network chunks may split a multi-byte character, so decoding waits for
/// the terminating newline.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        let Some(newline) = self.pending.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let raw: Vec<u8> = self.pending.drain(..=newline).collect();
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| MemchatError::Generation(format!("Invalid UTF-8 in stream: {}", e)))
    }
}

/// Payload of a `data: ` line, or `None` for blanks, comments and `[DONE]`
pub fn parse_sse_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim_start();
        if data == "[DONE]" {
            return None;
        }
        return Some(data);
    }

    None
}

fn parse_chunk(data: &str) -> Result<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| {
        warn!("Unparseable stream chunk: {}", data);
        MemchatError::Generation(format!("Bad stream chunk: {}", e))
    })?;

    if let Some(error) = chunk.error {
        return Err(MemchatError::Generation(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty()))
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(parse_sse_line("data: {\"a\":1}\n"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_line("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_line("data: [DONE]"), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("   "), None);
    }

    #[test]
    fn test_parse_chunk() {
        let token = parse_chunk(r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(token.as_deref(), Some("Hel"));

        // Role-only first chunk and usage-only final chunk carry no text
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_chunk(r#"{"choices":[],"x_groq":{"usage":{}}}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_chunk_errors() {
        assert!(matches!(
            parse_chunk(r#"{"error":{"message":"rate limited"}}"#),
            Err(MemchatError::Generation(m)) if m == "rate limited"
        ));
        assert!(parse_chunk("not json").is_err());
    }

    #[test]
    fn test_line_buffer_joins_split_characters() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut lines = LineBuffer::default();
        lines.extend(&line[..split]);
        assert!(lines.next_line().unwrap().is_none());
        lines.extend(&line[split..]);

        let line = lines.next_line().unwrap().unwrap();
        let token = parse_chunk(parse_sse_line(&line).unwrap()).unwrap();
        assert_eq!(token.as_deref(), Some("café"));
        assert!(lines.next_line().unwrap().is_none());
    }

    #[test]
    fn test_line_buffer_multiple_lines_and_invalid_bytes() {
        let mut lines = LineBuffer::default();
        lines.extend(b"data: a\n\ndata: b");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("data: a\n"));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("\n"));
        assert!(lines.next_line().unwrap().is_none());

        let mut lines = LineBuffer::default();
        lines.extend(&[0xFF, 0xFE, b'\n']);
        assert!(matches!(lines.next_line(), Err(MemchatError::Generation(_))));
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "llama-3.1-8b-instant".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            top_p: TOP_P,
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 2048);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[tokio::test]
    #[ignore] // Requires GROQ_API_KEY
    async fn test_live_stream() {
        let key = std::env::var("GROQ_API_KEY").unwrap();
        let client = GroqClient::new(key, "llama-3.1-8b-instant".to_string());
        let mut stream = client.stream(vec![ChatMessage::user("Say hi")]).await.unwrap();
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token.unwrap());
        }
        assert!(!text.is_empty());
    }
}
