//! Streaming language-model client.
//!
//! This module provides:
//! * [`LanguageModelClient`]: conversation history, streamed generation,
//!   sentence-level chunking and cancellation.
//! * [`CompletionBackend`]: async trait implemented by token sources.
//! * [`ChatCompletionsBackend`]: OpenAI-compatible SSE backend (Groq by
//!   default).
//! * [`ScriptedBackend`]: canned replies for tests and offline runs.
//! * [`SentenceChunker`]: splits a token stream at sentence boundaries.
//! * [`LlmError`]: error variants for LLM operations.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_streaming::config::AppConfig;
//! use voice_streaming::llm::{ChatCompletionsBackend, LanguageModelClient, LlmEventKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let backend = ChatCompletionsBackend::from_config(&config.llm);
//!     let (llm, mut events) = LanguageModelClient::new(config.llm.clone(), Arc::new(backend));
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             if let LlmEventKind::Sentence(s) = event.kind {
//!                 println!("{s}");
//!             }
//!         }
//!     });
//!
//!     let _ = llm.generate_response("What's on the menu?", 1).await;
//! }
//! ```

pub mod backend;
pub mod client;
pub mod history;
pub mod prompt;
pub mod sentence;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use backend::{ChatCompletionsBackend, CompletionBackend, Script, ScriptedBackend, TokenStream};
pub use client::LanguageModelClient;
pub use history::ConversationHistory;
pub use prompt::{ChatMessage, ChatRequest, Role, DEFAULT_SYSTEM_PROMPT};
pub use sentence::{is_sentence_boundary, SentenceChunker};

// ---------------------------------------------------------------------------
// LlmError
// ---------------------------------------------------------------------------

/// Errors that can occur during generation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// The turn was cancelled or superseded.  Expected; not a failure.
    #[error("generation cancelled")]
    Cancelled,

    /// The service rejected the request.
    #[error("generation failed ({}): {message}", status_label(.status))]
    Generation { status: Option<u16>, message: String },

    /// HTTP transport or connection error.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// The connection did not open within the configured timeout.
    #[error("LLM request timed out")]
    Timeout,

    /// A response body could not be parsed as expected JSON.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),
}

fn status_label(status: &Option<u16>) -> String {
    status.map_or_else(|| "no status".to_string(), |s| s.to_string())
}

impl LlmError {
    /// Credential rejections end the session; everything else abandons
    /// only the current turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LlmError::Generation {
                status: Some(401 | 403),
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::Parse(e.to_string())
        } else {
            LlmError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// LlmEvent / LlmStatus
// ---------------------------------------------------------------------------

/// An event of generation turn `turn`.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmEvent {
    pub turn: u64,
    pub kind: LlmEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmEventKind {
    Token(String),
    /// A completed, trimmed sentence.
    Sentence(String),
    /// Full reply text at end of stream.
    Complete(String),
    Cancelled,
    Error(LlmError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmStatus {
    pub model: String,
    pub conversation_length: usize,
    pub is_generating: bool,
}
