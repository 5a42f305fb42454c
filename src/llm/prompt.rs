//! Chat message types and request assembly.
//!
//! Every request is `[system instruction] + last N history messages`.  The
//! instruction is fixed per client (replaceable with
//! [`LanguageModelClient::set_system_prompt`](crate::llm::LanguageModelClient::set_system_prompt));
//! history is owned by [`ConversationHistory`].

use serde::{Deserialize, Serialize};

use crate::llm::history::ConversationHistory;

// ---------------------------------------------------------------------------
// System instruction
// ---------------------------------------------------------------------------

/// Conversational food-ordering assistant, tuned for spoken replies.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a friendly and efficient voice assistant helping customers place food orders.

Your responsibilities:
- Greet customers warmly and professionally
- Help them browse the menu and make selections
- Clarify any questions about food items, ingredients, or preparation
- Confirm order details including quantities, special requests, and delivery information
- Keep responses concise and conversational (1-2 sentences max)
- Speak naturally as if having a real conversation

Important guidelines:
- Ask one question at a time
- Confirm important details before proceeding
- Handle interruptions gracefully
- Never use markdown, lists or emoji: everything you write is spoken aloud

Current menu context will be provided for each conversation.";

// ---------------------------------------------------------------------------
// Role / ChatMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in OpenAI chat format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters and messages for one streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

/// `system` followed by the last `window` history messages.
pub fn build_messages(
    system_prompt: &str,
    history: &ConversationHistory,
    window: usize,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(window + 1);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(history.recent(window).iter().cloned());
    messages
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
