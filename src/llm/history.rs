//! Session conversation history.
//!
//! [`ConversationHistory`] keeps every message of the session in order;
//! requests only ever see the most recent window of it (see
//! [`build_messages`](crate::llm::prompt::build_messages)).  It is cleared
//! explicitly, never by age.

use crate::llm::prompt::{ChatMessage, Role};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Inject background facts (menu, order state) as a `system` message.
    pub fn push_context(&mut self, context: &str) {
        self.messages
            .push(ChatMessage::system(format!("Context: {context}")));
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn all(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_role(&self) -> Option<Role> {
        self.messages.last().map(|m| m.role)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let history = ConversationHistory::new();
        assert!(history.is_empty());
        assert!(history.recent(10).is_empty());
        assert_eq!(history.last_role(), None);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let mut history = ConversationHistory::new();
        for i in 0..6 {
            history.push(ChatMessage::user(format!("turn {i}")));
        }
        let tail: Vec<&str> = history.recent(3).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, vec!["turn 3", "turn 4", "turn 5"]);
        // Older messages are kept, only the request window is bounded.
        assert_eq!(history.len(), 6);
    }

    #[test]
    fn window_larger_than_history() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::user("only"));
        assert_eq!(history.recent(10).len(), 1);
    }

    #[test]
    fn context_is_a_system_message() {
        let mut history = ConversationHistory::new();
        history.push_context("jollof rice is 2500 naira");
        assert_eq!(history.last_role(), Some(Role::System));
        assert_eq!(history.all()[0].content, "Context: jollof rice is 2500 naira");
    }

    #[test]
    fn clear_empties() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::assistant("hello"));
        history.clear();
        assert!(history.is_empty());
    }
}
