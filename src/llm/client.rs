//! [`LanguageModelClient`]: streamed generation with sentence chunking.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::llm::backend::CompletionBackend;
use crate::llm::history::ConversationHistory;
use crate::llm::prompt::{build_messages, ChatMessage, ChatRequest, DEFAULT_SYSTEM_PROMPT};
use crate::llm::sentence::SentenceChunker;
use crate::llm::{LlmError, LlmEvent, LlmEventKind, LlmStatus};

struct State {
    config: LlmConfig,
    system_prompt: String,
    history: ConversationHistory,
    /// The live generation turn, if any.
    current: Option<(u64, CancellationToken)>,
}

/// A registered turn that has not started streaming yet.
struct PendingTurn {
    turn: u64,
    token: CancellationToken,
    request: ChatRequest,
    min_chars: usize,
}

struct Inner {
    backend: Arc<dyn CompletionBackend>,
    events: mpsc::UnboundedSender<LlmEvent>,
    state: Mutex<State>,
}

/// Conversation-aware streaming client.
///
/// Cheap to clone; clones share history and the live turn.  Events are
/// emitted while holding the state lock and only after checking the turn's
/// cancellation token, so once [`cancel`](Self::cancel) returns no further
/// `Token`, `Sentence` or `Complete` event of that turn can be observed.
#[derive(Clone)]
pub struct LanguageModelClient {
    inner: Arc<Inner>,
}

impl LanguageModelClient {
    pub fn new(
        config: LlmConfig,
        backend: Arc<dyn CompletionBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<LlmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let client = Self {
            inner: Arc::new(Inner {
                backend,
                events: tx,
                state: Mutex::new(State {
                    config,
                    system_prompt,
                    history: ConversationHistory::new(),
                    current: None,
                }),
            }),
        };
        (client, rx)
    }

    /// Generate a reply to `user_text` as turn `turn`.
    ///
    /// Appends the user message to history, supersedes any live turn, then
    /// streams tokens.  Each completed sentence is emitted as soon as it is
    /// found; the trimmed remainder follows at end of stream.  On success
    /// the full reply is appended to history and returned.
    pub async fn generate_response(&self, user_text: &str, turn: u64) -> Result<String, LlmError> {
        let pending = self.begin_turn(user_text, turn);
        self.run_turn(pending).await
    }

    /// Like [`generate_response`](Self::generate_response), but streams on a
    /// new task.  The turn is registered before this returns, so a
    /// [`cancel`](Self::cancel) issued right after already applies to it.
    pub fn spawn_response(&self, user_text: &str, turn: u64) -> JoinHandle<Result<String, LlmError>> {
        let pending = self.begin_turn(user_text, turn);
        let client = self.clone();
        tokio::spawn(async move { client.run_turn(pending).await })
    }

    fn begin_turn(&self, user_text: &str, turn: u64) -> PendingTurn {
        let token = CancellationToken::new();
        let (request, min_chars) = {
            let mut st = self.inner.state.lock().unwrap();
            if let Some((prev, prev_token)) = st.current.take() {
                log::info!("llm: turn {turn} supersedes turn {prev}");
                prev_token.cancel();
                self.emit(prev, LlmEventKind::Cancelled);
            }
            st.history.push(ChatMessage::user(user_text));
            st.current = Some((turn, token.clone()));
            let request = ChatRequest {
                model: st.config.model.clone(),
                messages: build_messages(&st.system_prompt, &st.history, st.config.history_window),
                temperature: st.config.temperature,
                max_tokens: st.config.max_tokens,
                top_p: st.config.top_p,
            };
            (request, st.config.min_sentence_chars)
        };
        PendingTurn {
            turn,
            token,
            request,
            min_chars,
        }
    }

    async fn run_turn(&self, pending: PendingTurn) -> Result<String, LlmError> {
        let PendingTurn {
            turn,
            token,
            request,
            min_chars,
        } = pending;

        log::debug!(
            "llm: turn {turn}: {} messages to {}",
            request.messages.len(),
            request.model
        );

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(LlmError::Cancelled),
            opened = self.inner.backend.stream(request) => opened,
        };
        let mut tokens = match opened {
            Ok(tokens) => tokens,
            Err(e) => return Err(self.fail(turn, &token, e)),
        };

        let mut chunker = SentenceChunker::new(min_chars);
        let mut full = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(LlmError::Cancelled),
                next = tokens.next() => next,
            };
            match next {
                Some(Ok(piece)) => {
                    full.push_str(&piece);
                    let sentences = chunker.push(&piece);
                    let _st = self.inner.state.lock().unwrap();
                    if token.is_cancelled() {
                        return Err(LlmError::Cancelled);
                    }
                    self.emit(turn, LlmEventKind::Token(piece));
                    for sentence in sentences {
                        self.emit_sentence(turn, &sentence);
                    }
                }
                Some(Err(e)) => return Err(self.fail(turn, &token, e)),
                None => break,
            }
        }

        let mut st = self.inner.state.lock().unwrap();
        if token.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        if let Some(rest) = chunker.finish() {
            self.emit_sentence(turn, &rest);
        }
        let reply = full.trim().to_string();
        if reply.is_empty() {
            log::warn!("llm: turn {turn} produced no text");
        } else {
            st.history.push(ChatMessage::assistant(reply.clone()));
        }
        Self::release(&mut st, turn);
        self.emit(turn, LlmEventKind::Complete(reply.clone()));
        log::info!("llm: turn {turn} complete ({} chars)", reply.len());
        Ok(reply)
    }

    /// Cancel the live turn.  Returns its id, or `None` when idle.
    pub fn cancel(&self) -> Option<u64> {
        let mut st = self.inner.state.lock().unwrap();
        let (turn, token) = st.current.take()?;
        token.cancel();
        self.emit(turn, LlmEventKind::Cancelled);
        log::info!("llm: turn {turn} cancelled");
        Some(turn)
    }

    pub fn is_generating(&self) -> bool {
        self.inner.state.lock().unwrap().current.is_some()
    }

    pub fn clear_history(&self) {
        self.inner.state.lock().unwrap().history.clear();
        log::debug!("llm: history cleared");
    }

    /// Replace the system instruction for subsequent turns.
    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.inner.state.lock().unwrap().system_prompt = prompt.into();
    }

    pub fn add_context(&self, context: &str) {
        self.inner.state.lock().unwrap().history.push_context(context);
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().unwrap().history.all().to_vec()
    }

    pub fn status(&self) -> LlmStatus {
        let st = self.inner.state.lock().unwrap();
        LlmStatus {
            model: st.config.model.clone(),
            conversation_length: st.history.len(),
            is_generating: st.current.is_some(),
        }
    }

    pub fn config(&self) -> LlmConfig {
        self.inner.state.lock().unwrap().config.clone()
    }

    /// Applies from the next turn.  A configured system prompt replaces the
    /// current one.
    pub fn update_config(&self, config: LlmConfig) {
        let mut st = self.inner.state.lock().unwrap();
        if let Some(prompt) = &config.system_prompt {
            st.system_prompt = prompt.clone();
        }
        st.config = config;
    }

    pub async fn test_connection(&self) -> bool {
        self.inner.backend.is_available().await
    }

    // -----------------------------------------------------------------------

    fn emit(&self, turn: u64, kind: LlmEventKind) {
        let _ = self.inner.events.send(LlmEvent { turn, kind });
    }

    fn emit_sentence(&self, turn: u64, raw: &str) {
        let sentence = raw.trim();
        if !sentence.is_empty() {
            self.emit(turn, LlmEventKind::Sentence(sentence.to_string()));
        }
    }

    fn release(st: &mut State, turn: u64) {
        if matches!(st.current, Some((live, _)) if live == turn) {
            st.current = None;
        }
    }

    fn fail(&self, turn: u64, token: &CancellationToken, error: LlmError) -> LlmError {
        let mut st = self.inner.state.lock().unwrap();
        if token.is_cancelled() {
            return LlmError::Cancelled;
        }
        Self::release(&mut st, turn);
        log::error!("llm: turn {turn} failed: {error}");
        self.emit(turn, LlmEventKind::Error(error.clone()));
        error
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
