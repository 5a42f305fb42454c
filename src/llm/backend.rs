//! Token-stream backends.
//!
//! [`CompletionBackend`] is the seam between the LLM client and the
//! network.  [`ChatCompletionsBackend`] calls any OpenAI-compatible
//! `/chat/completions` endpoint with `stream: true` and decodes the
//! server-sent events; [`ScriptedBackend`] replays canned token lists.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::config::LlmConfig;
use crate::llm::prompt::ChatRequest;
use crate::llm::LlmError;

/// Incremental content deltas, in generation order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Async trait for streamed chat completion.
///
/// Implementors must be `Send + Sync` so they can be shared across tasks
/// (e.g. wrapped in `Arc<dyn CompletionBackend>`).
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Start a completion.  Errors before the first token (HTTP status,
    /// transport) are returned here; later ones arrive in the stream.
    async fn stream(&self, request: ChatRequest) -> Result<TokenStream, LlmError>;

    /// Cheap reachability / credential probe.
    async fn is_available(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    Token(String),
    Done,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Line-oriented SSE decoder.
///
/// Bytes are buffered until a full line is available, so lines (and
/// multi-byte characters) split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(chunk);
        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(item) = Self::decode_line(line.trim()) {
                items.push(item);
            }
        }
        items
    }

    /// Decode whatever is left when the body ends without a newline.
    pub fn finish(&mut self) -> Option<SseItem> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        Self::decode_line(line.trim())
    }

    fn decode_line(line: &str) -> Option<SseItem> {
        // Blank separators and `:` comments carry nothing.
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            return Some(SseItem::Done);
        }
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => {
                let choice = chunk.choices.into_iter().next()?;
                if let Some(reason) = &choice.finish_reason {
                    log::debug!("llm: finish reason: {reason}");
                }
                choice
                    .delta
                    .and_then(|d| d.content)
                    .filter(|c| !c.is_empty())
                    .map(SseItem::Token)
            }
            Err(e) => {
                log::warn!("llm: skipping unparseable chunk: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChatCompletionsBackend
// ---------------------------------------------------------------------------

/// Streams from an OpenAI-compatible `/chat/completions` endpoint (Groq by
/// default).
///
/// # No hardcoded URLs
/// All connection details (`base_url`, `api_key`) come exclusively from the
/// [`LlmConfig`] passed to [`ChatCompletionsBackend::from_config`].
pub struct ChatCompletionsBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatCompletionsBackend {
    /// Build a backend from application config.
    ///
    /// Only the connect phase is bounded by a timeout: a response stream
    /// may legitimately run for a long time.
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

/// Pull `error.message` out of an upstream error body.
pub fn upstream_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

struct SseState {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

#[async_trait]
impl CompletionBackend for ChatCompletionsBackend {
    async fn stream(&self, request: ChatRequest) -> Result<TokenStream, LlmError> {
        let body = serde_json::json!({
            "model":       request.model,
            "messages":    request.messages,
            "temperature": request.temperature,
            "max_tokens":  request.max_tokens,
            "top_p":       request.top_p,
            "stream":      true,
        });

        let response = self
            .authorize(self.client.post(self.url("chat/completions")).json(&body))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = upstream_error_message(&text).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request rejected")
                    .to_string()
            });
            return Err(LlmError::Generation {
                status: Some(status.as_u16()),
                message,
            });
        }

        let state = SseState {
            body: Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec()))),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let tokens = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(token) = st.pending.pop_front() {
                    return Some((Ok(token), st));
                }
                if st.done {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => {
                        for item in st.decoder.push(&chunk) {
                            match item {
                                SseItem::Token(t) => st.pending.push_back(t),
                                SseItem::Done => st.done = true,
                            }
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(LlmError::from(e)), st));
                    }
                    None => {
                        if let Some(SseItem::Token(t)) = st.decoder.finish() {
                            st.pending.push_back(t);
                        }
                        st.done = true;
                    }
                }
            }
        });

        Ok(Box::pin(tokens))
    }

    async fn is_available(&self) -> bool {
        match self.authorize(self.client.get(self.url("models"))).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::warn!("llm: connection test failed: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// A canned reply for [`ScriptedBackend`].
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub tokens: Vec<String>,
    /// Pause before each token.
    pub delay: Duration,
    /// Returned from `stream` instead of any tokens.
    pub reject: Option<LlmError>,
    /// Yielded after all tokens.
    pub fail_after: Option<LlmError>,
}

impl Script {
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejected(err: LlmError) -> Self {
        Self {
            reject: Some(err),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ScriptedShared {
    scripts: VecDeque<Script>,
    requests: Vec<ChatRequest>,
}

/// Replays queued [`Script`]s in order and records every request.
/// With the queue empty, replies with a single fixed sentence.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    shared: Arc<Mutex<ScriptedShared>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) -> &Self {
        self.shared.lock().unwrap().scripts.push_back(script);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.shared.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream(&self, request: ChatRequest) -> Result<TokenStream, LlmError> {
        let script = {
            let mut shared = self.shared.lock().unwrap();
            shared.requests.push(request);
            shared
                .scripts
                .pop_front()
                .unwrap_or_else(|| Script::tokens(["Sorry, could you say that again?"]))
        };
        if let Some(err) = script.reject {
            return Err(err);
        }

        let delay = script.delay;
        let tail = script.fail_after.map(Err);
        let tokens = futures::stream::iter(script.tokens.into_iter().map(Ok))
            .chain(futures::stream::iter(tail))
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            });
        Ok(Box::pin(tokens))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- SseDecoder --------------------------------------------------------

    fn data(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    #[test]
    fn decodes_tokens_and_done() {
        let mut dec = SseDecoder::new();
        let mut payload = data("Hello");
        payload.push_str(&data(" there"));
        payload.push_str("data: [DONE]\n\n");
        assert_eq!(
            dec.push(payload.as_bytes()),
            vec![
                SseItem::Token("Hello".into()),
                SseItem::Token(" there".into()),
                SseItem::Done
            ]
        );
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut dec = SseDecoder::new();
        let payload = data("jollof");
        let (a, b) = payload.as_bytes().split_at(10);
        assert!(dec.push(a).is_empty());
        assert_eq!(dec.push(b), vec![SseItem::Token("jollof".into())]);
    }

    #[test]
    fn multibyte_split_inside_character() {
        let mut dec = SseDecoder::new();
        let payload = data("naïra");
        let bytes = payload.as_bytes();
        let split = payload.find('ï').unwrap() + 1;
        assert!(dec.push(&bytes[..split]).is_empty());
        assert_eq!(dec.push(&bytes[split..]), vec![SseItem::Token("naïra".into())]);
    }

    #[test]
    fn comments_role_deltas_and_garbage_are_skipped() {
        let mut dec = SseDecoder::new();
        let payload = concat!(
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
            "data: {not json}\n",
            "event: ping\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
        );
        assert!(dec.push(payload.as_bytes()).is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut dec = SseDecoder::new();
        let payload = data("end");
        let unterminated = payload.trim_end();
        assert!(dec.push(unterminated.as_bytes()).is_empty());
        assert_eq!(dec.finish(), Some(SseItem::Token("end".into())));
    }

    #[test]
    fn upstream_error_body() {
        let body = r#"{"error":{"message":"Invalid API Key","type":"invalid_request_error"}}"#;
        assert_eq!(upstream_error_message(body).as_deref(), Some("Invalid API Key"));
        assert_eq!(upstream_error_message("<html>"), None);
    }

    // ---- ChatCompletionsBackend ---------------------------------------------

    #[test]
    fn url_joins_without_double_slash() {
        let cfg = LlmConfig {
            base_url: "https://api.groq.com/openai/v1/".into(),
            ..LlmConfig::default()
        };
        let backend = ChatCompletionsBackend::from_config(&cfg);
        assert_eq!(
            backend.url("chat/completions"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn backend_is_object_safe() {
        let backend: Box<dyn CompletionBackend> =
            Box::new(ChatCompletionsBackend::from_config(&LlmConfig::default()));
        drop(backend);
    }

    // ---- ScriptedBackend ---------------------------------------------------

    #[tokio::test]
    async fn scripted_backend_replays_in_order() {
        let backend = ScriptedBackend::new();
        backend.push(Script::tokens(["a", "b"]));
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: 16,
            top_p: 1.0,
        };
        let tokens: Vec<String> = backend
            .stream(req)
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["a", "b"]);
        assert_eq!(backend.requests().len(), 1);
    }
}
