//! [`Orchestrator`]: wires VAD, STT, LLM and TTS into one conversation.
//!
//! Every subsystem reports on its own channel; the orchestrator drains
//! them one event at a time ([`Orchestrator::recv_incoming`] then
//! [`Orchestrator::handle`]), so handlers never overlap and session state
//! needs no locking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::audio::{AudioOutput, CpalMicrophone, Microphone, RodioOutput};
use crate::config::{AppConfig, VoiceProfile};
use crate::llm::{
    ChatCompletionsBackend, CompletionBackend, LanguageModelClient, LlmEvent, LlmEventKind,
    LlmStatus,
};
use crate::stt::{FinalTranscript, SpeechToTextClient, SttEvent, SttStatus};
use crate::transport::{Connector, ReconnectPolicy, TungsteniteConnector};
use crate::tts::{TextToSpeechClient, TtsEvent, TtsStatus};
use crate::vad::{VadEvent, VadStatus, VoiceActivityDetector};

use super::events::{ConversationEntry, ErrorReport, SessionEvent, Subsystem};
use super::metrics::{LatencyMetrics, MetricsSnapshot, TurnMetrics};
use super::state::SessionState;
use super::SessionError;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// The devices and services a session runs against.
#[derive(Clone)]
pub struct Platform {
    pub microphone: Arc<dyn Microphone>,
    pub connector: Arc<dyn Connector>,
    pub completions: Arc<dyn CompletionBackend>,
    pub output: Arc<dyn AudioOutput>,
}

impl Platform {
    /// Real microphone and speaker, real network services.
    pub fn native(config: &AppConfig) -> Self {
        Self {
            microphone: Arc::new(CpalMicrophone::new(config.audio.input_device.clone())),
            connector: Arc::new(TungsteniteConnector::new()),
            completions: Arc::new(ChatCompletionsBackend::from_config(&config.llm)),
            output: Arc::new(RodioOutput),
        }
    }
}

/// One event from any subsystem.
#[derive(Debug)]
pub enum Incoming {
    Vad(VadEvent),
    Stt(SttEvent),
    Llm(LlmEvent),
    Tts(TtsEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub voice: Option<VoiceProfile>,
    pub ai_speaking: bool,
    pub conversation_length: usize,
    pub vad: VadStatus,
    pub stt: SttStatus,
    pub llm: LlmStatus,
    pub tts: TtsStatus,
}

/// Bookkeeping for the generation turn whose events are still accepted.
struct LiveTurn {
    id: u64,
    transcript_at: Instant,
    dispatched_at: Instant,
    stt: Option<Duration>,
    tts: Option<Duration>,
    sent_first_sentence: bool,
}

/// Waiting for the first chunk of a turn's first synthesis request.
struct AwaitingAudio {
    turn: u64,
    request_id: u64,
    sent_at: Instant,
}

struct Receivers {
    vad: mpsc::UnboundedReceiver<VadEvent>,
    stt: mpsc::UnboundedReceiver<SttEvent>,
    llm: mpsc::UnboundedReceiver<LlmEvent>,
    tts: mpsc::UnboundedReceiver<TtsEvent>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: AppConfig,
    vad: VoiceActivityDetector,
    stt: SpeechToTextClient,
    llm: LanguageModelClient,
    tts: TextToSpeechClient,
    receivers: Receivers,
    events: mpsc::UnboundedSender<SessionEvent>,

    state: SessionState,
    voice: Option<VoiceProfile>,
    conversation: Vec<ConversationEntry>,
    metrics: LatencyMetrics,
    next_turn: u64,
    live_turn: Option<LiveTurn>,
    awaiting_audio: Option<AwaitingAudio>,
    /// Between `AiSpeechStart` and `AiSpeechEnd` (or a barge-in).
    ai_speaking: bool,
    last_speech_end: Option<Instant>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, platform: Platform) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let policy = ReconnectPolicy::from_config(&config.reconnect);
        let (vad, vad_rx) = VoiceActivityDetector::new(config.vad.clone(), platform.microphone.clone());
        let (stt, stt_rx) = SpeechToTextClient::new(
            config.stt.clone(),
            policy,
            platform.connector.clone(),
            platform.microphone,
        );
        let (llm, llm_rx) = LanguageModelClient::new(config.llm.clone(), platform.completions);
        let (tts, tts_rx) = TextToSpeechClient::new(
            config.tts.clone(),
            config.interruption.clone(),
            policy,
            platform.connector,
            platform.output,
        );
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                vad,
                stt,
                llm,
                tts,
                receivers: Receivers {
                    vad: vad_rx,
                    stt: stt_rx,
                    llm: llm_rx,
                    tts: tts_rx,
                },
                events,
                state: SessionState::Idle,
                voice: None,
                conversation: Vec::new(),
                metrics: LatencyMetrics::default(),
                next_turn: 0,
                live_turn: None,
                awaiting_audio: None,
                ai_speaking: false,
                last_speech_end: None,
            },
            rx,
        )
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::debug!("orchestrator: {} -> {}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn lookup_voice(&self, name: &str) -> Result<VoiceProfile, SessionError> {
        self.config
            .voice(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownVoice(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Validate `voice_name` and bring up the microphone, STT and TTS
    /// concurrently.  Any failure releases what did come up and is returned.
    pub async fn initialize(&mut self, voice_name: &str) -> Result<(), SessionError> {
        let voice = self.lookup_voice(voice_name)?;
        if !matches!(self.state, SessionState::Idle | SessionState::Stopped) {
            return Err(SessionError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }

        log::info!("orchestrator: initializing with voice {}", voice.label);
        self.set_state(SessionState::Initializing);
        let began = Instant::now();

        let (vad, stt, tts) = tokio::join!(
            self.vad.initialize(),
            self.stt.connect(),
            self.tts.connect(&voice.id)
        );
        let outcome: Result<(), SessionError> = match (vad, stt, tts) {
            (Err(e), _, _) => Err(e.into()),
            (_, Err(e), _) => Err(e.into()),
            (_, _, Err(e)) => Err(e.into()),
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            log::error!("orchestrator: initialization failed: {e}");
            self.release_all().await;
            self.set_state(SessionState::Idle);
            self.emit(SessionEvent::Error(ErrorReport {
                subsystem: e.subsystem(),
                message: e.to_string(),
                terminal: true,
            }));
            return Err(e);
        }

        let init_ms = began.elapsed().as_millis() as u64;
        log::info!("orchestrator: ready in {init_ms} ms");
        self.voice = Some(voice.clone());
        self.set_state(SessionState::Ready);
        self.emit(SessionEvent::Initialized { voice, init_ms });
        Ok(())
    }

    /// Begin listening.  Reconnects anything a terminal error took down.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Listening | SessionState::Speaking => {
                log::warn!("orchestrator: already started");
                return Ok(());
            }
            SessionState::Ready | SessionState::Stopped => {}
            state => {
                return Err(SessionError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        self.ensure_connected().await?;
        self.vad.start()?;
        if let Err(e) = self.stt.start_streaming().await {
            self.vad.stop().await;
            return Err(e.into());
        }

        log::info!("orchestrator: listening");
        self.set_state(SessionState::Listening);
        self.emit(SessionEvent::Started);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<(), SessionError> {
        self.vad.initialize().await?;
        if !self.stt.state().is_open() {
            self.stt.connect().await?;
        }
        if !self.tts.is_connected() {
            if let Some(voice) = self.voice.clone() {
                self.tts.connect(&voice.id).await?;
            }
        }
        Ok(())
    }

    /// Halt capture and cancel generation and playback.  Connections stay
    /// open for the next [`start`](Self::start).
    pub async fn stop(&mut self) {
        if !self.state.is_active() {
            log::debug!("orchestrator: stop ignored in state {}", self.state);
            return;
        }
        self.halt().await;
        log::info!("orchestrator: stopped");
        self.set_state(SessionState::Stopped);
        self.emit(SessionEvent::Stopped);
    }

    async fn halt(&mut self) {
        self.vad.stop().await;
        self.stt.stop_streaming().await;
        self.llm.cancel();
        self.tts.interrupt();
        self.live_turn = None;
        self.awaiting_audio = None;
        if std::mem::take(&mut self.ai_speaking) {
            self.emit(SessionEvent::AiSpeechEnd);
        }
        self.last_speech_end = None;
    }

    async fn release_all(&mut self) {
        self.vad.cleanup().await;
        self.stt.disconnect().await;
        self.tts.disconnect().await;
    }

    /// Disconnect and release every subsystem and forget the conversation.
    pub async fn cleanup(&mut self) {
        if self.state.is_active() {
            self.halt().await;
        }
        self.release_all().await;
        self.llm.clear_history();
        self.conversation.clear();
        self.metrics.clear();
        self.voice = None;
        log::info!("orchestrator: cleaned up");
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::CleanedUp);
    }

    /// Reconnect the synthesis session with another voice.
    pub async fn change_voice(&mut self, voice_name: &str) -> Result<(), SessionError> {
        let voice = self.lookup_voice(voice_name)?;
        if !self.state.is_initialized() {
            return Err(SessionError::InvalidState {
                operation: "change_voice",
                state: self.state,
            });
        }
        log::info!("orchestrator: switching voice to {}", voice.label);
        self.tts.disconnect().await;
        self.tts.connect(&voice.id).await?;
        self.voice = Some(voice.clone());
        self.emit(SessionEvent::VoiceChanged(voice));
        Ok(())
    }

    /// Inject background knowledge into the model's conversation.
    pub fn add_context(&self, context: &str) {
        self.llm.add_context(context);
    }

    pub fn conversation_history(&self) -> Vec<ConversationEntry> {
        self.conversation.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.conversation.len())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            voice: self.voice.clone(),
            ai_speaking: self.ai_speaking,
            conversation_length: self.conversation.len(),
            vad: self.vad.status(),
            stt: self.stt.status(),
            llm: self.llm.status(),
            tts: self.tts.status(),
        }
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Wait for the next subsystem event.  Cancel-safe; VAD is polled first
    /// so a barge-in is never queued behind pending sentences.
    pub async fn recv_incoming(&mut self) -> Incoming {
        let rx = &mut self.receivers;
        tokio::select! {
            biased;
            Some(ev) = rx.vad.recv() => Incoming::Vad(ev),
            Some(ev) = rx.stt.recv() => Incoming::Stt(ev),
            Some(ev) = rx.llm.recv() => Incoming::Llm(ev),
            Some(ev) = rx.tts.recv() => Incoming::Tts(ev),
            else => std::future::pending().await,
        }
    }

    pub async fn handle(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Vad(ev) => self.on_vad(ev).await,
            Incoming::Stt(ev) => self.on_stt(ev).await,
            Incoming::Llm(ev) => self.on_llm(ev).await,
            Incoming::Tts(ev) => self.on_tts(ev).await,
        }
    }

    async fn on_vad(&mut self, event: VadEvent) {
        match event {
            VadEvent::Volume(level) => self.emit(SessionEvent::Volume(level)),
            VadEvent::SpeechStart { .. } => {
                self.emit(SessionEvent::UserSpeechStart);
                if self.ai_speaking && self.config.interruption.enabled {
                    self.barge_in();
                }
            }
            VadEvent::SpeechEnd { at } => {
                self.last_speech_end = Some(at);
                self.emit(SessionEvent::UserSpeechEnd);
            }
            VadEvent::Error(e) => {
                if self.state.is_active() {
                    let terminal = e.is_terminal();
                    self.report(Subsystem::Vad, e.to_string(), terminal).await;
                } else {
                    log::debug!("orchestrator: vad error outside a session: {e}");
                }
            }
            other => log::debug!("orchestrator: vad {other:?}"),
        }
    }

    /// The user spoke over the assistant.
    fn barge_in(&mut self) {
        let cancelled = self.llm.cancel();
        self.tts.interrupt();
        self.live_turn = None;
        self.awaiting_audio = None;
        self.ai_speaking = false;
        match cancelled {
            Some(turn) => log::info!("orchestrator: barge-in, turn {turn} cancelled"),
            None => log::info!("orchestrator: barge-in during playback"),
        }
        self.emit(SessionEvent::Interrupted);
        if self.state.is_active() {
            self.set_state(SessionState::Listening);
        }
    }

    async fn on_stt(&mut self, event: SttEvent) {
        match event {
            SttEvent::Interim(t) => {
                if !t.text.trim().is_empty() {
                    self.emit(SessionEvent::InterimTranscript(t.text));
                }
            }
            SttEvent::Final(t) => self.on_final_transcript(t),
            SttEvent::Error { error, terminal } => {
                self.report(Subsystem::Stt, error.to_string(), terminal).await;
            }
            SttEvent::Reconnecting {
                attempt,
                max_attempts,
            } => log::warn!("orchestrator: stt reconnecting ({attempt}/{max_attempts})"),
            other => log::debug!("orchestrator: stt {other:?}"),
        }
    }

    fn on_final_transcript(&mut self, transcript: FinalTranscript) {
        let text = transcript.text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if !self.state.is_active() {
            log::debug!("orchestrator: transcript ignored in state {}", self.state);
            return;
        }

        let stt = self
            .last_speech_end
            .take()
            .map(|end| transcript.received_at.saturating_duration_since(end));
        self.conversation
            .push(ConversationEntry::user(text.clone(), transcript.confidence));
        self.emit(SessionEvent::UserMessage(text.clone()));

        self.next_turn += 1;
        let id = self.next_turn;
        log::info!("orchestrator: turn {id}: {text:?}");
        self.live_turn = Some(LiveTurn {
            id,
            transcript_at: transcript.received_at,
            dispatched_at: Instant::now(),
            stt,
            tts: None,
            sent_first_sentence: false,
        });
        // Not awaited: later utterances keep flowing while this streams.
        drop(self.llm.spawn_response(&text, id));
    }

    async fn on_llm(&mut self, event: LlmEvent) {
        let live = self.live_turn.as_ref().map(|t| t.id);
        if live != Some(event.turn) {
            log::debug!("orchestrator: dropping event of stale turn {}", event.turn);
            return;
        }

        match event.kind {
            LlmEventKind::Token(_) => {}
            LlmEventKind::Sentence(sentence) => self.relay_sentence(event.turn, sentence).await,
            LlmEventKind::Complete(reply) => self.complete_turn(reply),
            LlmEventKind::Cancelled => self.live_turn = None,
            LlmEventKind::Error(e) => {
                self.live_turn = None;
                let terminal = e.is_terminal();
                self.report(Subsystem::Llm, e.to_string(), terminal).await;
            }
        }
    }

    async fn relay_sentence(&mut self, turn: u64, sentence: String) {
        self.emit(SessionEvent::AiSentence(sentence.clone()));
        match self.tts.stream_text(&sentence) {
            Ok(request_id) => {
                if let Some(live) = self.live_turn.as_mut() {
                    if !live.sent_first_sentence {
                        live.sent_first_sentence = true;
                        self.awaiting_audio = Some(AwaitingAudio {
                            turn,
                            request_id,
                            sent_at: Instant::now(),
                        });
                    }
                }
            }
            Err(e) => {
                let terminal = e.is_terminal();
                self.report(Subsystem::Tts, e.to_string(), terminal).await;
            }
        }
    }

    fn complete_turn(&mut self, reply: String) {
        let Some(turn) = self.live_turn.take() else {
            return;
        };
        if !reply.is_empty() {
            self.conversation.push(ConversationEntry::assistant(reply.clone()));
        }
        self.emit(SessionEvent::AiMessageComplete(reply));

        let now = Instant::now();
        let total = now.saturating_duration_since(turn.transcript_at);
        let llm = now.saturating_duration_since(turn.dispatched_at);
        self.metrics.total.push(total);
        self.metrics.llm.push(llm);
        if let Some(stt) = turn.stt {
            self.metrics.stt.push(stt);
        }
        let averages = self.metrics();
        log::info!(
            "orchestrator: turn {} done in {} ms (avg {} ms)",
            turn.id,
            total.as_millis(),
            averages.average_total_ms
        );
        self.emit(SessionEvent::Metrics(TurnMetrics {
            turn: turn.id,
            stt: turn.stt,
            llm,
            tts: turn.tts,
            total,
            averages,
        }));
    }

    async fn on_tts(&mut self, event: TtsEvent) {
        match event {
            TtsEvent::AudioChunk {
                request_id, len, ..
            } => {
                self.note_first_audio(request_id);
                self.emit(SessionEvent::AiAudioChunk { len });
            }
            TtsEvent::PlaybackStarted => {
                self.ai_speaking = true;
                self.emit(SessionEvent::AiSpeechStart);
                if self.state.is_active() {
                    self.set_state(SessionState::Speaking);
                }
            }
            TtsEvent::PlaybackFinished => {
                if std::mem::take(&mut self.ai_speaking) {
                    self.emit(SessionEvent::AiSpeechEnd);
                }
                if self.state == SessionState::Speaking {
                    self.set_state(SessionState::Listening);
                }
            }
            TtsEvent::Interrupted => self.emit(SessionEvent::AiInterrupted),
            TtsEvent::Error { error, terminal } => {
                self.report(Subsystem::Tts, error.to_string(), terminal).await;
            }
            TtsEvent::Reconnecting {
                attempt,
                max_attempts,
            } => log::warn!("orchestrator: tts reconnecting ({attempt}/{max_attempts})"),
            other => log::debug!("orchestrator: tts {other:?}"),
        }
    }

    fn note_first_audio(&mut self, request_id: u64) {
        let Some(waiting) = self.awaiting_audio.as_ref() else {
            return;
        };
        if request_id < waiting.request_id {
            return;
        }
        let latency = waiting.sent_at.elapsed();
        let turn = waiting.turn;
        self.awaiting_audio = None;
        self.metrics.tts.push(latency);
        if let Some(live) = self.live_turn.as_mut().filter(|t| t.id == turn) {
            live.tts = Some(latency);
        }
        log::debug!(
            "orchestrator: first audio of turn {turn} after {} ms",
            latency.as_millis()
        );
    }

    /// Surface an error.  Terminal ones end the session; the rest return
    /// it to listening.
    async fn report(&mut self, subsystem: Subsystem, message: String, terminal: bool) {
        log::error!("orchestrator: {subsystem} error: {message}");
        self.emit(SessionEvent::Error(ErrorReport {
            subsystem,
            message,
            terminal,
        }));
        if !self.state.is_active() {
            return;
        }
        if terminal {
            self.halt().await;
            log::warn!("orchestrator: session stopped after terminal {subsystem} error");
            self.set_state(SessionState::Stopped);
            self.emit(SessionEvent::Stopped);
        } else if !self.ai_speaking {
            self.set_state(SessionState::Listening);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::json;

    use super::*;
    use crate::audio::{ChannelMicrophone, MicrophoneFeed, RecordingOutput};
    use crate::llm::{Script, ScriptedBackend};
    use crate::transport::{MemoryConnector, RemotePeer, TransportError};

    struct Harness {
        orchestrator: Orchestrator,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        connector: MemoryConnector,
        peers: mpsc::UnboundedReceiver<RemotePeer>,
        backend: ScriptedBackend,
        output: RecordingOutput,
        feed: MicrophoneFeed,
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.stt.api_key = Some("dg".into());
        config.tts.api_key = Some("mm".into());
        config.tts.group_id = Some("grp".into());
        config
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    fn harness_with(config: AppConfig) -> Harness {
        let (connector, peers) = MemoryConnector::new();
        let (mic, feed) = ChannelMicrophone::new(16_000, 1);
        let backend = ScriptedBackend::new();
        let output = RecordingOutput::new();
        let platform = Platform {
            microphone: Arc::new(mic),
            connector: Arc::new(connector.clone()),
            completions: Arc::new(backend.clone()),
            output: Arc::new(output.clone()),
        };
        let (orchestrator, events) = Orchestrator::new(config, platform);
        Harness {
            orchestrator,
            events,
            connector,
            peers,
            backend,
            output,
            feed,
        }
    }

    /// Accept the STT and TTS connections in whatever order they arrive,
    /// answering the TTS auth frame.
    async fn accept_both(peers: &mut mpsc::UnboundedReceiver<RemotePeer>) -> (RemotePeer, RemotePeer) {
        let mut stt = None;
        let mut tts = None;
        while stt.is_none() || tts.is_none() {
            let mut peer = peers.recv().await.unwrap();
            if peer.request.url.contains("voice_id=") {
                let auth = peer.recv_json().await.unwrap();
                assert_eq!(auth["type"], "auth");
                peer.send_json(json!({ "type": "auth_success", "session_id": "s-1" }));
                tts = Some(peer);
            } else {
                stt = Some(peer);
            }
        }
        (stt.unwrap(), tts.unwrap())
    }

    async fn ready(h: &mut Harness) -> (RemotePeer, RemotePeer) {
        let (result, peers) = tokio::join!(
            h.orchestrator.initialize("austyn"),
            accept_both(&mut h.peers)
        );
        result.unwrap();
        peers
    }

    /// Run the event loop until `pred` matches a session event.
    async fn pump_until<F>(h: &mut Harness, mut pred: F) -> Vec<SessionEvent>
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            while let Ok(ev) = h.events.try_recv() {
                let hit = pred(&ev);
                seen.push(ev);
                if hit {
                    return seen;
                }
            }
            tokio::select! {
                incoming = h.orchestrator.recv_incoming() => h.orchestrator.handle(incoming).await,
                _ = tokio::time::sleep_until(deadline) => panic!("timed out; saw {seen:?}"),
            }
        }
    }

    fn final_frame(text: &str) -> serde_json::Value {
        json!({
            "type": "Results",
            "is_final": true,
            "speech_final": true,
            "channel": { "alternatives": [{ "transcript": text, "confidence": 0.97 }] }
        })
    }

    fn audio(bytes: usize) -> serde_json::Value {
        json!({ "type": "audio_chunk", "audio": BASE64.encode(vec![7u8; bytes]) })
    }

    fn drain_ai(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::AiSentence(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    // ---- initialize ---

    #[tokio::test]
    async fn unknown_voice_is_rejected_before_connecting() {
        let mut h = harness();
        let err = h.orchestrator.initialize("hal").await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownVoice(ref v) if v == "hal"));
        assert_eq!(h.connector.attempts(), 0);
        assert_eq!(h.orchestrator.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn initialize_brings_everything_up() {
        let mut h = harness();
        let (_stt, tts) = ready(&mut h).await;
        assert!(tts.request.url.contains("voice_id=English_Trustworth_Man"));
        assert_eq!(h.orchestrator.state(), SessionState::Ready);

        let mut states = Vec::new();
        let mut initialized = false;
        while let Ok(ev) = h.events.try_recv() {
            match ev {
                SessionEvent::StateChanged(s) => states.push(s),
                SessionEvent::Initialized { voice, .. } => {
                    assert_eq!(voice.label, "Austyn");
                    initialized = true;
                }
                _ => {}
            }
        }
        assert!(initialized);
        assert_eq!(states, vec![SessionState::Initializing, SessionState::Ready]);
    }

    #[tokio::test]
    async fn failed_subsystem_aborts_initialization() {
        let mut h = harness();
        // The first dial fails; STT does not retry its initial connect and
        // TTS treats an auth rejection as final.
        h.connector.fail_next(TransportError::Auth("invalid key".into()));
        h.connector.fail_next(TransportError::Auth("invalid key".into()));
        let err = h.orchestrator.initialize("ada").await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(h.orchestrator.state(), SessionState::Idle);
        assert_eq!(h.output.open_handles(), 0);
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        let mut h = harness();
        assert!(matches!(
            h.orchestrator.start().await,
            Err(SessionError::InvalidState { operation: "start", .. })
        ));
    }

    // ---- turns ---

    #[tokio::test(start_paused = true)]
    async fn final_transcript_drives_a_turn() {
        let mut h = harness();
        h.backend
            .push(Script::tokens(["Sure thing. ", "Your order ", "is on its way."]));
        let (stt, mut tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();

        stt.send_json(final_frame("I want jollof rice"));
        let seen = pump_until(&mut h, |e| matches!(e, SessionEvent::Metrics(_))).await;

        assert!(seen.contains(&SessionEvent::UserMessage("I want jollof rice".into())));
        assert_eq!(
            drain_ai(&seen),
            vec!["Sure thing.".to_string(), "Your order is on its way.".to_string()]
        );
        let Some(SessionEvent::Metrics(m)) = seen.last() else {
            panic!("expected metrics last");
        };
        assert_eq!(m.turn, 1);
        assert_eq!(m.averages.conversation_length, 2);
        assert!(m.total >= m.llm);

        // Both sentences reached the synthesis service in order.
        let first = tts.recv_json().await.unwrap();
        let second = tts.recv_json().await.unwrap();
        assert_eq!(first["text"], "Sure thing.");
        assert_eq!(second["text"], "Your order is on its way.");

        let history = h.orchestrator.conversation_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text, "Sure thing. Your order is on its way.");
        assert_eq!(h.orchestrator.metrics().conversation_length, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_before_start_is_ignored() {
        let mut h = harness();
        let (stt, _tts) = ready(&mut h).await;
        stt.send_json(final_frame("hello?"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(incoming) =
            tokio::time::timeout(Duration::from_millis(10), h.orchestrator.recv_incoming()).await
        {
            h.orchestrator.handle(incoming).await;
        }
        assert!(h.orchestrator.conversation_history().is_empty());
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn generation_error_returns_to_listening() {
        let mut h = harness();
        h.backend.push(Script::rejected(crate::llm::LlmError::Generation {
            status: Some(500),
            message: "overloaded".into(),
        }));
        let (stt, _tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();

        stt.send_json(final_frame("anything on the menu?"));
        let seen = pump_until(&mut h, |e| matches!(e, SessionEvent::Error(_))).await;
        let Some(SessionEvent::Error(report)) = seen.last() else {
            unreachable!()
        };
        assert_eq!(report.subsystem, Subsystem::Llm);
        assert!(!report.terminal);
        assert_eq!(h.orchestrator.state(), SessionState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_from_llm_stops_the_session() {
        let mut h = harness();
        h.backend.push(Script::rejected(crate::llm::LlmError::Generation {
            status: Some(401),
            message: "invalid api key".into(),
        }));
        let (stt, _tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();

        stt.send_json(final_frame("hello"));
        pump_until(&mut h, |e| *e == SessionEvent::Stopped).await;
        assert_eq!(h.orchestrator.state(), SessionState::Stopped);
    }

    // ---- barge-in ---

    #[tokio::test(start_paused = true)]
    async fn speech_during_playback_interrupts() {
        let mut h = harness();
        h.backend.push(
            Script::tokens([
                "Let me tell you about our menu. ",
                "We have jollof rice. ",
                "We also have suya and puff-puff.",
            ])
            .with_delay(Duration::from_secs(1)),
        );
        let (stt, mut tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();

        stt.send_json(final_frame("what do you have?"));
        pump_until(&mut h, |e| matches!(e, SessionEvent::AiSentence(_))).await;
        let request = tts.recv_json().await.unwrap();
        assert_eq!(request["type"], "tts");
        tts.send_json(audio(2_000));
        pump_until(&mut h, |e| *e == SessionEvent::AiSpeechStart).await;
        assert_eq!(h.orchestrator.state(), SessionState::Speaking);

        h.feed.push_level(0.3, 2_048);
        let seen = pump_until(&mut h, |e| *e == SessionEvent::Interrupted).await;
        assert!(seen.contains(&SessionEvent::UserSpeechStart));
        assert_eq!(h.orchestrator.state(), SessionState::Listening);

        // Nothing more from the cancelled turn.
        h.feed.push_level(0.0, 2_048);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut later = Vec::new();
        while let Ok(incoming) =
            tokio::time::timeout(Duration::from_millis(10), h.orchestrator.recv_incoming()).await
        {
            h.orchestrator.handle(incoming).await;
        }
        while let Ok(ev) = h.events.try_recv() {
            later.push(ev);
        }
        assert!(drain_ai(&later).is_empty(), "stale sentences: {later:?}");
        assert!(!later
            .iter()
            .any(|e| matches!(e, SessionEvent::AiMessageComplete(_))));
        assert_eq!(h.output.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_can_be_disabled() {
        let mut config = config();
        config.interruption.enabled = false;
        let mut h = harness_with(config);
        h.backend.push(Script::tokens(["One moment please."]));
        let (stt, tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();

        stt.send_json(final_frame("hi"));
        pump_until(&mut h, |e| matches!(e, SessionEvent::AiSentence(_))).await;
        tts.send_json(audio(3_000));
        pump_until(&mut h, |e| *e == SessionEvent::AiSpeechStart).await;

        h.feed.push_level(0.3, 2_048);
        let seen = pump_until(&mut h, |e| *e == SessionEvent::UserSpeechStart).await;
        assert!(!seen.contains(&SessionEvent::Interrupted));
        assert_eq!(h.orchestrator.state(), SessionState::Speaking);
    }

    // ---- stop / voice / cleanup ---

    #[tokio::test(start_paused = true)]
    async fn stop_while_speaking_ends_ai_speech() {
        let mut h = harness();
        h.backend.push(Script::tokens(["Your table is ready."]));
        let (stt, tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();

        stt.send_json(final_frame("is my table ready?"));
        pump_until(&mut h, |e| matches!(e, SessionEvent::AiSentence(_))).await;
        tts.send_json(audio(3_000));
        pump_until(&mut h, |e| *e == SessionEvent::AiSpeechStart).await;

        h.orchestrator.stop().await;
        let mut seen = Vec::new();
        while let Ok(ev) = h.events.try_recv() {
            seen.push(ev);
        }
        let end = seen.iter().position(|e| *e == SessionEvent::AiSpeechEnd);
        let stopped = seen.iter().position(|e| *e == SessionEvent::Stopped);
        assert!(end.is_some() && end < stopped, "saw {seen:?}");
        assert!(!h.orchestrator.status().ai_speaking);

        // A quiet stop has no speech to end.
        h.orchestrator.start().await.unwrap();
        h.orchestrator.stop().await;
        while let Ok(ev) = h.events.try_recv() {
            assert_ne!(ev, SessionEvent::AiSpeechEnd);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_connections_and_restarts() {
        let mut h = harness();
        let (_stt, _tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();
        h.orchestrator.stop().await;
        assert_eq!(h.orchestrator.state(), SessionState::Stopped);
        assert!(h.orchestrator.status().tts.state.is_open());

        h.orchestrator.start().await.unwrap();
        assert_eq!(h.orchestrator.state(), SessionState::Listening);
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn change_voice_reconnects_tts() {
        let mut h = harness();
        let (_stt, _tts) = ready(&mut h).await;

        let peers = &mut h.peers;
        let serve = async move {
            let mut peer = peers.recv().await.unwrap();
            peer.recv_json().await.unwrap();
            peer.send_json(json!({ "type": "auth_success", "session_id": "s-2" }));
            peer
        };
        let (result, peer) = tokio::join!(h.orchestrator.change_voice("ada"), serve);
        result.unwrap();
        assert!(peer.request.url.contains("voice_id=English_Graceful_Lady"));
        assert_eq!(
            h.orchestrator.status().voice.map(|v| v.label),
            Some("Ada".to_string())
        );
        assert!(matches!(
            h.orchestrator.change_voice("nobody").await,
            Err(SessionError::UnknownVoice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_releases_everything() {
        let mut h = harness();
        let (_stt, _tts) = ready(&mut h).await;
        h.orchestrator.start().await.unwrap();
        h.orchestrator.cleanup().await;

        assert_eq!(h.orchestrator.state(), SessionState::Idle);
        assert_eq!(h.output.open_handles(), 0);
        assert_eq!(h.feed.listeners(), 0);
        assert!(h.orchestrator.conversation_history().is_empty());
        assert_eq!(h.orchestrator.metrics(), MetricsSnapshot::default());
    }
}
