//! Streaming text-to-speech client.
//!
//! [`TextToSpeechClient::connect`] opens the audio output, dials the
//! service and authenticates with the chosen voice, then spawns two tasks:
//!
//! * the session task, which owns the connection, turns inbound audio into
//!   queued chunks, sends keep-alive pings and reconnects (re-authenticating
//!   with the same voice) when the connection drops;
//! * the playback loop ([`run_playback`]), which owns the player.
//!
//! [`stream_text`](TextToSpeechClient::stream_text) and
//! [`interrupt`](TextToSpeechClient::interrupt) are synchronous so the
//! orchestrator can call them from inside an event handler.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioOutput, PlaybackError};
use crate::config::{InterruptionConfig, TtsConfig};
use crate::transport::{
    ConnectRequest, ConnectionState, Connector, Duplex, Frame, ReconnectPolicy, TransportError,
};

use super::messages::{auth_message, ping_message, synthesis_request, tts_url, ServerMessage};
use super::queue::{run_playback, PlaybackQueue};
use super::{TtsError, TtsEvent, TtsStatus};

// ---------------------------------------------------------------------------
// RequestTracker
// ---------------------------------------------------------------------------

/// Requests remembered while waiting for their audio.
const MAX_PENDING: usize = 32;

/// Attributes inbound audio to the synthesis request that produced it.
///
/// The service answers requests in order, so when a frame does not echo a
/// `request_id` it belongs to the request between `audio_start` and
/// `audio_end`, or to the oldest request not yet started.  An interrupted
/// request keeps its `audio_start` only until a newer request is waiting.
#[derive(Debug, Default)]
struct RequestTracker {
    last_sent: u64,
    pending: VecDeque<u64>,
    active: Option<u64>,
    /// Requests up to this id were superseded by an interrupt.
    discard_up_to: Option<u64>,
}

impl RequestTracker {
    fn next_id(&mut self) -> u64 {
        self.last_sent += 1;
        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(self.last_sent);
        self.last_sent
    }

    fn unsend(&mut self, id: u64) {
        self.pending.retain(|&p| p != id);
    }

    fn attribute(&mut self, echoed: Option<u64>) -> u64 {
        if let Some(id) = echoed {
            // Anything older than an echoed id has been answered.
            self.pending.retain(|&p| p >= id);
            return id;
        }
        if self.active.is_some_and(|id| self.is_discarded(id)) && !self.pending.is_empty() {
            self.active = None;
        }
        self.active
            .or_else(|| self.pending.front().copied())
            .unwrap_or(self.last_sent)
    }

    fn start(&mut self, echoed: Option<u64>) -> u64 {
        let id = match echoed {
            Some(id) => {
                self.pending.retain(|&p| p > id);
                id
            }
            None => self.pending.pop_front().unwrap_or(self.last_sent),
        };
        self.active = Some(id);
        id
    }

    fn end(&mut self, echoed: Option<u64>) -> u64 {
        let id = self.attribute(echoed);
        if self.active == Some(id) {
            self.active = None;
        } else {
            self.pending.retain(|&p| p != id);
        }
        id
    }

    /// Everything sent so far is stale; only requests sent after this
    /// wait for audio.
    fn discard_sent(&mut self) {
        self.discard_up_to = Some(self.last_sent);
        self.pending.clear();
    }

    fn is_discarded(&self, id: u64) -> bool {
        matches!(self.discard_up_to, Some(upto) if id <= upto)
    }

    /// The service forgets outstanding requests when the connection drops.
    fn reset_in_flight(&mut self) {
        self.pending.clear();
        self.active = None;
    }
}

#[derive(Default)]
struct Shared {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    voice_id: Option<String>,
    session_id: Option<String>,
    tracker: RequestTracker,
}

struct Session {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    playback: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// TextToSpeechClient
// ---------------------------------------------------------------------------

/// See the module docs.
pub struct TextToSpeechClient {
    config: TtsConfig,
    interruption: InterruptionConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    output: Arc<dyn AudioOutput>,
    events: mpsc::UnboundedSender<TtsEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    shared: Arc<Mutex<Shared>>,
    queue: Arc<PlaybackQueue>,
    fade: Arc<Mutex<Duration>>,
    session: Option<Session>,
}

impl TextToSpeechClient {
    pub fn new(
        config: TtsConfig,
        interruption: InterruptionConfig,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        output: Arc<dyn AudioOutput>,
    ) -> (Self, mpsc::UnboundedReceiver<TtsEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let fade = Arc::new(Mutex::new(interruption.fade_out()));
        (
            Self {
                config,
                interruption,
                policy,
                connector,
                output,
                events,
                state: Arc::new(state),
                shared: Arc::new(Mutex::new(Shared::default())),
                queue: Arc::new(PlaybackQueue::new()),
                fade,
                session: None,
            },
            rx,
        )
    }

    fn request(&self, voice_id: &str) -> Result<ConnectRequest, TtsError> {
        let url = tts_url(&self.config, voice_id)
            .map_err(|e| TransportError::Connection(format!("invalid TTS endpoint: {e}")))?;
        Ok(ConnectRequest::new(url.as_str()))
    }

    fn emit(&self, event: TtsEvent) {
        let _ = self.events.send(event);
    }

    /// Open the audio output, connect and authenticate with `voice_id`.
    ///
    /// A no-op when already connected with the same voice; a different
    /// voice replaces the current session.
    pub async fn connect(&mut self, voice_id: &str) -> Result<(), TtsError> {
        if self.session.is_some() {
            if self.is_connected() && self.voice_id().as_deref() == Some(voice_id) {
                return Ok(());
            }
            self.disconnect().await;
        }

        let request = self.request(voice_id)?;

        let output = self.output.clone();
        let player = tokio::task::spawn_blocking(move || output.open())
            .await
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("output task failed: {e}")))??;

        self.state.send_replace(ConnectionState::Connecting);
        log::info!("tts: connecting to {} (voice {voice_id})", request.redacted_url());

        let auth_timeout = Duration::from_millis(self.config.auth_timeout_ms);
        let mut duplex = match self.connector.connect(request.clone()).await {
            Ok(duplex) => duplex,
            Err(e) => {
                log::error!("tts: connection failed: {e}");
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        self.state.send_replace(ConnectionState::Connected);
        self.emit(TtsEvent::Connected);

        let session_id =
            match authenticate(&mut duplex, &self.config, voice_id, auth_timeout).await {
                Ok(session_id) => session_id,
                Err(e) => {
                    log::error!("tts: authentication failed: {e}");
                    duplex.send(Frame::Close);
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(e.into());
                }
            };

        {
            let mut shared = self.shared.lock().unwrap();
            shared.outbound = Some(duplex.outbound.clone());
            shared.voice_id = Some(voice_id.to_string());
            shared.session_id = session_id.clone();
            shared.tracker.reset_in_flight();
        }
        self.state.send_replace(ConnectionState::Streaming);
        log::info!("tts: authenticated (session {session_id:?})");
        self.emit(TtsEvent::Authenticated { session_id });

        let shutdown = CancellationToken::new();
        let playback = tokio::spawn(run_playback(
            self.queue.clone(),
            player,
            self.fade.clone(),
            self.events.clone(),
            shutdown.clone(),
        ));
        let worker = SessionTask {
            config: self.config.clone(),
            voice_id: voice_id.to_string(),
            connector: self.connector.clone(),
            request,
            policy: self.policy,
            events: self.events.clone(),
            state: self.state.clone(),
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run(duplex));
        self.session = Some(Session {
            shutdown,
            task,
            playback,
        });
        Ok(())
    }

    /// Send one sentence for synthesis and return its request id.
    pub fn stream_text(&self, text: &str) -> Result<u64, TtsError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TtsError::Synthesis("nothing to synthesise".into()));
        }
        if !self.is_connected() {
            return Err(TtsError::NotConnected);
        }

        let mut shared = self.shared.lock().unwrap();
        let Some(outbound) = shared.outbound.clone() else {
            return Err(TtsError::NotConnected);
        };
        let id = shared.tracker.next_id();
        let frame = Frame::json(&synthesis_request(&self.config, id, text));
        if outbound.send(frame).is_err() {
            shared.tracker.unsend(id);
            return Err(TtsError::NotConnected);
        }
        log::debug!("tts: request {id}: {text}");
        Ok(id)
    }

    /// Stop the playing chunk with a fade and, if configured, drop every
    /// queued chunk plus any audio still to arrive for requests sent so far.
    /// Safe to call at any time.
    pub fn interrupt(&self) {
        let clear = self.interruption.clear_queue_on_interrupt;
        if clear {
            self.shared.lock().unwrap().tracker.discard_sent();
        }
        let report = self.queue.interrupt(clear);
        log::info!(
            "tts: interrupted (stopped: {}, dropped {} queued)",
            report.stopped,
            report.dropped
        );
        self.emit(TtsEvent::Interrupted);
    }

    /// Stop playback, close the connection and release the audio output.
    /// Idempotent.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            self.state.send_replace(ConnectionState::Disconnected);
            return;
        };
        log::info!("tts: disconnecting");
        self.queue.interrupt(true);
        session.shutdown.cancel();
        if let Err(e) = session.task.await {
            log::warn!("tts: session task ended abnormally: {e}");
        }
        if let Err(e) = session.playback.await {
            log::warn!("tts: playback task ended abnormally: {e}");
        }
        {
            let mut shared = self.shared.lock().unwrap();
            shared.outbound = None;
            shared.session_id = None;
            shared.tracker.reset_in_flight();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        self.emit(TtsEvent::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Authenticated and ready for [`stream_text`](Self::stream_text).
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn is_playing(&self) -> bool {
        self.queue.is_playing()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn voice_id(&self) -> Option<String> {
        self.shared.lock().unwrap().voice_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().unwrap().session_id.clone()
    }

    pub fn status(&self) -> TtsStatus {
        let shared = self.shared.lock().unwrap();
        TtsStatus {
            state: self.state(),
            voice_id: shared.voice_id.clone(),
            session_id: shared.session_id.clone(),
            playing: self.queue.is_playing(),
            queued: self.queue.len(),
        }
    }

    pub fn config(&self) -> &TtsConfig {
        &self.config
    }

    /// Synthesis options apply to the next request; connection options to
    /// the next [`connect`](Self::connect).
    pub fn update_config(&mut self, config: TtsConfig) {
        self.config = config;
        log::info!("tts: configuration updated");
    }

    pub fn set_interruption(&mut self, interruption: InterruptionConfig) {
        *self.fade.lock().unwrap() = interruption.fade_out();
        self.interruption = interruption;
    }
}

impl Drop for TextToSpeechClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.queue.interrupt(true);
            session.shutdown.cancel();
        }
    }
}

/// Send the `auth` frame and wait for `auth_success`.
///
/// An `error` frame first means the credentials or voice were rejected.
async fn authenticate(
    duplex: &mut Duplex,
    config: &TtsConfig,
    voice_id: &str,
    timeout: Duration,
) -> Result<Option<String>, TransportError> {
    if !duplex.send(Frame::json(&auth_message(config, voice_id))) {
        return Err(TransportError::Connection("closed before authentication".into()));
    }
    let inbound = &mut duplex.inbound;
    let wait = async {
        loop {
            match inbound.recv().await {
                Some(Frame::Text(text)) => match ServerMessage::parse(&text) {
                    Ok(ServerMessage::AuthSuccess { session_id }) => return Ok(session_id),
                    Ok(ServerMessage::Error(detail)) => return Err(TransportError::Auth(detail)),
                    Ok(other) => log::debug!("tts: ignoring {other:?} before authentication"),
                    Err(e) => log::warn!("tts: unparseable frame during authentication: {e}"),
                },
                Some(Frame::Binary(_)) => log::debug!("tts: ignoring audio before authentication"),
                Some(Frame::Close) | None => {
                    return Err(TransportError::Connection(
                        "closed during authentication".into(),
                    ))
                }
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| TransportError::Connection("authentication timed out".into()))?
}

// ---------------------------------------------------------------------------
// SessionTask
// ---------------------------------------------------------------------------

struct SessionTask {
    config: TtsConfig,
    voice_id: String,
    connector: Arc<dyn Connector>,
    request: ConnectRequest,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TtsEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    shared: Arc<Mutex<Shared>>,
    queue: Arc<PlaybackQueue>,
    shutdown: CancellationToken,
}

enum Exit {
    Disconnect,
    Lost,
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl SessionTask {
    fn emit(&self, event: TtsEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(self, mut duplex: Duplex) {
        loop {
            match self.pump(&mut duplex).await {
                Exit::Disconnect => {
                    self.set_state(ConnectionState::Closing);
                    duplex.send(Frame::Close);
                    break;
                }
                Exit::Lost => {
                    {
                        let mut shared = self.shared.lock().unwrap();
                        shared.outbound = None;
                        shared.tracker.reset_in_flight();
                    }
                    self.set_state(ConnectionState::Disconnected);
                    log::warn!("tts: connection lost");
                    self.emit(TtsEvent::Disconnected);

                    match self.reconnect().await {
                        Some(fresh) => duplex = fresh,
                        None => break,
                    }
                }
            }
        }

        self.shared.lock().unwrap().outbound = None;
        self.set_state(ConnectionState::Disconnected);
        log::info!("tts: session closed");
    }

    /// Serve one connection until it ends.
    async fn pump(&self, duplex: &mut Duplex) -> Exit {
        let mut ping = (self.config.ping_interval_ms > 0).then(|| {
            let period = Duration::from_millis(self.config.ping_interval_ms);
            tokio::time::interval_at(Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Exit::Disconnect,
                _ = next_ping(&mut ping) => {
                    log::trace!("tts: ping");
                    if !duplex.send(Frame::json(&ping_message())) {
                        return Exit::Lost;
                    }
                }
                inbound = duplex.inbound.recv() => match inbound {
                    Some(Frame::Binary(data)) => self.on_audio(None, data),
                    Some(Frame::Text(text)) => self.handle_text(&text),
                    Some(Frame::Close) | None => return Exit::Lost,
                },
            }
        }
    }

    fn on_audio(&self, echoed: Option<u64>, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let request_id = {
            let mut shared = self.shared.lock().unwrap();
            let id = shared.tracker.attribute(echoed);
            if shared.tracker.is_discarded(id) {
                log::debug!("tts: dropping {} bytes of interrupted request {id}", data.len());
                return;
            }
            id
        };
        let len = data.len();
        let seq = self.queue.push(request_id, data);
        self.emit(TtsEvent::AudioChunk {
            seq,
            request_id,
            len,
        });
    }

    fn handle_text(&self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("tts: skipping frame: {e}");
                return;
            }
        };
        match message {
            ServerMessage::AuthSuccess { session_id } => {
                self.shared.lock().unwrap().session_id = session_id.clone();
                self.emit(TtsEvent::Authenticated { session_id });
            }
            ServerMessage::AudioStart { request_id } => {
                let (id, stale) = {
                    let mut shared = self.shared.lock().unwrap();
                    let id = shared.tracker.start(request_id);
                    (id, shared.tracker.is_discarded(id))
                };
                if !stale {
                    log::debug!("tts: audio start (request {id})");
                    self.emit(TtsEvent::SynthesisStarted { request_id: id });
                }
            }
            ServerMessage::AudioChunk { request_id, audio } => self.on_audio(request_id, audio),
            ServerMessage::AudioEnd { request_id } => {
                let (id, stale) = {
                    let mut shared = self.shared.lock().unwrap();
                    let id = shared.tracker.end(request_id);
                    (id, shared.tracker.is_discarded(id))
                };
                if !stale {
                    log::debug!("tts: audio end (request {id})");
                    self.emit(TtsEvent::SynthesisEnded { request_id: id });
                }
            }
            ServerMessage::Transcript(text) => self.emit(TtsEvent::Transcript(text)),
            ServerMessage::Error(detail) => {
                log::error!("tts: server error: {detail}");
                self.emit(TtsEvent::Error {
                    error: TtsError::Synthesis(detail),
                    terminal: false,
                });
            }
            ServerMessage::Pong => log::trace!("tts: pong"),
            ServerMessage::Unknown(kind) => log::debug!("tts: unknown message type {kind:?}"),
        }
    }

    /// Bounded reconnection with re-authentication.  `None` means give up.
    async fn reconnect(&self) -> Option<Duplex> {
        let mut backoff = self.policy.start();
        let auth_timeout = Duration::from_millis(self.config.auth_timeout_ms);

        while let Some((attempt, delay)) = backoff.next_attempt() {
            self.set_state(ConnectionState::Connecting);
            log::info!(
                "tts: reconnecting ({attempt}/{}) in {delay:?}",
                self.policy.max_attempts
            );
            self.emit(TtsEvent::Reconnecting {
                attempt,
                max_attempts: self.policy.max_attempts,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("tts: reconnect abandoned, disconnecting");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let mut duplex = match self.connector.connect(self.request.clone()).await {
                Ok(duplex) => duplex,
                Err(e) if e.is_terminal() => return self.give_up(e.into()),
                Err(e) => {
                    log::warn!("tts: reconnect attempt {attempt} failed: {e}");
                    continue;
                }
            };
            self.set_state(ConnectionState::Connected);
            self.emit(TtsEvent::Connected);

            match authenticate(&mut duplex, &self.config, &self.voice_id, auth_timeout).await {
                Ok(session_id) => {
                    {
                        let mut shared = self.shared.lock().unwrap();
                        shared.outbound = Some(duplex.outbound.clone());
                        shared.session_id = session_id.clone();
                    }
                    self.set_state(ConnectionState::Streaming);
                    log::info!("tts: reconnected after {attempt} attempt(s)");
                    self.emit(TtsEvent::Authenticated { session_id });
                    return Some(duplex);
                }
                Err(e) if e.is_terminal() => return self.give_up(e.into()),
                Err(e) => log::warn!("tts: re-authentication attempt {attempt} failed: {e}"),
            }
        }

        log::error!(
            "tts: giving up after {} reconnect attempts",
            backoff.attempts()
        );
        self.give_up(TtsError::ReconnectExhausted {
            attempts: backoff.attempts(),
        })
    }

    fn give_up(&self, error: TtsError) -> Option<Duplex> {
        log::error!("tts: {error}");
        self.emit(TtsEvent::Error {
            error,
            terminal: true,
        });
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
