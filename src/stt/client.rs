//! Streaming speech-to-text client.
//!
//! [`SpeechToTextClient::connect`] dials the service and spawns a session
//! task that owns the connection.  The client talks to that task over a
//! command channel; the task reports everything through [`SttEvent`]s and
//! publishes its [`ConnectionState`] on a watch channel.
//!
//! # Session task
//!
//! ```text
//! select! {
//!     command     → start/stop streaming, disconnect
//!     inbound     → parse → SttEvent        (None ⇒ connection lost)
//!     mic frame   → mono → resample → PCM16 → binary frame   (Streaming only)
//! }
//! connection lost while Streaming ──▶ Backoff: up to N attempts, fixed delay
//!     success   → resume Streaming with the same microphone
//!     Auth      → terminal error, Disconnected
//!     exhausted → terminal error, Disconnected
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::{pcm16_le_bytes, resample_linear, AudioFrame, Microphone, MicrophoneStream};
use crate::config::SttConfig;
use crate::transport::{
    ConnectRequest, ConnectionState, Connector, Duplex, Frame, ReconnectPolicy, TransportError,
};

use super::messages::{close_stream_message, listen_url, ServerMessage};
use super::{SttError, SttEvent, SttStatus};

enum Command {
    StartStreaming(MicrophoneStream, oneshot::Sender<()>),
    StopStreaming(oneshot::Sender<()>),
    Disconnect,
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// See the module docs.
pub struct SpeechToTextClient {
    config: SttConfig,
    connector: Arc<dyn Connector>,
    microphone: Arc<dyn Microphone>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<SttEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Option<Session>,
}

impl SpeechToTextClient {
    pub fn new(
        config: SttConfig,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        microphone: Arc<dyn Microphone>,
    ) -> (Self, mpsc::UnboundedReceiver<SttEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                config,
                connector,
                microphone,
                policy,
                events,
                state: Arc::new(state),
                session: None,
            },
            rx,
        )
    }

    fn request(&self) -> Result<ConnectRequest, SttError> {
        let url = listen_url(&self.config)
            .map_err(|e| TransportError::Connection(format!("invalid STT endpoint: {e}")))?;
        let mut request = ConnectRequest::new(url.as_str());
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.header("Authorization", format!("token {key}"));
        }
        Ok(request)
    }

    /// Open the streaming session.  A no-op while already connected.
    pub async fn connect(&mut self) -> Result<(), SttError> {
        if let Some(session) = &self.session {
            if !session.task.is_finished() && self.state().is_open() {
                return Ok(());
            }
        }
        self.session = None;

        let request = self.request()?;
        self.state.send_replace(ConnectionState::Connecting);
        log::info!("stt: connecting to {}", request.redacted_url());

        let duplex = match self.connector.connect(request.clone()).await {
            Ok(duplex) => duplex,
            Err(e) => {
                log::error!("stt: connection failed: {e}");
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        self.state.send_replace(ConnectionState::Connected);
        log::info!("stt: connected");
        let _ = self.events.send(SttEvent::Connected);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = SessionTask {
            config: self.config.clone(),
            connector: self.connector.clone(),
            request,
            policy: self.policy,
            events: self.events.clone(),
            state: self.state.clone(),
            commands: command_rx,
            mic: None,
        };
        let task = tokio::spawn(worker.run(duplex));
        self.session = Some(Session { commands, task });
        Ok(())
    }

    /// Start capturing and transmitting audio.
    ///
    /// Fails with [`SttError::NotConnected`] before [`connect`](Self::connect)
    /// has succeeded.  A second call while streaming is a no-op.
    pub async fn start_streaming(&mut self) -> Result<(), SttError> {
        if self.is_streaming() {
            log::warn!("stt: already streaming");
            return Ok(());
        }
        let Some(session) = self.session.as_ref().filter(|s| !s.task.is_finished()) else {
            return Err(SttError::NotConnected);
        };
        if !self.state.borrow().is_open() {
            return Err(SttError::NotConnected);
        }
        let commands = session.commands.clone();

        let microphone = self.microphone.clone();
        let stream = tokio::task::spawn_blocking(move || microphone.open())
            .await
            .map_err(|e| SttError::Server(format!("capture task failed: {e}")))??;

        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(Command::StartStreaming(stream, ack_tx))
            .map_err(|_| SttError::NotConnected)?;
        ack_rx.await.map_err(|_| SttError::NotConnected)
    }

    /// Send end-of-stream, stop capture and release the microphone.
    pub async fn stop_streaming(&mut self) {
        if !self.is_streaming() {
            log::debug!("stt: stop_streaming while not streaming");
        }
        let Some(session) = &self.session else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if session.commands.send(Command::StopStreaming(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop streaming and close the connection.  Idempotent.
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            self.state.send_replace(ConnectionState::Disconnected);
            return;
        };
        let _ = session.commands.send(Command::Disconnect);
        if let Err(e) = session.task.await {
            log::warn!("stt: session task ended abnormally: {e}");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn status(&self) -> SttStatus {
        SttStatus {
            state: self.state(),
            streaming: self.is_streaming(),
            model: self.config.model.clone(),
            language: self.config.language.clone(),
        }
    }

    pub fn config(&self) -> &SttConfig {
        &self.config
    }

    /// Replace the streaming options; they take effect on the next
    /// [`connect`](Self::connect).
    pub fn update_config(&mut self, config: SttConfig) {
        self.config = config;
        log::info!("stt: configuration updated");
    }
}

impl Drop for SpeechToTextClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(Command::Disconnect);
        }
    }
}

// ---------------------------------------------------------------------------
// SessionTask
// ---------------------------------------------------------------------------

struct SessionTask {
    config: SttConfig,
    connector: Arc<dyn Connector>,
    request: ConnectRequest,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<SttEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: mpsc::UnboundedReceiver<Command>,
    mic: Option<MicrophoneStream>,
}

/// What ended one connection.
enum Exit {
    Disconnect,
    Lost,
}

async fn next_frame(mic: &mut Option<MicrophoneStream>) -> Option<AudioFrame> {
    match mic {
        Some(stream) => stream.frames.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionTask {
    fn emit(&self, event: SttEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(mut self, mut duplex: Duplex) {
        loop {
            match self.pump(&mut duplex).await {
                Exit::Disconnect => {
                    self.set_state(ConnectionState::Closing);
                    let _ = duplex.outbound.send(Frame::Close);
                    break;
                }
                Exit::Lost => {
                    let was_streaming = self.mic.is_some();
                    self.set_state(ConnectionState::Disconnected);
                    log::warn!("stt: connection lost (streaming: {was_streaming})");
                    self.emit(SttEvent::Disconnected);

                    if !was_streaming {
                        break;
                    }
                    match self.reconnect().await {
                        Some(fresh) => duplex = fresh,
                        None => break,
                    }
                }
            }
        }

        self.mic = None;
        self.set_state(ConnectionState::Disconnected);
        log::info!("stt: session closed");
    }

    /// Serve one connection until it ends.
    async fn pump(&mut self, duplex: &mut Duplex) -> Exit {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::StartStreaming(stream, ack)) => {
                        self.mic = Some(stream);
                        self.set_state(ConnectionState::Streaming);
                        log::info!("stt: streaming started");
                        self.emit(SttEvent::StreamingStarted);
                        let _ = ack.send(());
                    }
                    Some(Command::StopStreaming(ack)) => {
                        self.stop_streaming(duplex);
                        let _ = ack.send(());
                    }
                    Some(Command::Disconnect) | None => {
                        self.stop_streaming(duplex);
                        return Exit::Disconnect;
                    }
                },
                inbound = duplex.inbound.recv() => match inbound {
                    Some(Frame::Text(text)) => self.handle_text(&text),
                    Some(Frame::Binary(_)) => log::debug!("stt: ignoring binary frame"),
                    Some(Frame::Close) | None => return Exit::Lost,
                },
                frame = next_frame(&mut self.mic) => match frame {
                    Some(frame) => {
                        if !self.send_audio(duplex, &frame) {
                            return Exit::Lost;
                        }
                    }
                    None => {
                        log::error!("stt: capture stream ended");
                        self.mic = None;
                        self.set_state(ConnectionState::Connected);
                        self.emit(SttEvent::StreamingStopped);
                        self.emit(SttEvent::Error {
                            error: SttError::Capture(crate::audio::CaptureError::Stream(
                                "capture stream ended".into(),
                            )),
                            terminal: false,
                        });
                    }
                },
            }
        }
    }

    fn stop_streaming(&mut self, duplex: &Duplex) {
        if self.mic.take().is_none() {
            return;
        }
        duplex.send(Frame::Text(close_stream_message()));
        self.set_state(ConnectionState::Connected);
        log::info!("stt: streaming stopped");
        self.emit(SttEvent::StreamingStopped);
    }

    /// Convert one capture frame to service PCM and send it.
    fn send_audio(&self, duplex: &Duplex, frame: &AudioFrame) -> bool {
        let mono = frame.to_mono();
        let resampled = resample_linear(&mono, frame.sample_rate, self.config.sample_rate);
        if resampled.is_empty() {
            return true;
        }
        duplex.send(Frame::Binary(pcm16_le_bytes(&resampled)))
    }

    fn handle_text(&self, text: &str) {
        let message = match ServerMessage::parse(text, Instant::now()) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("stt: unparseable frame: {e}");
                return;
            }
        };
        match message {
            ServerMessage::Interim(t) => {
                log::debug!("stt: interim: {}", t.text);
                self.emit(SttEvent::Interim(t));
            }
            ServerMessage::Final(t) => {
                log::info!("stt: final: {}", t.text);
                self.emit(SttEvent::Final(t));
            }
            ServerMessage::SpeechStarted => self.emit(SttEvent::SpeechStarted),
            ServerMessage::UtteranceEnd => self.emit(SttEvent::UtteranceEnd),
            ServerMessage::Metadata(v) => {
                log::debug!("stt: metadata: {v}");
                self.emit(SttEvent::Metadata(v));
            }
            ServerMessage::Error(detail) => {
                log::error!("stt: server error: {detail}");
                self.emit(SttEvent::Error {
                    error: SttError::Server(detail),
                    terminal: false,
                });
            }
            ServerMessage::Ignored => {}
        }
    }

    /// Bounded reconnection.  `None` means give up (terminal error already
    /// emitted, or the owner asked to stop).
    async fn reconnect(&mut self) -> Option<Duplex> {
        let mut backoff = self.policy.start();

        while let Some((attempt, delay)) = backoff.next_attempt() {
            self.set_state(ConnectionState::Connecting);
            log::info!(
                "stt: reconnecting ({attempt}/{}) in {delay:?}",
                self.policy.max_attempts
            );
            self.emit(SttEvent::Reconnecting {
                attempt,
                max_attempts: self.policy.max_attempts,
            });

            // Commands stay live during the delay so stop/disconnect abort it.
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(Command::StartStreaming(stream, ack)) => {
                            self.mic = Some(stream);
                            let _ = ack.send(());
                        }
                        Some(Command::StopStreaming(ack)) => {
                            self.mic = None;
                            self.emit(SttEvent::StreamingStopped);
                            let _ = ack.send(());
                            log::info!("stt: reconnect abandoned, streaming stopped");
                            return None;
                        }
                        Some(Command::Disconnect) | None => {
                            log::info!("stt: reconnect abandoned, disconnecting");
                            return None;
                        }
                    },
                }
            }

            match self.connector.connect(self.request.clone()).await {
                Ok(duplex) => {
                    // Audio captured while offline is stale.
                    if let Some(mic) = self.mic.as_mut() {
                        while mic.frames.try_recv().is_ok() {}
                    }
                    self.set_state(ConnectionState::Streaming);
                    log::info!("stt: reconnected after {attempt} attempt(s)");
                    self.emit(SttEvent::Connected);
                    return Some(duplex);
                }
                Err(e) if e.is_terminal() => {
                    log::error!("stt: reconnect rejected: {e}");
                    self.emit(SttEvent::Error {
                        error: e.into(),
                        terminal: true,
                    });
                    return None;
                }
                Err(e) => log::warn!("stt: reconnect attempt {attempt} failed: {e}"),
            }
        }

        log::error!(
            "stt: giving up after {} reconnect attempts",
            backoff.attempts()
        );
        self.emit(SttEvent::Error {
            error: SttError::ReconnectExhausted {
                attempts: backoff.attempts(),
            },
            terminal: true,
        });
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::{ChannelMicrophone, MicrophoneFeed};
    use crate::transport::{MemoryConnector, RemotePeer};

    struct Harness {
        client: SpeechToTextClient,
        events: mpsc::UnboundedReceiver<SttEvent>,
        connector: MemoryConnector,
        peers: mpsc::UnboundedReceiver<RemotePeer>,
        feed: MicrophoneFeed,
    }

    fn harness() -> Harness {
        let (connector, peers) = MemoryConnector::new();
        let (mic, feed) = ChannelMicrophone::new(48_000, 2);
        let config = SttConfig {
            api_key: Some("dg-test".into()),
            ..SttConfig::default()
        };
        let (client, events) = SpeechToTextClient::new(
            config,
            ReconnectPolicy::default(),
            Arc::new(connector.clone()),
            Arc::new(mic),
        );
        Harness {
            client,
            events,
            connector,
            peers,
            feed,
        }
    }

    async fn next_event<F>(rx: &mut mpsc::UnboundedReceiver<SttEvent>, mut pred: F) -> SttEvent
    where
        F: FnMut(&SttEvent) -> bool,
    {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&ev) {
                return ev;
            }
        }
    }

    // ---- connect -----------------------------------------------------------

    #[tokio::test]
    async fn connect_sends_token_header_and_options() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let peer = h.peers.recv().await.unwrap();

        assert!(peer.request.url.contains("model=nova-2"));
        assert!(peer
            .request
            .headers
            .contains(&("Authorization".into(), "token dg-test".into())));
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(h.events.recv().await, Some(SttEvent::Connected));
    }

    #[tokio::test]
    async fn auth_rejection_fails_connect() {
        let mut h = harness();
        h.connector.fail_next(TransportError::Auth("401".into()));
        let err = h.client.connect().await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn transport_failure_fails_connect() {
        let mut h = harness();
        h.connector
            .fail_next(TransportError::Connection("refused".into()));
        let err = h.client.connect().await.unwrap_err();
        assert!(matches!(err, SttError::Transport(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn start_streaming_before_connect_is_not_connected() {
        let mut h = harness();
        assert_eq!(h.client.start_streaming().await, Err(SttError::NotConnected));
    }

    // ---- streaming ---------------------------------------------------------

    #[tokio::test]
    async fn audio_is_sent_as_16k_mono_pcm() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let mut peer = h.peers.recv().await.unwrap();
        h.client.start_streaming().await.unwrap();
        assert!(h.client.is_streaming());

        // 480 stereo frames at 48 kHz → 160 mono samples at 16 kHz.
        h.feed.push(&vec![0.5; 960]);
        match peer.recv().await {
            Some(Frame::Binary(bytes)) => assert_eq!(bytes.len(), 320),
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transcripts_become_events() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let peer = h.peers.recv().await.unwrap();

        peer.send_json(serde_json::json!({
            "type": "Results", "is_final": false,
            "channel": { "alternatives": [{ "transcript": "I want", "confidence": 0.6 }] }
        }));
        peer.send_json(serde_json::json!({
            "type": "Results", "is_final": true, "speech_final": true,
            "channel": { "alternatives": [{ "transcript": "I want jollof rice", "confidence": 0.97 }] }
        }));
        peer.send_json(serde_json::json!({ "type": "UtteranceEnd" }));

        let interim = next_event(&mut h.events, |e| matches!(e, SttEvent::Interim(_))).await;
        assert!(matches!(interim, SttEvent::Interim(t) if t.text == "I want"));
        let fin = next_event(&mut h.events, |e| matches!(e, SttEvent::Final(_))).await;
        assert!(matches!(fin, SttEvent::Final(t) if t.text == "I want jollof rice"));
        let end = next_event(&mut h.events, |e| matches!(e, SttEvent::UtteranceEnd)).await;
        assert_eq!(end, SttEvent::UtteranceEnd);
    }

    #[tokio::test]
    async fn stop_streaming_sends_close_stream_and_releases_mic() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let mut peer = h.peers.recv().await.unwrap();
        h.client.start_streaming().await.unwrap();
        assert_eq!(h.feed.listeners(), 1);

        h.client.stop_streaming().await;
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(h.feed.listeners(), 0);
        let close = peer.recv_json().await.unwrap();
        assert_eq!(close["type"], "CloseStream");
    }

    #[tokio::test]
    async fn disconnect_closes_transport() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let mut peer = h.peers.recv().await.unwrap();
        h.client.disconnect().await;
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert_eq!(peer.recv().await, Some(Frame::Close));
        // Idempotent.
        h.client.disconnect().await;
    }

    // ---- reconnection ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn lost_connection_while_streaming_reconnects_and_resumes() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let peer = h.peers.recv().await.unwrap();
        h.client.start_streaming().await.unwrap();

        h.connector
            .fail_next(TransportError::Connection("still down".into()));
        drop(peer);

        let ev = next_event(&mut h.events, |e| matches!(e, SttEvent::Reconnecting { .. })).await;
        assert_eq!(
            ev,
            SttEvent::Reconnecting {
                attempt: 1,
                max_attempts: 5
            }
        );
        let ev = next_event(&mut h.events, |e| matches!(e, SttEvent::Connected)).await;
        assert_eq!(ev, SttEvent::Connected);
        assert_eq!(h.client.state(), ConnectionState::Streaming);
        assert_eq!(h.connector.attempts(), 3);

        let mut fresh = h.peers.recv().await.unwrap();
        h.feed.push(&vec![0.1; 960]);
        assert!(matches!(fresh.recv().await, Some(Frame::Binary(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_are_terminal() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let peer = h.peers.recv().await.unwrap();
        h.client.start_streaming().await.unwrap();

        for _ in 0..5 {
            h.connector
                .fail_next(TransportError::Connection("down".into()));
        }
        drop(peer);

        let ev = next_event(&mut h.events, |e| matches!(e, SttEvent::Error { .. })).await;
        assert_eq!(
            ev,
            SttEvent::Error {
                error: SttError::ReconnectExhausted { attempts: 5 },
                terminal: true
            }
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        // One initial connect plus exactly five retries.
        assert_eq!(h.connector.attempts(), 6);
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_during_reconnect_stops_retrying() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        let peer = h.peers.recv().await.unwrap();
        h.client.start_streaming().await.unwrap();

        h.connector.fail_next(TransportError::Auth("revoked".into()));
        drop(peer);

        let ev = next_event(&mut h.events, |e| matches!(e, SttEvent::Error { .. })).await;
        assert!(matches!(ev, SttEvent::Error { terminal: true, .. }));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn lost_connection_while_idle_does_not_reconnect() {
        let mut h = harness();
        h.client.connect().await.unwrap();
        drop(h.peers.recv().await.unwrap());

        next_event(&mut h.events, |e| matches!(e, SttEvent::Disconnected)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.client.start_streaming().await, Err(SttError::NotConnected));
    }
}
