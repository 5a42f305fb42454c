//! Run an [`Orchestrator`] on its own task, driven by [`Command`]s.
//!
//! ```rust,no_run
//! use voice_streaming::config::AppConfig;
//! use voice_streaming::orchestrator::{spawn, Orchestrator, Platform, SessionEvent};
//!
//! # async fn example() -> Result<(), voice_streaming::orchestrator::SessionError> {
//! let config = AppConfig::default();
//! let platform = Platform::native(&config);
//! let (orchestrator, mut events) = Orchestrator::new(config, platform);
//! let (session, task) = spawn(orchestrator);
//!
//! session.initialize("austyn").await?;
//! session.start().await?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::AiSentence(text) = event {
//!         println!("assistant: {text}");
//!     }
//! }
//! drop(session);
//! task.await.ok();
//! # Ok(())
//! # }
//! ```

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::events::ConversationEntry;
use super::metrics::MetricsSnapshot;
use super::session::{Orchestrator, SessionStatus};
use super::SessionError;

/// A request to the session task.  Every variant carries its reply slot.
#[derive(Debug)]
pub enum Command {
    Initialize {
        voice: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Start {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ChangeVoice {
        voice: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    AddContext {
        text: String,
        reply: oneshot::Sender<()>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    History {
        reply: oneshot::Sender<Vec<ConversationEntry>>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
}

impl Orchestrator {
    /// Serve `commands` and subsystem events until the command channel
    /// closes, then clean up.
    ///
    /// Commands take priority so a `stop` is never starved by a busy
    /// audio stream.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
                incoming = self.recv_incoming() => self.handle(incoming).await,
            }
        }

        log::info!("orchestrator: command channel closed, shutting down");
        if self.state().is_initialized() {
            self.cleanup().await;
        }
    }

    async fn execute(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::Initialize { voice, reply } => {
                let _ = reply.send(self.initialize(&voice).await);
            }
            Command::Start { reply } => {
                let _ = reply.send(self.start().await);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::ChangeVoice { voice, reply } => {
                let _ = reply.send(self.change_voice(&voice).await);
            }
            Command::AddContext { text, reply } => {
                self.add_context(&text);
                let _ = reply.send(());
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.metrics());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::History { reply } => {
                let _ = reply.send(self.conversation_history());
            }
            Command::Cleanup { reply } => {
                self.cleanup().await;
                let _ = reply.send(());
            }
        }
    }
}

/// Start `orchestrator` on a new task.  The task ends, after cleaning up,
/// once every [`SessionHandle`] clone is dropped.
pub fn spawn(orchestrator: Orchestrator) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(orchestrator.run(rx));
    (SessionHandle { commands: tx }, task)
}

/// Cloneable front-end handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn initialize(&self, voice: &str) -> Result<(), SessionError> {
        let voice = voice.to_string();
        self.call(|reply| Command::Initialize { voice, reply }).await?
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Start { reply }).await?
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Stop { reply }).await
    }

    pub async fn change_voice(&self, voice: &str) -> Result<(), SessionError> {
        let voice = voice.to_string();
        self.call(|reply| Command::ChangeVoice { voice, reply }).await?
    }

    pub async fn add_context(&self, text: &str) -> Result<(), SessionError> {
        let text = text.to_string();
        self.call(|reply| Command::AddContext { text, reply }).await
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot, SessionError> {
        self.call(|reply| Command::Metrics { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.call(|reply| Command::Status { reply }).await
    }

    pub async fn conversation_history(&self) -> Result<Vec<ConversationEntry>, SessionError> {
        self.call(|reply| Command::History { reply }).await
    }

    pub async fn cleanup(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Cleanup { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
