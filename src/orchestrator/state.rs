//! Session state machine.

use std::fmt;

/// Lifecycle of one conversation session.
///
/// ```text
/// Idle ──initialize──▶ Initializing ──all subsystems up──▶ Ready
///                            └──any failure──▶ Idle
/// Ready / Stopped ──start──▶ Listening ⇄ Speaking   (AI playback on / off)
/// Listening / Speaking ──stop or terminal error──▶ Stopped
/// any ──cleanup──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing held; `initialize` has not run or `cleanup` has.
    #[default]
    Idle,

    /// Microphone, STT and TTS are being brought up concurrently.
    Initializing,

    /// Every subsystem is connected; waiting for `start`.
    Ready,

    /// Capturing and transcribing; the assistant is silent.
    Listening,

    /// Assistant audio is playing.  Speech from the user is a barge-in.
    Speaking,

    /// Capture halted; connections stay open for the next `start`.
    Stopped,
}

impl SessionState {
    /// Returns `true` while the microphone is live.
    ///
    /// ```
    /// use voice_streaming::orchestrator::SessionState;
    ///
    /// assert!(!SessionState::Ready.is_active());
    /// assert!(SessionState::Listening.is_active());
    /// assert!(SessionState::Speaking.is_active());
    /// assert!(!SessionState::Stopped.is_active());
    /// ```
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    /// `true` once `initialize` has succeeded and until `cleanup`.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self,
            SessionState::Ready
                | SessionState::Listening
                | SessionState::Speaking
                | SessionState::Stopped
        )
    }

    /// A short label for logs and the console.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- is_active ---

    #[test]
    fn only_listening_and_speaking_are_active() {
        for state in [
            SessionState::Idle,
            SessionState::Initializing,
            SessionState::Ready,
            SessionState::Stopped,
        ] {
            assert!(!state.is_active(), "{state} should not be active");
        }
        assert!(SessionState::Listening.is_active());
        assert!(SessionState::Speaking.is_active());
    }

    // ---- is_initialized ---

    #[test]
    fn idle_and_initializing_are_not_initialized() {
        assert!(!SessionState::Idle.is_initialized());
        assert!(!SessionState::Initializing.is_initialized());
        assert!(SessionState::Ready.is_initialized());
        assert!(SessionState::Stopped.is_initialized());
    }

    // ---- label ---

    #[test]
    fn labels() {
        assert_eq!(SessionState::Idle.label(), "idle");
        assert_eq!(SessionState::Speaking.to_string(), "speaking");
        assert_eq!(SessionState::Stopped.label(), "stopped");
    }

    // ---- Default ---

    #[test]
    fn default_is_idle() {
        assert_eq!(SessionState::default(), SessionState::Idle);
    }
}
