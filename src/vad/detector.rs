//! Sampling loop that turns microphone audio into [`VadEvent`]s.
//!
//! # Lifecycle
//!
//! ```text
//! new ──initialize──▶ device held ──start──▶ sampling ──stop──▶ device held
//!                          └───────────── cleanup ─────────────▶ released
//! ```
//!
//! While sampling, a task wakes every `tick_ms`, drains whatever frames the
//! capture thread delivered, computes the RMS over the most recent
//! `analysis_window` mono samples, smooths it, and feeds the
//! [`VadStateMachine`].  The task owns the [`MicrophoneStream`] and hands it
//! back when stopped, so a later `start` reuses the same device handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::{CaptureError, Microphone, MicrophoneStream};
use crate::config::VadConfig;

use super::state::{
    rms, PreSpeechBuffer, VadStateMachine, VadTransition, VolumeSample, VolumeSmoother,
};
use super::{MicrophoneCheck, VadEvent, VadStatus};

/// How long `test_microphone` waits for a frame when idle.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<MicrophoneStream>,
}

/// Voice-activity detector; see the module docs.
pub struct VoiceActivityDetector {
    microphone: Arc<dyn Microphone>,
    config_tx: watch::Sender<VadConfig>,
    events: mpsc::UnboundedSender<VadEvent>,
    stream: Option<MicrophoneStream>,
    running: Option<Running>,
    speaking: Arc<AtomicBool>,
    last_volume: Arc<AtomicU32>,
}

impl VoiceActivityDetector {
    /// Create a detector and the receiver its events arrive on.
    pub fn new(
        config: VadConfig,
        microphone: Arc<dyn Microphone>,
    ) -> (Self, mpsc::UnboundedReceiver<VadEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (config_tx, _) = watch::channel(config);
        (
            Self {
                microphone,
                config_tx,
                events,
                stream: None,
                running: None,
                speaking: Arc::new(AtomicBool::new(false)),
                last_volume: Arc::new(AtomicU32::new(0f32.to_bits())),
            },
            rx,
        )
    }

    /// Acquire the capture device.  Calling it again while the device is
    /// held is a no-op.
    pub async fn initialize(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_some() || self.running.is_some() {
            return Ok(());
        }
        let microphone = self.microphone.clone();
        let stream = tokio::task::spawn_blocking(move || microphone.open())
            .await
            .map_err(|e| CaptureError::Stream(format!("capture task failed: {e}")))?
            .map_err(|e| {
                log::error!("vad: initialisation failed: {e}");
                let _ = self.events.send(VadEvent::Error(e.clone()));
                e
            })?;
        log::info!(
            "vad: initialised ({} Hz, {} ch)",
            stream.sample_rate,
            stream.channels
        );
        self.stream = Some(stream);
        let _ = self.events.send(VadEvent::Initialized);
        Ok(())
    }

    /// Begin sampling.  Fails with `DeviceUnavailable` if [`initialize`]
    /// has not succeeded; a second call while running is a no-op.
    ///
    /// [`initialize`]: Self::initialize
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.running.is_some() {
            log::warn!("vad: already listening");
            return Ok(());
        }
        let stream = self.stream.take().ok_or_else(|| {
            CaptureError::DeviceUnavailable("detector not initialised".into())
        })?;

        self.speaking.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let sampler = Sampler {
            config_rx: self.config_tx.subscribe(),
            events: self.events.clone(),
            speaking: self.speaking.clone(),
            last_volume: self.last_volume.clone(),
        };
        let handle = tokio::spawn(sampler.run(stream, cancel.clone()));
        self.running = Some(Running { cancel, handle });

        log::info!("vad: started");
        let _ = self.events.send(VadEvent::Started);
        Ok(())
    }

    /// Stop sampling and keep the device for a later [`start`](Self::start).
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            log::debug!("vad: stop while not listening");
            return;
        };
        running.cancel.cancel();
        match running.handle.await {
            Ok(stream) => self.stream = Some(stream),
            Err(e) => log::warn!("vad: sampling task ended abnormally: {e}"),
        }
        self.speaking.store(false, Ordering::SeqCst);
        log::info!("vad: stopped");
        let _ = self.events.send(VadEvent::Stopped);
    }

    /// Stop, release the device and reset all state.  Idempotent.
    pub async fn cleanup(&mut self) {
        self.stop().await;
        if self.stream.take().is_some() {
            log::info!("vad: device released");
        }
        self.speaking.store(false, Ordering::SeqCst);
        self.last_volume.store(0f32.to_bits(), Ordering::SeqCst);
        let _ = self.events.send(VadEvent::CleanedUp);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.running.is_some()
    }

    pub fn status(&self) -> VadStatus {
        VadStatus {
            initialized: self.stream.is_some() || self.running.is_some(),
            listening: self.is_listening(),
            speaking: self.is_speaking(),
            volume: f32::from_bits(self.last_volume.load(Ordering::SeqCst)),
        }
    }

    pub fn config(&self) -> VadConfig {
        self.config_tx.borrow().clone()
    }

    /// Replace thresholds and timings; a running loop picks them up on its
    /// next tick.
    pub fn update_config(&self, config: VadConfig) {
        self.config_tx.send_replace(config);
        log::info!("vad: configuration updated");
    }

    /// One-shot level probe.  Initialises the device if needed.
    ///
    /// While sampling, the most recent smoothed level is reported; otherwise
    /// the next captured frame is measured directly.
    pub async fn test_microphone(&mut self) -> Result<MicrophoneCheck, CaptureError> {
        let threshold = self.config_tx.borrow().silence_threshold;
        if self.running.is_some() {
            let volume = f32::from_bits(self.last_volume.load(Ordering::SeqCst));
            return Ok(MicrophoneCheck::new(volume, threshold));
        }

        self.initialize().await?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(CaptureError::DeviceUnavailable("detector not initialised".into()));
        };
        let volume = match tokio::time::timeout(PROBE_TIMEOUT, stream.frames.recv()).await {
            Ok(Some(frame)) => rms(&frame.to_mono()),
            Ok(None) => return Err(CaptureError::Stream("capture stream ended".into())),
            Err(_) => 0.0,
        };
        Ok(MicrophoneCheck::new(volume, threshold))
    }
}

impl Drop for VoiceActivityDetector {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler task
// ---------------------------------------------------------------------------

struct Sampler {
    config_rx: watch::Receiver<VadConfig>,
    events: mpsc::UnboundedSender<VadEvent>,
    speaking: Arc<AtomicBool>,
    last_volume: Arc<AtomicU32>,
}

impl Sampler {
    async fn run(mut self, mut stream: MicrophoneStream, cancel: CancellationToken) -> MicrophoneStream {
        let mut config = self.config_rx.borrow_and_update().clone();
        let mut machine = VadStateMachine::new(&config);
        let mut smoother = VolumeSmoother::new(config.smoothing_samples);
        let mut lookback = PreSpeechBuffer::new(Duration::from_millis(config.pre_speech_buffer_ms));
        let mut window: VecDeque<f32> = VecDeque::with_capacity(config.analysis_window);

        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.config_rx.has_changed().unwrap_or(false) {
                let fresh = self.config_rx.borrow_and_update().clone();
                machine.reconfigure(&fresh);
                smoother.resize(fresh.smoothing_samples);
                lookback.set_window(Duration::from_millis(fresh.pre_speech_buffer_ms));
                if fresh.tick_ms != config.tick_ms {
                    ticker = tokio::time::interval(Duration::from_millis(fresh.tick_ms.max(1)));
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
                config = fresh;
            }

            // Drain everything captured since the last tick.
            loop {
                match stream.frames.try_recv() {
                    Ok(frame) => window.extend(frame.to_mono()),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        log::error!("vad: capture stream ended");
                        let _ = self.events.send(VadEvent::Error(CaptureError::Stream(
                            "capture stream ended".into(),
                        )));
                        self.speaking.store(false, Ordering::SeqCst);
                        return stream;
                    }
                }
            }
            let excess = window.len().saturating_sub(config.analysis_window.max(1));
            window.drain(..excess);

            let now = Instant::now();
            let level = rms(window.make_contiguous());
            let volume = smoother.push(level);
            self.last_volume.store(volume.to_bits(), Ordering::SeqCst);

            lookback.push(VolumeSample { volume, at: now });
            let _ = self.events.send(VadEvent::Volume(volume));

            match machine.feed(volume, now) {
                Some(VadTransition::SpeechStart) => {
                    self.speaking.store(true, Ordering::SeqCst);
                    log::debug!("vad: speech started");
                    let _ = self.events.send(VadEvent::SpeechStart {
                        at: now,
                        pre_speech: lookback.snapshot(),
                    });
                }
                Some(VadTransition::SpeechEnd) => {
                    self.speaking.store(false, Ordering::SeqCst);
                    log::debug!("vad: speech ended");
                    let _ = self.events.send(VadEvent::SpeechEnd { at: now });
                }
                None => {}
            }
        }

        stream
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ChannelMicrophone;

    fn detector() -> (
        VoiceActivityDetector,
        mpsc::UnboundedReceiver<VadEvent>,
        crate::audio::MicrophoneFeed,
    ) {
        let (mic, feed) = ChannelMicrophone::new(16_000, 1);
        let (vad, rx) = VoiceActivityDetector::new(VadConfig::default(), Arc::new(mic));
        (vad, rx, feed)
    }

    /// Drain events until `pred` matches or the channel stays quiet.
    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<VadEvent>, mut pred: F) -> Option<VadEvent>
    where
        F: FnMut(&VadEvent) -> bool,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ev)) if pred(&ev) => return Some(ev),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn start_before_initialize_fails() {
        let (mut vad, _rx, _feed) = detector();
        assert!(matches!(vad.start(), Err(CaptureError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn initialize_propagates_device_unavailable() {
        let (mic, _feed) = ChannelMicrophone::new(16_000, 1);
        mic.fail_next(CaptureError::DeviceUnavailable("permission denied".into()));
        let (mut vad, mut rx) = VoiceActivityDetector::new(VadConfig::default(), Arc::new(mic));
        let err = vad.initialize().await.unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        assert!(matches!(rx.recv().await, Some(VadEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn loud_input_produces_speech_start_then_end() {
        let (mut vad, mut rx, feed) = detector();
        vad.initialize().await.unwrap();
        vad.start().unwrap();

        feed.push_level(0.3, 2048);
        let start = wait_for(&mut rx, |e| matches!(e, VadEvent::SpeechStart { .. })).await;
        match start {
            Some(VadEvent::SpeechStart { pre_speech, .. }) => assert!(!pre_speech.is_empty()),
            other => panic!("expected speech start, got {other:?}"),
        }
        assert!(vad.is_speaking());

        feed.push_level(0.0, 2048);
        let end = wait_for(&mut rx, |e| matches!(e, VadEvent::SpeechEnd { .. })).await;
        assert!(end.is_some());
        assert!(!vad.is_speaking());

        vad.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_input_only_reports_volume() {
        let (mut vad, mut rx, feed) = detector();
        vad.initialize().await.unwrap();
        vad.start().unwrap();
        feed.push_level(0.001, 2048);

        tokio::time::sleep(Duration::from_secs(2)).await;
        vad.stop().await;

        let mut volumes = 0;
        while let Ok(ev) = rx.try_recv() {
            assert!(
                !matches!(ev, VadEvent::SpeechStart { .. }),
                "quiet input must not start speech"
            );
            if matches!(ev, VadEvent::Volume(_)) {
                volumes += 1;
            }
        }
        assert!(volumes > 50, "expected ~60 Hz volume events, got {volumes}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_device_and_restart_works() {
        let (mut vad, _rx, feed) = detector();
        vad.initialize().await.unwrap();
        vad.start().unwrap();
        vad.stop().await;
        assert!(vad.status().initialized);
        assert!(!vad.status().listening);
        assert_eq!(feed.listeners(), 1);

        vad.start().unwrap();
        assert!(vad.is_listening());
        vad.cleanup().await;
        assert_eq!(feed.listeners(), 0);
        // Idempotent.
        vad.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn raised_threshold_applies_on_next_tick() {
        let (mut vad, mut rx, feed) = detector();
        vad.initialize().await.unwrap();
        let mut cfg = vad.config();
        cfg.silence_threshold = 0.9;
        vad.update_config(cfg);
        vad.start().unwrap();
        feed.push_level(0.3, 2048);

        tokio::time::sleep(Duration::from_secs(1)).await;
        vad.stop().await;
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(ev, VadEvent::SpeechStart { .. }));
        }
    }

    #[tokio::test]
    async fn test_microphone_measures_a_frame() {
        let (mut vad, _rx, feed) = detector();
        vad.initialize().await.unwrap();
        feed.push_level(0.5, 512);
        let check = vad.test_microphone().await.unwrap();
        assert!(check.working);
        assert!((check.volume - 0.5).abs() < 1e-4);
        assert!((check.threshold - 0.01).abs() < f32::EPSILON);
    }
}
