//! FIFO playback queue and its single playback loop.
//!
//! Chunks are pushed as they arrive from the network.  [`run_playback`]
//! takes them one at a time, decodes, and plays each to completion before
//! taking the next, so output is strictly ordered and never overlaps.
//! [`PlaybackQueue::interrupt`] cancels the chunk being played (the player
//! fades it out) and optionally empties the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::audio::{PlayOutcome, Player};

use super::{TtsError, TtsEvent};

/// One synthesised audio chunk, tagged with its arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub seq: u64,
    pub request_id: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptReport {
    /// A chunk was playing (or about to) and has been stopped.
    pub stopped: bool,
    /// Queued chunks dropped.
    pub dropped: usize,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<AudioChunk>,
    /// Stop handle of the chunk currently owned by the playback loop.
    current: Option<CancellationToken>,
    /// Between `PlaybackStarted` and `PlaybackFinished`.
    playing: bool,
    next_seq: u64,
}

#[derive(Default)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a chunk and return its sequence number.
    pub fn push(&self, request_id: u64, data: Vec<u8>) -> u64 {
        let seq = {
            let mut st = self.state.lock().unwrap();
            st.next_seq += 1;
            let seq = st.next_seq;
            st.chunks.push_back(AudioChunk {
                seq,
                request_id,
                data,
            });
            seq
        };
        self.wake.notify_one();
        seq
    }

    pub fn interrupt(&self, clear_queue: bool) -> InterruptReport {
        let mut st = self.state.lock().unwrap();
        let stopped = match st.current.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        let dropped = if clear_queue {
            let n = st.chunks.len();
            st.chunks.clear();
            n
        } else {
            0
        };
        InterruptReport { stopped, dropped }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    /// Pop the next chunk and register its stop handle in one step, so an
    /// interrupt can never miss a chunk that has just been taken.
    fn take_next(&self) -> Option<(AudioChunk, CancellationToken)> {
        let mut st = self.state.lock().unwrap();
        let chunk = st.chunks.pop_front()?;
        let token = CancellationToken::new();
        st.current = Some(token.clone());
        Some((chunk, token))
    }

    /// Returns `true` on the idle → playing edge.
    fn mark_playing(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        !std::mem::replace(&mut st.playing, true)
    }

    /// Release the current chunk.  Returns `true` on the playing → idle
    /// edge, i.e. nothing is left to play.
    fn settle(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        st.current = None;
        if st.chunks.is_empty() && st.playing {
            st.playing = false;
            return true;
        }
        false
    }
}

/// Drain `queue` through `player` until `shutdown` fires.
///
/// `fade` is read before every chunk so configuration changes apply to the
/// next interrupt.
pub async fn run_playback(
    queue: Arc<PlaybackQueue>,
    player: Arc<dyn Player>,
    fade: Arc<Mutex<Duration>>,
    events: mpsc::UnboundedSender<TtsEvent>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let Some((chunk, stop)) = queue.take_next() else {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = queue.wake.notified() => continue,
            }
        };

        if stop.is_cancelled() {
            log::debug!("tts: chunk {} interrupted before playback", chunk.seq);
        } else {
            match player.decode(&chunk.data) {
                Ok(audio) => {
                    if queue.mark_playing() {
                        let _ = events.send(TtsEvent::PlaybackStarted);
                    }
                    let fade = *fade.lock().unwrap();
                    match player.play(audio, stop, fade).await {
                        Ok(PlayOutcome::Finished) => {
                            log::debug!("tts: chunk {} played", chunk.seq);
                        }
                        Ok(PlayOutcome::Interrupted) => {
                            log::info!("tts: chunk {} interrupted", chunk.seq);
                        }
                        Err(e) => {
                            log::error!("tts: playback of chunk {} failed: {e}", chunk.seq);
                            let _ = events.send(TtsEvent::Error {
                                error: TtsError::Playback(e),
                                terminal: false,
                            });
                        }
                    }
                }
                Err(e) => log::warn!("tts: skipping chunk {}: {e}", chunk.seq),
            }
        }

        if queue.settle() {
            let _ = events.send(TtsEvent::PlaybackFinished);
        }
    }

    queue.interrupt(true);
    if queue.settle() {
        let _ = events.send(TtsEvent::PlaybackFinished);
    }
    log::debug!("tts: playback loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioOutput, RecordingOutput};

    struct Rig {
        queue: Arc<PlaybackQueue>,
        output: RecordingOutput,
        events: mpsc::UnboundedReceiver<TtsEvent>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn rig() -> Rig {
        let queue = Arc::new(PlaybackQueue::new());
        let output = RecordingOutput::new();
        let player = output.open().unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_playback(
            queue.clone(),
            player,
            Arc::new(Mutex::new(Duration::from_millis(50))),
            tx,
            shutdown.clone(),
        ));
        Rig {
            queue,
            output,
            events,
            shutdown,
            task,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TtsEvent>) -> Vec<TtsEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    // ---- ordering ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn chunks_play_in_order_without_overlap() {
        let mut r = rig();
        for (i, len) in [30usize, 10, 20, 5].iter().enumerate() {
            r.queue.push(1, vec![i as u8 + 1; *len]);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let records = r.output.records();
        let firsts: Vec<u8> = records.iter().map(|rec| rec.payload[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3, 4]);
        assert_eq!(r.output.max_concurrent(), 1);
        for pair in records.windows(2) {
            assert!(pair[0].ended <= pair[1].started);
        }
        assert_eq!(
            drain(&mut r.events),
            vec![TtsEvent::PlaybackStarted, TtsEvent::PlaybackFinished]
        );
        assert!(!r.queue.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_chunk_is_skipped() {
        let r = rig();
        r.queue.push(1, vec![9; 10]);
        r.queue.push(1, Vec::new());
        r.queue.push(1, vec![8; 10]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let firsts: Vec<u8> = r.output.records().iter().map(|rec| rec.payload[0]).collect();
        assert_eq!(firsts, vec![9, 8]);
    }

    // ---- interrupt ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_within_fade_and_clears_queue() {
        let mut r = rig();
        r.queue.push(1, vec![1; 1_000]);
        r.queue.push(1, vec![2; 1_000]);
        r.queue.push(2, vec![3; 1_000]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = r.queue.interrupt(true);
        assert_eq!(report, InterruptReport { stopped: true, dropped: 2 });
        assert!(r.queue.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let records = r.output.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, PlayOutcome::Interrupted);
        // 100 ms played, then the 50 ms fade.
        assert_eq!(records[0].ended - records[0].started, Duration::from_millis(150));
        assert_eq!(
            drain(&mut r.events),
            vec![TtsEvent::PlaybackStarted, TtsEvent::PlaybackFinished]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_without_clear_keeps_queue() {
        let r = rig();
        r.queue.push(1, vec![1; 1_000]);
        r.queue.push(1, vec![2; 20]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(r.queue.interrupt(false).dropped, 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let records = r.output.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].outcome, PlayOutcome::Finished);
    }

    #[tokio::test]
    async fn interrupt_when_idle_is_a_no_op() {
        let queue = PlaybackQueue::new();
        assert_eq!(queue.interrupt(true), InterruptReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_loop_and_releases_player() {
        let r = rig();
        r.queue.push(1, vec![1; 1_000]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        r.shutdown.cancel();
        r.queue.interrupt(true);
        r.task.await.unwrap();
        assert_eq!(r.output.open_handles(), 0);
    }
}
