//! End-to-end conversations against in-memory services.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voice_streaming::audio::{ChannelMicrophone, MicrophoneFeed, PlayOutcome, RecordingOutput};
use voice_streaming::config::AppConfig;
use voice_streaming::llm::{Script, ScriptedBackend};
use voice_streaming::orchestrator::{spawn, Orchestrator, Platform, SessionEvent, SessionHandle};
use voice_streaming::transport::{MemoryConnector, RemotePeer};

struct Rig {
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    stt: RemotePeer,
    /// Text of every synthesis request the fake TTS service received.
    synthesised: mpsc::UnboundedReceiver<String>,
    feed: MicrophoneFeed,
    output: RecordingOutput,
    _task: JoinHandle<()>,
}

/// A TTS service that answers every request with `audio_start`, two
/// chunks of `chunk_len` bytes and `audio_end`.
fn synthesis_service(mut peer: RemotePeer, chunk_len: usize) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(frame) = peer.recv_json().await {
            if frame["type"] != "tts" {
                continue;
            }
            let id = frame["request_id"].clone();
            let _ = tx.send(frame["text"].as_str().unwrap_or_default().to_string());
            peer.send_json(json!({ "type": "audio_start", "request_id": id }));
            for fill in [1u8, 2] {
                peer.send_json(json!({
                    "type": "audio_chunk",
                    "request_id": id,
                    "audio": BASE64.encode(vec![fill; chunk_len]),
                }));
            }
            peer.send_json(json!({ "type": "audio_end", "request_id": id }));
        }
    });
    rx
}

async fn rig(script: Script, chunk_len: usize) -> Rig {
    let (connector, mut peers) = MemoryConnector::new();
    let (mic, feed) = ChannelMicrophone::new(48_000, 2);
    let backend = ScriptedBackend::new();
    backend.push(script);
    let output = RecordingOutput::new();

    let mut config = AppConfig::default();
    config.stt.api_key = Some("dg-key".into());
    config.tts.api_key = Some("mm-key".into());
    config.tts.group_id = Some("group".into());

    let platform = Platform {
        microphone: Arc::new(mic),
        connector: Arc::new(connector),
        completions: Arc::new(backend),
        output: Arc::new(output.clone()),
    };
    let (orchestrator, events) = Orchestrator::new(config, platform);
    let (session, task) = spawn(orchestrator);

    let accept = async {
        let mut stt = None;
        let mut tts = None;
        while stt.is_none() || tts.is_none() {
            let mut peer = peers.recv().await.expect("connector dropped");
            if peer.request.url.contains("voice_id=") {
                let auth = peer.recv_json().await.expect("auth frame");
                assert_eq!(auth["voice_id"], "English_Trustworth_Man");
                peer.send_json(json!({ "type": "auth_success", "session_id": "it-1" }));
                tts = Some(peer);
            } else {
                stt = Some(peer);
            }
        }
        (stt.unwrap(), tts.unwrap())
    };
    let (init, (stt, tts)) = tokio::join!(session.initialize("austyn"), accept);
    init.unwrap();
    session.start().await.unwrap();

    Rig {
        session,
        events,
        stt,
        synthesised: synthesis_service(tts, chunk_len),
        feed,
        output,
        _task: task,
    }
}

fn final_transcript(text: &str) -> Value {
    json!({
        "type": "Results",
        "is_final": true,
        "speech_final": true,
        "channel": { "alternatives": [{ "transcript": text, "confidence": 0.98 }] }
    })
}

/// Collect session events until `done` says the scenario is over.
async fn collect_until<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut done: F) -> Vec<SessionEvent>
where
    F: FnMut(&[SessionEvent]) -> bool,
{
    let mut seen = Vec::new();
    while !done(&seen) {
        match tokio::time::timeout(Duration::from_secs(30), events.recv()).await {
            Ok(Some(SessionEvent::Volume(_))) => {}
            Ok(Some(ev)) => seen.push(ev),
            Ok(None) => panic!("session ended early; saw {seen:?}"),
            Err(_) => panic!("timed out; saw {seen:?}"),
        }
    }
    seen
}

fn position(seen: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
    seen.iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event missing from {seen:?}"))
}

fn sentences(seen: &[SessionEvent]) -> Vec<&str> {
    seen.iter()
        .filter_map(|e| match e {
            SessionEvent::AiSentence(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

// ---- end to end ---

#[tokio::test(start_paused = true)]
async fn jollof_order_flows_through_every_stage() {
    let script = Script::tokens(["Great choice! ", "Jollof rice ", "is coming right up."])
        .with_delay(Duration::from_millis(40));
    let mut rig = rig(script, 120).await;

    rig.stt.send_json(final_transcript("I want jollof rice"));
    let seen = collect_until(&mut rig.events, |seen| {
        seen.iter().any(|e| matches!(e, SessionEvent::Metrics(_)))
            && seen.iter().any(|e| *e == SessionEvent::AiSpeechEnd)
    })
    .await;

    let user = position(&seen, |e| *e == SessionEvent::UserMessage("I want jollof rice".into()));
    let first_sentence = position(&seen, |e| matches!(e, SessionEvent::AiSentence(_)));
    assert!(user < first_sentence);
    assert_eq!(sentences(&seen), vec!["Great choice!", "Jollof rice is coming right up."]);

    let audio = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::AiAudioChunk { .. }))
        .count();
    assert_eq!(audio, 4);

    let metrics = seen
        .iter()
        .find_map(|e| match e {
            SessionEvent::Metrics(m) => Some(*m),
            _ => None,
        })
        .unwrap();
    assert!(metrics.total > Duration::ZERO);
    assert!(metrics.total >= metrics.llm);
    assert!(metrics.averages.average_total_ms > 0);
    assert_eq!(metrics.averages.conversation_length, 2);

    // Sentences reached the synthesis service in generation order.
    assert_eq!(rig.synthesised.recv().await.as_deref(), Some("Great choice!"));
    assert_eq!(
        rig.synthesised.recv().await.as_deref(),
        Some("Jollof rice is coming right up.")
    );

    // Playback was strictly serialised and in arrival order.
    let records = rig.output.records();
    assert_eq!(records.len(), 4);
    assert_eq!(rig.output.max_concurrent(), 1);
    let fills: Vec<u8> = records.iter().map(|r| r.payload[0]).collect();
    assert_eq!(fills, vec![1, 2, 1, 2]);
    assert!(records.iter().all(|r| r.outcome == PlayOutcome::Finished));

    let history = rig.session.conversation_history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "I want jollof rice");
    assert_eq!(history[1].text, "Great choice! Jollof rice is coming right up.");
}

// ---- barge-in ---

#[tokio::test(start_paused = true)]
async fn speaking_over_the_assistant_cuts_it_off() {
    let script = Script::tokens([
        "Today we have jollof rice. ",
        "We also have pounded yam and egusi. ",
        "And for dessert there is puff-puff.",
    ])
    .with_delay(Duration::from_secs(1));
    let mut rig = rig(script, 3_000).await;

    rig.stt.send_json(final_transcript("what is on the menu"));
    collect_until(&mut rig.events, |seen| seen.contains(&SessionEvent::AiSpeechStart)).await;

    // The user starts talking while the first sentence plays.
    rig.feed.push_level(0.4, 4_096);
    let seen = collect_until(&mut rig.events, |seen| seen.contains(&SessionEvent::Interrupted)).await;
    assert!(seen.contains(&SessionEvent::UserSpeechStart));
    assert!(sentences(&seen).is_empty());

    // Long enough for the cancelled turn to have produced everything.
    rig.feed.push_level(0.0, 4_096);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut later = Vec::new();
    while let Ok(ev) = rig.events.try_recv() {
        later.push(ev);
    }
    assert!(sentences(&later).is_empty(), "stale sentences after barge-in: {later:?}");
    assert!(!later
        .iter()
        .any(|e| matches!(e, SessionEvent::AiMessageComplete(_) | SessionEvent::Metrics(_))));

    let records = rig.output.records();
    assert_eq!(records.len(), 1, "queued audio must not play after an interrupt");
    assert_eq!(records[0].outcome, PlayOutcome::Interrupted);
    assert_eq!(rig.synthesised.try_recv().as_deref(), Ok("Today we have jollof rice."));
    assert!(rig.synthesised.try_recv().is_err());

    let history = rig.session.conversation_history().await.unwrap();
    assert_eq!(history.len(), 1, "an interrupted reply is not recorded");
}
