//! Console front end for a voice session.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load `.env`, then [`AppConfig`] from disk, then environment overrides.
//! 3. Build the native [`Platform`] and spawn the [`Orchestrator`].
//! 4. Initialise with the default voice.
//! 5. Read commands from stdin and print session events until `quit`.

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use voice_streaming::config::{load_dotenv, AppConfig};
use voice_streaming::orchestrator::{
    spawn, Orchestrator, Platform, SessionEvent, SessionHandle, Speaker,
};

const HELP: &str = "commands: start | stop | voice <name> | voices | metrics | history | status | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-streaming starting up");

    // 2. Configuration
    load_dotenv();
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    config.apply_env();
    let default_voice = config.default_voice.clone();
    let voice_names: Vec<String> = config.voices.keys().cloned().collect();

    // 3. Session
    let platform = Platform::native(&config);
    let (orchestrator, events) = Orchestrator::new(config, platform);
    let (session, task) = spawn(orchestrator);
    let printer = tokio::spawn(print_events(events));

    // 4. Bring everything up
    session
        .initialize(&default_voice)
        .await
        .with_context(|| format!("initialising with voice {default_voice:?}"))?;
    println!("{HELP}");

    // 5. Console loop
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let result = match (words.next(), words.next()) {
            (None, _) => continue,
            (Some("start"), _) => session.start().await,
            (Some("stop"), _) => session.stop().await,
            (Some("voice"), Some(name)) => session.change_voice(name).await,
            (Some("voices"), _) => {
                println!("{}", voice_names.join(", "));
                Ok(())
            }
            (Some("metrics"), _) => print_metrics(&session).await,
            (Some("history"), _) => print_history(&session).await,
            (Some("status"), _) => session.status().await.map(|s| println!("{s:#?}")),
            (Some("quit" | "exit"), _) => break,
            _ => {
                println!("{HELP}");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("error: {e}");
        }
    }

    session.cleanup().await?;
    drop(session);
    task.await.context("session task failed")?;
    printer.abort();
    log::info!("voice-streaming shut down");
    Ok(())
}

async fn print_metrics(session: &SessionHandle) -> Result<(), voice_streaming::orchestrator::SessionError> {
    let m = session.metrics().await?;
    println!(
        "avg total {} ms | stt {} ms | llm {} ms | tts {} ms | {} messages",
        m.average_total_ms, m.average_stt_ms, m.average_llm_ms, m.average_tts_ms, m.conversation_length
    );
    Ok(())
}

async fn print_history(session: &SessionHandle) -> Result<(), voice_streaming::orchestrator::SessionError> {
    for entry in session.conversation_history().await? {
        let who = match entry.speaker {
            Speaker::User => "you",
            Speaker::Assistant => "assistant",
        };
        println!("{who}: {}", entry.text);
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Initialized { voice, init_ms } => {
                println!("ready with {} ({init_ms} ms)", voice.label)
            }
            SessionEvent::StateChanged(state) => log::debug!("state: {state}"),
            SessionEvent::InterimTranscript(text) => println!("  … {text}"),
            SessionEvent::UserMessage(text) => println!("you: {text}"),
            SessionEvent::AiSentence(text) => println!("assistant: {text}"),
            SessionEvent::Interrupted => println!("(interrupted)"),
            SessionEvent::VoiceChanged(voice) => println!("voice: {}", voice.label),
            SessionEvent::Metrics(m) => println!(
                "turn {}: {} ms (avg {} ms)",
                m.turn,
                m.total.as_millis(),
                m.averages.average_total_ms
            ),
            SessionEvent::Error(report) => println!(
                "{} error{}: {}",
                report.subsystem,
                if report.terminal { " (session stopped)" } else { "" },
                report.message
            ),
            SessionEvent::Started => println!("listening"),
            SessionEvent::Stopped => println!("stopped"),
            _ => {}
        }
    }
}
