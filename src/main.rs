//! livetalk - talk to the Gemini Live API from the terminal
//!
//! Streams the microphone, optionally sends a photo, forwards stdin lines as
//! text turns and prints the conversation as it completes. Speech is played
//! through PulseAudio.

use anyhow::Context;
use clap::Parser;
use livetalk::recorder::TurnRecorder;
use livetalk::video::{self, DEFAULT_MAX_EDGE};
use livetalk::{Session, SessionConfig, SessionEvent};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "livetalk")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Photo to send as a video frame once connected
    #[arg(long, value_name = "PATH")]
    image: Option<PathBuf>,

    /// Do not stream the microphone
    #[arg(long)]
    no_mic: bool,

    /// Record model speech and transcripts under this directory
    #[arg(long, value_name = "DIR")]
    record: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;

    let (session, mut events) = Session::new(SessionConfig::from_env());
    let mut recorder = TurnRecorder::new(cli.record.as_deref());

    session.connect(&api_key).await.context("failed to start live session")?;
    info!("Connected. Type a message and press enter; Ctrl-D or Ctrl-C to quit.");

    if !cli.no_mic {
        if let Err(e) = session.start_capture() {
            warn!("Continuing without microphone: {}", e);
        }
    }

    if let Some(path) = &cli.image {
        let jpeg = video::load_jpeg_frame(path, DEFAULT_MAX_EDGE)
            .with_context(|| format!("failed to load {}", path.display()))?;
        info!("Sending {} ({} bytes)", path.display(), jpeg.len());
        session.send_video_frame(&jpeg);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if !text.is_empty() {
                        session.send_text(text);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin: {}", e);
                    break;
                }
            },
            event = events.recv() => {
                let Some(event) = event else { break };
                recorder.on_event(&event);
                match event {
                    SessionEvent::Message(message) => {
                        println!("{}: {}", message.role.as_str(), message.content);
                    }
                    SessionEvent::Interrupted => println!("(interrupted)"),
                    SessionEvent::GoAway { time_left } => {
                        eprintln!("Server closing soon ({})", time_left.as_deref().unwrap_or("unknown"));
                    }
                    SessionEvent::Error(e) => eprintln!("Error: {}", e),
                    SessionEvent::Disconnected => {
                        eprintln!("Disconnected");
                        break;
                    }
                    SessionEvent::Connected | SessionEvent::Audio(_) | SessionEvent::TurnComplete => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect();
    recorder.finish();
    Ok(())
}
