//! drivemode - terminal front end for a drive mode session
//!
//! Reads push-to-talk and navigation commands from stdin and prints the
//! session status as it changes.

use anyhow::{Context, Result};
use clap::Parser;
use drivemode::api::{HttpAudioFetcher, HttpDriveApi};
use drivemode::audio::{InputStream, MediaBackend, Microphone, SilentMedia};
use drivemode::cli::{self, Args};
use drivemode::config::DriveConfig;
use drivemode::demo::DemoMicrophone;
use drivemode::error::CaptureError;
use drivemode::session::{
    Orchestrator, ResumeChoice, SessionEvent, SessionHandle, SessionParts, SessionSnapshot,
    UserInput, View,
};
use log::{debug, info, warn};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

const HELP: &str = "\
Commands:
  press / release    hold and release the mic button
  toggle             play or pause
  resume / new       answer the resume question
  select <n>         choose playlist n (1-based)
  back               return to the playlist screen
  key <n>            pick demo voice clip n while recording
  click              tap to let blocked audio start
  history            load listening history
  delete <id>        delete a history entry
  quit               end drive mode";

/// Stands in when no capture device is available. Opening it reports a
/// missing device, which lets the session switch to the demo voice.
struct NoMicrophone;

impl Microphone for NoMicrophone {
    fn open(&mut self) -> Result<Box<dyn InputStream>, CaptureError> {
        Err(CaptureError::DeviceNotFound)
    }

    fn describe(&self) -> &str {
        "no microphone"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cli::init_logging(&args);

    let mut config = DriveConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    info!("Starting drive mode against {}", config.api_base);

    let timeout = Duration::from_secs(config.request_timeout_secs);
    let api = HttpDriveApi::new(config.api_base.clone(), timeout)
        .context("Failed to build the Drive API client")?;
    let fetcher = HttpAudioFetcher::new(timeout).context("Failed to build the audio client")?;

    let parts = SessionParts {
        api: Arc::new(api),
        fetcher: Arc::new(fetcher),
        player_media: media_backend(&args),
        announcer_media: media_backend(&args),
        microphone: microphone(&args, &config),
    };
    let (orchestrator, handle) =
        Orchestrator::new(&config, parts).context("Invalid drive mode configuration")?;
    let SessionHandle {
        input,
        snapshots,
        events,
    } = handle;

    println!("{}", HELP);
    input
        .send(UserInput::Enter)
        .context("Session stopped before it started")?;
    tokio::spawn(read_commands(input));
    tokio::spawn(print_updates(snapshots, events));

    orchestrator.run().await;
    Ok(())
}

fn media_backend(args: &Args) -> Box<dyn MediaBackend> {
    #[cfg(feature = "pipewire")]
    if !args.no_audio {
        return Box::new(drivemode::audio::PipewireMedia::new());
    }
    #[cfg(not(feature = "pipewire"))]
    if !args.no_audio {
        debug!("Built without audio output; using the silent backend");
    }
    Box::new(SilentMedia::new())
}

fn microphone(args: &Args, config: &DriveConfig) -> Box<dyn Microphone> {
    if args.no_microphone {
        return match &config.demo_voice_dir {
            Some(dir) => Box::new(DemoMicrophone::new(dir.clone())),
            None => {
                warn!("--no-microphone without a demo voice directory; voice commands are off");
                Box::new(NoMicrophone)
            }
        };
    }
    #[cfg(feature = "pipewire")]
    let device: Box<dyn Microphone> = Box::new(drivemode::audio::PipewireMicrophone::new(
        config.capture.sample_rate,
    ));
    #[cfg(not(feature = "pipewire"))]
    let device: Box<dyn Microphone> = Box::new(NoMicrophone);
    device
}

async fn read_commands(input: UnboundedSender<UserInput>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        match parse_command(&line) {
            Ok(Some(command)) => {
                if input.send(command).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(message) => eprintln!("{}", message),
        }
    }
    let _ = input.send(UserInput::Close);
}

/// Parse one stdin line. Blank lines and `help` produce no input.
fn parse_command(line: &str) -> Result<Option<UserInput>, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let input = match command {
        "press" => UserInput::MicPress,
        "release" => UserInput::MicRelease,
        "toggle" => UserInput::TogglePlay,
        "resume" => UserInput::ResumeChoice(ResumeChoice::Resume),
        "new" => UserInput::ResumeChoice(ResumeChoice::New),
        "select" => {
            let n: usize = number(command, arg)?;
            if n == 0 {
                return Err("Playlists are numbered from 1".to_string());
            }
            UserInput::SelectPlaylist(n - 1)
        }
        "back" => UserInput::BackToSelection,
        "key" => UserInput::DemoKey(number(command, arg)?),
        "click" => UserInput::Gesture,
        "history" => UserInput::OpenHistory,
        "delete" => UserInput::DeleteHistory(number(command, arg)?),
        "quit" | "exit" => UserInput::Close,
        "help" => {
            println!("{}", HELP);
            return Ok(None);
        }
        other => return Err(format!("Unknown command {:?}; type help", other)),
    };
    Ok(Some(input))
}

fn number<T: FromStr>(command: &str, arg: Option<&str>) -> Result<T, String> {
    arg.and_then(|a| a.parse().ok())
        .ok_or_else(|| format!("{} needs a number", command))
}

async fn print_updates(
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut events: UnboundedReceiver<SessionEvent>,
) {
    let mut last = String::new();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = describe(&snapshots.borrow_and_update());
                if line != last {
                    println!("{}", line);
                    last = line;
                }
            }
            Some(event) = events.recv() => debug!("{:?}", event),
        }
    }
}

/// Status line for a snapshot. Progress is left out so the line only
/// changes when something the listener cares about does.
fn describe(snapshot: &SessionSnapshot) -> String {
    let mut line = format!("[{}] {}", snapshot.status, snapshot.status_message);
    if let Some(text) = &snapshot.recognized_text {
        line.push_str(&format!(" | heard \"{}\"", text));
    }
    match snapshot.view {
        View::Selection => {
            for (i, title) in snapshot.playlist_titles.iter().enumerate() {
                line.push_str(&format!("\n  {}. {}", i + 1, title));
            }
        }
        View::Playback => {
            if let Some(title) = &snapshot.current_title {
                let state = if snapshot.paused { "paused" } else { "now" };
                line.push_str(&format!(" | {}: {}", state, title));
            }
            if snapshot.queue_len > 0 {
                line.push_str(&format!(" | {} queued", snapshot.queue_len));
            }
        }
    }
    if snapshot.show_resume_choice {
        line.push_str("\n  resume or new?");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("press"), Ok(Some(UserInput::MicPress)));
        assert_eq!(parse_command("  select 2 "), Ok(Some(UserInput::SelectPlaylist(1))));
        assert_eq!(parse_command("delete 55"), Ok(Some(UserInput::DeleteHistory(55))));
        assert_eq!(
            parse_command("new"),
            Ok(Some(UserInput::ResumeChoice(ResumeChoice::New)))
        );
        assert_eq!(parse_command(""), Ok(None));
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(parse_command("select 0").is_err());
        assert!(parse_command("key").is_err());
        assert!(parse_command("dance").is_err());
    }
}
