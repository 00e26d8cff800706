//! Command-line interface for drivemode
//!
//! Handles argument parsing, config overrides and logging configuration.

use crate::config::DriveConfig;
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// drivemode - Hands-free news playback driven by voice commands
#[derive(Parser, Debug)]
#[command(name = "drivemode")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = trace for HTTP too
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// JSON config file (defaults to ~/.config/drivemode/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the Drive API
    #[arg(long)]
    pub api_base: Option<String>,

    /// Origin serving the fixed-message assets
    #[arg(long)]
    pub static_base: Option<String>,

    #[arg(long)]
    pub user_id: Option<i64>,

    /// Record from the demo voice clips instead of a microphone
    #[arg(long, env = "DRIVE_TEST_NO_MICROPHONE")]
    pub no_microphone: bool,

    /// Discard audio output and play on a silent clock
    #[arg(long, env = "DRIVE_TEST_NO_AUDIO")]
    pub no_audio: bool,

    /// Directory with the demo voice command clips
    #[arg(long, env = "DRIVE_DEMO_VOICE_DIR")]
    pub demo_voice: Option<PathBuf>,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Command-line values take precedence over the config file
    pub fn apply(&self, config: &mut DriveConfig) {
        if let Some(api_base) = &self.api_base {
            config.api_base = api_base.clone();
        }
        if let Some(static_base) = &self.static_base {
            config.static_base = static_base.clone();
        }
        if let Some(user_id) = self.user_id {
            config.user_id = user_id;
        }
        if let Some(dir) = &self.demo_voice {
            config.demo_voice_dir = Some(dir.clone());
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("drivemode", args.log_level());

    // HTTP client internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("reqwest", args.log_level());
        builder.filter_module("hyper", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
