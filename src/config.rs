//! Drive mode configuration
//!
//! Loaded from a JSON file at `~/.config/drivemode/config.json` (or the path
//! given on the command line). Missing fields take their defaults, so an empty
//! object is a valid config.

use crate::audio::{CaptureConfig, PlaybackConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriveConfig {
    /// Base URL of the Drive API, e.g. `http://localhost:8080/api/drive`
    pub api_base: String,
    /// Origin serving `/static/audio/fixed/...`
    pub static_base: String,
    pub user_id: i64,
    pub voice_type: String,
    pub speed: f32,
    pub request_timeout_secs: u64,
    /// Directory with pre-recorded demo command clips
    pub demo_voice_dir: Option<PathBuf>,
    pub timings: Timings,
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080/api/drive".to_string(),
            static_base: "http://localhost:8080".to_string(),
            user_id: 1,
            voice_type: "nova".to_string(),
            speed: 1.0,
            request_timeout_secs: 30,
            demo_voice_dir: None,
            timings: Timings::default(),
            playback: PlaybackConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl DriveConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("drivemode")
            .join("config.json")
    }

    /// Load from `path`, or from the default location when it exists.
    /// Falls back to defaults when no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: DriveConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Speed formatted the way the TTS endpoints and asset names expect
    pub fn speed_label(&self) -> String {
        format!("{:.1}", self.speed)
    }
}

/// Session timing constants, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timings {
    pub command_cooldown_ms: u64,
    pub resume_choice_timeout_ms: u64,
    /// Total attempts for entry and command analysis calls
    pub call_attempts: u32,
    pub call_retry_delay_ms: u64,
    pub select_confirm_delay_ms: u64,
    pub success_revert_ms: u64,
    pub hint_revert_ms: u64,
    pub recognized_text_hide_ms: u64,
    pub min_message_visible_ms: u64,
    pub next_item_delay_ms: u64,
    pub volume_restore_delay_ms: u64,
    pub ducked_volume: f32,
    /// Blobs smaller than this are rejected before upload
    pub min_command_bytes: usize,
    /// Consecutive item failures that halt the queue
    pub max_item_failures: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            command_cooldown_ms: 1000,
            resume_choice_timeout_ms: 10_000,
            call_attempts: 3,
            call_retry_delay_ms: 2000,
            select_confirm_delay_ms: 1500,
            success_revert_ms: 2000,
            hint_revert_ms: 3000,
            recognized_text_hide_ms: 3000,
            min_message_visible_ms: 800,
            next_item_delay_ms: 2000,
            volume_restore_delay_ms: 100,
            ducked_volume: 0.2,
            min_command_bytes: 2000,
            max_item_failures: 3,
        }
    }
}

impl Timings {
    pub fn command_cooldown(&self) -> Duration {
        Duration::from_millis(self.command_cooldown_ms)
    }

    pub fn resume_choice_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_choice_timeout_ms)
    }

    pub fn call_retry_delay(&self) -> Duration {
        Duration::from_millis(self.call_retry_delay_ms)
    }

    pub fn select_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.select_confirm_delay_ms)
    }

    pub fn success_revert(&self) -> Duration {
        Duration::from_millis(self.success_revert_ms)
    }

    pub fn hint_revert(&self) -> Duration {
        Duration::from_millis(self.hint_revert_ms)
    }

    pub fn recognized_text_hide(&self) -> Duration {
        Duration::from_millis(self.recognized_text_hide_ms)
    }

    pub fn min_message_visible(&self) -> Duration {
        Duration::from_millis(self.min_message_visible_ms)
    }

    pub fn next_item_delay(&self) -> Duration {
        Duration::from_millis(self.next_item_delay_ms)
    }

    pub fn volume_restore_delay(&self) -> Duration {
        Duration::from_millis(self.volume_restore_delay_ms)
    }
}
