//! Adaptive relative-silence detection
//!
//! Speech is confirmed once enough time has passed and the loudest level seen
//! clears an absolute floor. After that, silence is measured relative to the
//! loudest level, so a noisy cabin does not keep the microphone open forever.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SilenceConfig {
    /// The observed maximum must exceed this before speech counts
    pub speech_floor_db: f32,
    pub confirm_after_ms: u64,
    /// Silence is anything this far below the observed maximum
    pub relative_drop_db: f32,
    /// Silence lasting this long ends the recording
    pub silence_hold_ms: u64,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            speech_floor_db: -45.0,
            confirm_after_ms: 400,
            relative_drop_db: 12.0,
            silence_hold_ms: 1500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SilenceDetector {
    config: SilenceConfig,
    max_level: f32,
    speech_confirmed: bool,
    silence_since: Option<Duration>,
}

impl SilenceDetector {
    pub fn new(config: SilenceConfig) -> Self {
        Self {
            config,
            max_level: f32::NEG_INFINITY,
            speech_confirmed: false,
            silence_since: None,
        }
    }

    pub fn speech_confirmed(&self) -> bool {
        self.speech_confirmed
    }

    pub fn max_level(&self) -> f32 {
        self.max_level
    }

    /// Feed one level sample taken `elapsed` after recording started.
    /// Returns true when the recording should stop.
    pub fn observe(&mut self, elapsed: Duration, level_db: f32) -> bool {
        self.max_level = self.max_level.max(level_db);

        if !self.speech_confirmed
            && elapsed >= Duration::from_millis(self.config.confirm_after_ms)
            && self.max_level > self.config.speech_floor_db
        {
            self.speech_confirmed = true;
        }
        if !self.speech_confirmed {
            return false;
        }

        if level_db < self.max_level - self.config.relative_drop_db {
            let since = *self.silence_since.get_or_insert(elapsed);
            elapsed.saturating_sub(since) >= Duration::from_millis(self.config.silence_hold_ms)
        } else {
            self.silence_since = None;
            false
        }
    }
}

impl Default for SilenceDetector {
    fn default() -> Self {
        Self::new(SilenceConfig::default())
    }
}
