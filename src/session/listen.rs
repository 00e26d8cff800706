//! Listening time for history records: wall time minus paused time

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct ListenTracker {
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl ListenTracker {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.paused_at = None;
        self.paused_total = Duration::ZERO;
    }

    pub fn pause(&mut self) {
        if self.started.is_some() && self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Whole seconds listened so far
    pub fn elapsed_secs(&self) -> u32 {
        let Some(started) = self.started else {
            return 0;
        };
        let now = Instant::now();
        let mut paused = self.paused_total;
        if let Some(at) = self.paused_at {
            paused += now.saturating_duration_since(at);
        }
        now.saturating_duration_since(started)
            .saturating_sub(paused)
            .as_secs() as u32
    }

    /// Stop tracking and return the whole seconds listened
    pub fn finish(&mut self) -> u32 {
        let secs = self.elapsed_secs();
        self.reset();
        secs
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
