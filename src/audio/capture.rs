//! Push-to-talk voice capture
//!
//! [`VoiceCapture`] owns at most one recording. It samples the input level on
//! a timer, feeds it to the silence detector and enforces a hard ceiling.
//! Microphones are behind the [`Microphone`] seam so the PipeWire input, the
//! demo clips and test fakes all share the same engine.

use super::silence::{SilenceConfig, SilenceDetector};
use crate::error::CaptureError;
use crate::models::RecordedAudio;
use crate::timers::{TimerFired, TimerRegistry};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;

/// Lowest level reported, for digital silence
pub const LEVEL_FLOOR_DB: f32 = -100.0;

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Level sampling period (about 60 Hz by default)
    pub sample_period_ms: u64,
    /// Hard ceiling on a single recording
    pub max_duration_ms: u64,
    /// Shorter recordings are discarded
    pub min_recording_ms: u64,
    /// Sample rate requested from real inputs
    pub sample_rate: u32,
    pub silence: SilenceConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 16,
            max_duration_ms: 10_000,
            min_recording_ms: 300,
            sample_rate: 16000,
            silence: SilenceConfig::default(),
        }
    }
}

/// A source of input streams
pub trait Microphone: Send {
    /// Acquire an input stream, classifying any failure
    fn open(&mut self) -> Result<Box<dyn InputStream>, CaptureError>;

    /// Pick a canned clip for the next recording. Only demo inputs have
    /// clips; their numbering depends on the screen.
    fn select_clip(&mut self, _key: u8, _selection_screen: bool) -> bool {
        false
    }

    fn describe(&self) -> &str;
}

/// One acquired input stream
pub trait InputStream: Send {
    fn has_audio_track(&self) -> bool;

    /// Current input level in dB, floored at [`LEVEL_FLOOR_DB`]
    fn level_db(&mut self) -> f32;

    /// Stop capturing and hand over the recording
    fn finish(&mut self, elapsed: Duration) -> Result<Option<RecordedAudio>, CaptureError>;

    /// Release the device. Must be safe to call more than once.
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureTimer {
    Sample,
    Ceiling,
}

#[derive(Debug)]
pub enum CaptureMsg {
    Timer(TimerFired<CaptureTimer>),
}

impl From<TimerFired<CaptureTimer>> for CaptureMsg {
    fn from(fired: TimerFired<CaptureTimer>) -> Self {
        CaptureMsg::Timer(fired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Silence,
    MaxDuration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureNotice {
    /// The engine stopped by itself; `audio` is what `stop_recording` returned
    AutoStop {
        reason: StopReason,
        audio: Option<RecordedAudio>,
    },
}

struct Recording {
    stream: Box<dyn InputStream>,
    started_at: Instant,
    detector: SilenceDetector,
}

pub struct VoiceCapture {
    config: CaptureConfig,
    microphone: Box<dyn Microphone>,
    timers: TimerRegistry<CaptureTimer, CaptureMsg>,
    recording: Option<Recording>,
}

impl VoiceCapture {
    pub fn new(
        config: CaptureConfig,
        microphone: Box<dyn Microphone>,
    ) -> (Self, UnboundedReceiver<CaptureMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let capture = Self {
            config,
            microphone,
            timers: TimerRegistry::new(tx),
            recording: None,
        };
        (capture, rx)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn microphone_name(&self) -> &str {
        self.microphone.describe()
    }

    /// Swap the input device, stopping any recording in progress
    pub fn replace_microphone(&mut self, microphone: Box<dyn Microphone>) {
        self.abort();
        info!("Using microphone: {}", microphone.describe());
        self.microphone = microphone;
    }

    pub fn select_clip(&mut self, key: u8, selection_screen: bool) -> bool {
        self.microphone.select_clip(key, selection_screen)
    }

    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.recording.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let mut stream = self.microphone.open()?;
        if !stream.has_audio_track() {
            stream.release();
            return Err(CaptureError::NoAudioTrack);
        }

        self.timers.schedule_repeating(
            CaptureTimer::Sample,
            Duration::from_millis(self.config.sample_period_ms.max(1)),
        );
        self.timers.schedule(
            CaptureTimer::Ceiling,
            Duration::from_millis(self.config.max_duration_ms),
        );
        self.recording = Some(Recording {
            stream,
            started_at: Instant::now(),
            detector: SilenceDetector::new(self.config.silence.clone()),
        });
        debug!("Recording started on {}", self.microphone.describe());
        Ok(())
    }

    /// Stop and return the recording, or `None` when nothing usable was
    /// captured. Always releases the stream and the sampling timers.
    pub fn stop_recording(&mut self) -> Option<RecordedAudio> {
        self.timers.clear_all();
        let mut recording = self.recording.take()?;
        let elapsed = recording.started_at.elapsed();

        let audio = recording.stream.finish(elapsed);
        recording.stream.release();

        if elapsed < Duration::from_millis(self.config.min_recording_ms) {
            debug!("Discarding {}ms recording", elapsed.as_millis());
            return None;
        }
        match audio {
            Ok(audio) => {
                if let Some(a) = &audio {
                    debug!("Recorded {}ms, {} bytes", elapsed.as_millis(), a.len());
                }
                audio
            }
            Err(e) => {
                warn!("Failed to finish recording: {}", e);
                None
            }
        }
    }

    /// Drop any recording without producing audio
    pub fn abort(&mut self) {
        self.timers.clear_all();
        if let Some(mut recording) = self.recording.take() {
            recording.stream.release();
        }
    }

    pub fn handle(&mut self, msg: CaptureMsg) -> Option<CaptureNotice> {
        let CaptureMsg::Timer(fired) = msg;
        if !self.timers.accept(&fired) {
            return None;
        }
        match fired.kind {
            CaptureTimer::Sample => {
                let recording = self.recording.as_mut()?;
                let elapsed = recording.started_at.elapsed();
                let level = recording.stream.level_db();
                if recording.detector.observe(elapsed, level) {
                    info!("Silence detected after {}ms", elapsed.as_millis());
                    return Some(self.auto_stop(StopReason::Silence));
                }
                None
            }
            CaptureTimer::Ceiling => {
                self.recording.as_ref()?;
                info!("Recording hit the {}ms ceiling", self.config.max_duration_ms);
                Some(self.auto_stop(StopReason::MaxDuration))
            }
        }
    }

    fn auto_stop(&mut self, reason: StopReason) -> CaptureNotice {
        let audio = self.stop_recording();
        CaptureNotice::AutoStop { reason, audio }
    }
}

impl Drop for VoiceCapture {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Shared state between a real-time input callback and the engine
#[derive(Clone, Default)]
pub struct SharedCaptureState {
    inner: Arc<Mutex<CaptureStateInner>>,
}

#[derive(Default)]
struct CaptureStateInner {
    /// Level of the most recent buffer
    level_db: Option<f32>,
    samples: Vec<f32>,
    sample_rate: u32,
    error: Option<CaptureError>,
}

impl SharedCaptureState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureStateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn level_db(&self) -> f32 {
        self.lock().level_db.unwrap_or(LEVEL_FLOOR_DB)
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    pub fn take_samples(&self) -> Vec<f32> {
        std::mem::take(&mut self.lock().samples)
    }

    pub fn error(&self) -> Option<CaptureError> {
        self.lock().error.clone()
    }

    pub fn set_error(&self, error: CaptureError) {
        self.lock().error = Some(error);
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.level_db = None;
        inner.error = None;
    }

    /// Process incoming mono samples
    pub fn process_samples(&self, samples: &[f32], sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.sample_rate = sample_rate;
        inner.level_db = Some(level_db(samples));
        inner.samples.extend_from_slice(samples);
    }
}

/// Calculate RMS volume from samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Signal energy as dB relative to full scale
pub fn level_db(samples: &[f32]) -> f32 {
    let rms = calculate_rms(samples);
    if rms <= 0.0 {
        return LEVEL_FLOOR_DB;
    }
    (20.0 * rms.log10()).max(LEVEL_FLOOR_DB)
}
