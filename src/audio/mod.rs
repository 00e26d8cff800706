//! Audio engines
//!
//! This module provides:
//! - The playback engine with retry, degradation and position sync
//! - Push-to-talk capture with adaptive silence detection
//! - In-memory WAV encoding via hound
//! - PipeWire input and output (`pipewire` feature)

mod capture;
mod media;
mod playback;
#[cfg(feature = "pipewire")]
mod pipewire;
mod recorder;
mod silence;
mod source;

pub use capture::{
    calculate_rms, level_db, CaptureConfig, CaptureMsg, CaptureNotice, InputStream, Microphone,
    SharedCaptureState, StopReason, VoiceCapture, LEVEL_FLOOR_DB,
};
pub use media::{
    estimate_duration, MediaBackend, MediaErrorCode, MediaEvent, MediaEvents, MediaHandle,
    PlayRejection, SilentMedia, Transport,
};
pub use playback::{
    EngineMsg, PlayRequest, PlaybackConfig, PlaybackEngine, PlaybackFailure, PlaybackNotice,
    PositionReporter, TTS_GENERATION_FAILED,
};
#[cfg(feature = "pipewire")]
pub use pipewire::{PipewireMedia, PipewireMicrophone};
pub use recorder::{WavRecorder, WAV_MIME};
pub use silence::{SilenceConfig, SilenceDetector};
pub use source::{AudioFetcher, FetchedAudio};
