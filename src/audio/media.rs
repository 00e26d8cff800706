//! Media backend abstraction
//!
//! A playback engine hands a fetched payload to a [`MediaBackend`] and gets
//! back a [`MediaHandle`]. The handle reports readiness, progress, end and
//! errors as [`MediaEvent`]s through the sink it was opened with; the events
//! mirror an HTML media element so the engine's lifecycle rules stay the same
//! for every backend.

use crate::error::MediaError;
use log::debug;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Media error numbering, as used by HTML media elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaErrorCode {
    Aborted = 1,
    Network = 2,
    Decode = 3,
    SourceNotSupported = 4,
}

impl MediaErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(MediaErrorCode::Aborted),
            2 => Some(MediaErrorCode::Network),
            3 => Some(MediaErrorCode::Decode),
            4 => Some(MediaErrorCode::SourceNotSupported),
            _ => None,
        }
    }

    /// Decode and format errors can be degraded once metadata is known
    pub fn is_format_class(self) -> bool {
        matches!(
            self,
            MediaErrorCode::Decode | MediaErrorCode::SourceNotSupported
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            MediaErrorCode::Aborted => "Playback was aborted",
            MediaErrorCode::Network => "A network error interrupted the audio",
            MediaErrorCode::Decode => "The audio could not be decoded",
            MediaErrorCode::SourceNotSupported => "The audio format is not supported",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaEvent {
    MetadataLoaded { duration: f64 },
    CanPlayThrough,
    TimeUpdate { position: f64 },
    Ended,
    Error(MediaErrorCode),
}

/// Event sink handed to a backend when a payload is opened
#[derive(Clone)]
pub struct MediaEvents {
    sink: Arc<dyn Fn(MediaEvent) + Send + Sync>,
}

impl MediaEvents {
    pub fn new(sink: impl Fn(MediaEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn emit(&self, event: MediaEvent) {
        (self.sink)(event)
    }
}

/// Why `play` did not start
#[derive(Debug, Clone, PartialEq)]
pub enum PlayRejection {
    /// The output refuses to start without a user gesture
    NotAllowed,
    Failed(String),
}

pub trait MediaBackend: Send {
    fn open(
        &mut self,
        payload: Vec<u8>,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaHandle>, MediaError>;
}

/// One loaded audio resource
pub trait MediaHandle: Send {
    fn play(&mut self) -> Result<(), PlayRejection>;
    fn pause(&mut self);
    /// Current position in seconds
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn seek(&mut self, position: f64);
    fn set_volume(&mut self, volume: f32);
    fn set_rate(&mut self, rate: f32);
    /// Stop and free everything the handle holds
    fn release(&mut self);
}

/// Duration of a payload: exact for WAV, estimated at 128 kbit/s otherwise
pub fn estimate_duration(payload: &[u8]) -> f64 {
    if let Ok(reader) = hound::WavReader::new(Cursor::new(payload)) {
        let spec = reader.spec();
        if spec.sample_rate > 0 {
            return reader.duration() as f64 / spec.sample_rate as f64;
        }
    }
    payload.len() as f64 * 8.0 / 128_000.0
}

const TICK: Duration = Duration::from_millis(250);

/// A wall-clock playback position that emits time updates and the end
/// event while running. Backends without a real clock use it to drive
/// their events.
pub struct Transport {
    events: MediaEvents,
    duration: f64,
    position: f64,
    anchor: Option<Instant>,
    rate: f32,
    ticker: Option<JoinHandle<()>>,
}

impl Transport {
    pub fn new(events: MediaEvents, duration: f64) -> Self {
        Self {
            events,
            duration: duration.max(0.0),
            position: 0.0,
            anchor: None,
            rate: 1.0,
            ticker: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn position(&self) -> f64 {
        match self.anchor {
            Some(anchor) => {
                (self.position + anchor.elapsed().as_secs_f64() * self.rate as f64)
                    .min(self.duration)
            }
            None => self.position,
        }
    }

    pub fn play(&mut self) {
        if self.anchor.is_some() {
            return;
        }
        self.anchor = Some(Instant::now());
        self.spawn_ticker();
    }

    pub fn pause(&mut self) {
        self.position = self.position();
        self.anchor = None;
        if let Some(t) = self.ticker.take() {
            t.abort();
        }
    }

    pub fn seek(&mut self, position: f64) {
        let running = self.is_running();
        self.pause();
        self.position = position.clamp(0.0, self.duration);
        if running {
            self.play();
        }
    }

    pub fn set_rate(&mut self, rate: f32) {
        let running = self.is_running();
        self.pause();
        self.rate = rate.max(0.01);
        if running {
            self.play();
        }
    }

    pub fn release(&mut self) {
        self.pause();
    }

    fn spawn_ticker(&mut self) {
        let events = self.events.clone();
        let start_pos = self.position;
        let duration = self.duration;
        let rate = self.rate as f64;
        self.ticker = Some(tokio::spawn(async move {
            let start = Instant::now();
            loop {
                let pos = start_pos + start.elapsed().as_secs_f64() * rate;
                if pos + 1e-3 >= duration {
                    break;
                }
                events.emit(MediaEvent::TimeUpdate { position: pos });
                let left = Duration::from_secs_f64((duration - pos) / rate);
                time::sleep(left.min(TICK)).await;
            }
            events.emit(MediaEvent::TimeUpdate { position: duration });
            events.emit(MediaEvent::Ended);
        }));
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(t) = self.ticker.take() {
            t.abort();
        }
    }
}

/// Backend that produces no sound but runs the full event lifecycle on a
/// wall clock, for machines without audio output
#[derive(Debug, Default)]
pub struct SilentMedia;

impl SilentMedia {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for SilentMedia {
    fn open(
        &mut self,
        payload: Vec<u8>,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaHandle>, MediaError> {
        let duration = estimate_duration(&payload);
        debug!(
            "Silent media opened {} bytes ({:.1}s)",
            payload.len(),
            duration
        );
        events.emit(MediaEvent::MetadataLoaded { duration });
        events.emit(MediaEvent::CanPlayThrough);
        Ok(Box::new(SilentHandle {
            transport: Transport::new(events, duration),
        }))
    }
}

struct SilentHandle {
    transport: Transport,
}

impl MediaHandle for SilentHandle {
    fn play(&mut self) -> Result<(), PlayRejection> {
        self.transport.play();
        Ok(())
    }

    fn pause(&mut self) {
        self.transport.pause();
    }

    fn position(&self) -> f64 {
        self.transport.position()
    }

    fn duration(&self) -> Option<f64> {
        Some(self.transport.duration())
    }

    fn seek(&mut self, position: f64) {
        self.transport.seek(position);
    }

    fn set_volume(&mut self, _volume: f32) {}

    fn set_rate(&mut self, rate: f32) {
        self.transport.set_rate(rate);
    }

    fn release(&mut self) {
        self.transport.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn wav_bytes(seconds: f32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..(16000.0 * seconds) as usize {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_estimate_duration() {
        assert!((estimate_duration(&wav_bytes(1.5)) - 1.5).abs() < 1e-6);
        // 16 kB of mp3 at 128 kbit/s is one second
        assert!((estimate_duration(&vec![0u8; 16_000]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MediaErrorCode::from_u8(3), Some(MediaErrorCode::Decode));
        assert_eq!(MediaErrorCode::from_u8(9), None);
        assert!(MediaErrorCode::SourceNotSupported.is_format_class());
        assert!(!MediaErrorCode::Network.is_format_class());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_media_runs_to_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = MediaEvents::new(move |e| {
            let _ = tx.send(e);
        });
        let mut backend = SilentMedia::new();
        let mut handle = backend.open(wav_bytes(1.0), events).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(MediaEvent::MetadataLoaded { duration: 1.0 })
        );
        assert_eq!(rx.recv().await, Some(MediaEvent::CanPlayThrough));

        let started = Instant::now();
        handle.play().unwrap();
        loop {
            match rx.recv().await.unwrap() {
                MediaEvent::Ended => break,
                MediaEvent::TimeUpdate { position } => assert!(position <= 1.0),
                other => panic!("unexpected {:?}", other),
            }
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(999) && elapsed <= Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_pause_holds_position() {
        let events = MediaEvents::new(|_| {});
        let mut transport = Transport::new(events, 10.0);
        transport.play();
        time::sleep(Duration::from_secs(2)).await;
        transport.pause();
        let held = transport.position();
        time::sleep(Duration::from_secs(3)).await;
        assert!((transport.position() - held).abs() < 1e-9);
        assert!((held - 2.0).abs() < 0.01);
    }
}
