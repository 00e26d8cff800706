//! PipeWire input and output
//!
//! [`PipewireMicrophone`] captures F32LE mono from the default source on a
//! dedicated thread and meters it through [`SharedCaptureState`].
//! [`PipewireMedia`] plays WAV payloads on the default sink. Other formats
//! report their estimated duration and then a format error, which the
//! playback engine turns into degraded playback.

use super::capture::{InputStream, Microphone, SharedCaptureState};
use super::media::{
    estimate_duration, MediaBackend, MediaErrorCode, MediaEvent, MediaEvents, MediaHandle,
    PlayRejection, Transport,
};
use super::recorder::WavRecorder;
use crate::error::{CaptureError, MediaError};
use crate::models::RecordedAudio;
use log::{debug, error, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const APP_NAME: &str = "Drive Mode";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);

enum PipeWireCommand {
    Stop,
}

/// Map a PipeWire startup failure onto the capture error classes
fn classify_start_error(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("not allowed") {
        CaptureError::PermissionDenied
    } else if lower.contains("busy") {
        CaptureError::DeviceBusy
    } else if lower.contains("connect to pipewire") || lower.contains("no such") {
        CaptureError::DeviceNotFound
    } else {
        CaptureError::Failed(message.to_string())
    }
}

/// Serialize a raw-audio EnumFormat pod requesting F32LE
fn format_pod(rate: Option<u32>, channels: Option<u32>) -> Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    if let Some(rate) = rate {
        audio_info.set_rate(rate);
    }
    if let Some(channels) = channels {
        audio_info.set_channels(channels);
    }

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

/// Default PipeWire source
pub struct PipewireMicrophone {
    sample_rate: u32,
}

impl PipewireMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Microphone for PipewireMicrophone {
    fn open(&mut self) -> Result<Box<dyn InputStream>, CaptureError> {
        let state = SharedCaptureState::new();
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

        let loop_state = state.clone();
        let sample_rate = self.sample_rate;
        let handle = thread::spawn(move || {
            let ready = ready_tx.clone();
            if let Err(e) = run_capture_loop(loop_state.clone(), sample_rate, receiver, ready_tx) {
                let _ = ready.send(Err(e.clone()));
                loop_state.set_error(classify_start_error(&e));
            }
        });

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => Ok(Box::new(PipewireInputStream {
                state,
                sender: Some(sender),
                thread: Some(handle),
                recorder: WavRecorder::new(self.sample_rate),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(classify_start_error(&e))
            }
            Err(_) => {
                let _ = sender.send(PipeWireCommand::Stop);
                Err(CaptureError::DeviceBusy)
            }
        }
    }

    fn describe(&self) -> &str {
        "PipeWire default source"
    }
}

struct PipewireInputStream {
    state: SharedCaptureState,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
    thread: Option<JoinHandle<()>>,
    recorder: WavRecorder,
}

impl PipewireInputStream {
    fn stop_loop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl InputStream for PipewireInputStream {
    fn has_audio_track(&self) -> bool {
        self.state.error().is_none()
    }

    fn level_db(&mut self) -> f32 {
        self.state.level_db()
    }

    fn finish(&mut self, _elapsed: Duration) -> Result<Option<RecordedAudio>, CaptureError> {
        self.stop_loop();
        if let Some(e) = self.state.error() {
            return Err(e);
        }
        let samples = self.state.take_samples();
        if samples.is_empty() {
            return Ok(None);
        }
        let rate = match self.state.sample_rate() {
            0 => self.recorder.sample_rate(),
            r => r,
        };
        WavRecorder::new(rate).encode(&samples).map(Some)
    }

    fn release(&mut self) {
        self.stop_loop();
    }
}

impl Drop for PipewireInputStream {
    fn drop(&mut self) {
        self.stop_loop();
    }
}

/// Main loop, context and core for one stream thread
fn connect_loop() -> Result<
    (
        pw::main_loop::MainLoopRc,
        pw::context::ContextRc,
        pw::core::CoreRc,
    ),
    String,
> {
    pw::init();
    let mainloop =
        pw::main_loop::MainLoopRc::new(None).map_err(|e| format!("PipeWire main loop: {}", e))?;
    let context =
        pw::context::ContextRc::new(&mainloop, None).map_err(|e| format!("PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("PipeWire connection: {}", e))?;
    Ok((mainloop, context, core))
}

/// Quit `mainloop` when the owning handle sends [`PipeWireCommand::Stop`]
fn quit_on_stop(
    mainloop: &pw::main_loop::MainLoopRc,
    receiver: pw::channel::Receiver<PipeWireCommand>,
) -> pw::channel::AttachedReceiver<'_, PipeWireCommand> {
    let weak = mainloop.downgrade();
    receiver.attach(mainloop.loop_(), move |PipeWireCommand::Stop| {
        if let Some(mainloop) = weak.upgrade() {
            mainloop.quit();
        }
    })
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    state: SharedCaptureState,
    sample_rate: u32,
    receiver: pw::channel::Receiver<PipeWireCommand>,
    ready: std_mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    let (mainloop, _context, core) = connect_loop()?;
    let _receiver = quit_on_stop(&mainloop, receiver);

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedCaptureState,
    }

    let user_data = UserData {
        format: Default::default(),
        state: state.clone(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "drivemode-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
                return;
            };
            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }
            if let Err(e) = user_data.format.parse(param) {
                warn!("Failed to parse capture format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1);
            let rate = user_data.format.rate();
            let n_samples = data.chunk().size() / (std::mem::size_of::<f32>() as u32);

            if let Some(raw_samples) = data.data() {
                // First channel only
                let mut mono = Vec::with_capacity((n_samples / n_channels) as usize);
                for i in (0..n_samples).step_by(n_channels as usize) {
                    let start = i as usize * std::mem::size_of::<f32>();
                    let end = start + std::mem::size_of::<f32>();
                    if end <= raw_samples.len() {
                        mono.push(f32::from_le_bytes(
                            raw_samples[start..end].try_into().unwrap_or([0; 4]),
                        ));
                    }
                }
                user_data.state.process_samples(&mono, rate);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod(Some(sample_rate), Some(1))?;
    let pod = Pod::from_bytes(&values).ok_or("Invalid audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));
    mainloop.run();
    Ok(())
}

/// Decoded samples shared with the output thread
#[derive(Clone, Default)]
struct SharedPlaybackState {
    inner: Arc<Mutex<PlaybackStateInner>>,
}

#[derive(Default)]
struct PlaybackStateInner {
    samples: Vec<f32>,
    sample_rate: u32,
    position: usize,
    volume: f32,
}

impl SharedPlaybackState {
    fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PlaybackStateInner {
                samples,
                sample_rate,
                position: 0,
                volume: 1.0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackStateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    fn seek(&self, seconds: f64) {
        let mut inner = self.lock();
        let target = (seconds.max(0.0) * inner.sample_rate as f64) as usize;
        inner.position = target.min(inner.samples.len());
    }

    fn set_volume(&self, volume: f32) {
        self.lock().volume = volume;
    }

    /// Next chunk for the output, advancing the position
    fn get_samples(&self, count: usize) -> Option<Vec<f32>> {
        let mut inner = self.lock();
        if inner.position >= inner.samples.len() {
            return None;
        }
        let end = (inner.position + count).min(inner.samples.len());
        let volume = inner.volume;
        let samples = inner.samples[inner.position..end]
            .iter()
            .map(|s| s * volume)
            .collect();
        inner.position = end;
        Some(samples)
    }
}

/// Decode a WAV payload to mono f32
fn decode_wav(payload: &[u8]) -> Option<(Vec<f32>, u32)> {
    let reader = hound::WavReader::new(Cursor::new(payload)).ok()?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>().ok()?,
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<Result<_, _>>()
                .ok()?
        }
    };
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Some((mono, spec.sample_rate))
}

/// Default PipeWire sink
#[derive(Debug, Default)]
pub struct PipewireMedia;

impl PipewireMedia {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for PipewireMedia {
    fn open(
        &mut self,
        payload: Vec<u8>,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaHandle>, MediaError> {
        let Some((samples, sample_rate)) = decode_wav(&payload) else {
            let duration = estimate_duration(&payload);
            debug!("Cannot decode {} bytes, estimated {:.1}s", payload.len(), duration);
            events.emit(MediaEvent::MetadataLoaded { duration });
            events.emit(MediaEvent::Error(MediaErrorCode::SourceNotSupported));
            return Ok(Box::new(PipewireHandle::undecodable(events, duration)));
        };
        if sample_rate == 0 {
            return Err(MediaError::Open("WAV with zero sample rate".to_string()));
        }

        let duration = samples.len() as f64 / sample_rate as f64;
        events.emit(MediaEvent::MetadataLoaded { duration });
        events.emit(MediaEvent::CanPlayThrough);
        Ok(Box::new(PipewireHandle {
            transport: Transport::new(events, duration),
            state: Some(SharedPlaybackState::new(samples, sample_rate)),
            output: None,
        }))
    }
}

struct Output {
    sender: pw::channel::Sender<PipeWireCommand>,
    thread: JoinHandle<()>,
}

struct PipewireHandle {
    transport: Transport,
    /// `None` when the payload could not be decoded
    state: Option<SharedPlaybackState>,
    output: Option<Output>,
}

impl PipewireHandle {
    fn undecodable(events: MediaEvents, duration: f64) -> Self {
        Self {
            transport: Transport::new(events, duration),
            state: None,
            output: None,
        }
    }

    fn stop_output(&mut self) {
        if let Some(output) = self.output.take() {
            let _ = output.sender.send(PipeWireCommand::Stop);
            let _ = output.thread.join();
        }
    }
}

impl MediaHandle for PipewireHandle {
    fn play(&mut self) -> Result<(), PlayRejection> {
        let Some(state) = self.state.clone() else {
            return Err(PlayRejection::Failed("Audio could not be decoded".to_string()));
        };
        if self.output.is_some() {
            return Ok(());
        }
        state.seek(self.transport.position());

        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let thread = thread::spawn(move || {
            if let Err(e) = run_playback_loop(state, receiver) {
                error!("Playback error: {}", e);
            }
        });
        self.output = Some(Output { sender, thread });
        self.transport.play();
        Ok(())
    }

    fn pause(&mut self) {
        self.stop_output();
        self.transport.pause();
    }

    fn position(&self) -> f64 {
        self.transport.position()
    }

    fn duration(&self) -> Option<f64> {
        Some(self.transport.duration())
    }

    fn seek(&mut self, position: f64) {
        let playing = self.output.is_some();
        self.stop_output();
        self.transport.seek(position);
        if let Some(state) = &self.state {
            state.seek(self.transport.position());
        }
        if playing {
            let _ = self.play();
        }
    }

    fn set_volume(&mut self, volume: f32) {
        if let Some(state) = &self.state {
            state.set_volume(volume);
        }
    }

    fn set_rate(&mut self, rate: f32) {
        // The sink plays at the payload rate; only the clock follows
        self.transport.set_rate(rate);
    }

    fn release(&mut self) {
        self.stop_output();
        self.transport.release();
        self.state = None;
    }
}

impl Drop for PipewireHandle {
    fn drop(&mut self) {
        self.stop_output();
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    state: SharedPlaybackState,
    receiver: pw::channel::Receiver<PipeWireCommand>,
) -> Result<(), String> {
    let (mainloop, _context, core) = connect_loop()?;
    let _receiver = quit_on_stop(&mainloop, receiver);

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedPlaybackState,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let sample_rate = state.sample_rate();
    let user_data = UserData {
        format: Default::default(),
        state,
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Speech",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "drivemode-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
                return;
            };
            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }
            if let Err(e) = user_data.format.parse(param) {
                warn!("Failed to parse playback format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;
            let Some(slice) = data.data() else {
                return;
            };
            let n_frames = slice.len() / stride;

            match user_data.state.get_samples(n_frames) {
                Some(samples) => {
                    for (i, &sample) in samples.iter().enumerate() {
                        let bytes = sample.to_le_bytes();
                        for channel in 0..n_channels {
                            let offset = i * stride + channel * 4;
                            if offset + 4 <= slice.len() {
                                slice[offset..offset + 4].copy_from_slice(&bytes);
                            }
                        }
                    }
                    let written = samples.len() * stride;
                    if written < slice.len() {
                        slice[written..].fill(0);
                    }

                    let chunk = data.chunk_mut();
                    *chunk.offset_mut() = 0;
                    *chunk.stride_mut() = stride as i32;
                    *chunk.size_mut() = written as u32;
                }
                None => {
                    if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                        mainloop.quit();
                    }
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod(Some(sample_rate), None)?;
    let pod = Pod::from_bytes(&values).ok_or("Invalid audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    mainloop.run();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_start_error() {
        assert_eq!(
            classify_start_error("Failed to connect to PipeWire: refused"),
            CaptureError::DeviceNotFound
        );
        assert_eq!(
            classify_start_error("Failed to connect stream: Device or resource busy"),
            CaptureError::DeviceBusy
        );
        assert_eq!(
            classify_start_error("Permission denied"),
            CaptureError::PermissionDenied
        );
        assert!(matches!(classify_start_error("odd"), CaptureError::Failed(_)));
    }

    #[test]
    fn test_decode_wav_mixes_to_mono() {
        let audio = WavRecorder::new(8000).encode(&[0.5; 800]).unwrap();
        let (samples, rate) = decode_wav(&audio.bytes).unwrap();
        assert_eq!(rate, 8000);
        assert_eq!(samples.len(), 800);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert!(decode_wav(b"ID3 not a wav").is_none());
    }

    #[test]
    fn test_playback_state_applies_volume() {
        let state = SharedPlaybackState::new(vec![1.0; 10], 10);
        state.set_volume(0.2);
        let chunk = state.get_samples(4).unwrap();
        assert_eq!(chunk.len(), 4);
        assert!((chunk[0] - 0.2).abs() < 1e-6);
        state.seek(0.9);
        assert_eq!(state.get_samples(4).unwrap().len(), 1);
        assert!(state.get_samples(4).is_none());
    }
}
