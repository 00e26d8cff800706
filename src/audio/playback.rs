//! Playback engine
//!
//! Owns at most one audio resource at a time. `play` tears down whatever was
//! active, fetches the payload on a spawned task, opens it in the media
//! backend and drives the load → play → progress → end/error lifecycle.
//! Everything asynchronous (fetch results, media events, timers) comes back
//! as an [`EngineMsg`] on the engine's channel; the owner feeds those into
//! [`PlaybackEngine::handle`] and gets [`PlaybackNotice`]s in return.
//!
//! Messages are stamped with the engine generation, which moves on every
//! `play` and `stop`, so events from a released resource are dropped.

use super::media::{
    MediaBackend, MediaErrorCode, MediaEvent, MediaEvents, MediaHandle, PlayRejection,
};
use super::source::{AudioFetcher, FetchedAudio};
use crate::error::{FetchError, MediaError};
use crate::timers::{TimerFired, TimerRegistry};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Server error code that marks a transient synthesis failure
pub const TTS_GENERATION_FAILED: &str = "TTS_GENERATION_FAILED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Retries after the first attempt for transient server or network failures
    pub max_tts_retries: u32,
    /// Delay before retry n (0-based); the last entry repeats
    pub retry_delays_ms: Vec<u64>,
    /// Start this long after metadata loads if can-play-through has not fired
    pub start_grace_ms: u64,
    pub synthetic_tick_ms: u64,
    pub sync_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_tts_retries: 2,
            retry_delays_ms: vec![3000, 5000],
            start_grace_ms: 300,
            synthetic_tick_ms: 100,
            sync_interval_ms: 5000,
        }
    }
}

impl PlaybackConfig {
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .retry_delays_ms
            .get(attempt as usize)
            .or_else(|| self.retry_delays_ms.last())
            .copied()
            .unwrap_or(3000);
        Duration::from_millis(ms)
    }

    fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    fn synthetic_tick(&self) -> Duration {
        Duration::from_millis(self.synthetic_tick_ms)
    }

    fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Receives periodic position reports for items while they play
#[async_trait]
pub trait PositionReporter: Send + Sync {
    async fn report(&self, item_id: &str, position_secs: f64);
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub url: String,
    /// `None` for announcements
    pub item: Option<String>,
    /// Seconds to seek to once metadata is known
    pub start_offset: f64,
    pub retry_attempt: u32,
}

impl PlayRequest {
    pub fn announcement(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            item: None,
            start_offset: 0.0,
            retry_attempt: 0,
        }
    }

    pub fn item(url: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            item: Some(item.into()),
            start_offset: 0.0,
            retry_attempt: 0,
        }
    }

    pub fn with_start_offset(mut self, seconds: f64) -> Self {
        self.start_offset = seconds.max(0.0);
        self
    }
}

/// Terminal failure of one play request
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFailure {
    pub item: Option<String>,
    pub code: MediaErrorCode,
    pub message: String,
    /// Code from a structured server error body
    pub server_code: Option<String>,
    pub from_server: bool,
    pub ever_played: bool,
    pub metadata_loaded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    Retrying {
        item: Option<String>,
        attempt: u32,
        delay: Duration,
    },
    Started {
        item: Option<String>,
    },
    Progress {
        item: Option<String>,
        percent: f64,
    },
    Paused {
        item: Option<String>,
    },
    Resumed {
        item: Option<String>,
    },
    Ended {
        item: Option<String>,
    },
    /// Decoding failed after load; progress continues on a synthetic clock
    Degraded {
        item: Option<String>,
        code: MediaErrorCode,
    },
    Failed(PlaybackFailure),
    /// Output refused to start without a user gesture
    AutoplayBlocked {
        item: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineTimer {
    Retry,
    StartGrace,
    SyntheticTick,
    Sync,
}

#[derive(Debug)]
pub enum EngineMsg {
    Fetched {
        generation: u64,
        result: Result<FetchedAudio, FetchError>,
    },
    Media {
        generation: u64,
        event: MediaEvent,
    },
    Timer(TimerFired<EngineTimer>),
}

impl From<TimerFired<EngineTimer>> for EngineMsg {
    fn from(fired: TimerFired<EngineTimer>) -> Self {
        EngineMsg::Timer(fired)
    }
}

/// Elapsed unpaused wall time from a base position
struct SyntheticClock {
    base: f64,
    since: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl SyntheticClock {
    fn new(base: f64, paused: bool) -> Self {
        let now = Instant::now();
        Self {
            base,
            since: now,
            paused_at: paused.then_some(now),
            paused_total: Duration::ZERO,
        }
    }

    fn elapsed(&self) -> f64 {
        let now = self.paused_at.unwrap_or_else(Instant::now);
        let running = now
            .saturating_duration_since(self.since)
            .saturating_sub(self.paused_total);
        self.base + running.as_secs_f64()
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    fn seek(&mut self, position: f64) {
        let now = Instant::now();
        self.base = position;
        self.since = now;
        self.paused_total = Duration::ZERO;
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fetching,
    Loading,
    Playing,
    WaitingRetry,
}

struct Active {
    request: PlayRequest,
    phase: Phase,
    handle: Option<Box<dyn MediaHandle>>,
    fetch: Option<JoinHandle<()>>,
    started: bool,
    ever_played: bool,
    paused: bool,
    awaiting_gesture: bool,
    metadata_loaded: bool,
    duration: Option<f64>,
    position: f64,
    synthetic: Option<SyntheticClock>,
}

impl Active {
    fn new(request: PlayRequest, fetch: JoinHandle<()>) -> Self {
        Self {
            request,
            phase: Phase::Fetching,
            handle: None,
            fetch: Some(fetch),
            started: false,
            ever_played: false,
            paused: false,
            awaiting_gesture: false,
            metadata_loaded: false,
            duration: None,
            position: 0.0,
            synthetic: None,
        }
    }

    fn item(&self) -> Option<String> {
        self.request.item.clone()
    }

    fn position(&self) -> f64 {
        let raw = match (&self.synthetic, &self.handle) {
            (Some(clock), _) => clock.elapsed(),
            (None, Some(handle)) => handle.position(),
            (None, None) => self.position,
        };
        match self.duration {
            Some(d) if d > 0.0 => raw.min(d),
            _ => raw,
        }
    }

    fn percent(&self) -> f64 {
        match self.duration {
            Some(d) if d > 0.0 => (self.position() / d * 100.0).clamp(0.0, 100.0),
            _ => 0.0,
        }
    }

    fn release(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
        if let Some(mut handle) = self.handle.take() {
            handle.pause();
            handle.release();
        }
        self.synthetic = None;
    }
}

pub struct PlaybackEngine {
    name: &'static str,
    config: PlaybackConfig,
    fetcher: Arc<dyn AudioFetcher>,
    backend: Box<dyn MediaBackend>,
    reporter: Option<Arc<dyn PositionReporter>>,
    tx: UnboundedSender<EngineMsg>,
    timers: TimerRegistry<EngineTimer, EngineMsg>,
    generation: u64,
    active: Option<Active>,
    volume: f32,
    rate: f32,
}

impl PlaybackEngine {
    /// Create an engine and the receiver its owner must drain into `handle`
    pub fn new(
        name: &'static str,
        config: PlaybackConfig,
        fetcher: Arc<dyn AudioFetcher>,
        backend: Box<dyn MediaBackend>,
    ) -> (Self, UnboundedReceiver<EngineMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            name,
            config,
            fetcher,
            backend,
            reporter: None,
            timers: TimerRegistry::new(tx.clone()),
            tx,
            generation: 0,
            active: None,
            volume: 1.0,
            rate: 1.0,
        };
        (engine, rx)
    }

    /// Report item positions every sync interval while playing
    pub fn with_reporter(mut self, reporter: Arc<dyn PositionReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Start playing `request`, releasing whatever was active.
    /// A request for the item that is already audibly playing is ignored.
    pub fn play(&mut self, request: PlayRequest) {
        if request.item.is_some()
            && request.retry_attempt == 0
            && self.is_playing()
            && self.current_item() == request.item.as_deref()
        {
            debug!("[{}] {:?} already playing", self.name, request.item);
            return;
        }

        self.timers.cancel(EngineTimer::Retry);
        self.release_active();
        self.generation += 1;

        let generation = self.generation;
        let fetcher = self.fetcher.clone();
        let tx = self.tx.clone();
        let url = request.url.clone();
        debug!(
            "[{}] fetching {} (attempt {})",
            self.name,
            url,
            request.retry_attempt + 1
        );
        let fetch = tokio::spawn(async move {
            let result = fetcher.fetch(&url).await;
            let _ = tx.send(EngineMsg::Fetched { generation, result });
        });
        self.active = Some(Active::new(request, fetch));
    }

    /// Release the active resource and every pending timer
    pub fn stop(&mut self) {
        self.timers.clear_all();
        self.release_active();
        self.generation += 1;
    }

    pub fn pause(&mut self) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if !active.ever_played || active.paused || active.awaiting_gesture {
            return Vec::new();
        }
        match active.synthetic.as_mut() {
            Some(clock) => clock.pause(),
            None => {
                if let Some(handle) = active.handle.as_mut() {
                    handle.pause();
                }
            }
        }
        active.paused = true;
        debug!("[{}] paused", self.name);
        vec![PlaybackNotice::Paused {
            item: active.item(),
        }]
    }

    /// Resume after a pause, or retry a start the output refused
    pub fn resume(&mut self) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let item = active.item();

        if active.awaiting_gesture {
            let result = match active.handle.as_mut() {
                Some(handle) => handle.play(),
                None => return Vec::new(),
            };
            return match result {
                Ok(()) => {
                    let first = !active.ever_played;
                    active.awaiting_gesture = false;
                    active.paused = false;
                    active.ever_played = true;
                    active.phase = Phase::Playing;
                    if first {
                        self.start_sync();
                        vec![PlaybackNotice::Started { item }]
                    } else {
                        vec![PlaybackNotice::Resumed { item }]
                    }
                }
                Err(PlayRejection::NotAllowed) => vec![PlaybackNotice::AutoplayBlocked { item }],
                Err(PlayRejection::Failed(msg)) => {
                    self.fail(MediaErrorCode::Aborted, msg, None, false)
                }
            };
        }

        if !active.paused {
            return Vec::new();
        }
        if let Some(clock) = active.synthetic.as_mut() {
            clock.resume();
            active.paused = false;
            return vec![PlaybackNotice::Resumed { item }];
        }
        let result = match active.handle.as_mut() {
            Some(handle) => handle.play(),
            None => return Vec::new(),
        };
        match result {
            Ok(()) => {
                active.paused = false;
                vec![PlaybackNotice::Resumed { item }]
            }
            Err(PlayRejection::NotAllowed) => {
                active.paused = false;
                active.awaiting_gesture = true;
                vec![PlaybackNotice::AutoplayBlocked { item }]
            }
            Err(PlayRejection::Failed(msg)) => self.fail(MediaErrorCode::Aborted, msg, None, false),
        }
    }

    pub fn toggle_pause(&mut self) -> Vec<PlaybackNotice> {
        match &self.active {
            Some(a) if a.paused || a.awaiting_gesture => self.resume(),
            Some(_) => self.pause(),
            None => Vec::new(),
        }
    }

    /// Clamped to [0, 1]; returns the applied value
    pub fn set_volume(&mut self, volume: f32) -> f32 {
        self.volume = volume.clamp(0.0, 1.0);
        if let Some(handle) = self.active.as_mut().and_then(|a| a.handle.as_mut()) {
            handle.set_volume(self.volume);
        }
        self.volume
    }

    /// Clamped to [0.5, 2.0]; returns the applied value
    pub fn set_playback_rate(&mut self, rate: f32) -> f32 {
        self.rate = rate.clamp(0.5, 2.0);
        if let Some(handle) = self.active.as_mut().and_then(|a| a.handle.as_mut()) {
            handle.set_rate(self.rate);
        }
        self.rate
    }

    /// Move by `delta` seconds within the active resource. Returns false when
    /// nothing seekable is playing.
    pub fn seek_by(&mut self, delta: f64) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let duration = match active.duration {
            Some(d) if d > 0.0 && active.ever_played => d,
            _ => return false,
        };
        let target = (active.position() + delta).clamp(0.0, duration);
        match active.synthetic.as_mut() {
            Some(clock) => clock.seek(target),
            None => {
                if let Some(handle) = active.handle.as_mut() {
                    handle.seek(target);
                }
            }
        }
        active.position = target;
        true
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn playback_rate(&self) -> f32 {
        self.rate
    }

    /// Audibly playing: started, not paused, not waiting for a gesture
    pub fn is_playing(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.ever_played && !a.paused && !a.awaiting_gesture)
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.active.as_ref().map(|a| a.paused).unwrap_or(false)
    }

    /// Anything active, including fetches and retry waits
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn awaiting_gesture(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.awaiting_gesture)
            .unwrap_or(false)
    }

    pub fn current_item(&self) -> Option<&str> {
        self.active.as_ref().and_then(|a| a.request.item.as_deref())
    }

    /// 0-100
    pub fn progress(&self) -> f64 {
        self.active.as_ref().map(|a| a.percent()).unwrap_or(0.0)
    }

    /// Seconds into the active resource
    pub fn position(&self) -> f64 {
        self.active.as_ref().map(|a| a.position()).unwrap_or(0.0)
    }

    /// Feed one message from the engine channel
    pub fn handle(&mut self, msg: EngineMsg) -> Vec<PlaybackNotice> {
        match msg {
            EngineMsg::Fetched { generation, result } if generation == self.generation => {
                self.on_fetched(result)
            }
            EngineMsg::Media { generation, event } if generation == self.generation => {
                self.on_media_event(event)
            }
            EngineMsg::Timer(fired) => {
                if self.timers.accept(&fired) {
                    self.on_timer(fired.kind)
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_fetched(&mut self, result: Result<FetchedAudio, FetchError>) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        active.fetch = None;
        let attempt = active.request.retry_attempt;
        let can_retry = attempt < self.config.max_tts_retries;

        match result {
            Ok(FetchedAudio::Audio(bytes)) if bytes.is_empty() => self.fail(
                MediaErrorCode::Decode,
                "The audio payload was empty".to_string(),
                None,
                false,
            ),
            Ok(FetchedAudio::Audio(bytes)) => self.open(bytes),
            Ok(FetchedAudio::ServerError {
                status,
                code,
                message,
            }) => {
                let transient =
                    code.as_deref() == Some(TTS_GENERATION_FAILED) || status == 500;
                if transient && can_retry {
                    self.schedule_retry()
                } else {
                    let message = message.unwrap_or_else(|| "Audio generation failed".to_string());
                    self.fail(MediaErrorCode::SourceNotSupported, message, code, true)
                }
            }
            Err(FetchError::Network(e)) => {
                if can_retry {
                    debug!("[{}] fetch failed: {}", self.name, e);
                    self.schedule_retry()
                } else {
                    self.fail(
                        MediaErrorCode::Network,
                        MediaErrorCode::Network.description().to_string(),
                        None,
                        false,
                    )
                }
            }
            Err(FetchError::Status(status)) => {
                if status == 500 && can_retry {
                    self.schedule_retry()
                } else {
                    self.fail(
                        MediaErrorCode::Network,
                        format!("The audio service returned {}", status),
                        None,
                        true,
                    )
                }
            }
        }
    }

    fn open(&mut self, bytes: Vec<u8>) -> Vec<PlaybackNotice> {
        let generation = self.generation;
        let tx = self.tx.clone();
        let events = MediaEvents::new(move |event| {
            let _ = tx.send(EngineMsg::Media { generation, event });
        });

        match self.backend.open(bytes, events) {
            Ok(mut handle) => {
                handle.set_volume(self.volume);
                handle.set_rate(self.rate);
                if let Some(active) = self.active.as_mut() {
                    active.handle = Some(handle);
                    active.phase = Phase::Loading;
                } else {
                    handle.release();
                }
                Vec::new()
            }
            Err(MediaError::Unsupported(msg)) => {
                self.fail(MediaErrorCode::SourceNotSupported, msg, None, false)
            }
            Err(MediaError::Open(msg)) => self.fail(MediaErrorCode::Decode, msg, None, false),
        }
    }

    fn on_media_event(&mut self, event: MediaEvent) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        match event {
            MediaEvent::MetadataLoaded { duration } => {
                active.metadata_loaded = true;
                active.duration = Some(duration);
                if active.request.start_offset > 0.0 {
                    let offset = active.request.start_offset.min(duration);
                    if let Some(handle) = active.handle.as_mut() {
                        handle.seek(offset);
                    }
                    active.position = offset;
                }
                if !active.started {
                    self.timers
                        .schedule(EngineTimer::StartGrace, self.config.start_grace());
                }
                Vec::new()
            }
            MediaEvent::CanPlayThrough => self.start_playback(),
            MediaEvent::TimeUpdate { position } => {
                active.position = position;
                if active.synthetic.is_none() && active.ever_played && !active.paused {
                    vec![PlaybackNotice::Progress {
                        item: active.item(),
                        percent: active.percent(),
                    }]
                } else {
                    Vec::new()
                }
            }
            MediaEvent::Ended => {
                if active.synthetic.is_some() {
                    return Vec::new();
                }
                self.finish()
            }
            MediaEvent::Error(code) => self.on_media_error(code),
        }
    }

    fn start_playback(&mut self) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if active.started || active.synthetic.is_some() {
            return Vec::new();
        }
        let Some(handle) = active.handle.as_mut() else {
            return Vec::new();
        };
        active.started = true;
        let result = handle.play();
        let item = active.item();
        self.timers.cancel(EngineTimer::StartGrace);

        match result {
            Ok(()) => {
                if let Some(active) = self.active.as_mut() {
                    active.ever_played = true;
                    active.phase = Phase::Playing;
                }
                info!("[{}] playing {:?}", self.name, item);
                self.start_sync();
                vec![PlaybackNotice::Started { item }]
            }
            Err(PlayRejection::NotAllowed) => {
                if let Some(active) = self.active.as_mut() {
                    active.awaiting_gesture = true;
                }
                warn!("[{}] autoplay blocked for {:?}", self.name, item);
                vec![PlaybackNotice::AutoplayBlocked { item }]
            }
            Err(PlayRejection::Failed(msg)) => self.fail(MediaErrorCode::Aborted, msg, None, false),
        }
    }

    fn on_media_error(&mut self, code: MediaErrorCode) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let known_duration = active.duration.unwrap_or(0.0);
        if !(code.is_format_class() && active.metadata_loaded && known_duration > 0.0) {
            return self.fail(code, code.description().to_string(), None, false);
        }
        if active.synthetic.is_some() {
            return Vec::new();
        }

        let position = active.position();
        if let Some(handle) = active.handle.as_mut() {
            handle.pause();
        }
        let first_start = !active.ever_played;
        active.synthetic = Some(SyntheticClock::new(position, active.paused));
        active.started = true;
        active.ever_played = true;
        active.awaiting_gesture = false;
        active.phase = Phase::Playing;
        let item = active.item();

        warn!(
            "[{}] {:?} after load ({}); continuing on synthetic clock",
            self.name,
            code,
            known_duration
        );
        self.timers.cancel(EngineTimer::StartGrace);
        self.timers
            .schedule_repeating(EngineTimer::SyntheticTick, self.config.synthetic_tick());

        let mut notices = Vec::new();
        if first_start {
            self.start_sync();
            notices.push(PlaybackNotice::Started { item: item.clone() });
        }
        notices.push(PlaybackNotice::Degraded { item, code });
        notices
    }

    fn on_timer(&mut self, kind: EngineTimer) -> Vec<PlaybackNotice> {
        match kind {
            EngineTimer::Retry => {
                let request = match &self.active {
                    Some(a) if a.phase == Phase::WaitingRetry => {
                        let mut next = a.request.clone();
                        next.retry_attempt += 1;
                        next
                    }
                    _ => return Vec::new(),
                };
                self.play(request);
                Vec::new()
            }
            EngineTimer::StartGrace => self.start_playback(),
            EngineTimer::SyntheticTick => {
                let Some(active) = self.active.as_mut() else {
                    return Vec::new();
                };
                if active.paused {
                    return Vec::new();
                }
                let Some(clock) = active.synthetic.as_ref() else {
                    return Vec::new();
                };
                let elapsed = clock.elapsed();
                let duration = active.duration.unwrap_or(0.0);
                active.position = elapsed.min(duration);
                if elapsed >= duration {
                    self.finish()
                } else {
                    vec![PlaybackNotice::Progress {
                        item: active.item(),
                        percent: active.percent(),
                    }]
                }
            }
            EngineTimer::Sync => {
                self.report_position();
                Vec::new()
            }
        }
    }

    fn schedule_retry(&mut self) -> Vec<PlaybackNotice> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let attempt = active.request.retry_attempt;
        let delay = self.config.retry_delay(attempt);
        if let Some(mut handle) = active.handle.take() {
            handle.release();
        }
        active.phase = Phase::WaitingRetry;
        let item = active.item();
        warn!(
            "[{}] transient failure for {:?}, retry {} in {:?}",
            self.name,
            item,
            attempt + 1,
            delay
        );
        self.timers.schedule(EngineTimer::Retry, delay);
        vec![PlaybackNotice::Retrying {
            item,
            attempt: attempt + 1,
            delay,
        }]
    }

    fn start_sync(&mut self) {
        let has_item = self
            .active
            .as_ref()
            .map(|a| a.request.item.is_some())
            .unwrap_or(false);
        if has_item && self.reporter.is_some() {
            self.timers
                .schedule_repeating(EngineTimer::Sync, self.config.sync_interval());
        }
    }

    fn report_position(&self) {
        if !self.is_playing() {
            return;
        }
        let (Some(reporter), Some(item)) = (self.reporter.clone(), self.current_item()) else {
            return;
        };
        let item = item.to_string();
        let position = self.position();
        tokio::spawn(async move {
            reporter.report(&item, position).await;
        });
    }

    fn finish(&mut self) -> Vec<PlaybackNotice> {
        let item = self.active.as_ref().and_then(|a| a.item());
        debug!("[{}] finished {:?}", self.name, item);
        self.release_active();
        vec![PlaybackNotice::Ended { item }]
    }

    fn fail(
        &mut self,
        code: MediaErrorCode,
        message: String,
        server_code: Option<String>,
        from_server: bool,
    ) -> Vec<PlaybackNotice> {
        let failure = match &self.active {
            Some(a) => PlaybackFailure {
                item: a.item(),
                code,
                message,
                server_code,
                from_server,
                ever_played: a.ever_played,
                metadata_loaded: a.metadata_loaded,
            },
            None => return Vec::new(),
        };
        error!(
            "[{}] playback failed for {:?}: code {} {}",
            self.name,
            failure.item,
            code.as_u8(),
            failure.message
        );
        self.release_active();
        vec![PlaybackNotice::Failed(failure)]
    }

    fn release_active(&mut self) {
        self.timers.cancel(EngineTimer::StartGrace);
        self.timers.cancel(EngineTimer::SyntheticTick);
        self.timers.cancel(EngineTimer::Sync);
        if let Some(mut active) = self.active.take() {
            active.release();
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MediaLog, RecordingReporter, ScriptedFetcher, ScriptedMedia};
    use tokio::time;

    struct Harness {
        engine: PlaybackEngine,
        rx: UnboundedReceiver<EngineMsg>,
        fetcher: Arc<ScriptedFetcher>,
        media: MediaLog,
    }

    impl Harness {
        fn new(fetcher: ScriptedFetcher) -> Self {
            Self::build(fetcher, None)
        }

        fn build(fetcher: ScriptedFetcher, reporter: Option<Arc<dyn PositionReporter>>) -> Self {
            let fetcher = Arc::new(fetcher);
            let media = MediaLog::default();
            let (mut engine, rx) = PlaybackEngine::new(
                "test",
                PlaybackConfig::default(),
                fetcher.clone(),
                Box::new(ScriptedMedia::new(media.clone())),
            );
            if let Some(reporter) = reporter {
                engine = engine.with_reporter(reporter);
            }
            Self {
                engine,
                rx,
                fetcher,
                media,
            }
        }

        /// Pump messages until a notice matches or the deadline passes
        async fn until(
            &mut self,
            limit: Duration,
            mut pred: impl FnMut(&PlaybackNotice) -> bool,
        ) -> Vec<PlaybackNotice> {
            let deadline = Instant::now() + limit;
            let mut seen = Vec::new();
            loop {
                let msg = tokio::select! {
                    msg = self.rx.recv() => msg,
                    _ = time::sleep_until(deadline) => return seen,
                };
                let Some(msg) = msg else { return seen };
                for notice in self.engine.handle(msg) {
                    let done = pred(&notice);
                    seen.push(notice);
                    if done {
                        return seen;
                    }
                }
            }
        }
    }

    fn is_started(n: &PlaybackNotice) -> bool {
        matches!(n, PlaybackNotice::Started { .. })
    }

    fn is_terminal(n: &PlaybackNotice) -> bool {
        matches!(n, PlaybackNotice::Ended { .. } | PlaybackNotice::Failed(_))
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_item_to_end() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "ok:2.0"));
        h.engine
            .play(PlayRequest::item("http://tts?newsId=1", "1"));

        let seen = h.until(Duration::from_secs(5), is_terminal).await;
        assert!(matches!(seen.first(), Some(PlaybackNotice::Started { item: Some(id) }) if id == "1"));
        assert!(seen
            .iter()
            .any(|n| matches!(n, PlaybackNotice::Progress { .. })));
        assert_eq!(
            seen.last(),
            Some(&PlaybackNotice::Ended {
                item: Some("1".into())
            })
        );
        assert!(!h.engine.is_busy());
        assert_eq!(h.media.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_resource_stays_active() {
        let mut h = Harness::new(
            ScriptedFetcher::new()
                .audio("newsId=a", "ok:30.0")
                .audio("newsId=b", "ok:30.0"),
        );
        h.engine.play(PlayRequest::item("http://tts?newsId=a", "a"));
        h.until(Duration::from_secs(1), is_started).await;
        assert_eq!(h.media.live(), 1);

        h.engine.play(PlayRequest::item("http://tts?newsId=b", "b"));
        let seen = h.until(Duration::from_secs(1), is_started).await;
        assert_eq!(
            seen.last(),
            Some(&PlaybackNotice::Started {
                item: Some("b".into())
            })
        );
        assert_eq!(h.media.live(), 1);
        assert_eq!(h.media.released(), vec!["ok:30.0".to_string()]);
        assert_eq!(h.engine.current_item(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_item_while_playing_is_noop() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=a", "ok:30.0"));
        h.engine.play(PlayRequest::item("http://tts?newsId=a", "a"));
        h.until(Duration::from_secs(1), is_started).await;
        h.engine.play(PlayRequest::item("http://tts?newsId=a", "a"));
        assert_eq!(h.fetcher.calls().len(), 1);
        assert!(h.engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_failure_retries_with_backoff() {
        let mut h = Harness::new(
            ScriptedFetcher::new()
                .server_error("newsId=1", 503, Some(TTS_GENERATION_FAILED), "busy")
                .server_error("newsId=1", 500, None, "boom")
                .audio("newsId=1", "ok:1.0"),
        );
        let start = Instant::now();
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));

        let seen = h.until(Duration::from_secs(20), is_started).await;
        let delays: Vec<Duration> = seen
            .iter()
            .filter_map(|n| match n {
                PlaybackNotice::Retrying { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(3000), Duration::from_millis(5000)]
        );
        assert!(start.elapsed() >= Duration::from_millis(8000));
        assert_eq!(h.fetcher.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_into_server_failure() {
        let mut h = Harness::new(ScriptedFetcher::new().server_error(
            "newsId=1",
            500,
            Some(TTS_GENERATION_FAILED),
            "synthesis down",
        ));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));

        let seen = h.until(Duration::from_secs(20), is_terminal).await;
        match seen.last() {
            Some(PlaybackNotice::Failed(f)) => {
                assert!(f.from_server);
                assert_eq!(f.message, "synthesis down");
                assert_eq!(f.server_code.as_deref(), Some(TTS_GENERATION_FAILED));
                assert!(!f.ever_played);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(h.fetcher.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_server_error_is_terminal() {
        let mut h = Harness::new(ScriptedFetcher::new().server_error(
            "newsId=1",
            404,
            Some("NEWS_NOT_FOUND"),
            "no such article",
        ));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let seen = h.until(Duration::from_secs(1), is_terminal).await;
        assert!(matches!(seen.last(), Some(PlaybackNotice::Failed(f)) if f.message == "no such article"));
        assert_eq!(h.fetcher.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_is_decode_failure() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", ""));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let seen = h.until(Duration::from_secs(1), is_terminal).await;
        assert!(matches!(seen.last(), Some(PlaybackNotice::Failed(f)) if f.code == MediaErrorCode::Decode));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_before_load_is_terminal() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "error-before:3"));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let seen = h.until(Duration::from_secs(1), is_terminal).await;
        match seen.last() {
            Some(PlaybackNotice::Failed(f)) => {
                assert_eq!(f.code, MediaErrorCode::Decode);
                assert!(!f.metadata_loaded);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_after_load_degrades_to_synthetic_clock() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "error-after:3:2.0"));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let started = Instant::now();

        let seen = h.until(Duration::from_secs(5), is_terminal).await;
        assert!(seen
            .iter()
            .any(|n| matches!(n, PlaybackNotice::Degraded { code: MediaErrorCode::Decode, .. })));
        assert!(seen.iter().any(is_started));
        assert!(matches!(seen.last(), Some(PlaybackNotice::Ended { .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2000) && elapsed <= Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_clock_honours_pause() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "error-after:4:2.0"));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        h.until(Duration::from_secs(1), |n| matches!(n, PlaybackNotice::Degraded { .. }))
            .await;
        let started = Instant::now();

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.engine.pause().len(), 1);
        // Nothing ends while paused
        let seen = h.until(Duration::from_secs(3), is_terminal).await;
        assert!(!seen.iter().any(is_terminal));
        assert_eq!(h.engine.resume().len(), 1);

        h.until(Duration::from_secs(5), is_terminal).await;
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timer_starts_without_can_play_through() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "meta-only:5.0"));
        let start = Instant::now();
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let seen = h.until(Duration::from_secs(1), is_started).await;
        assert!(seen.iter().any(is_started));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoplay_rejection_waits_for_gesture() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "reject:5.0"));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let seen = h
            .until(Duration::from_secs(1), |n| {
                matches!(n, PlaybackNotice::AutoplayBlocked { .. })
            })
            .await;
        assert!(seen
            .iter()
            .all(|n| !matches!(n, PlaybackNotice::Failed(_))));
        assert!(!h.engine.is_playing());
        assert!(h.engine.awaiting_gesture());

        let notices = h.engine.resume();
        assert_eq!(
            notices,
            vec![PlaybackNotice::Started {
                item: Some("1".into())
            }]
        );
        assert!(h.engine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_retries_then_fails() {
        let mut h = Harness::new(ScriptedFetcher::new().network_error("newsId=1", "refused"));
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        let seen = h.until(Duration::from_secs(20), is_terminal).await;
        assert!(matches!(seen.last(), Some(PlaybackNotice::Failed(f)) if f.code == MediaErrorCode::Network));
        assert_eq!(h.fetcher.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let mut h = Harness::new(
            ScriptedFetcher::new()
                .server_error("newsId=1", 500, None, "boom")
                .audio("newsId=1", "ok:1.0"),
        );
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        h.until(Duration::from_secs(1), |n| {
            matches!(n, PlaybackNotice::Retrying { .. })
        })
        .await;
        h.engine.stop();
        let seen = h.until(Duration::from_secs(10), |_| true).await;
        assert!(seen.is_empty());
        assert_eq!(h.fetcher.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_reports_position_while_playing() {
        let reporter = Arc::new(RecordingReporter::default());
        let mut h = Harness::build(
            ScriptedFetcher::new().audio("newsId=1", "ok:12.0"),
            Some(reporter.clone()),
        );
        h.engine.play(PlayRequest::item("http://tts?newsId=1", "1"));
        h.until(Duration::from_secs(20), is_terminal).await;
        // Let the spawned reports land
        time::sleep(Duration::from_millis(10)).await;
        let reports = reporter.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(id, _)| id == "1"));
        assert!((reports[0].1 - 5.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcements_are_not_synced() {
        let reporter = Arc::new(RecordingReporter::default());
        let mut h = Harness::build(
            ScriptedFetcher::new().audio("script", "ok:12.0"),
            Some(reporter.clone()),
        );
        h.engine
            .play(PlayRequest::announcement("http://tts/script?text=hi"));
        let seen = h.until(Duration::from_secs(20), is_terminal).await;
        assert!(matches!(seen.last(), Some(PlaybackNotice::Ended { item: None })));
        assert!(reporter.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_and_rate_are_clamped() {
        let h = Harness::new(ScriptedFetcher::new());
        let mut engine = h.engine;
        assert_eq!(engine.set_volume(1.7), 1.0);
        assert_eq!(engine.set_volume(-0.3), 0.0);
        assert_eq!(engine.set_playback_rate(3.0), 2.0);
        assert_eq!(engine.set_playback_rate(0.1), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_offset_and_seek() {
        let mut h = Harness::new(ScriptedFetcher::new().audio("newsId=1", "ok:60.0"));
        h.engine
            .play(PlayRequest::item("http://tts?newsId=1", "1").with_start_offset(20.0));
        h.until(Duration::from_secs(1), is_started).await;
        assert!((h.engine.position() - 20.0).abs() < 0.1);

        assert!(h.engine.seek_by(10.0));
        assert!((h.engine.position() - 30.0).abs() < 0.1);
        assert!(h.engine.seek_by(-100.0));
        assert!(h.engine.position() < 0.1);
    }

    #[test]
    fn test_retry_delay_schedule() {
        let config = PlaybackConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_millis(3000));
        assert_eq!(config.retry_delay(1), Duration::from_millis(5000));
        assert_eq!(config.retry_delay(7), Duration::from_millis(5000));
    }
}
