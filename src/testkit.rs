//! Scripted collaborators for engine and session tests
//!
//! Media payloads are plain strings that tell [`ScriptedMedia`] how to behave:
//!
//! - `ok:<secs>` loads and plays to the end
//! - `meta-only:<secs>` loads metadata but never reports can-play-through
//! - `reject:<secs>` refuses the first `play` as if autoplay were blocked
//! - `error-before:<code>` fails before any metadata
//! - `error-after:<code>:<secs>` fails right after metadata loads

use crate::api::{DriveApi, HistoryRecord};
use crate::audio::{
    AudioFetcher, FetchedAudio, InputStream, MediaBackend, MediaErrorCode, MediaEvent, MediaEvents,
    MediaHandle, Microphone, PlayRejection, PositionReporter, Transport, WAV_MIME,
};
use crate::error::{ApiError, CaptureError, FetchError, MediaError};
use crate::models::{
    CommandAnalysis, EntryResponse, EntryScenario, HistoryEntry, HistoryStatus, NewsQueue,
    Playlist, PlaylistSelection, RecordedAudio,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant};

#[derive(Debug, Clone)]
enum Step {
    Audio(Vec<u8>),
    Server {
        status: u16,
        code: Option<String>,
        message: String,
    },
    Network(String),
}

struct Route {
    pattern: String,
    steps: VecDeque<Step>,
    delay: Duration,
}

/// Audio fetcher answering by URL substring. Each pattern plays its steps in
/// order and repeats the last one.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<Vec<Route>>,
    fallback: Option<Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio(self, pattern: &str, payload: &str) -> Self {
        self.step(pattern, Step::Audio(payload.as_bytes().to_vec()))
    }

    pub fn server_error(self, pattern: &str, status: u16, code: Option<&str>, message: &str) -> Self {
        self.step(
            pattern,
            Step::Server {
                status,
                code: code.map(str::to_string),
                message: message.to_string(),
            },
        )
    }

    pub fn network_error(self, pattern: &str, message: &str) -> Self {
        self.step(pattern, Step::Network(message.to_string()))
    }

    /// Delay every response for `pattern`
    pub fn delayed(mut self, pattern: &str, delay: Duration) -> Self {
        self.route(pattern).delay = delay;
        self
    }

    /// Payload for URLs no pattern matches; without one they answer 404
    pub fn otherwise(mut self, payload: &str) -> Self {
        self.fallback = Some(payload.as_bytes().to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn step(mut self, pattern: &str, step: Step) -> Self {
        self.route(pattern).steps.push_back(step);
        self
    }

    fn route(&mut self, pattern: &str) -> &mut Route {
        let routes = self.routes.get_mut().unwrap();
        let index = match routes.iter().position(|r| r.pattern == pattern) {
            Some(i) => i,
            None => {
                routes.push(Route {
                    pattern: pattern.to_string(),
                    steps: VecDeque::new(),
                    delay: Duration::ZERO,
                });
                routes.len() - 1
            }
        };
        &mut routes[index]
    }

    fn next_step(&self, url: &str) -> (Option<Step>, Duration) {
        let mut routes = self.routes.lock().unwrap();
        let Some(route) = routes.iter_mut().find(|r| url.contains(&r.pattern)) else {
            return (self.fallback.clone().map(Step::Audio), Duration::ZERO);
        };
        let step = if route.steps.len() > 1 {
            route.steps.pop_front()
        } else {
            route.steps.front().cloned()
        };
        (step.or_else(|| self.fallback.clone().map(Step::Audio)), route.delay)
    }
}

#[async_trait]
impl AudioFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAudio, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let (step, delay) = self.next_step(url);
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        match step {
            Some(Step::Audio(bytes)) => Ok(FetchedAudio::Audio(bytes)),
            Some(Step::Server {
                status,
                code,
                message,
            }) => Ok(FetchedAudio::ServerError {
                status,
                code,
                message: Some(message),
            }),
            Some(Step::Network(msg)) => Err(FetchError::Network(msg)),
            None => Err(FetchError::Status(404)),
        }
    }
}

#[derive(Default)]
struct MediaLogInner {
    opened: Vec<String>,
    released: Vec<String>,
    volume: Option<f32>,
}

/// What a [`ScriptedMedia`] backend opened and released
#[derive(Clone, Default)]
pub struct MediaLog {
    inner: Arc<Mutex<MediaLogInner>>,
}

impl MediaLog {
    /// Handles opened and not yet released
    pub fn live(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.opened.len() - inner.released.len()
    }

    pub fn opened(&self) -> Vec<String> {
        self.inner.lock().unwrap().opened.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.inner.lock().unwrap().released.clone()
    }

    /// Last volume applied to any handle
    pub fn volume(&self) -> f32 {
        self.inner.lock().unwrap().volume.unwrap_or(1.0)
    }

    fn set_volume(&self, volume: f32) {
        self.inner.lock().unwrap().volume = Some(volume);
    }
}

enum Behaviour {
    Plays { secs: f64, can_play: bool, reject: bool },
    ErrorBefore(MediaErrorCode),
    ErrorAfter(MediaErrorCode, f64),
}

impl Behaviour {
    fn parse(spec: &str) -> Option<Self> {
        fn secs(s: &str) -> Option<f64> {
            s.parse().ok()
        }
        fn code(s: &str) -> Option<MediaErrorCode> {
            s.parse().ok().and_then(MediaErrorCode::from_u8)
        }
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            ["ok", s] => Some(Behaviour::Plays {
                secs: secs(s)?,
                can_play: true,
                reject: false,
            }),
            ["meta-only", s] => Some(Behaviour::Plays {
                secs: secs(s)?,
                can_play: false,
                reject: false,
            }),
            ["reject", s] => Some(Behaviour::Plays {
                secs: secs(s)?,
                can_play: true,
                reject: true,
            }),
            ["error-before", c] => Some(Behaviour::ErrorBefore(code(c)?)),
            ["error-after", c, s] => Some(Behaviour::ErrorAfter(code(c)?, secs(s)?)),
            _ => None,
        }
    }
}

/// Media backend driven by payload strings, running on a wall-clock transport
pub struct ScriptedMedia {
    log: MediaLog,
}

impl ScriptedMedia {
    pub fn new(log: MediaLog) -> Self {
        Self { log }
    }
}

impl MediaBackend for ScriptedMedia {
    fn open(
        &mut self,
        payload: Vec<u8>,
        events: MediaEvents,
    ) -> Result<Box<dyn MediaHandle>, MediaError> {
        let spec = String::from_utf8_lossy(&payload).to_string();
        let behaviour = Behaviour::parse(&spec)
            .ok_or_else(|| MediaError::Unsupported(format!("unscripted payload {:?}", spec)))?;
        self.log.inner.lock().unwrap().opened.push(spec.clone());

        let (duration, reject) = match behaviour {
            Behaviour::Plays {
                secs,
                can_play,
                reject,
            } => {
                events.emit(MediaEvent::MetadataLoaded { duration: secs });
                if can_play {
                    events.emit(MediaEvent::CanPlayThrough);
                }
                (secs, reject)
            }
            Behaviour::ErrorBefore(code) => {
                events.emit(MediaEvent::Error(code));
                (0.0, false)
            }
            Behaviour::ErrorAfter(code, secs) => {
                events.emit(MediaEvent::MetadataLoaded { duration: secs });
                events.emit(MediaEvent::Error(code));
                (secs, false)
            }
        };

        Ok(Box::new(ScriptedHandle {
            spec,
            log: self.log.clone(),
            transport: Transport::new(events, duration),
            reject_next: reject,
            released: false,
        }))
    }
}

struct ScriptedHandle {
    spec: String,
    log: MediaLog,
    transport: Transport,
    reject_next: bool,
    released: bool,
}

impl MediaHandle for ScriptedHandle {
    fn play(&mut self) -> Result<(), PlayRejection> {
        if self.reject_next {
            self.reject_next = false;
            return Err(PlayRejection::NotAllowed);
        }
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

    fn set_volume(&mut self, volume: f32) {
        self.log.set_volume(volume);
    }

    fn set_rate(&mut self, rate: f32) {
        self.transport.set_rate(rate);
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.transport.release();
        self.log
            .inner
            .lock()
            .unwrap()
            .released
            .push(self.spec.clone());
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Position reporter that keeps every report
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, f64)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(String, f64)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl PositionReporter for RecordingReporter {
    async fn report(&self, item_id: &str, position_secs: f64) {
        self.reports
            .lock()
            .unwrap()
            .push((item_id.to_string(), position_secs));
    }
}

#[derive(Default)]
struct StreamCounts {
    opened: usize,
    released: usize,
}

/// Streams opened and released by a [`ScriptedMicrophone`]
#[derive(Clone, Default)]
pub struct StreamLog {
    inner: Arc<Mutex<StreamCounts>>,
}

impl StreamLog {
    pub fn live(&self) -> usize {
        let counts = self.inner.lock().unwrap();
        counts.opened - counts.released
    }

    pub fn opened(&self) -> usize {
        self.inner.lock().unwrap().opened
    }
}

type LevelFn = Arc<dyn Fn(Duration) -> f32 + Send + Sync>;

/// Microphone whose level follows a function of time since the stream opened
pub struct ScriptedMicrophone {
    levels: LevelFn,
    failure: Option<CaptureError>,
    audio_track: bool,
    payload_len: Option<usize>,
    log: StreamLog,
}

impl ScriptedMicrophone {
    pub fn with_levels(levels: impl Fn(Duration) -> f32 + Send + Sync + 'static) -> Self {
        Self {
            levels: Arc::new(levels),
            failure: None,
            audio_track: true,
            payload_len: None,
            log: StreamLog::default(),
        }
    }

    pub fn failing(error: CaptureError) -> Self {
        let mut mic = Self::with_levels(|_| -20.0);
        mic.failure = Some(error);
        mic
    }

    pub fn without_audio_track() -> Self {
        let mut mic = Self::with_levels(|_| -20.0);
        mic.audio_track = false;
        mic
    }

    /// Fix the recorded blob size instead of deriving it from the duration
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = Some(len);
        self
    }

    pub fn stream_log(&self) -> StreamLog {
        self.log.clone()
    }
}

impl Microphone for ScriptedMicrophone {
    fn open(&mut self) -> Result<Box<dyn InputStream>, CaptureError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.log.inner.lock().unwrap().opened += 1;
        Ok(Box::new(ScriptedStream {
            levels: self.levels.clone(),
            opened_at: Instant::now(),
            audio_track: self.audio_track,
            payload_len: self.payload_len,
            log: self.log.clone(),
            released: false,
        }))
    }

    fn describe(&self) -> &str {
        "scripted microphone"
    }
}

struct ScriptedStream {
    levels: LevelFn,
    opened_at: Instant,
    audio_track: bool,
    payload_len: Option<usize>,
    log: StreamLog,
    released: bool,
}

impl InputStream for ScriptedStream {
    fn has_audio_track(&self) -> bool {
        self.audio_track
    }

    fn level_db(&mut self) -> f32 {
        (self.levels)(self.opened_at.elapsed())
    }

    fn finish(&mut self, elapsed: Duration) -> Result<Option<RecordedAudio>, CaptureError> {
        let duration_ms = elapsed.as_millis() as u64;
        // 16 kHz, 16-bit mono
        let len = self.payload_len.unwrap_or(duration_ms as usize * 32);
        Ok(Some(RecordedAudio {
            bytes: vec![0u8; len],
            file_name: "voice_test.wav".to_string(),
            mime_type: WAV_MIME.to_string(),
            duration_ms,
        }))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.log.inner.lock().unwrap().released += 1;
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// One call received by [`ScriptedApi`]
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Enter,
    NewsQueue,
    ListPlaylists,
    SelectPlaylist(String),
    Analyze { bytes: usize },
    RecordHistory(HistoryRecord),
    ListHistory,
    DeleteHistory(i64),
    UpdatePlaylistHistory { history_id: i64, status: HistoryStatus },
    Sync { item_id: String, secs: u32 },
    SetActive(bool),
}

struct ApiScript {
    entries: VecDeque<Result<EntryResponse, ApiError>>,
    queue: NewsQueue,
    playlists: Vec<Playlist>,
    selections: HashMap<String, PlaylistSelection>,
    analyses: VecDeque<Result<CommandAnalysis, ApiError>>,
    analysis_delay: Duration,
    history: Vec<HistoryEntry>,
    delete_fails: bool,
    next_history_id: i64,
}

impl Default for ApiScript {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            queue: NewsQueue::default(),
            playlists: Vec::new(),
            selections: HashMap::new(),
            analyses: VecDeque::new(),
            analysis_delay: Duration::ZERO,
            history: Vec::new(),
            delete_fails: false,
            next_history_id: 100,
        }
    }
}

/// In-memory Drive API. Entry results repeat the last scripted one; command
/// analyses are consumed in order and fall back to "no intent".
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<ApiScript>,
    calls: Mutex<Vec<ApiCall>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: EntryResponse) -> Self {
        self.script().entries.push_back(Ok(entry));
        self
    }

    pub fn entry_error(mut self, error: ApiError) -> Self {
        self.script().entries.push_back(Err(error));
        self
    }

    pub fn news_queue(mut self, queue: NewsQueue) -> Self {
        self.script().queue = queue;
        self
    }

    pub fn playlists(mut self, playlists: Vec<Playlist>) -> Self {
        self.script().playlists = playlists;
        self
    }

    pub fn selection(mut self, selection: PlaylistSelection) -> Self {
        self.script()
            .selections
            .insert(selection.playlist_id.clone(), selection);
        self
    }

    /// Queue a recognised command; the transcript is the intent in lower case
    pub fn intent(self, intent: &str) -> Self {
        self.analysis(Ok(CommandAnalysis {
            intent: Some(intent.to_string()),
            raw_text: Some(intent.to_lowercase().replace('_', " ")),
            message: None,
            confidence: Some(0.9),
        }))
    }

    pub fn analysis(mut self, result: Result<CommandAnalysis, ApiError>) -> Self {
        self.script().analyses.push_back(result);
        self
    }

    pub fn analysis_delay(mut self, delay: Duration) -> Self {
        self.script().analysis_delay = delay;
        self
    }

    pub fn history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.script().history = history;
        self
    }

    pub fn failing_deletes(mut self) -> Self {
        self.script().delete_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn history_records(&self) -> Vec<HistoryRecord> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::RecordHistory(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    fn script(&mut self) -> &mut ApiScript {
        self.script.get_mut().unwrap()
    }

    fn log(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DriveApi for ScriptedApi {
    async fn enter_session(&self, _user_id: i64) -> Result<EntryResponse, ApiError> {
        self.log(ApiCall::Enter);
        let mut script = self.script.lock().unwrap();
        let next = if script.entries.len() > 1 {
            script.entries.pop_front()
        } else {
            script.entries.front().cloned()
        };
        next.unwrap_or_else(|| {
            Ok(EntryResponse {
                scenario: EntryScenario::FirstTimeWelcome,
                news_id: None,
                last_sentence_idx: None,
                news_queue: None,
                briefing_audio_url: None,
                resume_news_title: None,
            })
        })
    }

    async fn news_queue(&self, _user_id: i64) -> Result<NewsQueue, ApiError> {
        self.log(ApiCall::NewsQueue);
        Ok(self.script.lock().unwrap().queue.clone())
    }

    async fn list_playlists(&self, _user_id: i64) -> Result<Vec<Playlist>, ApiError> {
        self.log(ApiCall::ListPlaylists);
        Ok(self.script.lock().unwrap().playlists.clone())
    }

    async fn select_playlist(
        &self,
        _user_id: i64,
        playlist_id: &str,
    ) -> Result<PlaylistSelection, ApiError> {
        self.log(ApiCall::SelectPlaylist(playlist_id.to_string()));
        self.script
            .lock()
            .unwrap()
            .selections
            .get(playlist_id)
            .cloned()
            .ok_or_else(|| ApiError::Http {
                status: 404,
                message: "playlist not found".to_string(),
            })
    }

    async fn analyze_voice_command(
        &self,
        audio: &RecordedAudio,
        _user_id: i64,
    ) -> Result<CommandAnalysis, ApiError> {
        self.log(ApiCall::Analyze { bytes: audio.len() });
        let (result, delay) = {
            let mut script = self.script.lock().unwrap();
            let result = script
                .analyses
                .pop_front()
                .unwrap_or_else(|| Ok(CommandAnalysis::default()));
            (result, script.analysis_delay)
        };
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        result
    }

    async fn record_history(&self, record: &HistoryRecord) -> Result<Option<i64>, ApiError> {
        self.log(ApiCall::RecordHistory(record.clone()));
        let mut script = self.script.lock().unwrap();
        script.next_history_id += 1;
        Ok(Some(script.next_history_id))
    }

    async fn list_history(&self, _user_id: i64) -> Result<Vec<HistoryEntry>, ApiError> {
        self.log(ApiCall::ListHistory);
        Ok(self.script.lock().unwrap().history.clone())
    }

    async fn delete_history(&self, history_id: i64) -> Result<(), ApiError> {
        self.log(ApiCall::DeleteHistory(history_id));
        let mut script = self.script.lock().unwrap();
        if script.delete_fails {
            return Err(ApiError::Http {
                status: 500,
                message: "delete failed".to_string(),
            });
        }
        script.history.retain(|h| h.history_id != history_id);
        Ok(())
    }

    async fn update_playlist_history(
        &self,
        history_id: i64,
        status: HistoryStatus,
        _current_time_sec: u32,
        _listen_duration_sec: u32,
    ) -> Result<(), ApiError> {
        self.log(ApiCall::UpdatePlaylistHistory { history_id, status });
        Ok(())
    }

    async fn sync_playback_state(
        &self,
        _user_id: i64,
        item_id: &str,
        current_time_sec: u32,
    ) -> Result<(), ApiError> {
        self.log(ApiCall::Sync {
            item_id: item_id.to_string(),
            secs: current_time_sec,
        });
        Ok(())
    }

    async fn set_drive_mode_active(&self, _user_id: i64, active: bool) -> Result<(), ApiError> {
        self.log(ApiCall::SetActive(active));
        Ok(())
    }
}
