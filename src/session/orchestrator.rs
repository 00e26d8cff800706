//! Session orchestrator
//!
//! A single task owns the session state, both playback engines and the
//! voice capture engine. [`Orchestrator::step`] waits on five channels (user
//! input, the two engines, capture and internal messages) and handles one
//! message to completion before waiting again. Spawned tasks only perform
//! I/O or sleep and post their result back as an [`Internal`] message.
//!
//! Stale continuations are dropped by stamp: engine messages by engine
//! generation, timers by registry sequence, fixed messages by the
//! [`FixedMessageSession`] stamp and playlist selections by view epoch.

use super::fixed::{FixedMessage, FixedMessageSession};
use super::intent::Intent;
use super::listen::ListenTracker;
use super::retry::{RetryCounter, RetryDecision};
use super::state::{
    MessageBoard, Post, SelectedPlaylist, SessionSnapshot, SessionState, Status, View,
};
use crate::api::{ApiPositionReporter, DriveApi, HistoryRecord, TtsUrls};
use crate::audio::{
    AudioFetcher, CaptureMsg, CaptureNotice, EngineMsg, MediaBackend, MediaErrorCode, Microphone,
    PlayRequest, PlaybackEngine, PlaybackFailure, PlaybackNotice, VoiceCapture,
    TTS_GENERATION_FAILED,
};
use crate::config::{DriveConfig, Timings};
use crate::demo::DemoMicrophone;
use crate::error::{ApiError, CaptureError};
use crate::models::{
    CommandAnalysis, EntryResponse, HistoryEntry, HistoryStatus, HistoryTarget, NewsQueue,
    NewsRef, Playlist, PlaylistSelection, RecordedAudio,
};
use crate::timers::{TimerFired, TimerRegistry};
use log::{debug, info, warn};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::Instant;

const RESUME_PROMPT: &str = "Shall we continue the article you were listening to?";
const NEW_BRIEFING_PROMPT: &str = "Starting a new news briefing";
const READY_MESSAGE: &str = "Press the mic button to give a command";
const SEEK_STEP_SECS: f64 = 10.0;

/// Answer to the resume-or-start-new question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    Resume,
    New,
}

/// Everything the front end can ask for
#[derive(Debug, Clone, PartialEq)]
pub enum UserInput {
    Enter,
    MicPress,
    MicRelease,
    TogglePlay,
    /// A tap that lets blocked output start
    Gesture,
    ResumeChoice(ResumeChoice),
    /// 0-based index into the playlists on the selection screen
    SelectPlaylist(usize),
    BackToSelection,
    /// Number key choosing a demo voice clip
    DemoKey(u8),
    OpenHistory,
    DeleteHistory(i64),
    Close,
}

/// Why a voice command was not sent for analysis or not executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Cooldown,
    InFlight,
    DuringAnnouncement,
    TooShort,
    NothingRecorded,
}

/// Milestones published for the front end and tests
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ItemStarted {
        news_id: String,
        start_sentence_idx: u32,
    },
    ItemEnded {
        news_id: String,
    },
    ItemFailed {
        news_id: String,
    },
    AnnouncementStarted,
    AnnouncementEnded,
    FixedMessageStarted(FixedMessage),
    FixedMessageFinished {
        message: FixedMessage,
        played: bool,
    },
    ResumeChoiceOffered,
    CommandDispatched(Intent),
    CommandRejected(Rejection),
    QueueCompleted,
    /// Too many consecutive item failures
    QueueHalted,
    Closed,
}

/// Collaborators the orchestrator is built from
pub struct SessionParts {
    pub api: Arc<dyn DriveApi>,
    pub fetcher: Arc<dyn AudioFetcher>,
    pub player_media: Box<dyn MediaBackend>,
    pub announcer_media: Box<dyn MediaBackend>,
    pub microphone: Box<dyn Microphone>,
}

/// The front end's side of a session
pub struct SessionHandle {
    pub input: UnboundedSender<UserInput>,
    pub snapshots: watch::Receiver<SessionSnapshot>,
    pub events: UnboundedReceiver<SessionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionTimer {
    ResumeChoice,
    EntryRetry,
    CommandRetry,
    SelectConfirm,
    StatusRevert,
    RecognizedTextHide,
    MessageFlush,
    NextItem,
    VolumeRestore,
}

#[derive(Debug)]
enum Internal {
    Timer(TimerFired<SessionTimer>),
    Entered(Result<EntryResponse, ApiError>),
    Playlists(Result<Vec<Playlist>, ApiError>),
    PlaylistSelected {
        epoch: u64,
        result: Result<PlaylistSelection, ApiError>,
    },
    Analysis {
        audio: RecordedAudio,
        result: Result<CommandAnalysis, ApiError>,
    },
    FreshQueue(Result<NewsQueue, ApiError>),
    History(Result<Vec<HistoryEntry>, ApiError>),
    HistoryRecorded(HistoryEntry),
    HistoryDeleted {
        history_id: i64,
        was_current: bool,
        was_playing: bool,
        result: Result<(), ApiError>,
    },
    Deactivated,
}

impl From<TimerFired<SessionTimer>> for Internal {
    fn from(fired: TimerFired<SessionTimer>) -> Self {
        Internal::Timer(fired)
    }
}

/// What runs once a fixed message finishes
#[derive(Debug, Clone)]
enum Continuation {
    AfterWelcome,
    LoadPlaylists,
    Resume,
    AdvanceQueue,
    ResumePlayer,
    StartPlaylist(PlaylistSelection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Asset,
    Script,
}

/// The fixed message in flight on the announcer
#[derive(Debug)]
struct Announcement {
    stamp: u64,
    message: FixedMessage,
    stage: Stage,
    /// An article was paused to make room for this message
    resume_after: bool,
    continuation: Option<Continuation>,
}

struct Inbox {
    input: UnboundedReceiver<UserInput>,
    input_open: bool,
    player: UnboundedReceiver<EngineMsg>,
    announcer: UnboundedReceiver<EngineMsg>,
    capture: UnboundedReceiver<CaptureMsg>,
    internal: UnboundedReceiver<Internal>,
}

pub struct Orchestrator {
    inbox: Inbox,
    core: SessionCore,
}

impl Orchestrator {
    pub fn new(config: &DriveConfig, parts: SessionParts) -> Result<(Self, SessionHandle), ApiError> {
        let urls = TtsUrls::new(
            &config.api_base,
            &config.static_base,
            config.voice_type.clone(),
            config.speed_label(),
        )?;

        let reporter = Arc::new(ApiPositionReporter::new(parts.api.clone(), config.user_id));
        let (player, player_rx) = PlaybackEngine::new(
            "player",
            config.playback.clone(),
            parts.fetcher.clone(),
            parts.player_media,
        );
        let player = player.with_reporter(reporter);
        let (announcer, announcer_rx) = PlaybackEngine::new(
            "announcer",
            config.playback.clone(),
            parts.fetcher,
            parts.announcer_media,
        );
        let (capture, capture_rx) = VoiceCapture::new(config.capture.clone(), parts.microphone);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let timings = config.timings.clone();
        let core = SessionCore {
            user_id: config.user_id,
            tts_retries: config.playback.max_tts_retries,
            demo_voice_dir: config.demo_voice_dir.clone(),
            api: parts.api,
            urls,
            player,
            announcer,
            capture,
            timers: TimerRegistry::new(internal_tx.clone()),
            tx: internal_tx,
            events: event_tx,
            snapshots: snapshot_tx,
            state: SessionState::default(),
            board: MessageBoard::new(timings.min_message_visible()),
            fixed: FixedMessageSession::default(),
            announcement: None,
            listen: ListenTracker::default(),
            entry_retry: RetryCounter::new(timings.call_attempts, timings.call_retry_delay()),
            command_retry: RetryCounter::new(timings.call_attempts, timings.call_retry_delay()),
            timings,
            pending_entry: None,
            pending_select: None,
            retry_audio: None,
            last_command_at: None,
            command_in_flight: false,
            ducked_from: None,
            item_failures: 0,
            playlist_listened: 0,
            view_epoch: 0,
            closing: false,
            closed: false,
        };

        let orchestrator = Self {
            inbox: Inbox {
                input: input_rx,
                input_open: true,
                player: player_rx,
                announcer: announcer_rx,
                capture: capture_rx,
                internal: internal_rx,
            },
            core,
        };
        let handle = SessionHandle {
            input: input_tx,
            snapshots: snapshot_rx,
            events: event_rx,
        };
        Ok((orchestrator, handle))
    }

    /// Handle one message. Returns false once the session has closed.
    pub async fn step(&mut self) -> bool {
        if self.core.closed {
            return false;
        }
        let Inbox {
            input,
            input_open,
            player,
            announcer,
            capture,
            internal,
        } = &mut self.inbox;
        let core = &mut self.core;

        tokio::select! {
            msg = input.recv(), if *input_open => match msg {
                Some(msg) => core.on_input(msg),
                None => {
                    *input_open = false;
                    core.stop_session();
                }
            },
            Some(msg) = player.recv() => {
                let notices = core.player.handle(msg);
                core.on_player_notices(notices);
            }
            Some(msg) = announcer.recv() => {
                let notices = core.announcer.handle(msg);
                core.on_announcer_notices(notices);
            }
            Some(msg) = capture.recv() => {
                if let Some(notice) = core.capture.handle(msg) {
                    core.on_capture_notice(notice);
                }
            }
            Some(msg) = internal.recv() => core.on_internal(msg),
        }

        core.publish();
        !core.closed
    }

    /// Run until the session closes
    pub async fn run(mut self) {
        info!("Drive mode session started");
        while self.step().await {}
        info!("Drive mode session closed");
    }
}

struct SessionCore {
    user_id: i64,
    timings: Timings,
    tts_retries: u32,
    demo_voice_dir: Option<PathBuf>,
    api: Arc<dyn DriveApi>,
    urls: TtsUrls,
    player: PlaybackEngine,
    announcer: PlaybackEngine,
    capture: VoiceCapture,
    tx: UnboundedSender<Internal>,
    timers: TimerRegistry<SessionTimer, Internal>,
    events: UnboundedSender<SessionEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    state: SessionState,
    board: MessageBoard,
    fixed: FixedMessageSession,
    announcement: Option<Announcement>,
    listen: ListenTracker,
    entry_retry: RetryCounter,
    command_retry: RetryCounter,
    pending_entry: Option<EntryResponse>,
    pending_select: Option<usize>,
    /// Kept for re-sending while an analysis is retried
    retry_audio: Option<RecordedAudio>,
    last_command_at: Option<Instant>,
    command_in_flight: bool,
    /// Player volume before ducking for a recording
    ducked_from: Option<f32>,
    item_failures: u32,
    /// Seconds listened in the selected playlist
    playlist_listened: u32,
    view_epoch: u64,
    closing: bool,
    closed: bool,
}

impl SessionCore {
    fn spawn(&self, task: impl Future<Output = Internal> + Send + 'static) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let msg = task.await;
            let _ = tx.send(msg);
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        let snapshot = SessionSnapshot::capture(
            &self.state,
            self.player.is_playing(),
            self.player.is_paused(),
            self.player.progress(),
            self.capture.is_recording(),
        );
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn set_status(&mut self, status: Status, message: impl Into<String>) {
        self.state.status = status;
        self.set_message(message);
    }

    fn set_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        let important = MessageBoard::is_important(&message, self.state.status);
        match self.board.post(&message, important) {
            Post::Show => {
                self.timers.cancel(SessionTimer::MessageFlush);
                self.state.status_message = message;
            }
            Post::Deferred(wait) => self.timers.schedule(SessionTimer::MessageFlush, wait),
        }
    }

    /// An article (not a briefing) is the current player item
    fn article_current(&self) -> bool {
        self.state.current_news.is_some() && !self.state.playing_briefing
    }

    fn on_input(&mut self, input: UserInput) {
        if self.closing {
            debug!("Ignoring {:?} while closing", input);
            return;
        }
        match input {
            UserInput::Enter => self.enter(),
            UserInput::MicPress => self.mic_press(),
            UserInput::MicRelease => self.mic_release(),
            UserInput::TogglePlay => self.handle_play_pause(),
            UserInput::Gesture => {
                if self.player.awaiting_gesture() {
                    let notices = self.player.resume();
                    self.on_player_notices(notices);
                }
            }
            UserInput::ResumeChoice(choice) => self.choose(choice),
            UserInput::SelectPlaylist(index) => self.select_by_index(index),
            UserInput::BackToSelection => self.back_to_selection(),
            UserInput::DemoKey(key) => {
                let selection_screen = self.state.view == View::Selection;
                if !self.capture.select_clip(key, selection_screen) {
                    debug!("No demo clip for key {}", key);
                }
            }
            UserInput::OpenHistory => self.open_history(),
            UserInput::DeleteHistory(history_id) => self.delete_history(history_id),
            UserInput::Close => self.stop_session(),
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        if self.closing {
            if let Internal::Deactivated = msg {
                self.closed = true;
                self.emit(SessionEvent::Closed);
            }
            return;
        }
        match msg {
            Internal::Timer(fired) => {
                if self.timers.accept(&fired) {
                    self.on_timer(fired.kind);
                }
            }
            Internal::Entered(result) => self.on_entered(result),
            Internal::Playlists(result) => match result {
                Ok(playlists) => {
                    debug!("Loaded {} playlists", playlists.len());
                    self.state.playlists = playlists;
                }
                Err(e) => {
                    warn!("Failed to load playlists: {}", e);
                    if self.state.view == View::Selection {
                        self.set_message(e.user_message());
                    }
                }
            },
            Internal::PlaylistSelected { epoch, result } => self.on_playlist_selected(epoch, result),
            Internal::Analysis { audio, result } => self.on_analysis(audio, result),
            Internal::FreshQueue(result) => self.on_fresh_queue(result),
            Internal::History(result) => match result {
                Ok(history) => {
                    info!("Loaded {} history entries", history.len());
                    self.state.history = history;
                }
                Err(e) => {
                    warn!("Failed to load history: {}", e);
                    self.set_message(e.user_message());
                }
            },
            Internal::HistoryRecorded(entry) => self.state.history.insert(0, entry),
            Internal::HistoryDeleted {
                history_id,
                was_current,
                was_playing,
                result,
            } => self.on_history_deleted(history_id, was_current, was_playing, result),
            Internal::Deactivated => {}
        }
    }

    fn on_timer(&mut self, kind: SessionTimer) {
        match kind {
            SessionTimer::ResumeChoice => self.on_resume_choice_timeout(),
            SessionTimer::EntryRetry => self.request_entry(),
            SessionTimer::CommandRetry => {
                if let Some(audio) = self.retry_audio.take() {
                    self.analyze(audio);
                }
            }
            SessionTimer::SelectConfirm => {
                if let Some(index) = self.pending_select.take() {
                    if self.state.view == View::Selection {
                        self.select_by_index(index);
                    }
                }
            }
            SessionTimer::StatusRevert => {
                if self.state.status == Status::Success {
                    if self.player.is_playing() && self.article_current() {
                        self.set_status(Status::Playing, "Playing the news...");
                    } else {
                        self.set_status(Status::Idle, READY_MESSAGE);
                    }
                }
            }
            SessionTimer::RecognizedTextHide => self.state.recognized_text = None,
            SessionTimer::MessageFlush => {
                if let Some(message) = self.board.flush() {
                    self.state.status_message = message;
                }
            }
            SessionTimer::NextItem => self.play_next(),
            SessionTimer::VolumeRestore => {
                if let Some(volume) = self.ducked_from.take() {
                    self.player.set_volume(volume);
                }
            }
        }
    }

    // Entry

    fn enter(&mut self) {
        info!("Entering drive mode for user {}", self.user_id);
        self.set_status(Status::Processing, "Starting drive mode...");
        let api = self.api.clone();
        let user_id = self.user_id;
        tokio::spawn(async move {
            if let Err(e) = api.set_drive_mode_active(user_id, true).await {
                debug!("Failed to mark drive mode active: {}", e);
            }
        });
        self.request_entry();
    }

    fn request_entry(&mut self) {
        let api = self.api.clone();
        let user_id = self.user_id;
        self.spawn(async move { Internal::Entered(api.enter_session(user_id).await) });
    }

    fn on_entered(&mut self, result: Result<EntryResponse, ApiError>) {
        match result {
            Ok(entry) => {
                self.entry_retry.reset();
                info!("Entry scenario {:?}", entry.scenario);
                self.pending_entry = Some(entry);
                self.set_status(Status::Processing, "Welcome to drive mode");
                self.play_fixed(FixedMessage::Welcome, Some(Continuation::AfterWelcome));
            }
            Err(e) => match self.entry_retry.on_failure(&e) {
                RetryDecision::Retry { attempt, delay } => {
                    warn!("Entry failed ({}), retrying in {:?}", e, delay);
                    self.set_message(format!(
                        "Checking the network connection... ({}/{})",
                        attempt,
                        self.entry_retry.max_attempts()
                    ));
                    self.timers.schedule(SessionTimer::EntryRetry, delay);
                }
                RetryDecision::Exhausted => {
                    warn!("Entry failed after every attempt: {}", e);
                    self.set_status(Status::Error, "There is a problem with the network connection.");
                    self.load_playlists();
                }
                RetryDecision::NotRetryable => {
                    warn!("Entry failed: {}", e);
                    self.set_status(Status::Error, e.user_message());
                    self.load_playlists();
                }
            },
        }
    }

    fn after_welcome(&mut self) {
        self.load_playlists();
        let Some(entry) = self.pending_entry.take() else {
            return;
        };
        let resume = entry.resume_info();
        let briefing = entry.briefing_audio_url.as_deref().map(|u| self.urls.resolve(u));
        let queue = entry.news_queue.map(NewsQueue::into_items).unwrap_or_default();
        self.state.news_queue = queue.into();

        match resume {
            Some(info) => {
                debug!("Offering to resume {} at sentence {}", info.news_id, info.last_sentence_idx);
                self.state.resume_info = Some(info);
                self.switch_view(View::Playback);
                let url = briefing.unwrap_or_else(|| self.urls.script(RESUME_PROMPT));
                self.play_briefing(url);
            }
            None if !self.state.news_queue.is_empty() => {
                self.switch_view(View::Playback);
                match briefing {
                    Some(url) => self.play_briefing(url),
                    None => self.play_next(),
                }
            }
            None => self.set_status(Status::Idle, "Choose a playlist"),
        }
    }

    fn load_playlists(&mut self) {
        let api = self.api.clone();
        let user_id = self.user_id;
        self.spawn(async move { Internal::Playlists(api.list_playlists(user_id).await) });
    }

    // Briefings and the resume choice

    fn play_briefing(&mut self, url: String) {
        self.state.briefing_url = Some(url.clone());
        self.state.playing_briefing = true;
        self.state.current_news = None;
        self.set_status(Status::Processing, "Preparing the briefing...");
        self.player.play(PlayRequest::announcement(url));
    }

    fn on_briefing_finished(&mut self) {
        self.state.playing_briefing = false;
        self.state.briefing_url = None;
        self.emit(SessionEvent::AnnouncementEnded);
        if self.state.show_resume_choice {
            return;
        }
        if self.state.resume_info.is_some() {
            self.offer_resume_choice();
        } else {
            self.play_next();
        }
    }

    fn offer_resume_choice(&mut self) {
        self.state.show_resume_choice = true;
        self.state.current_news = None;
        self.set_status(
            Status::Idle,
            "Continue the previous article, or start a new briefing?",
        );
        self.timers
            .schedule(SessionTimer::ResumeChoice, self.timings.resume_choice_timeout());
        self.emit(SessionEvent::ResumeChoiceOffered);
    }

    fn on_resume_choice_timeout(&mut self) {
        if !self.state.show_resume_choice {
            debug!("Resume choice already settled");
            return;
        }
        self.state.show_resume_choice = false;
        if self.state.resume_info.is_some() {
            info!("No resume choice made; continuing the previous article");
            self.play_fixed(FixedMessage::ResumeTimeoutAuto, Some(Continuation::Resume));
        } else {
            info!("No resume choice made; moving on");
            self.play_fixed(FixedMessage::ResumeTimeoutNext, Some(Continuation::AdvanceQueue));
        }
    }

    fn choose(&mut self, choice: ResumeChoice) {
        self.timers.cancel(SessionTimer::ResumeChoice);
        self.state.show_resume_choice = false;
        match choice {
            ResumeChoice::Resume => {
                if self.state.resume_info.is_some() {
                    self.resume_article();
                } else {
                    self.set_message("There is no article to continue");
                }
            }
            ResumeChoice::New => {
                self.set_status(Status::Processing, "Preparing a new briefing...");
                self.state.resume_info = None;
                self.state.current_news = None;
                let api = self.api.clone();
                let user_id = self.user_id;
                self.spawn(async move { Internal::FreshQueue(api.news_queue(user_id).await) });
            }
        }
    }

    fn on_fresh_queue(&mut self, result: Result<NewsQueue, ApiError>) {
        match result {
            Ok(queue) => {
                self.state.news_queue = queue.into_items().into();
                info!("Fresh queue with {} items", self.state.news_queue.len());
                self.switch_view(View::Playback);
                let url = self.urls.script(NEW_BRIEFING_PROMPT);
                self.play_briefing(url);
            }
            Err(e) => {
                warn!("Failed to load a fresh queue: {}", e);
                self.set_status(Status::Error, e.user_message());
            }
        }
    }

    fn resume_article(&mut self) {
        let Some(info) = self.state.resume_info.clone() else {
            self.play_next();
            return;
        };
        let news = NewsRef {
            news_id: info.news_id,
            title: info.title,
            category: None,
        };
        self.start_article(news, Some(info.last_sentence_idx));
    }

    // Queue

    fn start_article(&mut self, news: NewsRef, start_sentence_idx: Option<u32>) {
        self.timers.cancel(SessionTimer::NextItem);
        self.timers.cancel(SessionTimer::ResumeChoice);
        self.state.show_resume_choice = false;
        if self.player.is_playing() && self.player.current_item() == Some(news.news_id.as_str()) {
            debug!("Article {} is already playing", news.news_id);
            self.set_status(Status::Playing, "Playing the news...");
            return;
        }
        self.state.playing_briefing = false;
        self.set_status(Status::Processing, "Preparing the news...");
        let url = self.urls.news(&news.news_id, start_sentence_idx);
        self.state.start_sentence_idx = start_sentence_idx.unwrap_or(0);
        self.state.current_news = Some(news.clone());
        self.player.play(PlayRequest::item(url, news.news_id));
    }

    fn play_next(&mut self) {
        self.timers.cancel(SessionTimer::NextItem);
        match self.state.news_queue.pop_front() {
            Some(news) => {
                debug!("Next article {} ({} left)", news.news_id, self.state.news_queue.len());
                self.start_article(news, None);
            }
            None => self.complete_queue(),
        }
    }

    fn complete_queue(&mut self) {
        info!("Queue finished");
        self.state.current_news = None;
        self.set_status(Status::Idle, "All news played");
        if let Some(history_id) = self
            .state
            .selected_playlist
            .as_ref()
            .and_then(|p| p.history_id)
        {
            let api = self.api.clone();
            let listened = self.playlist_listened;
            tokio::spawn(async move {
                if let Err(e) = api
                    .update_playlist_history(history_id, HistoryStatus::Completed, listened, listened)
                    .await
                {
                    warn!("Failed to complete playlist history {}: {}", history_id, e);
                }
            });
        }
        self.emit(SessionEvent::QueueCompleted);
        self.play_fixed(FixedMessage::PlaylistCompleted, None);
    }

    fn skip_to_next(&mut self) {
        self.player.stop();
        self.listen.reset();
        self.timers.cancel(SessionTimer::ResumeChoice);
        self.state.show_resume_choice = false;
        self.state.current_news = None;
        self.state.playing_briefing = false;
        self.state.briefing_url = None;
        self.timers.cancel(SessionTimer::NextItem);
        self.play_fixed(FixedMessage::NextArticle, Some(Continuation::AdvanceQueue));
    }

    fn handle_play_pause(&mut self) {
        if self.player.awaiting_gesture() {
            let notices = self.player.resume();
            self.on_player_notices(notices);
        } else if self.player.is_playing() || self.player.is_paused() {
            let notices = self.player.toggle_pause();
            self.on_player_notices(notices);
        } else if self.player.is_busy() {
            debug!("Player is still loading");
        } else if let Some(url) = self.state.briefing_url.clone() {
            self.play_briefing(url);
        } else if self.state.resume_info.is_some() {
            self.choose(ResumeChoice::Resume);
        } else if !self.state.news_queue.is_empty() {
            self.play_next();
        } else {
            self.set_message("No news to play");
        }
    }

    fn record_history(&self, news: &NewsRef, status: HistoryStatus, listened: u32) {
        let record = HistoryRecord {
            user_id: self.user_id,
            item_id: news.news_id.clone(),
            category: news.category_or_default().to_string(),
            status,
            listen_duration_sec: listened,
            last_sentence_idx: Some(self.state.start_sentence_idx),
        };
        let api = self.api.clone();
        let tx = self.tx.clone();
        let news = news.clone();
        tokio::spawn(async move {
            match api.record_history(&record).await {
                Ok(Some(history_id)) => {
                    let entry = HistoryEntry::for_news(
                        history_id,
                        &news,
                        status,
                        listened,
                        record.last_sentence_idx.unwrap_or(0),
                    );
                    let _ = tx.send(Internal::HistoryRecorded(entry));
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Failed to record {} for {}: {}",
                    status.as_str(),
                    news.news_id,
                    e
                ),
            }
        });
    }

    // Player

    fn on_player_notices(&mut self, notices: Vec<PlaybackNotice>) {
        for notice in notices {
            self.on_player_notice(notice);
        }
    }

    fn on_player_notice(&mut self, notice: PlaybackNotice) {
        match notice {
            PlaybackNotice::Retrying { attempt, .. } => {
                self.set_status(
                    Status::Processing,
                    format!("Generating audio... (retry {}/{})", attempt, self.tts_retries),
                );
            }
            PlaybackNotice::Started { item: Some(id) } => self.on_article_started(id),
            PlaybackNotice::Started { item: None } => {
                self.set_status(Status::Playing, "Playing announcement...");
                self.emit(SessionEvent::AnnouncementStarted);
            }
            PlaybackNotice::Progress { .. } => {}
            PlaybackNotice::Paused { item } => {
                if item.is_some() {
                    self.listen.pause();
                }
                if matches!(self.state.status, Status::Playing | Status::Success) {
                    self.set_status(
                        Status::Idle,
                        "Paused. Press the mic button to give a command",
                    );
                }
            }
            PlaybackNotice::Resumed { item } => {
                if item.is_some() {
                    self.listen.resume();
                    self.set_status(Status::Playing, "Playing the news...");
                } else {
                    self.set_status(Status::Playing, "Playing announcement...");
                }
            }
            PlaybackNotice::Ended { item: Some(id) } => self.on_article_ended(id),
            PlaybackNotice::Ended { item: None } => self.on_briefing_finished(),
            PlaybackNotice::Degraded { code, .. } => {
                warn!("Playback degraded ({:?})", code);
                self.set_status(
                    Status::Playing,
                    "Audio output may be unavailable; playback continues",
                );
            }
            PlaybackNotice::Failed(failure) => match failure.item {
                Some(_) => self.on_article_failed(failure),
                None => {
                    warn!("Briefing failed: {}", failure.message);
                    self.on_briefing_finished();
                }
            },
            PlaybackNotice::AutoplayBlocked { .. } => {
                self.set_status(Status::Idle, "Tap once to start playback");
            }
        }
    }

    fn on_article_started(&mut self, news_id: String) {
        self.item_failures = 0;
        let news = match &self.state.current_news {
            Some(n) if n.news_id == news_id => n.clone(),
            _ => NewsRef::new(news_id.clone()),
        };
        self.state.current_news = Some(news.clone());
        self.state.show_resume_choice = false;
        self.set_status(Status::Playing, "Playing the news...");
        self.listen.start();
        self.record_history(&news, HistoryStatus::Play, 0);
        self.emit(SessionEvent::ItemStarted {
            news_id,
            start_sentence_idx: self.state.start_sentence_idx,
        });
    }

    fn on_article_ended(&mut self, news_id: String) {
        self.item_failures = 0;
        let listened = self.listen.finish();
        self.playlist_listened += listened;
        if let Some(news) = self.state.current_news.take() {
            self.record_history(&news, HistoryStatus::Completed, listened);
        }
        if self
            .state
            .resume_info
            .as_ref()
            .map(|r| r.news_id == news_id)
            .unwrap_or(false)
        {
            self.state.resume_info = None;
        }
        self.emit(SessionEvent::ItemEnded { news_id });
        self.play_next();
    }

    fn on_article_failed(&mut self, failure: PlaybackFailure) {
        self.listen.reset();
        self.state.current_news = None;
        self.item_failures += 1;
        let news_id = failure.item.clone().unwrap_or_default();
        warn!(
            "Article {} failed ({} in a row): {}",
            news_id, self.item_failures, failure.message
        );
        self.emit(SessionEvent::ItemFailed { news_id });

        if self.item_failures >= self.timings.max_item_failures {
            self.item_failures = 0;
            self.set_status(
                Status::Error,
                "Playback failed several times in a row, so the queue has stopped.",
            );
            self.emit(SessionEvent::QueueHalted);
            self.play_fixed(FixedMessage::TtsRetry, None);
        } else if !self.state.news_queue.is_empty() {
            self.set_status(Status::Processing, "Moving to the next article...");
            self.timers
                .schedule(SessionTimer::NextItem, self.timings.next_item_delay());
        } else {
            self.set_status(Status::Error, failure_message(&failure));
        }
    }

    // Fixed messages

    fn play_fixed(&mut self, message: FixedMessage, continuation: Option<Continuation>) {
        let stamp = self.fixed.begin();
        let mut resume_after = false;
        if let Some(previous) = self.announcement.take() {
            debug!("{:?} superseded by {:?}", previous.message, message);
            resume_after = previous.resume_after;
        }
        if self.player.is_playing() && self.article_current() {
            self.player.pause();
            self.listen.pause();
            resume_after = true;
        }
        debug!("Fixed message {:?} (stamp {})", message, stamp);
        self.announcement = Some(Announcement {
            stamp,
            message,
            stage: Stage::Asset,
            resume_after,
            continuation,
        });
        self.emit(SessionEvent::FixedMessageStarted(message));
        self.announcer
            .play(PlayRequest::announcement(self.urls.fixed_asset(message.key())));
    }

    fn on_announcer_notices(&mut self, notices: Vec<PlaybackNotice>) {
        for notice in notices {
            let (stamp, message, stage) = match &self.announcement {
                Some(a) => (a.stamp, a.message, a.stage),
                None => return,
            };
            if !self.fixed.is_current(stamp) {
                debug!("Dropping stale notice for {:?}", message);
                self.announcement = None;
                return;
            }
            match notice {
                PlaybackNotice::Ended { .. } => self.finish_fixed(true),
                PlaybackNotice::Failed(failure) if stage == Stage::Asset => {
                    debug!(
                        "Asset for {:?} unavailable ({}); synthesizing",
                        message, failure.message
                    );
                    if let Some(a) = self.announcement.as_mut() {
                        a.stage = Stage::Script;
                    }
                    self.announcer
                        .play(PlayRequest::announcement(self.urls.script(message.text())));
                }
                PlaybackNotice::Failed(failure) => {
                    warn!("Fixed message {:?} failed: {}", message, failure.message);
                    self.finish_fixed(false);
                }
                PlaybackNotice::AutoplayBlocked { .. } => {
                    self.announcer.stop();
                    self.set_message("Tap once to start playback");
                    self.finish_fixed(false);
                }
                _ => {}
            }
        }
    }

    fn finish_fixed(&mut self, played: bool) {
        let Some(announcement) = self.announcement.take() else {
            return;
        };
        self.emit(SessionEvent::FixedMessageFinished {
            message: announcement.message,
            played,
        });
        if announcement.resume_after && announcement.message.resumes_playback() {
            let notices = self.player.resume();
            self.on_player_notices(notices);
        }
        if let Some(continuation) = announcement.continuation {
            self.run_continuation(continuation);
        }
    }

    fn run_continuation(&mut self, continuation: Continuation) {
        debug!("Continuing with {:?}", continuation);
        match continuation {
            Continuation::AfterWelcome => self.after_welcome(),
            Continuation::LoadPlaylists => self.load_playlists(),
            Continuation::Resume => self.resume_article(),
            Continuation::AdvanceQueue => self.play_next(),
            Continuation::ResumePlayer => {
                if self.player.is_paused() || self.player.awaiting_gesture() {
                    let notices = self.player.resume();
                    self.on_player_notices(notices);
                } else if !self.player.is_busy() {
                    self.handle_play_pause();
                }
            }
            Continuation::StartPlaylist(selection) => self.start_playlist(selection),
        }
    }

    // Screens and playlists

    fn switch_view(&mut self, view: View) {
        if self.state.view == view {
            return;
        }
        debug!("View {:?} -> {:?}", self.state.view, view);
        self.view_epoch += 1;
        self.fixed.invalidate();
        self.announcement = None;
        self.announcer.stop();
        self.pending_select = None;
        self.timers.cancel(SessionTimer::SelectConfirm);
        self.state.view = view;
    }

    fn select_by_index(&mut self, index: usize) {
        let Some(playlist) = self.state.playlists.get(index).cloned() else {
            self.set_message("Please choose a playlist");
            return;
        };
        self.set_status(Status::Processing, format!("Loading {}...", playlist.title));
        self.request_playlist(playlist.id);
    }

    fn request_playlist(&mut self, playlist_id: String) {
        info!("Selecting playlist {}", playlist_id);
        let api = self.api.clone();
        let user_id = self.user_id;
        let epoch = self.view_epoch;
        self.spawn(async move {
            let result = api.select_playlist(user_id, &playlist_id).await;
            Internal::PlaylistSelected { epoch, result }
        });
    }

    fn on_playlist_selected(&mut self, epoch: u64, result: Result<PlaylistSelection, ApiError>) {
        if epoch != self.view_epoch {
            debug!("Dropping playlist selection from an old screen");
            return;
        }
        match result {
            Ok(selection) if selection.news_list.is_empty() => {
                let message = selection
                    .message
                    .unwrap_or_else(|| "There is no news in this category".to_string());
                self.set_status(Status::Error, message);
            }
            Ok(selection) if selection.is_duplicate && selection.message.is_some() => {
                if let Some(message) = selection.message.clone() {
                    self.set_message(message);
                }
                self.play_fixed(
                    FixedMessage::NewsNotUpdated,
                    Some(Continuation::StartPlaylist(selection)),
                );
            }
            Ok(selection) => self.start_playlist(selection),
            Err(e) => {
                warn!("Playlist selection failed: {}", e);
                self.set_status(Status::Error, e.user_message());
            }
        }
    }

    fn start_playlist(&mut self, selection: PlaylistSelection) {
        let title = selection
            .playlist_title
            .clone()
            .or_else(|| {
                self.state
                    .playlists
                    .iter()
                    .find(|p| p.id == selection.playlist_id)
                    .map(|p| p.title.clone())
            })
            .unwrap_or_else(|| selection.playlist_id.clone());

        self.switch_view(View::Playback);
        self.timers.cancel(SessionTimer::ResumeChoice);
        self.state.show_resume_choice = false;
        self.state.resume_info = None;
        self.state.selected_playlist = Some(SelectedPlaylist {
            id: selection.playlist_id,
            title,
            history_id: selection.history_id,
        });
        self.playlist_listened = 0;
        self.state.news_queue = selection.news_list.into();
        self.set_status(
            Status::Processing,
            "Loading the audio, this can take a minute or two",
        );
        self.play_next();
    }

    fn back_to_selection(&mut self) {
        self.player.stop();
        self.listen.reset();
        self.timers.cancel(SessionTimer::NextItem);
        self.timers.cancel(SessionTimer::ResumeChoice);
        self.state.current_news = None;
        self.state.news_queue.clear();
        self.state.playing_briefing = false;
        self.state.briefing_url = None;
        self.state.show_resume_choice = false;
        self.state.selected_playlist = None;
        self.switch_view(View::Selection);
        self.set_status(Status::Idle, "Choose a playlist");
    }

    // History

    fn open_history(&mut self) {
        let api = self.api.clone();
        let user_id = self.user_id;
        self.spawn(async move { Internal::History(api.list_history(user_id).await) });
    }

    fn play_latest_history(&mut self) {
        let Some(entry) = self.state.history.first().cloned() else {
            self.set_message("There is no listening history yet");
            return;
        };
        match entry.target() {
            Some(HistoryTarget::News(news_id)) => {
                let news = NewsRef {
                    news_id,
                    title: None,
                    category: entry.category.clone(),
                };
                self.start_article(news, Some(entry.last_sentence_idx.unwrap_or(0)));
            }
            Some(HistoryTarget::Playlist(playlist_id)) => {
                self.set_status(Status::Processing, "Loading the playlist...");
                self.request_playlist(playlist_id);
            }
            None => self.set_message("That history entry cannot be played"),
        }
    }

    fn delete_history(&mut self, history_id: i64) {
        let was_current = self
            .state
            .selected_playlist
            .as_ref()
            .map(|p| p.history_id == Some(history_id))
            .unwrap_or(false);
        let was_playing = was_current && self.player.is_playing();
        if was_playing {
            let notices = self.player.pause();
            self.on_player_notices(notices);
        }
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.delete_history(history_id).await;
            Internal::HistoryDeleted {
                history_id,
                was_current,
                was_playing,
                result,
            }
        });
    }

    fn on_history_deleted(
        &mut self,
        history_id: i64,
        was_current: bool,
        was_playing: bool,
        result: Result<(), ApiError>,
    ) {
        match result {
            Ok(()) => {
                info!("Deleted history {}", history_id);
                self.state.history.retain(|h| h.history_id != history_id);
                self.open_history();
                if was_current {
                    self.back_to_selection();
                }
                if was_playing {
                    self.set_status(Status::Idle, FixedMessage::PlaylistDeleted.text());
                    self.play_fixed(FixedMessage::PlaylistDeleted, None);
                } else {
                    self.set_message("History entry deleted");
                }
            }
            Err(e) => {
                warn!("Failed to delete history {}: {}", history_id, e);
                self.set_message(format!("Could not delete the history entry. {}", e.user_message()));
                if was_playing {
                    let notices = self.player.resume();
                    self.on_player_notices(notices);
                }
            }
        }
    }

    // Voice commands

    fn mic_press(&mut self) {
        if self.command_in_flight {
            debug!("Command still resolving; ignoring the mic");
            self.emit(SessionEvent::CommandRejected(Rejection::InFlight));
            return;
        }
        if self.capture.is_recording() {
            return;
        }
        match self.capture.start_recording() {
            Ok(()) => self.on_recording_started(),
            Err(CaptureError::DeviceNotFound) if self.demo_voice_dir.is_some() => {
                if let Some(dir) = self.demo_voice_dir.clone() {
                    info!("No microphone found; using demo voice clips in {}", dir.display());
                    self.capture
                        .replace_microphone(Box::new(DemoMicrophone::new(dir)));
                }
                match self.capture.start_recording() {
                    Ok(()) => self.on_recording_started(),
                    Err(e) => self.on_capture_failed(e),
                }
            }
            Err(e) => self.on_capture_failed(e),
        }
    }

    fn on_recording_started(&mut self) {
        self.set_status(Status::Recording, "Listening...");
        if self.player.is_playing() && self.article_current() && self.ducked_from.is_none() {
            self.timers.cancel(SessionTimer::VolumeRestore);
            let volume = self.player.volume();
            self.ducked_from = Some(volume);
            self.player.set_volume(self.timings.ducked_volume);
        }
    }

    fn on_capture_failed(&mut self, error: CaptureError) {
        warn!("Recording failed to start: {}", error);
        self.set_status(Status::Error, error.user_message());
    }

    fn mic_release(&mut self) {
        if !self.capture.is_recording() {
            return;
        }
        let audio = self.capture.stop_recording();
        self.submit(audio);
    }

    fn on_capture_notice(&mut self, notice: CaptureNotice) {
        let CaptureNotice::AutoStop { reason, audio } = notice;
        debug!("Recording stopped by itself ({:?})", reason);
        self.submit(audio);
    }

    fn submit(&mut self, audio: Option<RecordedAudio>) {
        let Some(audio) = audio else {
            self.reject(Rejection::NothingRecorded, Some("Nothing was recorded. Please try again."));
            return;
        };
        if audio.len() < self.timings.min_command_bytes {
            self.reject(Rejection::TooShort, Some("Please speak a little longer"));
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_command_at {
            if now.saturating_duration_since(last) < self.timings.command_cooldown() {
                debug!("Command within the cooldown; dropped");
                self.reject(Rejection::Cooldown, None);
                return;
            }
        }
        if self.command_in_flight {
            self.reject(Rejection::InFlight, None);
            return;
        }
        self.last_command_at = Some(now);
        self.command_in_flight = true;
        self.set_status(Status::Processing, "Recognizing the command...");
        self.analyze(audio);
    }

    fn reject(&mut self, rejection: Rejection, message: Option<&str>) {
        self.emit(SessionEvent::CommandRejected(rejection));
        if self.state.status == Status::Recording {
            if self.player.is_playing() && self.article_current() {
                self.set_status(Status::Playing, message.unwrap_or("Playing the news..."));
            } else {
                self.set_status(Status::Idle, message.unwrap_or(READY_MESSAGE));
            }
        } else if let Some(message) = message {
            self.set_message(message);
        }
        self.schedule_volume_restore();
    }

    fn analyze(&mut self, audio: RecordedAudio) {
        debug!("Analyzing {} bytes of {}", audio.len(), audio.mime_type);
        let api = self.api.clone();
        let user_id = self.user_id;
        self.spawn(async move {
            let result = api.analyze_voice_command(&audio, user_id).await;
            Internal::Analysis { audio, result }
        });
    }

    fn on_analysis(&mut self, audio: RecordedAudio, result: Result<CommandAnalysis, ApiError>) {
        if !self.command_in_flight {
            return;
        }
        match result {
            Ok(analysis) => {
                self.command_retry.reset();
                self.command_in_flight = false;
                if let Some(text) = analysis.raw_text.as_deref().filter(|t| !t.trim().is_empty()) {
                    self.state.recognized_text = Some(text.to_string());
                    self.timers.schedule(
                        SessionTimer::RecognizedTextHide,
                        self.timings.recognized_text_hide(),
                    );
                }
                let intent = Intent::from_analysis(&analysis)
                    .refine(analysis.raw_text.as_deref(), self.article_current());
                info!("Voice command {} ({:?})", intent, analysis.raw_text);
                self.dispatch(intent);
                self.schedule_volume_restore();
            }
            Err(e) => match self.command_retry.on_failure(&e) {
                RetryDecision::Retry { attempt, delay } => {
                    warn!("Command analysis failed ({}), retrying in {:?}", e, delay);
                    self.set_message(format!(
                        "Checking the network connection... ({}/{})",
                        attempt,
                        self.command_retry.max_attempts()
                    ));
                    self.retry_audio = Some(audio);
                    self.timers.schedule(SessionTimer::CommandRetry, delay);
                }
                RetryDecision::Exhausted => {
                    self.command_in_flight = false;
                    self.set_status(Status::Error, "Please check your network connection.");
                    self.schedule_volume_restore();
                }
                RetryDecision::NotRetryable => {
                    self.command_in_flight = false;
                    self.set_status(Status::Error, e.user_message());
                    self.schedule_volume_restore();
                }
            },
        }
    }

    fn schedule_volume_restore(&mut self) {
        if self.ducked_from.is_some() {
            self.timers
                .schedule(SessionTimer::VolumeRestore, self.timings.volume_restore_delay());
        }
    }

    fn welcome_playing(&self) -> bool {
        self.announcement
            .as_ref()
            .map(|a| a.message == FixedMessage::Welcome)
            .unwrap_or(false)
    }

    /// Welcome message or briefing in progress
    fn onboarding(&self) -> bool {
        self.state.playing_briefing || self.welcome_playing()
    }

    fn dispatch(&mut self, intent: Intent) {
        if self.onboarding() && !intent.allowed_during_announcement() {
            info!("Ignoring {} during the announcement", intent);
            self.emit(SessionEvent::CommandRejected(Rejection::DuringAnnouncement));
            if self.state.playing_briefing && self.player.is_paused() {
                // RESUME stays filtered while the briefing is paused
                self.set_status(Status::Idle, "Announcement paused. Press play to continue");
            } else if self.state.playing_briefing {
                self.set_status(Status::Playing, "Playing announcement...");
            } else {
                self.set_status(Status::Processing, "Welcome to drive mode");
            }
            return;
        }
        self.emit(SessionEvent::CommandDispatched(intent));
        self.set_status(Status::Success, format!("Command: {}", intent));
        self.timers
            .schedule(SessionTimer::StatusRevert, self.timings.success_revert());

        if intent == Intent::Next && self.welcome_playing() {
            info!("Skipping the welcome message");
            self.announcer.stop();
            self.finish_fixed(false);
            return;
        }
        match self.state.view {
            View::Selection => self.dispatch_on_selection(intent),
            View::Playback => self.dispatch_on_playback(intent),
        }
    }

    fn dispatch_on_selection(&mut self, intent: Intent) {
        match intent {
            Intent::Select(slot) => {
                self.pending_select = Some(slot.index());
                self.timers.schedule(
                    SessionTimer::SelectConfirm,
                    self.timings.select_confirm_delay(),
                );
            }
            Intent::Stop => self.stop_session(),
            Intent::Help | Intent::Unknown | Intent::SttFailed => self.hint(intent),
            Intent::HistoryOpen => self.open_history(),
            _ => self.set_message("Please choose a playlist"),
        }
    }

    fn dispatch_on_playback(&mut self, intent: Intent) {
        match intent {
            Intent::Next => self.skip_to_next(),
            Intent::Pause => {
                let notices = self.player.pause();
                self.on_player_notices(notices);
                self.play_fixed(FixedMessage::Paused, None);
            }
            Intent::Resume => self.play_fixed(FixedMessage::Resumed, Some(Continuation::ResumePlayer)),
            Intent::Stop => {
                if let Some(news) = self.state.current_news.clone() {
                    let listened = self.listen.finish();
                    self.record_history(&news, HistoryStatus::Rejected, listened);
                }
                self.stop_session();
            }
            Intent::SeekForward => self.seek(SEEK_STEP_SECS),
            Intent::SeekBackward => self.seek(-SEEK_STEP_SECS),
            Intent::Help | Intent::Unknown | Intent::SttFailed => self.hint(intent),
            Intent::ResumeChoice => self.choose(ResumeChoice::Resume),
            Intent::NewBriefingChoice => self.choose(ResumeChoice::New),
            Intent::HistoryOpen => self.open_history(),
            Intent::HistoryPlay => self.play_latest_history(),
            Intent::HistoryDelete => match self.state.history.first() {
                Some(entry) => self.delete_history(entry.history_id),
                None => self.set_message("There is no listening history yet"),
            },
            Intent::Play => self.handle_play_pause(),
            Intent::Select(_) => {
                self.set_message("Go back to the playlist screen to choose another playlist")
            }
        }
    }

    fn seek(&mut self, delta: f64) {
        if self.article_current() && self.player.seek_by(delta) {
            if delta > 0.0 {
                self.set_message("Moved 10 seconds forward");
            } else {
                self.set_message("Moved 10 seconds back");
            }
        } else {
            self.set_message("You can only seek while playing");
        }
    }

    fn hint(&mut self, intent: Intent) {
        let message = match intent {
            Intent::Help => FixedMessage::Help,
            Intent::SttFailed => FixedMessage::SttFailed,
            _ => FixedMessage::CommandNotUnderstood,
        };
        self.set_message(message.text());
        self.timers
            .schedule(SessionTimer::StatusRevert, self.timings.hint_revert());
        self.play_fixed(message, None);
    }

    // Teardown

    fn stop_session(&mut self) {
        if self.closing {
            return;
        }
        info!("Ending drive mode");
        self.capture.abort();
        self.timers.clear_all();
        self.fixed.invalidate();
        self.announcement = None;
        self.player.stop();
        self.announcer.stop();

        self.listen.reset();
        self.command_in_flight = false;
        self.retry_audio = None;
        self.pending_select = None;
        self.ducked_from = None;
        self.board.clear();
        self.state.current_news = None;
        self.state.playing_briefing = false;
        self.state.show_resume_choice = false;
        self.set_status(Status::Idle, "Drive mode ended");
        self.closing = true;

        let api = self.api.clone();
        let user_id = self.user_id;
        let had_playlist = self.state.selected_playlist.is_some();
        self.spawn(async move {
            if had_playlist {
                if let Err(e) = api.sync_playback_state(user_id, "", 0).await {
                    debug!("Failed to clear playback state: {}", e);
                }
            }
            if let Err(e) = api.set_drive_mode_active(user_id, false).await {
                warn!("Failed to mark drive mode inactive: {}", e);
            }
            Internal::Deactivated
        });
    }
}

/// Terminal message for an article that could not be played
fn failure_message(failure: &PlaybackFailure) -> String {
    if failure.server_code.as_deref() == Some(TTS_GENERATION_FAILED) {
        "The speech service is having trouble. Please try again in a moment.".to_string()
    } else if failure.code == MediaErrorCode::Network {
        "Could not load the audio. Please check your network connection.".to_string()
    } else if failure.from_server && !failure.message.is_empty() {
        failure.message.clone()
    } else {
        "This article could not be played.".to_string()
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
