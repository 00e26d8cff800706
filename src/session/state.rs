//! Session state and the status line
//!
//! [`SessionState`] is owned and mutated by the orchestrator only. Readers
//! get a [`SessionSnapshot`] through a watch channel.

use crate::models::{HistoryEntry, NewsRef, Playlist, ResumeInfo};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Recording,
    Processing,
    Playing,
    Success,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::Recording => "recording",
            Status::Processing => "processing",
            Status::Playing => "playing",
            Status::Success => "success",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which screen the session is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    Selection,
    Playback,
}

/// The playlist chosen on the selection screen
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPlaylist {
    pub id: String,
    pub title: String,
    pub history_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub status: Status,
    pub status_message: String,
    pub recognized_text: Option<String>,
    /// The article playing now; `None` during announcements
    pub current_news: Option<NewsRef>,
    /// Sentence the current article was started from
    pub start_sentence_idx: u32,
    pub news_queue: VecDeque<NewsRef>,
    pub resume_info: Option<ResumeInfo>,
    pub briefing_url: Option<String>,
    pub playing_briefing: bool,
    pub show_resume_choice: bool,
    /// Newest first
    pub history: Vec<HistoryEntry>,
    pub view: View,
    pub playlists: Vec<Playlist>,
    pub selected_playlist: Option<SelectedPlaylist>,
}

/// Read-only view of the session for the terminal front end and tests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: Status,
    pub status_message: String,
    pub recognized_text: Option<String>,
    pub current_title: Option<String>,
    pub queue_len: usize,
    pub show_resume_choice: bool,
    pub view: View,
    pub playlist_titles: Vec<String>,
    pub selected_playlist: Option<String>,
    pub history_len: usize,
    pub playing: bool,
    pub paused: bool,
    pub progress: f64,
    pub recording: bool,
}

impl SessionSnapshot {
    pub fn capture(state: &SessionState, playing: bool, paused: bool, progress: f64, recording: bool) -> Self {
        Self {
            status: state.status,
            status_message: state.status_message.clone(),
            recognized_text: state.recognized_text.clone(),
            current_title: state.current_news.as_ref().map(|n| n.display_title()),
            queue_len: state.news_queue.len(),
            show_resume_choice: state.show_resume_choice,
            view: state.view,
            playlist_titles: state.playlists.iter().map(|p| p.title.clone()).collect(),
            selected_playlist: state.selected_playlist.as_ref().map(|p| p.title.clone()),
            history_len: state.history.len(),
            playing,
            paused,
            progress,
            recording,
        }
    }
}

const IMPORTANT_WORDS: [&str; 7] = [
    "permission",
    "network",
    "connection",
    "error",
    "fail",
    "not found",
    "problem",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Post {
    Show,
    /// Hold the text until the current one has been visible long enough
    Deferred(Duration),
}

/// Keeps each status message on screen for a minimum time unless the new
/// one is important
#[derive(Debug)]
pub struct MessageBoard {
    min_visible: Duration,
    shown_at: Option<Instant>,
    pending: Option<String>,
}

impl MessageBoard {
    pub fn new(min_visible: Duration) -> Self {
        Self {
            min_visible,
            shown_at: None,
            pending: None,
        }
    }

    pub fn is_important(text: &str, status: Status) -> bool {
        if status == Status::Error {
            return true;
        }
        let lower = text.to_lowercase();
        IMPORTANT_WORDS.iter().any(|w| lower.contains(w))
    }

    pub fn post(&mut self, text: &str, important: bool) -> Post {
        let now = Instant::now();
        if !important {
            if let Some(at) = self.shown_at {
                let visible = now.saturating_duration_since(at);
                if visible < self.min_visible {
                    self.pending = Some(text.to_string());
                    return Post::Deferred(self.min_visible - visible);
                }
            }
        }
        self.pending = None;
        self.shown_at = Some(now);
        Post::Show
    }

    /// Take the held message, marking it shown now
    pub fn flush(&mut self) -> Option<String> {
        let text = self.pending.take()?;
        self.shown_at = Some(Instant::now());
        Some(text)
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}
