//! Wire and domain types shared by the API client and the session
//!
//! Field names follow the Drive API's camelCase JSON.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category shown when the server did not send one
pub const DEFAULT_CATEGORY: &str = "General";

/// A reference to one news article
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewsRef {
    pub news_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl NewsRef {
    pub fn new(news_id: impl Into<String>) -> Self {
        Self {
            news_id: news_id.into(),
            title: None,
            category: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Title for display, falling back to the id
    pub fn display_title(&self) -> String {
        match &self.title {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => format!("News {}", self.news_id),
        }
    }

    pub fn category_or_default(&self) -> &str {
        self.category.as_deref().unwrap_or(DEFAULT_CATEGORY)
    }
}

/// A playlist offered on the selection screen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expected_count: Option<u32>,
    #[serde(default)]
    pub news_list: Vec<NewsRef>,
}

/// Response to selecting a playlist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSelection {
    #[serde(default)]
    pub history_id: Option<i64>,
    pub playlist_id: String,
    #[serde(default)]
    pub playlist_title: Option<String>,
    #[serde(default)]
    pub news_list: Vec<NewsRef>,
    /// Combined audio for the whole playlist; items are played one by one instead
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Which entry sequence the server picked for this session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryScenario {
    ResumeBriefing,
    NewBriefing,
    FirstTimeWelcome,
}

/// Personalised queue handed out at entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewsQueue {
    #[serde(default)]
    pub personal_news: Vec<NewsRef>,
    #[serde(default)]
    pub hot_news: Option<NewsRef>,
}

impl NewsQueue {
    /// Flatten into play order: personal picks, then the hot item
    pub fn into_items(self) -> Vec<NewsRef> {
        let mut items = self.personal_news;
        items.extend(self.hot_news);
        items
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryResponse {
    pub scenario: EntryScenario,
    #[serde(default, alias = "resumeNewsId")]
    pub news_id: Option<String>,
    #[serde(default)]
    pub last_sentence_idx: Option<u32>,
    #[serde(default)]
    pub news_queue: Option<NewsQueue>,
    #[serde(default)]
    pub briefing_audio_url: Option<String>,
    #[serde(default, alias = "newsTitle")]
    pub resume_news_title: Option<String>,
}

impl EntryResponse {
    /// The interrupted article, if the server offered one
    pub fn resume_info(&self) -> Option<ResumeInfo> {
        match (&self.news_id, self.scenario) {
            (Some(id), EntryScenario::ResumeBriefing) if !id.is_empty() => Some(ResumeInfo {
                news_id: id.clone(),
                last_sentence_idx: self.last_sentence_idx.unwrap_or(0),
                title: self.resume_news_title.clone(),
            }),
            _ => None,
        }
    }
}

/// An article that can be picked up where it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub news_id: String,
    pub last_sentence_idx: u32,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Play,
    Completed,
    Rejected,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Play => "PLAY",
            HistoryStatus::Completed => "COMPLETED",
            HistoryStatus::Rejected => "REJECTED",
        }
    }
}

/// What a history record refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryTarget {
    News(String),
    Playlist(String),
}

/// One listening record, newest first in the session's list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub history_id: i64,
    #[serde(default)]
    pub news_id: Option<String>,
    #[serde(default)]
    pub playlist_id: Option<String>,
    #[serde(default)]
    pub playlist_title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub status: HistoryStatus,
    #[serde(default)]
    pub last_sentence_idx: Option<u32>,
    #[serde(default)]
    pub listen_duration: Option<u32>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
}

impl HistoryEntry {
    /// Build a local record for a news item, stamped now
    pub fn for_news(
        history_id: i64,
        news: &NewsRef,
        status: HistoryStatus,
        listen_duration: u32,
        last_sentence_idx: u32,
    ) -> Self {
        Self {
            history_id,
            news_id: Some(news.news_id.clone()),
            playlist_id: None,
            playlist_title: None,
            category: Some(news.category_or_default().to_string()),
            status,
            last_sentence_idx: Some(last_sentence_idx),
            listen_duration: Some(listen_duration),
            created_at: Some(Utc::now().naive_utc()),
        }
    }

    pub fn target(&self) -> Option<HistoryTarget> {
        match (&self.news_id, &self.playlist_id) {
            (Some(id), _) if !id.is_empty() => Some(HistoryTarget::News(id.clone())),
            (_, Some(id)) if !id.is_empty() => Some(HistoryTarget::Playlist(id.clone())),
            _ => None,
        }
    }
}

/// Result of analysing a recorded voice command
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandAnalysis {
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// A finished voice recording ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAudio {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
    pub duration_ms: u64,
}

impl RecordedAudio {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
