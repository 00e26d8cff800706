//! Drive API collaborator
//!
//! The session talks to the backend only through [`DriveApi`]. The HTTP
//! implementation lives in [`http`]; tests substitute a scripted fake.

pub mod http;

use crate::audio::PositionReporter;
use crate::error::ApiError;
use crate::models::{
    CommandAnalysis, EntryResponse, HistoryEntry, HistoryStatus, NewsQueue, Playlist,
    PlaylistSelection, RecordedAudio,
};
use async_trait::async_trait;
use log::debug;
use reqwest::Url;
use std::sync::Arc;

pub use http::{HttpAudioFetcher, HttpDriveApi};

/// A history write as sent to the server
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub user_id: i64,
    pub item_id: String,
    pub category: String,
    pub status: HistoryStatus,
    pub listen_duration_sec: u32,
    pub last_sentence_idx: Option<u32>,
}

#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn enter_session(&self, user_id: i64) -> Result<EntryResponse, ApiError>;

    async fn news_queue(&self, user_id: i64) -> Result<NewsQueue, ApiError>;

    async fn list_playlists(&self, user_id: i64) -> Result<Vec<Playlist>, ApiError>;

    async fn select_playlist(
        &self,
        user_id: i64,
        playlist_id: &str,
    ) -> Result<PlaylistSelection, ApiError>;

    async fn analyze_voice_command(
        &self,
        audio: &RecordedAudio,
        user_id: i64,
    ) -> Result<CommandAnalysis, ApiError>;

    /// Returns the id of the created record when the server reports one
    async fn record_history(&self, record: &HistoryRecord) -> Result<Option<i64>, ApiError>;

    async fn list_history(&self, user_id: i64) -> Result<Vec<HistoryEntry>, ApiError>;

    async fn delete_history(&self, history_id: i64) -> Result<(), ApiError>;

    async fn update_playlist_history(
        &self,
        history_id: i64,
        status: HistoryStatus,
        current_time_sec: u32,
        listen_duration_sec: u32,
    ) -> Result<(), ApiError>;

    async fn sync_playback_state(
        &self,
        user_id: i64,
        item_id: &str,
        current_time_sec: u32,
    ) -> Result<(), ApiError>;

    async fn set_drive_mode_active(&self, user_id: i64, active: bool) -> Result<(), ApiError>;
}

/// Reports playback position through the Drive API, ignoring failures
pub struct ApiPositionReporter {
    api: Arc<dyn DriveApi>,
    user_id: i64,
}

impl ApiPositionReporter {
    pub fn new(api: Arc<dyn DriveApi>, user_id: i64) -> Self {
        Self { api, user_id }
    }
}

#[async_trait]
impl PositionReporter for ApiPositionReporter {
    async fn report(&self, item_id: &str, position_secs: f64) {
        let secs = position_secs.max(0.0).floor() as u32;
        if let Err(e) = self.api.sync_playback_state(self.user_id, item_id, secs).await {
            debug!("Playback sync for {} failed: {}", item_id, e);
        }
    }
}

/// Builds the TTS and fixed-asset URLs
#[derive(Debug, Clone)]
pub struct TtsUrls {
    api_base: Url,
    static_base: Url,
    voice_type: String,
    speed: String,
}

impl TtsUrls {
    pub fn new(
        api_base: &str,
        static_base: &str,
        voice_type: impl Into<String>,
        speed: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| ApiError::Decode(format!("invalid api base {}: {}", api_base, e)))?;
        let static_base = Url::parse(static_base)
            .map_err(|e| ApiError::Decode(format!("invalid static base {}: {}", static_base, e)))?;
        Ok(Self {
            api_base,
            static_base,
            voice_type: voice_type.into(),
            speed: speed.into(),
        })
    }

    /// Article audio, optionally starting at a sentence index
    pub fn news(&self, news_id: &str, start_sentence_idx: Option<u32>) -> String {
        let mut url = self.endpoint("tts");
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("newsId", news_id)
                .append_pair("voiceType", &self.voice_type)
                .append_pair("speed", &self.speed);
            if let Some(idx) = start_sentence_idx {
                query.append_pair("startSentenceIdx", &idx.to_string());
            }
        }
        url.to_string()
    }

    /// On-demand synthesis of literal text
    pub fn script(&self, text: &str) -> String {
        let mut url = self.endpoint("tts/script");
        url.query_pairs_mut()
            .append_pair("text", text)
            .append_pair("voiceType", &self.voice_type)
            .append_pair("speed", &self.speed);
        url.to_string()
    }

    /// Precomputed asset for a fixed message key
    pub fn fixed_asset(&self, key: &str) -> String {
        let mut url = self.static_base.clone();
        url.set_query(None);
        url.set_path(&format!(
            "/static/audio/fixed/{}_{}_{}.mp3",
            key, self.voice_type, self.speed
        ));
        url.to_string()
    }

    /// Resolve a server-provided (possibly relative) URL against the static origin
    pub fn resolve(&self, url: &str) -> String {
        match self.static_base.join(url) {
            Ok(u) => u.to_string(),
            Err(_) => url.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.api_base.clone();
        let base = self.api_base.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", base, path));
        url.set_query(None);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> TtsUrls {
        TtsUrls::new(
            "http://localhost:8080/api/drive",
            "http://localhost:8080",
            "nova",
            "1.0",
        )
        .unwrap()
    }

    #[test]
    fn test_news_url() {
        assert_eq!(
            urls().news("42", None),
            "http://localhost:8080/api/drive/tts?newsId=42&voiceType=nova&speed=1.0"
        );
        assert_eq!(
            urls().news("42", Some(3)),
            "http://localhost:8080/api/drive/tts?newsId=42&voiceType=nova&speed=1.0&startSentenceIdx=3"
        );
    }

    #[test]
    fn test_script_url_encodes_text() {
        let url = urls().script("Paused. Say resume");
        assert!(url.starts_with("http://localhost:8080/api/drive/tts/script?text=Paused.+Say+resume"));
        assert!(url.ends_with("&voiceType=nova&speed=1.0"));
    }

    #[test]
    fn test_fixed_asset_url() {
        assert_eq!(
            urls().fixed_asset("welcome"),
            "http://localhost:8080/static/audio/fixed/welcome_nova_1.0.mp3"
        );
    }

    #[test]
    fn test_resolve_relative_briefing_url() {
        assert_eq!(
            urls().resolve("/api/drive/tts/script?text=hi"),
            "http://localhost:8080/api/drive/tts/script?text=hi"
        );
        assert_eq!(urls().resolve("https://cdn.example/a.mp3"), "https://cdn.example/a.mp3");
    }

    #[test]
    fn test_invalid_base_rejected() {
        assert!(TtsUrls::new("not a url", "http://x", "nova", "1.0").is_err());
    }
}
