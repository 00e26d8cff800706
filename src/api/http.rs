//! REST client for the Drive API
//!
//! All routes hang off the configured base, e.g. `http://host/api/drive`.

use super::{DriveApi, HistoryRecord};
use crate::audio::{AudioFetcher, FetchedAudio};
use crate::error::{ApiError, FetchError};
use crate::models::{
    CommandAnalysis, EntryResponse, HistoryEntry, HistoryStatus, NewsQueue, Playlist,
    PlaylistSelection, RecordedAudio,
};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// JSON error body shared by the API and the TTS service
#[derive(Debug, Default, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpDriveApi {
    client: Client,
    base: String,
}

impl HttpDriveApi {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { client, base }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }
}

/// Check the status and decode the JSON body
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let resp = check(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Turn a non-success response into `ApiError::Http`, preferring the
/// server's own message
async fn check(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ServerMessage>(&body)
        .ok()
        .and_then(|m| m.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(ApiError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl DriveApi for HttpDriveApi {
    async fn enter_session(&self, user_id: i64) -> Result<EntryResponse, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("entry/{}", user_id)))
            .send()
            .await?;
        decode(resp).await
    }

    async fn news_queue(&self, user_id: i64) -> Result<NewsQueue, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("queue/{}", user_id)))
            .send()
            .await?;
        decode(resp).await
    }

    async fn list_playlists(&self, user_id: i64) -> Result<Vec<Playlist>, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("playlists/{}", user_id)))
            .send()
            .await?;
        decode(resp).await
    }

    async fn select_playlist(
        &self,
        user_id: i64,
        playlist_id: &str,
    ) -> Result<PlaylistSelection, ApiError> {
        let resp = self
            .client
            .post(self.url("select-playlist"))
            .query(&[("userId", user_id.to_string())])
            .json(&serde_json::json!({ "playlistId": playlist_id }))
            .send()
            .await?;
        decode(resp).await
    }

    async fn analyze_voice_command(
        &self,
        audio: &RecordedAudio,
        user_id: i64,
    ) -> Result<CommandAnalysis, ApiError> {
        let part = multipart::Part::bytes(audio.bytes.clone())
            .file_name(audio.file_name.clone())
            .mime_str(&audio.mime_type)
            .map_err(|e| ApiError::Decode(format!("invalid audio type: {}", e)))?;
        let form = multipart::Form::new()
            .part("audio", part)
            .text("userId", user_id.to_string());

        debug!(
            "Uploading {} ({} bytes) for analysis",
            audio.file_name,
            audio.len()
        );
        let resp = self
            .client
            .post(self.url("voice/analyze"))
            .multipart(form)
            .send()
            .await?;
        decode(resp).await
    }

    async fn record_history(&self, record: &HistoryRecord) -> Result<Option<i64>, ApiError> {
        let mut form = vec![
            ("userId", record.user_id.to_string()),
            ("newsId", record.item_id.clone()),
            ("category", record.category.clone()),
            ("status", record.status.as_str().to_string()),
            ("listenDuration", record.listen_duration_sec.to_string()),
            ("isRecommended", "false".to_string()),
        ];
        if let Some(idx) = record.last_sentence_idx {
            form.push(("lastSentenceIdx", idx.to_string()));
        }

        let resp = self
            .client
            .post(self.url("history"))
            .form(&form)
            .send()
            .await?;
        let resp = check(resp).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        // The body may be empty, a bare id or a history object
        let id = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| match v {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::Object(map) => map.get("historyId").and_then(|id| id.as_i64()),
                _ => None,
            });
        Ok(id)
    }

    async fn list_history(&self, user_id: i64) -> Result<Vec<HistoryEntry>, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("history/user/{}", user_id)))
            .send()
            .await?;
        decode(resp).await
    }

    async fn delete_history(&self, history_id: i64) -> Result<(), ApiError> {
        let resp = self
            .client
            .delete(self.url(&format!("history/{}", history_id)))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn update_playlist_history(
        &self,
        history_id: i64,
        status: HistoryStatus,
        current_time_sec: u32,
        listen_duration_sec: u32,
    ) -> Result<(), ApiError> {
        let resp = self
            .client
            .patch(self.url(&format!("history/{}", history_id)))
            .query(&[
                ("status", status.as_str().to_string()),
                ("currentTime", current_time_sec.to_string()),
                ("listenDuration", listen_duration_sec.to_string()),
            ])
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn sync_playback_state(
        &self,
        user_id: i64,
        item_id: &str,
        current_time_sec: u32,
    ) -> Result<(), ApiError> {
        let resp = self
            .client
            .patch(self.url("playback/sync"))
            .query(&[
                ("userId", user_id.to_string()),
                ("playlistId", item_id.to_string()),
                ("currentTime", current_time_sec.to_string()),
            ])
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn set_drive_mode_active(&self, user_id: i64, active: bool) -> Result<(), ApiError> {
        let resp = self
            .client
            .patch(self.url(&format!("active/{}", user_id)))
            .query(&[("isActive", active.to_string())])
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

/// Fetches TTS audio over HTTP
pub struct HttpAudioFetcher {
    client: Client,
}

impl HttpAudioFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AudioFetcher for HttpAudioFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAudio, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = resp.status();
        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);

        if is_json {
            let body = resp.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<ServerMessage>(&body).unwrap_or_else(|e| {
                warn!("Unparseable JSON error body from {}: {}", url, e);
                ServerMessage::default()
            });
            return Ok(FetchedAudio::ServerError {
                status: status.as_u16(),
                code: parsed.code,
                message: parsed.message,
            });
        }

        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(FetchedAudio::Audio(bytes.to_vec()))
    }
}
