//! Where playback engines get their audio bytes from

use crate::error::FetchError;
use async_trait::async_trait;

/// The body returned for an audio URL
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedAudio {
    /// A playable (or at least non-JSON) payload
    Audio(Vec<u8>),
    /// A structured JSON error from the TTS service
    ServerError {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
}

/// Fetches audio payloads for the playback engine
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedAudio, FetchError>;
}
