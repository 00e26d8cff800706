//! Error types for drive mode
//!
//! Each engine boundary gets its own error enum. Engines never hand these
//! across their boundary during steady-state playback or recording; they are
//! folded into notices and the session decides what the user sees.

use thiserror::Error;

/// Errors returned by the Drive API collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// The request never produced a response (refused, reset, timed out)
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the failure is transport-level and worth retrying
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    /// Text suitable for the status line
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Network(_) => "There is a problem with the network connection.".to_string(),
            ApiError::Http { message, .. } if !message.is_empty() => {
                format!("Connection error: {}", message)
            }
            ApiError::Http { status, .. } => format!("Connection error (server returned {})", status),
            ApiError::Decode(_) => "Connection error: the server sent an unexpected reply".to_string(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Errors from fetching an audio payload
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Connection refused, reset or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success status without a structured JSON body
    #[error("Server returned HTTP {0}")]
    Status(u16),
}

/// Errors opening an audio payload in a media backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Failed to open audio: {0}")]
    Open(String),

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),
}

/// Classified microphone start failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Microphone is in use by another application")]
    DeviceBusy,

    #[error("No microphone found")]
    DeviceNotFound,

    #[error("Input stream has no audio track")]
    NoAudioTrack,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Microphone error: {0}")]
    Failed(String),
}

impl CaptureError {
    /// Text suitable for the status line
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::PermissionDenied => {
                "Microphone permission is required. Allow access and try again.".to_string()
            }
            CaptureError::DeviceBusy => {
                "The microphone is being used by another application.".to_string()
            }
            CaptureError::DeviceNotFound => "No microphone was found. Check the device.".to_string(),
            CaptureError::NoAudioTrack => "The microphone did not provide any audio.".to_string(),
            CaptureError::AlreadyRecording => "Already listening.".to_string(),
            CaptureError::Failed(msg) => format!("Could not start the microphone: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_failures_are_network() {
        assert!(ApiError::Network("refused".into()).is_network());
        assert!(!ApiError::Http {
            status: 503,
            message: String::new()
        }
        .is_network());
        assert!(!ApiError::Decode("eof".into()).is_network());
    }

    #[test]
    fn test_user_messages_hide_raw_codes() {
        let msg = ApiError::Network("tcp connect error: os error 111".into()).user_message();
        assert!(msg.contains("network"));
        assert!(!msg.contains("111"));

        let msg = CaptureError::PermissionDenied.user_message();
        assert!(msg.contains("permission"));
    }

    #[test]
    fn test_http_message_prefers_server_text() {
        let err = ApiError::Http {
            status: 404,
            message: "playlist not found".into(),
        };
        assert_eq!(err.user_message(), "Connection error: playlist not found");
    }
}
