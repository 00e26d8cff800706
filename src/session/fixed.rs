//! Fixed messages
//!
//! Short canned announcements played on the announcer engine, first from
//! the precomputed static asset and then through on-demand synthesis.

/// A canned announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixedMessage {
    Welcome,
    NextArticle,
    Paused,
    Resumed,
    CommandNotUnderstood,
    SttFailed,
    Help,
    PlaylistLoading,
    PlaylistCompleted,
    TtsError,
    NetworkError,
    TtsRetry,
    NewsNotUpdated,
    PlaylistDeleted,
    ResumeTimeoutAuto,
    ResumeTimeoutNext,
}

impl FixedMessage {
    pub const ALL: [FixedMessage; 16] = [
        FixedMessage::Welcome,
        FixedMessage::NextArticle,
        FixedMessage::Paused,
        FixedMessage::Resumed,
        FixedMessage::CommandNotUnderstood,
        FixedMessage::SttFailed,
        FixedMessage::Help,
        FixedMessage::PlaylistLoading,
        FixedMessage::PlaylistCompleted,
        FixedMessage::TtsError,
        FixedMessage::NetworkError,
        FixedMessage::TtsRetry,
        FixedMessage::NewsNotUpdated,
        FixedMessage::PlaylistDeleted,
        FixedMessage::ResumeTimeoutAuto,
        FixedMessage::ResumeTimeoutNext,
    ];

    /// Asset name under `/static/audio/fixed/`
    pub fn key(self) -> &'static str {
        match self {
            FixedMessage::Welcome => "welcome",
            FixedMessage::NextArticle => "next_article",
            FixedMessage::Paused => "paused",
            FixedMessage::Resumed => "resumed",
            FixedMessage::CommandNotUnderstood => "command_not_understood",
            FixedMessage::SttFailed => "stt_failed",
            FixedMessage::Help => "help",
            FixedMessage::PlaylistLoading => "playlist_loading",
            FixedMessage::PlaylistCompleted => "playlist_completed",
            FixedMessage::TtsError => "tts_error",
            FixedMessage::NetworkError => "network_error",
            FixedMessage::TtsRetry => "tts_retry",
            FixedMessage::NewsNotUpdated => "news_not_updated",
            FixedMessage::PlaylistDeleted => "playlist_deleted",
            FixedMessage::ResumeTimeoutAuto => "resume_timeout_auto",
            FixedMessage::ResumeTimeoutNext => "resume_timeout_next",
        }
    }

    /// Text sent to the synthesis fallback
    pub fn text(self) -> &'static str {
        match self {
            FixedMessage::Welcome => "Welcome to drive mode",
            FixedMessage::NextArticle => "Here is the next article",
            FixedMessage::Paused => "Paused",
            FixedMessage::Resumed => "Resuming playback",
            FixedMessage::CommandNotUnderstood => {
                "I didn't understand. Try commands like 'next' or 'pause'."
            }
            FixedMessage::SttFailed => "I couldn't hear that. Please speak louder and more clearly.",
            FixedMessage::Help => "Press the mic button and say a command.",
            FixedMessage::PlaylistLoading => "Getting your playlist ready",
            FixedMessage::PlaylistCompleted => "That's the end of the playlist",
            FixedMessage::TtsError => "Something went wrong while generating the audio",
            FixedMessage::NetworkError => "There is a connection problem. Please try again shortly.",
            FixedMessage::TtsRetry => {
                "There was a problem playing the news. Trying again shortly."
            }
            FixedMessage::NewsNotUpdated => {
                "News hasn't been updated yet. Playing the previous playlist."
            }
            FixedMessage::PlaylistDeleted => "The playlist was deleted and playback stopped.",
            FixedMessage::ResumeTimeoutAuto => "Picking up where you left off",
            FixedMessage::ResumeTimeoutNext => "Moving on to the next article",
        }
    }

    /// Whether an article paused for this message continues afterwards.
    /// Only messages that leave playback state alone qualify.
    pub fn resumes_playback(self) -> bool {
        matches!(
            self,
            FixedMessage::Help | FixedMessage::CommandNotUnderstood | FixedMessage::SttFailed
        )
    }
}

/// Stamp counter for fixed-message playback. Each message takes a fresh
/// stamp; anything carrying an older one is stale.
#[derive(Debug, Default)]
pub struct FixedMessageSession {
    current: u64,
}

impl FixedMessageSession {
    pub fn begin(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    /// Make every outstanding stamp stale
    pub fn invalidate(&mut self) {
        self.current += 1;
    }

    pub fn is_current(&self, stamp: u64) -> bool {
        stamp == self.current
    }
}
