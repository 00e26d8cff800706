//! Voice command intents

use crate::models::CommandAnalysis;
use std::fmt;

/// The six playlists offered on the selection screen, in display order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistSlot {
    Interest,
    Latest,
    Economy,
    Politics,
    It,
    Hot,
}

impl PlaylistSlot {
    pub fn index(self) -> usize {
        match self {
            PlaylistSlot::Interest => 0,
            PlaylistSlot::Latest => 1,
            PlaylistSlot::Economy => 2,
            PlaylistSlot::Politics => 3,
            PlaylistSlot::It => 4,
            PlaylistSlot::Hot => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Next,
    Pause,
    Resume,
    Stop,
    SeekForward,
    SeekBackward,
    Select(PlaylistSlot),
    Unknown,
    SttFailed,
    Help,
    HistoryOpen,
    HistoryPlay,
    HistoryDelete,
    ResumeChoice,
    NewBriefingChoice,
    Play,
}

/// Phrases the analyzer uses when it heard nothing intelligible
const RECOGNITION_FAILURE: [&str; 3] = ["could not recognize", "couldn't recognize", "not recognized"];

impl Intent {
    /// Map an analyzer intent name; anything unrecognised is `Unknown`
    pub fn parse(name: &str) -> Intent {
        match name.trim().to_ascii_uppercase().as_str() {
            "NEXT" => Intent::Next,
            "PAUSE" => Intent::Pause,
            "RESUME" => Intent::Resume,
            "STOP" => Intent::Stop,
            "SEEK_FORWARD" => Intent::SeekForward,
            "SEEK_BACKWARD" => Intent::SeekBackward,
            "SELECT_INTEREST" => Intent::Select(PlaylistSlot::Interest),
            "SELECT_LATEST" => Intent::Select(PlaylistSlot::Latest),
            "SELECT_ECONOMY" => Intent::Select(PlaylistSlot::Economy),
            "SELECT_POLITICS" => Intent::Select(PlaylistSlot::Politics),
            "SELECT_IT" => Intent::Select(PlaylistSlot::It),
            "SELECT_HOT" => Intent::Select(PlaylistSlot::Hot),
            "STT_FAILED" => Intent::SttFailed,
            "HELP" => Intent::Help,
            "HISTORY_OPEN" => Intent::HistoryOpen,
            "HISTORY_PLAY" => Intent::HistoryPlay,
            "HISTORY_DELETE" => Intent::HistoryDelete,
            "RESUME_CHOICE" => Intent::ResumeChoice,
            "NEW_BRIEFING_CHOICE" => Intent::NewBriefingChoice,
            "PLAY" => Intent::Play,
            _ => Intent::Unknown,
        }
    }

    /// Intent for an analysis result. Without an intent the analyzer's
    /// message tells a recognition failure from a command it did not know.
    pub fn from_analysis(analysis: &CommandAnalysis) -> Intent {
        match analysis.intent.as_deref() {
            Some(name) if !name.trim().is_empty() => Intent::parse(name),
            _ => {
                let message = analysis.message.as_deref().unwrap_or("").to_lowercase();
                if RECOGNITION_FAILURE.iter().any(|p| message.contains(p)) {
                    Intent::SttFailed
                } else {
                    Intent::Unknown
                }
            }
        }
    }

    /// "Play the next one" arrives as PLAY; treat it as NEXT while an
    /// article is current
    pub fn refine(self, raw_text: Option<&str>, article_current: bool) -> Intent {
        let says_next = raw_text
            .map(|t| t.to_lowercase().contains("next"))
            .unwrap_or(false);
        if self == Intent::Play && says_next && article_current {
            Intent::Next
        } else {
            self
        }
    }

    /// Commands honoured while an announcement is playing
    pub fn allowed_during_announcement(self) -> bool {
        matches!(self, Intent::Next | Intent::Stop | Intent::Pause)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Next => "NEXT",
            Intent::Pause => "PAUSE",
            Intent::Resume => "RESUME",
            Intent::Stop => "STOP",
            Intent::SeekForward => "SEEK_FORWARD",
            Intent::SeekBackward => "SEEK_BACKWARD",
            Intent::Select(PlaylistSlot::Interest) => "SELECT_INTEREST",
            Intent::Select(PlaylistSlot::Latest) => "SELECT_LATEST",
            Intent::Select(PlaylistSlot::Economy) => "SELECT_ECONOMY",
            Intent::Select(PlaylistSlot::Politics) => "SELECT_POLITICS",
            Intent::Select(PlaylistSlot::It) => "SELECT_IT",
            Intent::Select(PlaylistSlot::Hot) => "SELECT_HOT",
            Intent::Unknown => "UNKNOWN",
            Intent::SttFailed => "STT_FAILED",
            Intent::Help => "HELP",
            Intent::HistoryOpen => "HISTORY_OPEN",
            Intent::HistoryPlay => "HISTORY_PLAY",
            Intent::HistoryDelete => "HISTORY_DELETE",
            Intent::ResumeChoice => "RESUME_CHOICE",
            Intent::NewBriefingChoice => "NEW_BRIEFING_CHOICE",
            Intent::Play => "PLAY",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(intent: Option<&str>, message: Option<&str>) -> CommandAnalysis {
        CommandAnalysis {
            intent: intent.map(str::to_string),
            raw_text: None,
            message: message.map(str::to_string),
            confidence: None,
        }
    }

    #[test]
    fn test_parse_round_trips_names() {
        for name in ["NEXT", "SEEK_BACKWARD", "SELECT_HOT", "HISTORY_DELETE", "NEW_BRIEFING_CHOICE"] {
            assert_eq!(Intent::parse(name).as_str(), name);
        }
        assert_eq!(Intent::parse(" pause "), Intent::Pause);
        assert_eq!(Intent::parse("DANCE"), Intent::Unknown);
    }

    #[test]
    fn test_select_slots_map_to_indices() {
        assert_eq!(Intent::parse("SELECT_INTEREST"), Intent::Select(PlaylistSlot::Interest));
        assert_eq!(PlaylistSlot::Interest.index(), 0);
        assert_eq!(PlaylistSlot::It.index(), 4);
        assert_eq!(PlaylistSlot::Hot.index(), 5);
    }

    #[test]
    fn test_missing_intent_uses_message() {
        let stt = analysis(None, Some("Sorry, we could not recognize your voice"));
        assert_eq!(Intent::from_analysis(&stt), Intent::SttFailed);
        assert_eq!(Intent::from_analysis(&analysis(None, Some("Unsupported command"))), Intent::Unknown);
        assert_eq!(Intent::from_analysis(&analysis(Some(""), None)), Intent::Unknown);
        assert_eq!(Intent::from_analysis(&analysis(Some("HELP"), None)), Intent::Help);
    }

    #[test]
    fn test_play_next_becomes_next_only_with_an_article() {
        assert_eq!(Intent::Play.refine(Some("Play the next one"), true), Intent::Next);
        assert_eq!(Intent::Play.refine(Some("Play the next one"), false), Intent::Play);
        assert_eq!(Intent::Play.refine(Some("play"), true), Intent::Play);
        assert_eq!(Intent::Pause.refine(Some("next"), true), Intent::Pause);
    }

    #[test]
    fn test_announcement_filter() {
        assert!(Intent::Next.allowed_during_announcement());
        assert!(Intent::Stop.allowed_during_announcement());
        assert!(Intent::Pause.allowed_during_announcement());
        assert!(!Intent::Help.allowed_during_announcement());
        assert!(!Intent::Select(PlaylistSlot::It).allowed_during_announcement());
    }
}
