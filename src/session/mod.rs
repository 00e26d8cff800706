//! Drive mode session: state, voice commands and the orchestrator that
//! sequences playback, announcements and recording

mod fixed;
mod intent;
mod listen;
mod orchestrator;
mod retry;
mod state;

pub use fixed::{FixedMessage, FixedMessageSession};
pub use intent::{Intent, PlaylistSlot};
pub use listen::ListenTracker;
pub use orchestrator::{
    Orchestrator, Rejection, ResumeChoice, SessionEvent, SessionHandle, SessionParts, UserInput,
};
pub use retry::{RetryCounter, RetryDecision};
pub use state::{
    MessageBoard, Post, SelectedPlaylist, SessionSnapshot, SessionState, Status, View,
};
