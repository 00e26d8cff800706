//! drivemode - hands-free news playback driven by push-to-talk voice commands
//!
//! The [`session::Orchestrator`] owns two [`audio::PlaybackEngine`]s (articles
//! and announcements) and an [`audio::VoiceCapture`], and talks to the backend
//! through [`api::DriveApi`].

pub mod api;
pub mod audio;
pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod models;
pub mod session;
pub mod timers;

#[cfg(test)]
mod testkit;
