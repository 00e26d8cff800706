//! Scripted demo voice
//!
//! Stands in for a microphone on machines without one. Pressing the mic
//! starts a synthetic level animation; a number key picks a pre-recorded
//! command clip from the demo directory; releasing hands that clip over as
//! the recording. Key numbering depends on the screen.

use crate::audio::{InputStream, Microphone};
use crate::error::CaptureError;
use crate::models::RecordedAudio;
use log::{debug, info};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub const DEMO_MIME: &str = "audio/mpeg";

/// One pre-recorded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoClip {
    pub key: u8,
    pub file: &'static str,
    pub label: &'static str,
}

pub const SELECTION_CLIPS: [DemoClip; 6] = [
    DemoClip { key: 1, file: "select_interest.mp3", label: "Today's picks for you" },
    DemoClip { key: 2, file: "select_latest.mp3", label: "Today's top stories" },
    DemoClip { key: 3, file: "select_economy.mp3", label: "Economy and business" },
    DemoClip { key: 4, file: "select_politics.mp3", label: "Politics and society" },
    DemoClip { key: 5, file: "select_it.mp3", label: "IT and science" },
    DemoClip { key: 6, file: "select_hot.mp3", label: "Breaking news" },
];

pub const PLAYBACK_CLIPS: [DemoClip; 5] = [
    DemoClip { key: 1, file: "pause.mp3", label: "Pause" },
    DemoClip { key: 2, file: "resume.mp3", label: "Resume" },
    DemoClip { key: 3, file: "seek_forward.mp3", label: "Forward 10 seconds" },
    DemoClip { key: 4, file: "help.mp3", label: "Help" },
    DemoClip { key: 5, file: "stop.mp3", label: "Stop" },
];

/// Look up the clip for a key on the selection or playback screen
pub fn clip_for_key(key: u8, selection_screen: bool) -> Option<DemoClip> {
    let clips: &[DemoClip] = if selection_screen {
        &SELECTION_CLIPS
    } else {
        &PLAYBACK_CLIPS
    };
    clips.iter().find(|c| c.key == key).copied()
}

const BASE_DB: f32 = -38.0;
const AMPLITUDE_DB: f32 = 8.0;
const PHASE_STEP: f32 = 0.15;
const LEVEL_STEP: Duration = Duration::from_millis(80);

/// Animated level, stepped every 80 ms
pub fn demo_level(elapsed: Duration) -> f32 {
    let steps = (elapsed.as_millis() / LEVEL_STEP.as_millis()) as f32;
    let t = steps * PHASE_STEP;
    let wave = t.sin() * 0.6 + (t * 2.3).sin() * 0.4;
    BASE_DB + wave * AMPLITUDE_DB
}

#[derive(Default)]
struct Selection {
    clip: Option<DemoClip>,
}

/// Microphone replacement backed by clip files
pub struct DemoMicrophone {
    dir: PathBuf,
    selection: Arc<Mutex<Selection>>,
}

impl DemoMicrophone {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            selection: Arc::new(Mutex::new(Selection::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Microphone for DemoMicrophone {
    fn open(&mut self) -> Result<Box<dyn InputStream>, CaptureError> {
        Ok(Box::new(DemoStream {
            dir: self.dir.clone(),
            selection: self.selection.clone(),
            opened_at: Instant::now(),
        }))
    }

    fn select_clip(&mut self, key: u8, selection_screen: bool) -> bool {
        match clip_for_key(key, selection_screen) {
            Some(clip) => {
                info!("Demo command {}: {}", key, clip.label);
                self.lock().clip = Some(clip);
                true
            }
            None => false,
        }
    }

    fn describe(&self) -> &str {
        "demo voice"
    }
}

struct DemoStream {
    dir: PathBuf,
    selection: Arc<Mutex<Selection>>,
    opened_at: Instant,
}

impl InputStream for DemoStream {
    fn has_audio_track(&self) -> bool {
        true
    }

    fn level_db(&mut self) -> f32 {
        demo_level(self.opened_at.elapsed())
    }

    fn finish(&mut self, elapsed: Duration) -> Result<Option<RecordedAudio>, CaptureError> {
        let clip = self
            .selection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clip
            .take();
        let Some(clip) = clip else {
            debug!("Demo recording ended without a command key");
            return Ok(None);
        };

        let path = self.dir.join(clip.file);
        let bytes = fs::read(&path).map_err(|e| {
            CaptureError::Failed(format!("demo clip {} unavailable: {}", path.display(), e))
        })?;
        Ok(Some(RecordedAudio {
            bytes,
            file_name: clip.file.to_string(),
            mime_type: DEMO_MIME.to_string(),
            duration_ms: elapsed.as_millis() as u64,
        }))
    }

    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("drivemode-demo-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("pause.mp3"), vec![7u8; 4096]).unwrap();
        fs::write(dir.join("select_it.mp3"), vec![9u8; 4096]).unwrap();
        dir
    }

    #[test]
    fn test_keys_depend_on_screen() {
        assert_eq!(clip_for_key(5, true).map(|c| c.file), Some("select_it.mp3"));
        assert_eq!(clip_for_key(5, false).map(|c| c.file), Some("stop.mp3"));
        assert_eq!(clip_for_key(6, false), None);
        assert_eq!(clip_for_key(0, true), None);
    }

    #[test]
    fn test_level_stays_in_band() {
        for ms in (0..10_000).step_by(80) {
            let level = demo_level(Duration::from_millis(ms));
            assert!((-46.0..=-30.0).contains(&level), "{} at {}ms", level, ms);
        }
    }

    #[tokio::test]
    async fn test_release_hands_over_selected_clip() {
        let dir = demo_dir();
        let mut mic = DemoMicrophone::new(&dir);
        let mut stream = mic.open().unwrap();
        assert!(mic.select_clip(1, false));

        let audio = stream
            .finish(Duration::from_millis(900))
            .unwrap()
            .expect("clip");
        assert_eq!(audio.file_name, "pause.mp3");
        assert_eq!(audio.mime_type, DEMO_MIME);
        assert_eq!(audio.len(), 4096);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_release_without_key_is_empty() {
        let dir = demo_dir();
        let mut mic = DemoMicrophone::new(&dir);
        let mut stream = mic.open().unwrap();
        assert_eq!(stream.finish(Duration::from_secs(1)).unwrap(), None);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_missing_clip_file_is_an_error() {
        let dir = demo_dir();
        let mut mic = DemoMicrophone::new(&dir);
        let mut stream = mic.open().unwrap();
        assert!(mic.select_clip(2, false));
        assert!(matches!(
            stream.finish(Duration::from_secs(1)),
            Err(CaptureError::Failed(_))
        ));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_key_before_press_is_used_once() {
        let dir = demo_dir();
        let mut mic = DemoMicrophone::new(&dir);
        assert!(mic.select_clip(5, true));
        let mut stream = mic.open().unwrap();
        let audio = stream.finish(Duration::from_secs(1)).unwrap().expect("clip");
        assert_eq!(audio.file_name, "select_it.mp3");

        let mut again = mic.open().unwrap();
        assert_eq!(again.finish(Duration::from_secs(1)).unwrap(), None);
        fs::remove_dir_all(dir).ok();
    }
}
