//! WAV encoding of recorded commands using hound
//!
//! Commands are encoded in memory as 16-bit mono WAV, ready for upload.

use crate::error::CaptureError;
use crate::models::RecordedAudio;
use hound::{WavSpec, WavWriter};
use std::io::Cursor;

pub const WAV_MIME: &str = "audio/wav";

/// In-memory WAV recorder
#[derive(Debug, Clone)]
pub struct WavRecorder {
    spec: WavSpec,
}

impl WavRecorder {
    /// 16-bit mono at the given sample rate
    pub fn new(sample_rate: u32) -> Self {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Self { spec }
    }

    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    /// Generate a unique upload name for a new recording
    pub fn generate_filename() -> String {
        format!("voice_{}.wav", uuid::Uuid::new_v4())
    }

    /// Encode f32 samples in [-1, 1]
    pub fn encode(&self, samples: &[f32]) -> Result<RecordedAudio, CaptureError> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, self.spec)
                .map_err(|e| CaptureError::Failed(format!("Failed to create WAV writer: {}", e)))?;
            for &sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| CaptureError::Failed(format!("Failed to write sample: {}", e)))?;
            }
            writer
                .finalize()
                .map_err(|e| CaptureError::Failed(format!("Failed to finalize WAV: {}", e)))?;
        }

        Ok(RecordedAudio {
            bytes: cursor.into_inner(),
            file_name: Self::generate_filename(),
            mime_type: WAV_MIME.to_string(),
            duration_ms: Self::duration_ms(samples.len(), self.spec.sample_rate),
        })
    }

    /// Duration of `sample_count` mono samples in milliseconds
    pub fn duration_ms(sample_count: usize, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        sample_count as u64 * 1000 / sample_rate as u64
    }
}

impl Default for WavRecorder {
    fn default() -> Self {
        Self::new(16000)
    }
}
