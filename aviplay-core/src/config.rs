// Playback Settings

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::audio::AUDIO_BUFFER_SAMPLES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-session options. Missing fields in a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Play the audio track when there is one
    pub audio: bool,
    /// Confirm keys and mouse clicks end playback
    pub skippable: bool,
    pub poll_interval_ms: u64,
    /// Device buffer size in sample frames
    pub audio_buffer_samples: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            audio: true,
            skippable: true,
            poll_interval_ms: 10,
            audio_buffer_samples: AUDIO_BUFFER_SAMPLES,
        }
    }
}

impl PlaybackConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
