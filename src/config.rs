//! Configuration types for the voice pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the cooking-assistant voice pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio capture settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech segment recording/encoding settings.
    pub segment: SegmentConfig,
    /// Utterance buffering (completeness flush) settings.
    pub utterance: UtteranceConfig,
    /// Streamed-audio playback settings.
    pub playback: PlaybackConfig,
    /// Idle guidance hint settings.
    pub hints: HintConfig,
    /// Backend service endpoints.
    pub backend: BackendConfig,
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Pipeline sample rate in Hz; capture downsamples to this.
    pub input_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            input_device: None,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration.
///
/// The detector uses asymmetric hysteresis: a frame must reach
/// `start_threshold` to open a segment, but only needs to stay above the
/// lower `end_threshold` to keep it open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold that opens a speech segment.
    pub start_threshold: f32,
    /// RMS threshold that keeps an open segment alive. Must be below
    /// `start_threshold`.
    pub end_threshold: f32,
    /// Silence duration in ms (no frame above `end_threshold`) that closes
    /// a segment.
    pub silence_window_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.1,
            end_threshold: 0.025,
            silence_window_ms: 1500,
        }
    }
}

/// Speech segment recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Segments shorter than this are discarded without transcription.
    pub min_speech_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self { min_speech_ms: 300 }
    }
}

/// Utterance buffering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceConfig {
    /// Extra wait in ms after an INCOMPLETE fragment before force-flushing.
    /// Measured from the most recent fragment, not cumulative.
    pub incomplete_extra_wait_ms: u64,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            incomplete_extra_wait_ms: 2000,
        }
    }
}

/// Streamed-audio playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate assumed for TTS chunks until the stream reports one.
    pub default_sample_rate: u32,
    /// Lead in ms applied when re-anchoring the schedule after an underrun.
    pub underrun_lead_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_sample_rate: 32_000,
            underrun_lead_ms: 20,
        }
    }
}

/// Idle guidance hint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HintConfig {
    /// Silence duration in ms before a guidance hint is shown.
    pub idle_ms: u64,
    /// Maximum number of hints per session.
    pub max_hints: u32,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            idle_ms: 30_000,
            max_hints: 5,
        }
    }
}

/// Backend service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the assistant backend (STT, generation, sessions).
    pub base_url: String,
    /// Member id sent when creating a voice session.
    pub member_id: i64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_owned(),
            member_id: 0,
        }
    }
}

impl VoiceConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/sous/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp/sous-config"))
            .join("sous")
            .join("config.toml")
    }
}
