//! Voice activity detection using energy-based analysis.
//!
//! RMS energy thresholding with asymmetric hysteresis: a higher threshold
//! opens a speech segment than the one that keeps it open, so energy
//! hovering near the boundary cannot chatter between states. Silence is
//! measured from frame timestamps, so the detector behaves identically
//! whether it is driven by a live capture stream or synthetic frames.

use crate::config::VadConfig;
use crate::pipeline::messages::AmplitudeFrame;
use std::time::{Duration, Instant};
use tracing::info;

/// Detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Idle,
    Speaking,
}

/// Transition emitted by a single [`EnergyVad::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Frame energy reached the start threshold while idle.
    SpeechStarted,
    /// The silence window elapsed with no frame above the end threshold.
    SpeechEnded,
}

/// Outcome of one detector tick.
#[derive(Debug, Clone, Copy)]
pub struct VadTick {
    /// RMS energy of the frame just processed.
    pub rms: f32,
    /// State transition, if one occurred on this frame.
    pub event: Option<VadEvent>,
}

/// Energy-threshold voice activity detector.
pub struct EnergyVad {
    state: VadState,
    start_threshold: f32,
    end_threshold: f32,
    silence_window: Duration,
    /// Timestamp of the last frame whose RMS reached the end threshold.
    last_above: Option<Instant>,
}

impl EnergyVad {
    /// Create a new detector from config.
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "VAD initialized: start={}, end={}, silence={}ms",
            config.start_threshold, config.end_threshold, config.silence_window_ms
        );
        Self {
            state: VadState::Idle,
            start_threshold: config.start_threshold,
            end_threshold: config.end_threshold,
            silence_window: Duration::from_millis(config.silence_window_ms),
            last_above: None,
        }
    }

    /// Process one amplitude frame.
    pub fn tick(&mut self, frame: &AmplitudeFrame) -> VadTick {
        let rms = compute_rms(&frame.samples);
        let event = match self.state {
            VadState::Idle => {
                if rms >= self.start_threshold {
                    self.state = VadState::Speaking;
                    self.last_above = Some(frame.captured_at);
                    Some(VadEvent::SpeechStarted)
                } else {
                    None
                }
            }
            VadState::Speaking => {
                if rms >= self.end_threshold {
                    self.last_above = Some(frame.captured_at);
                    None
                } else {
                    let silent_for = self
                        .last_above
                        .map_or(Duration::ZERO, |t| frame.captured_at.saturating_duration_since(t));
                    if silent_for >= self.silence_window {
                        self.state = VadState::Idle;
                        self.last_above = None;
                        Some(VadEvent::SpeechEnded)
                    } else {
                        None
                    }
                }
            }
        };
        VadTick { rms, event }
    }

    /// Whether the detector currently considers the user to be speaking.
    pub fn is_speaking(&self) -> bool {
        self.state == VadState::Speaking
    }

    /// Reset the detector to idle.
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.last_above = None;
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
