//! Message types passed between pipeline stages and to observers.

use crate::dialogue::DialogueMessage;
use std::time::Instant;

/// A chunk of amplitude samples from the microphone; one frame per capture
/// callback, which doubles as the VAD's fixed-cadence tick.
#[derive(Debug, Clone)]
pub struct AmplitudeFrame {
    /// Mono f32 samples at the pipeline sample rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this frame was captured.
    pub captured_at: Instant,
}

/// Global pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelinePhase {
    /// Listening; the VAD may open new segments freely.
    #[default]
    Idle,
    /// A response is committed and awaited; the VAD keeps ticking but must
    /// not open a new segment.
    LlmWaiting,
    /// A response is arriving/playing; speech onset here is a barge-in.
    TtsStreaming,
}

/// Events emitted for UI and observability.
///
/// Intentionally lightweight so the pipeline can emit without blocking
/// audio-critical paths.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Capture started or stopped.
    Listening { active: bool },
    /// The VAD opened or closed a speech segment.
    Speaking { active: bool },
    /// A message was appended to the dialogue log.
    MessageAppended(DialogueMessage),
    /// An existing message's text/status changed.
    MessagePatched(DialogueMessage),
    /// A message (usually a placeholder) was removed.
    MessageRemoved { id: String },
    /// The global phase changed.
    PhaseChanged(PipelinePhase),
    /// The active recipe step changed.
    StepChanged { index: usize },
    /// The voice session ended; `finished` marks end-of-cooking.
    SessionEnded { finished: bool },
}
