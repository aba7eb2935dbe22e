//! Sous: hands-free voice assistant for cook mode.
//!
//! While the user's hands are busy, the pipeline listens continuously and
//! turns speech into streamed, spoken answers:
//! Microphone → VAD → segment recording → STT (+completeness) → utterance
//! buffering → streaming LLM+TTS response → scheduled playback.
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async
//! channels, all coordinated by one control loop:
//! - **Audio capture**: records from the microphone via `cpal`
//! - **VAD**: energy-threshold detection with asymmetric hysteresis
//! - **Segments**: per-burst recording, WAV-encoded for upload
//! - **STT**: backend transcription with sentence-completeness analysis
//! - **Utterance buffer**: completeness-driven flush policy
//! - **Generation**: SSE-framed streaming LLM + TTS response protocol
//! - **Playback**: gapless sample-accurate scheduling of PCM chunks
//!
//! New user speech always wins: onset during an assistant turn stops
//! playback and aborts the stream before the new segment starts recording.

pub mod audio;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod generation;
pub mod hints;
pub mod pipeline;
pub mod segment;
pub mod session;
pub mod sse;
pub mod stt;
pub mod utterance;
pub mod vad;

pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use pipeline::coordinator::PipelineCoordinator;
pub use pipeline::messages::{PipelineEvent, PipelinePhase};
pub use session::CookHandoff;
