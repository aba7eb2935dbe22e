//! Error types for the voice pipeline.

/// Top-level error type for the cooking-assistant voice pipeline.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access was refused by the platform.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Required capture primitives are absent (no input device, no host).
    #[error("unsupported audio environment: {0}")]
    UnsupportedEnvironment(String),

    /// Audio device or stream error after capture started.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text request failed.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Server-reported error event inside a generation stream.
    #[error("generation stream error: {0}")]
    GenerationStream(String),

    /// Transport-level failure of a generation request (non-cancellation).
    #[error("generation network error: {0}")]
    GenerationNetwork(String),

    /// One malformed record inside an otherwise healthy stream.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    /// Voice-session history save/restore failure (best-effort, non-fatal).
    #[error("lifecycle sync error: {0}")]
    LifecycleSync(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
