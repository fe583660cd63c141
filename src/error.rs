//! Error types for the voice pipeline.

/// Top-level error type for the voice assistant daemon.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Command dispatcher error (bad command table, malformed tool tag).
    #[error("dispatcher error: {0}")]
    Dispatcher(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
