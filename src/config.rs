//! Configuration types for the voice assistant daemon.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SpeechError};

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Ring buffer (C1) settings.
    pub ring_buffer: RingBufferConfig,
    /// Preroll buffer (C4) settings.
    pub preroll: PrerollConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Conversation gate settings (wake word / goodbye / cancel phrases).
    pub conversation: ConversationConfig,
    /// Barge-in (interrupt) behavior while TTS is playing.
    pub barge_in: BargeInConfig,
    /// Command dispatcher (direct command table) settings.
    pub command_table: CommandTableConfig,
    /// Overall pipeline behavior (mode, timing constants).
    pub pipeline: PipelineConfig,
    /// Where conversation/metrics snapshots are persisted.
    pub data: DataConfig,
}

impl SpeechConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field omitted from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SpeechError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| SpeechError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz (pipeline operates at this rate internally).
    pub input_sample_rate: u32,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
    /// Number of input channels (1 = mono).
    pub input_channels: u16,
    /// Capture chunk size in frames.
    pub buffer_size: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 16_000,
            input_channels: 1,
            buffer_size: 512,
            input_device: None,
            output_device: None,
        }
    }
}

/// Ring buffer (C1) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferConfig {
    /// Capacity in bytes. ~262144 bytes is ~8s of 16kHz mono i16 audio.
    pub capacity_bytes: usize,
    /// Timeout in ms for `wait_for(min_bytes, timeout)`.
    pub wait_timeout_ms: u64,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 262_144,
            wait_timeout_ms: 2_000,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection in normal operation.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default, good for most environments)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub speech_threshold: f32,
    /// RMS energy threshold while TTS is playing (or within `cooldown_ms` of
    /// having played). Higher than `speech_threshold` to resist echo.
    pub speech_threshold_tts: f32,
    /// Consecutive above-threshold frames required to declare speech while
    /// TTS is active. Defeats spurious residual-echo triggers.
    pub debounce_frames_tts: u32,
    /// Milliseconds after TTS onset during which all speech detection is
    /// suppressed, to let any echo canceller converge.
    pub startup_cooldown_ms: u32,
    /// Milliseconds after TTS stops during which `speech_threshold_tts`
    /// (rather than `speech_threshold`) is still applied.
    pub cooldown_ms: u32,
    /// VAD analysis frame size in samples. Must match `VAD_FRAME = 512`.
    pub frame_samples: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.01,
            speech_threshold_tts: 0.05,
            debounce_frames_tts: 3,
            startup_cooldown_ms: 300,
            cooldown_ms: 700,
            frame_samples: 512,
        }
    }
}

/// Preroll ring (C4) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrerollConfig {
    /// Capacity in bytes (~500ms of 16kHz mono i16 audio == 16000 bytes).
    pub capacity_bytes: usize,
}

impl Default for PrerollConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 16_000,
        }
    }
}

/// Which ASR engine family is active.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrEngineKind {
    /// Incremental streaming-partials engine (e.g. Vosk-like).
    Streaming,
    /// Chunking engine that finalizes on a pause or max-duration boundary
    /// (e.g. Whisper-like).
    #[default]
    Chunking,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Which engine family to run.
    pub engine: AsrEngineKind,
    /// Path to the ASR model (opaque to the core; passed to the concrete
    /// engine implementation).
    pub model_path: PathBuf,
    /// Chunking engine: silence duration (ms) after sufficient speech that
    /// ends a chunk at a natural pause.
    pub pause_duration_ms: u32,
    /// Chunking engine: minimum speech duration (ms) before a pause is
    /// allowed to finalize a chunk.
    pub min_duration_ms: u32,
    /// Chunking engine: forced chunk boundary after this much continuous
    /// speech (ms), regardless of pauses.
    pub max_duration_ms: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            engine: AsrEngineKind::Chunking,
            model_path: PathBuf::from("models/asr.bin"),
            pause_duration_ms: 700,
            min_duration_ms: 250,
            max_duration_ms: 15_000,
        }
    }
}

/// Language model configuration (single HTTP completion backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-chat-completions-compatible server.
    pub api_url: String,
    /// Model identifier to request.
    pub api_model: String,
    /// Bearer API key (empty for servers that don't require one).
    pub api_key: String,
    /// System prompt prepended to every conversation.
    pub system_prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling threshold.
    pub top_p: f32,
    /// Maximum tokens to generate per completion.
    pub max_tokens: u32,
    /// Maximum number of non-system messages retained in history (oldest
    /// trimmed first). 0 disables trimming.
    pub max_history_messages: usize,
    /// HTTP request timeout in seconds. A call exceeding this is treated as
    /// an error, not a cancellation.
    pub http_timeout_s: u64,
    /// How often (ms) the streaming read loop checks the interrupt flag.
    /// Bounds the cancellation latency (target: <= 200ms).
    pub progress_probe_ms: u64,
    /// Inter-sentence pacing applied by the TTS gateway consumer (ms).
    pub sentence_pacing_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            api_model: "llama3".to_owned(),
            api_key: String::new(),
            system_prompt: "You are a helpful voice assistant. Keep replies brief.".to_owned(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 512,
            max_history_messages: 20,
            http_timeout_s: 30,
            progress_probe_ms: 150,
            sentence_pacing_ms: 300,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Path to the TTS voice/model (opaque to the core).
    pub voice_path: PathBuf,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Speech speed multiplier.
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_path: PathBuf::from("voices/default"),
            sample_rate: 16_000,
            speed: 1.0,
        }
    }
}

/// Conversation gate configuration (wake word table, goodbye/cancel phrases).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// The assistant's name, concatenated with `wake_prefixes` to build the
    /// wake-word table (e.g. prefix "hey" + name "friday" -> "hey friday").
    pub ai_name: String,
    /// Prefixes combined with `ai_name` to build the wake-word table.
    pub wake_prefixes: Vec<String>,
    /// Phrases that end the session (matched against the full normalized
    /// transcript).
    pub goodbye_phrases: Vec<String>,
    /// Phrases that cancel a soft-paused response without ending the
    /// session (matched while TTS is in `PAUSE`).
    pub cancel_phrases: Vec<String>,
    /// Spoken acknowledgment when the wake word is heard with no command
    /// tail.
    pub empty_wake_ack: String,
    /// Spoken farewell on a goodbye match.
    pub farewell: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ai_name: "friday".to_owned(),
            wake_prefixes: vec![String::new(), "hey".to_owned(), "ok".to_owned()],
            goodbye_phrases: vec!["goodbye".to_owned(), "bye bye".to_owned()],
            cancel_phrases: vec!["never mind".to_owned(), "cancel".to_owned()],
            empty_wake_ack: "Hello sir.".to_owned(),
            farewell: "Goodbye sir.".to_owned(),
        }
    }
}

/// Barge-in / ducking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether barge-in (speaking over TTS) is enabled at all.
    pub enabled: bool,
    /// Volume fraction music is ducked to on first speech detection while
    /// music playback is active.
    pub duck_volume: f32,
    /// Seconds of continuous silence after which ducked volume is restored.
    pub duck_restore_after_s: f32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duck_volume: 0.3,
            duck_restore_after_s: 2.0,
        }
    }
}

/// Command dispatcher (C11) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTableConfig {
    /// Path to the command table JSON file (see crate::dispatcher for the
    /// schema). `None` disables direct-command matching entirely.
    pub table_path: Option<PathBuf>,
    /// Maximum fixed-point iterations when resolving chained `<command>`
    /// tags produced by follow-up LLM calls.
    pub max_recursion: u32,
}

impl Default for CommandTableConfig {
    fn default() -> Self {
        Self {
            table_path: None,
            max_recursion: 4,
        }
    }
}

/// How recognized text is routed: direct command table only, direct-first
/// with LLM fallback, or LLM only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Only the command table is consulted; unmatched text is dropped.
    DirectOnly,
    /// The command table is tried first; on no match, falls through to the
    /// LLM.
    #[default]
    DirectFirst,
    /// The command table is never consulted; all text goes to the LLM.
    LlmOnly,
}

/// Overall pipeline timing and mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Command routing mode.
    pub mode: PipelineMode,
    /// Length of one state-machine polling iteration in ms (the historical
    /// "100ms loop", now driven by the ring buffer's `wait_for`).
    pub iteration_ms: u64,
    /// Consecutive silent iterations that end `COMMAND_RECORDING` when VAD
    /// is silent (`DEFAULT_COMMAND_TIMEOUT`). 24 * 50ms = 1.2s.
    pub command_timeout_iterations: u32,
    /// Absolute ceiling on listening duration (ms) regardless of silence.
    pub max_recording_duration_ms: u32,
    /// Known placeholder transcripts treated as empty (e.g. from ASR
    /// engines that emit a sentinel on silence).
    pub blank_placeholders: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::DirectFirst,
            iteration_ms: 50,
            command_timeout_iterations: 24,
            max_recording_duration_ms: 20_000,
            blank_placeholders: vec!["[BLANK_AUDIO]".to_owned()],
        }
    }
}

/// Where persisted state (conversation snapshots, metrics) is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory for `chat_history_*.json` and `dawn_stats_*.json`.
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("dawn-voice")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = SpeechConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: SpeechConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.vad.speech_threshold, config.vad.speech_threshold);
        assert_eq!(parsed.conversation.ai_name, config.conversation.ai_name);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let partial = "[conversation]\nai_name = \"dawn\"\n";
        let parsed: SpeechConfig = toml::from_str(partial).expect("parse");
        assert_eq!(parsed.conversation.ai_name, "dawn");
        assert_eq!(parsed.audio.input_sample_rate, 16_000);
    }

    #[test]
    fn from_file_reads_toml_and_overlays_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm]\napi_model = \"custom-model\"\n").expect("write");
        let config = SpeechConfig::from_file(&path).expect("load");
        assert_eq!(config.llm.api_model, "custom-model");
        assert_eq!(config.llm.temperature, LlmConfig::default().temperature);
    }

    #[test]
    fn from_file_missing_path_errors() {
        let result = SpeechConfig::from_file(Path::new("/nonexistent/dawn-voice.toml"));
        assert!(result.is_err());
    }
}
