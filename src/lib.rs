//! dawn-voice: a local voice-assistant daemon.
//!
//! Continuously captures microphone audio, detects speech boundaries,
//! transcribes them, routes recognized text either to a deterministic
//! command table or to an LLM backend, and speaks the response.
//!
//! # Architecture
//!
//! - **Ring buffer** ([`ring_buffer`]): SPSC byte queue bridging the
//!   capture thread and the state-machine driver.
//! - **Capture** ([`audio`]): reads from the microphone via `cpal`.
//! - **VAD** ([`vad`]): RMS-energy speech/silence gate with TTS-aware
//!   debounce and cooldown.
//! - **Preroll** ([`preroll`]): a short pre-trigger audio window so
//!   utterance onsets survive VAD latency.
//! - **ASR** ([`asr`]): a streaming-or-chunking transcription adapter.
//! - **Pipeline** ([`pipeline`]): the five-state driver wiring the above
//!   into one session, plus the LLM worker ([`llm`]) and TTS gateway
//!   ([`tts`]).
//! - **Dispatcher** ([`dispatcher`]): direct command-table matching and
//!   `<command>` tool-tag execution.
//! - **Lifecycle** ([`lifecycle`]): SIGINT handling and graceful shutdown.

pub mod asr;
pub mod audio;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod input_queue;
pub mod lifecycle;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod preroll;
pub mod ring_buffer;
pub mod tts;
pub mod vad;

pub use config::SpeechConfig;
pub use error::{Result, SpeechError};
pub use pipeline::{Pipeline, States};
