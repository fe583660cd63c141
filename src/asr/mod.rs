//! Speech-to-text adapter (C5): a dual-mode engine trait (streaming partials
//! vs. chunking-with-finalization) plus a chunking manager that decides
//! segment boundaries for engines that only transcribe complete utterances.

use crate::config::{AsrEngineKind, SttConfig};
use crate::error::Result;
use std::time::{Duration, Instant};

/// A transcription result from an [`AsrEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcription {
    /// Recognized text.
    pub text: String,
    /// True if the engine considers this text final (not subject to later
    /// revision).
    pub is_final: bool,
}

/// Common interface implemented by both streaming and chunking ASR
/// backends.
///
/// `Streaming` engines emit partial transcriptions as audio arrives and a
/// final transcription on `finalize`. `Chunking` engines only ever return a
/// single final transcription from `finalize`, having buffered audio
/// internally via `feed`.
pub trait AsrEngine: Send {
    /// Feed newly captured audio samples (mono, at the engine's configured
    /// sample rate). May return an intermediate partial transcription.
    fn feed(&mut self, samples: &[f32]) -> Result<Option<Transcription>>;

    /// Finalize the current utterance and return its transcription,
    /// clearing any internal buffer.
    fn finalize(&mut self) -> Result<Transcription>;

    /// Discard any buffered audio without producing a transcription
    /// (used when a segment is abandoned, e.g. on barge-in reset).
    fn reset(&mut self);
}

/// A minimal deterministic engine used where no concrete ASR backend is
/// configured. Counts fed samples and reports their duration as text; real
/// deployments provide a concrete [`AsrEngine`] backed by an actual model.
pub struct StubAsrEngine {
    sample_rate: u32,
    sample_count: usize,
}

impl StubAsrEngine {
    /// Create a stub engine for the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            sample_count: 0,
        }
    }
}

impl AsrEngine for StubAsrEngine {
    fn feed(&mut self, samples: &[f32]) -> Result<Option<Transcription>> {
        self.sample_count += samples.len();
        Ok(None)
    }

    fn finalize(&mut self) -> Result<Transcription> {
        let seconds = self.sample_count as f32 / self.sample_rate.max(1) as f32;
        self.sample_count = 0;
        Ok(Transcription {
            text: format!("[{seconds:.1}s of audio]"),
            is_final: true,
        })
    }

    fn reset(&mut self) {
        self.sample_count = 0;
    }
}

/// Wraps a chunking [`AsrEngine`] and decides when a chunk boundary is
/// reached: either a natural pause (`pause_duration_ms` of silence after at
/// least `min_duration_ms` of speech) or a forced boundary at
/// `max_duration_ms` of continuous speech.
pub struct ChunkingManager {
    engine: Box<dyn AsrEngine>,
    pause_duration: Duration,
    min_duration: Duration,
    max_duration: Duration,
    speech_started_at: Option<Instant>,
    silence_started_at: Option<Instant>,
    full_text: String,
}

impl ChunkingManager {
    /// Build a chunking manager around a concrete engine, using the
    /// boundary timing from `config`.
    pub fn new(engine: Box<dyn AsrEngine>, config: &SttConfig) -> Self {
        Self {
            engine,
            pause_duration: Duration::from_millis(config.pause_duration_ms as u64),
            min_duration: Duration::from_millis(config.min_duration_ms as u64),
            max_duration: Duration::from_millis(config.max_duration_ms as u64),
            speech_started_at: None,
            silence_started_at: None,
            full_text: String::new(),
        }
    }

    /// Feed one frame of classified audio. Returns `Some(text)` if a chunk
    /// boundary was reached and finalized.
    pub fn feed_frame(
        &mut self,
        samples: &[f32],
        is_speech: bool,
        now: Instant,
    ) -> Result<Option<String>> {
        self.engine.feed(samples)?;

        if is_speech {
            self.silence_started_at = None;
            if self.speech_started_at.is_none() {
                self.speech_started_at = Some(now);
            }

            if let Some(started) = self.speech_started_at {
                if now.saturating_duration_since(started) >= self.max_duration {
                    return self.finalize_chunk();
                }
            }
            return Ok(None);
        }

        // Silence frame.
        if self.speech_started_at.is_none() {
            return Ok(None);
        }

        let silence_start = *self.silence_started_at.get_or_insert(now);
        let spoke_long_enough = self
            .speech_started_at
            .map(|started| now.saturating_duration_since(started) >= self.min_duration)
            .unwrap_or(false);

        if spoke_long_enough && now.saturating_duration_since(silence_start) >= self.pause_duration
        {
            return self.finalize_chunk();
        }

        Ok(None)
    }

    fn finalize_chunk(&mut self) -> Result<Option<String>> {
        let transcription = self.engine.finalize()?;
        self.speech_started_at = None;
        self.silence_started_at = None;
        if !transcription.text.is_empty() {
            if !self.full_text.is_empty() {
                self.full_text.push(' ');
            }
            self.full_text.push_str(&transcription.text);
        }
        Ok(Some(transcription.text))
    }

    /// The full accumulated text across all chunks finalized since the last
    /// `reset`.
    pub fn get_full_text(&self) -> &str {
        &self.full_text
    }

    /// Discard in-progress audio and accumulated text.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.speech_started_at = None;
        self.silence_started_at = None;
        self.full_text.clear();
    }
}

/// Build a concrete engine for the configured `AsrEngineKind`. No concrete
/// streaming/chunking backend ships with this crate; callers inject one by
/// implementing [`AsrEngine`] and constructing their own [`ChunkingManager`]
/// when `engine == AsrEngineKind::Chunking`.
pub fn stub_engine_for(config: &SttConfig, sample_rate: u32) -> Box<dyn AsrEngine> {
    match config.engine {
        AsrEngineKind::Streaming | AsrEngineKind::Chunking => {
            Box::new(StubAsrEngine::new(sample_rate))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stt_config() -> SttConfig {
        SttConfig {
            engine: AsrEngineKind::Chunking,
            model_path: "unused".into(),
            pause_duration_ms: 100,
            min_duration_ms: 50,
            max_duration_ms: 1_000,
        }
    }

    #[test]
    fn natural_pause_finalizes_after_min_duration() {
        let mut mgr = ChunkingManager::new(Box::new(StubAsrEngine::new(16_000)), &stt_config());
        let now = Instant::now();
        mgr.feed_frame(&[0.1; 1600], true, now).unwrap();
        let boundary = mgr
            .feed_frame(&[0.0; 10], false, now + Duration::from_millis(120))
            .unwrap();
        assert!(boundary.is_some());
    }

    #[test]
    fn brief_pause_before_min_duration_does_not_finalize() {
        let mut mgr = ChunkingManager::new(Box::new(StubAsrEngine::new(16_000)), &stt_config());
        let now = Instant::now();
        mgr.feed_frame(&[0.1; 10], true, now).unwrap();
        let boundary = mgr
            .feed_frame(&[0.0; 10], false, now + Duration::from_millis(120))
            .unwrap();
        assert!(boundary.is_none());
    }

    #[test]
    fn forced_boundary_at_max_duration() {
        let mut mgr = ChunkingManager::new(Box::new(StubAsrEngine::new(16_000)), &stt_config());
        let start = Instant::now();
        mgr.feed_frame(&[0.1; 10], true, start).unwrap();
        let boundary = mgr
            .feed_frame(&[0.1; 10], true, start + Duration::from_millis(1_500))
            .unwrap();
        assert!(boundary.is_some());
    }

    #[test]
    fn reset_clears_accumulated_text() {
        let mut mgr = ChunkingManager::new(Box::new(StubAsrEngine::new(16_000)), &stt_config());
        let now = Instant::now();
        mgr.feed_frame(&[0.1; 1600], true, now).unwrap();
        mgr.feed_frame(&[0.0; 10], false, now + Duration::from_millis(120))
            .unwrap();
        assert!(!mgr.get_full_text().is_empty());
        mgr.reset();
        assert!(mgr.get_full_text().is_empty());
    }
}
