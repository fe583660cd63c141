//! Lightweight runtime counters (C12 persists a snapshot of these at
//! shutdown).

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated from across the pipeline.
#[derive(Default)]
pub struct Metrics {
    pub wake_words_detected: AtomicU64,
    pub commands_recorded: AtomicU64,
    pub commands_dispatched_direct: AtomicU64,
    pub commands_dispatched_llm: AtomicU64,
    pub llm_calls: AtomicU64,
    pub llm_calls_cancelled: AtomicU64,
    pub tts_utterances: AtomicU64,
    pub barge_ins: AtomicU64,
    pub asr_chunks_finalized: AtomicU64,
}

impl Metrics {
    /// Create a fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a wake word detection.
    pub fn record_wake_word(&self) {
        Self::inc(&self.wake_words_detected);
    }

    /// Record a finalized command recording.
    pub fn record_command_recorded(&self) {
        Self::inc(&self.commands_recorded);
    }

    /// Record a direct-command-table dispatch.
    pub fn record_direct_dispatch(&self) {
        Self::inc(&self.commands_dispatched_direct);
    }

    /// Record a command routed to the LLM.
    pub fn record_llm_dispatch(&self) {
        Self::inc(&self.commands_dispatched_llm);
    }

    /// Record an LLM call starting.
    pub fn record_llm_call(&self) {
        Self::inc(&self.llm_calls);
    }

    /// Record an LLM call cancelled mid-stream by barge-in.
    pub fn record_llm_cancelled(&self) {
        Self::inc(&self.llm_calls_cancelled);
    }

    /// Record a TTS utterance played to completion or discarded.
    pub fn record_tts_utterance(&self) {
        Self::inc(&self.tts_utterances);
    }

    /// Record a barge-in interrupting TTS playback.
    pub fn record_barge_in(&self) {
        Self::inc(&self.barge_ins);
    }

    /// Record an ASR chunk finalized into text.
    pub fn record_asr_chunk(&self) {
        Self::inc(&self.asr_chunks_finalized);
    }

    /// Take a serializable point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            wake_words_detected: self.wake_words_detected.load(Ordering::Relaxed),
            commands_recorded: self.commands_recorded.load(Ordering::Relaxed),
            commands_dispatched_direct: self.commands_dispatched_direct.load(Ordering::Relaxed),
            commands_dispatched_llm: self.commands_dispatched_llm.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            llm_calls_cancelled: self.llm_calls_cancelled.load(Ordering::Relaxed),
            tts_utterances: self.tts_utterances.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            asr_chunks_finalized: self.asr_chunks_finalized.load(Ordering::Relaxed),
        }
    }
}

/// A serializable point-in-time copy of [`Metrics`], persisted to
/// `dawn_stats_*.json` at shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub wake_words_detected: u64,
    pub commands_recorded: u64,
    pub commands_dispatched_direct: u64,
    pub commands_dispatched_llm: u64,
    pub llm_calls: u64,
    pub llm_calls_cancelled: u64,
    pub tts_utterances: u64,
    pub barge_ins: u64,
    pub asr_chunks_finalized: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.wake_words_detected, 0);
        assert_eq!(snap.llm_calls, 0);
    }

    #[test]
    fn recording_increments_the_right_counter() {
        let m = Metrics::new();
        m.record_wake_word();
        m.record_wake_word();
        m.record_llm_call();
        let snap = m.snapshot();
        assert_eq!(snap.wake_words_detected, 2);
        assert_eq!(snap.llm_calls, 1);
        assert_eq!(snap.commands_recorded, 0);
    }
}
