//! Voice Activity Detection using energy-based analysis (C3).
//!
//! Uses RMS energy thresholding to detect speech boundaries. While TTS
//! playback is active (or within its cooldown window), a higher threshold
//! plus a consecutive-frame debounce is applied so that residual echo from
//! the speakers doesn't falsely trigger speech detection.

use crate::config::VadConfig;
use crate::error::Result;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::info;

/// A completed speech segment handed off to the ASR stage.
pub struct SpeechSegment {
    /// Raw f32 samples, pre-roll included.
    pub samples: Vec<f32>,
    /// Sample rate of `samples`.
    pub sample_rate: u32,
    /// When the segment began (including pre-roll).
    pub started_at: Instant,
}

/// VAD processing output for a single frame.
pub struct VadOutput {
    /// Whether this frame started a new speech segment.
    pub speech_started: bool,
    /// Whether this frame is classified as speech.
    pub is_speech: bool,
    /// Completed speech segment, if one ended on this frame.
    pub segment: Option<SpeechSegment>,
    /// RMS energy of the processed frame.
    pub rms: f32,
}

/// Voice activity detector using RMS energy thresholding, with a
/// TTS-aware debounced threshold for echo resistance.
pub struct VadGate {
    pre_roll: VecDeque<f32>,
    pre_roll_max: usize,
    speech_buffer: Vec<f32>,
    in_speech: bool,
    silence_samples: usize,
    silence_samples_threshold: usize,
    speech_start: Option<Instant>,
    sample_rate: u32,

    threshold: f32,
    threshold_tts: f32,
    debounce_frames_tts: u32,
    startup_cooldown: Duration,
    cooldown: Duration,
    min_speech_samples: usize,

    tts_active: bool,
    tts_started_at: Option<Instant>,
    tts_stopped_at: Option<Instant>,
    consecutive_above_debounced: u32,
}

impl VadGate {
    /// Create a new VAD instance.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Result<Self> {
        let frame_ms = (config.frame_samples as f64 / sample_rate as f64) * 1000.0;
        info!(
            "VAD initialized: threshold={}, threshold_tts={}, frame={}ms",
            config.speech_threshold, config.speech_threshold_tts, frame_ms
        );

        // min_silence_duration_ms / min_speech_duration_ms / speech_pad_ms are
        // not present on the trimmed VadConfig; callers that need those
        // legacy knobs configure them via `with_timing`.
        Ok(Self {
            pre_roll: VecDeque::new(),
            pre_roll_max: 0,
            speech_buffer: Vec::new(),
            in_speech: false,
            silence_samples: 0,
            silence_samples_threshold: (sample_rate as usize) * 2, // 2s default
            speech_start: None,
            sample_rate,
            threshold: config.speech_threshold,
            threshold_tts: config.speech_threshold_tts,
            debounce_frames_tts: config.debounce_frames_tts,
            startup_cooldown: Duration::from_millis(config.startup_cooldown_ms as u64),
            cooldown: Duration::from_millis(config.cooldown_ms as u64),
            min_speech_samples: sample_rate as usize / 4, // 250ms default
            tts_active: false,
            tts_started_at: None,
            tts_stopped_at: None,
            consecutive_above_debounced: 0,
        })
    }

    /// Configure legacy millisecond-based timing knobs (min silence, pad,
    /// min speech) that apply regardless of TTS state.
    pub fn with_timing(
        mut self,
        min_silence_duration_ms: u32,
        speech_pad_ms: u32,
        min_speech_duration_ms: u32,
    ) -> Self {
        self.silence_samples_threshold =
            (min_silence_duration_ms as usize * self.sample_rate as usize) / 1000;
        self.pre_roll_max = (speech_pad_ms as usize * self.sample_rate as usize) / 1000;
        self.pre_roll = VecDeque::with_capacity(self.pre_roll_max + self.sample_rate as usize / 2);
        self.min_speech_samples =
            (min_speech_duration_ms as usize * self.sample_rate as usize) / 1000;
        self
    }

    /// Inform the VAD that TTS playback has started or stopped. Must be
    /// called on every `PLAY` entry/exit of the TTS gateway.
    pub fn set_tts_active(&mut self, active: bool, now: Instant) {
        if active && !self.tts_active {
            self.tts_started_at = Some(now);
            self.consecutive_above_debounced = 0;
        } else if !active && self.tts_active {
            self.tts_stopped_at = Some(now);
        }
        self.tts_active = active;
    }

    /// The threshold and whether consecutive-frame debounce applies, given
    /// the current TTS state.
    fn effective_threshold(&self, now: Instant) -> (f32, bool) {
        if self.tts_active {
            if let Some(started) = self.tts_started_at {
                if now.saturating_duration_since(started) < self.startup_cooldown {
                    return (f32::INFINITY, false);
                }
            }
            return (self.threshold_tts, true);
        }
        if let Some(stopped) = self.tts_stopped_at {
            if now.saturating_duration_since(stopped) < self.cooldown {
                return (self.threshold_tts, true);
            }
        }
        (self.threshold, false)
    }

    /// Process an audio frame and return a speech segment if a complete
    /// utterance has been detected.
    pub fn process_frame(&mut self, samples: &[f32], captured_at: Instant) -> Result<VadOutput> {
        let rms = compute_rms_energy(samples);
        let (effective_threshold, debounced) = self.effective_threshold(captured_at);
        let above = rms > effective_threshold;

        let is_speech = if debounced {
            if above {
                self.consecutive_above_debounced += 1;
            } else {
                self.consecutive_above_debounced = 0;
            }
            self.consecutive_above_debounced >= self.debounce_frames_tts
        } else {
            self.consecutive_above_debounced = 0;
            above
        };

        if self.pre_roll_max > 0 {
            self.pre_roll.extend(samples.iter().copied());
            while self.pre_roll.len() > self.pre_roll_max {
                let _ = self.pre_roll.pop_front();
            }
        }

        let mut speech_started = false;
        let mut completed: Option<SpeechSegment> = None;

        if is_speech {
            if !self.in_speech {
                self.in_speech = true;
                speech_started = true;
                self.speech_start = Some(captured_at);
                self.speech_buffer.clear();
                if !self.pre_roll.is_empty() {
                    self.speech_buffer.extend(self.pre_roll.iter().copied());
                }
            }
            self.silence_samples = 0;
            self.speech_buffer.extend_from_slice(samples);
        } else if self.in_speech {
            self.silence_samples = self.silence_samples.saturating_add(samples.len());
            self.speech_buffer.extend_from_slice(samples);

            if self.silence_samples >= self.silence_samples_threshold {
                self.in_speech = false;
                self.silence_samples = 0;

                if self.speech_buffer.len() >= self.min_speech_samples {
                    let started_at = self.speech_start.unwrap_or(captured_at);
                    completed = Some(SpeechSegment {
                        samples: std::mem::take(&mut self.speech_buffer),
                        sample_rate: self.sample_rate,
                        started_at,
                    });
                } else {
                    self.speech_buffer.clear();
                }
            }
        }

        Ok(VadOutput {
            speech_started,
            is_speech,
            segment: completed,
            rms,
        })
    }

    /// Reset all segment-in-progress state (called at interaction
    /// boundaries, e.g. on command timeout or session reset).
    pub fn reset(&mut self) {
        self.pre_roll.clear();
        self.speech_buffer.clear();
        self.in_speech = false;
        self.silence_samples = 0;
        self.speech_start = None;
        self.consecutive_above_debounced = 0;
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> VadGate {
        let config = VadConfig {
            speech_threshold: 0.1,
            speech_threshold_tts: 0.3,
            debounce_frames_tts: 3,
            startup_cooldown_ms: 100,
            cooldown_ms: 200,
            frame_samples: 160,
        };
        VadGate::new(&config, 16_000)
            .unwrap()
            .with_timing(200, 0, 0)
    }

    fn loud_frame(n: usize) -> Vec<f32> {
        vec![0.5; n]
    }

    fn quiet_frame(n: usize) -> Vec<f32> {
        vec![0.0; n]
    }

    #[test]
    fn detects_speech_above_threshold_outside_tts() {
        let mut vad = gate();
        let out = vad.process_frame(&loud_frame(160), Instant::now()).unwrap();
        assert!(out.is_speech);
        assert!(out.speech_started);
    }

    #[test]
    fn ignores_quiet_frames() {
        let mut vad = gate();
        let out = vad.process_frame(&quiet_frame(160), Instant::now()).unwrap();
        assert!(!out.is_speech);
    }

    #[test]
    fn startup_cooldown_suppresses_detection_right_after_tts_starts() {
        let mut vad = gate();
        let now = Instant::now();
        vad.set_tts_active(true, now);
        let out = vad.process_frame(&loud_frame(160), now).unwrap();
        assert!(!out.is_speech, "should be suppressed during startup cooldown");
    }

    #[test]
    fn requires_debounce_frames_during_tts() {
        let mut vad = gate();
        let start = Instant::now();
        let past_cooldown = start + Duration::from_millis(150);
        vad.set_tts_active(true, start);

        let first = vad.process_frame(&loud_frame(160), past_cooldown).unwrap();
        assert!(!first.is_speech, "single frame should not yet trip debounce");
        let second = vad.process_frame(&loud_frame(160), past_cooldown).unwrap();
        assert!(!second.is_speech);
        let third = vad.process_frame(&loud_frame(160), past_cooldown).unwrap();
        assert!(third.is_speech, "third consecutive loud frame should trip debounce");
    }

    #[test]
    fn segment_finalizes_after_silence_threshold() {
        let mut vad = gate();
        let now = Instant::now();
        vad.process_frame(&loud_frame(4000), now).unwrap();
        let out = vad
            .process_frame(&quiet_frame(4000), now + Duration::from_millis(10))
            .unwrap();
        assert!(out.segment.is_some());
    }

    #[test]
    fn reset_clears_in_progress_segment() {
        let mut vad = gate();
        vad.process_frame(&loud_frame(160), Instant::now()).unwrap();
        vad.reset();
        let out = vad.process_frame(&quiet_frame(4000), Instant::now()).unwrap();
        assert!(out.segment.is_none());
    }
}
