//! Text-to-speech gateway (C10): a sentence-granular synthesis queue with
//! `IDLE | PLAY | PAUSE | DISCARD` playback states, mutex + condvar
//! coordinated with a dedicated playback thread.
//!
//! `PAUSE` is soft: queued sentences are retained and playback resumes
//! where it left off. `DISCARD` is a one-shot instruction that empties the
//! queue and stops any sentence currently sounding, at the next safe point;
//! it is terminal for the utterance in progress even if `PLAY` is re-entered
//! before the next `speak()` call.

use crate::audio::playback::PlaybackHandle;
use crate::error::Result;
use crate::metrics::Metrics;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Playback state of the TTS gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing queued, nothing playing.
    Idle,
    /// Actively consuming the queue.
    Play,
    /// Soft-paused: queue retained, playback suspended.
    Pause,
    /// One-shot: drop the queue and stop the current utterance.
    Discard,
}

/// A synthesis backend. Implementations own the concrete voice model; the
/// gateway only needs raw samples back.
pub trait TtsEngine: Send + Sync {
    /// Synthesize `text` into mono PCM samples at [`TtsEngine::sample_rate`].
    fn synthesize(&self, text: &str) -> Result<Vec<f32>>;

    /// Output sample rate of synthesized audio.
    fn sample_rate(&self) -> u32;
}

/// Deterministic stand-in engine used where no concrete TTS backend is
/// configured: emits silence proportional to the text length so pacing in
/// tests and dry runs is plausible without needing a real voice model.
pub struct StubTtsEngine {
    sample_rate: u32,
}

impl StubTtsEngine {
    /// Create a stub engine at the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl TtsEngine for StubTtsEngine {
    fn synthesize(&self, text: &str) -> Result<Vec<f32>> {
        let seconds = (text.chars().count() as f32 * 0.06).clamp(0.2, 8.0);
        Ok(vec![0.0f32; (self.sample_rate as f32 * seconds) as usize])
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Abstraction over actually sounding synthesized audio, so the gateway can
/// be exercised without real audio hardware.
pub trait PlaybackSink: Send + Sync {
    /// Play `samples`, honoring `handle` for mid-playback discard. Returns
    /// `true` if playback ran to completion, `false` if discarded.
    fn play(&self, samples: &[f32], handle: &PlaybackHandle) -> Result<bool>;
}

/// A sink that does not touch any audio device: used in headless or test
/// contexts. Treats playback as instantaneous.
#[derive(Default)]
pub struct NullPlaybackSink;

impl PlaybackSink for NullPlaybackSink {
    fn play(&self, _samples: &[f32], _handle: &PlaybackHandle) -> Result<bool> {
        // No audio device involved; nothing to discard mid-playback.
        Ok(true)
    }
}

/// Plays synthesized audio through the system's default output device.
pub struct CpalPlaybackSink(Mutex<crate::audio::playback::CpalPlayback>);

impl CpalPlaybackSink {
    /// Open the configured output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &crate::config::AudioConfig) -> Result<Self> {
        Ok(Self(Mutex::new(crate::audio::playback::CpalPlayback::new(
            config,
        )?)))
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn play(&self, samples: &[f32], handle: &PlaybackHandle) -> Result<bool> {
        self.0.lock().play(samples, handle)
    }
}

struct Shared {
    state: PlaybackState,
    queue: VecDeque<String>,
}

/// Sentence-granular TTS queue and playback-state machine.
pub struct TtsGateway {
    shared: Mutex<Shared>,
    cv: Condvar,
    engine: Arc<dyn TtsEngine>,
    sink: Arc<dyn PlaybackSink>,
    handle: Mutex<PlaybackHandle>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
}

impl TtsGateway {
    /// Build a gateway and spawn its dedicated playback thread.
    pub fn new(
        engine: Arc<dyn TtsEngine>,
        sink: Arc<dyn PlaybackSink>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let gateway = Arc::new(Self {
            shared: Mutex::new(Shared {
                state: PlaybackState::Idle,
                queue: VecDeque::new(),
            }),
            cv: Condvar::new(),
            engine,
            sink,
            handle: Mutex::new(PlaybackHandle::new()),
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let worker_gateway = Arc::clone(&gateway);
        std::thread::Builder::new()
            .name("tts-playback".into())
            .spawn(move || worker_gateway.run_playback_loop())
            .expect("failed to spawn TTS playback thread");

        gateway
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        self.shared.lock().state
    }

    /// True while a sentence is actively sounding.
    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Play
    }

    /// Enqueue text for synthesis. Moves to `PLAY` immediately unless
    /// currently paused (queued sentences play once resumed) or discarding.
    pub fn speak(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let mut shared = self.shared.lock();
        shared.queue.push_back(text.to_owned());
        if shared.state == PlaybackState::Idle {
            shared.state = PlaybackState::Play;
        }
        self.cv.notify_one();
    }

    /// Soft-pause: `PLAY -> PAUSE`. No-op from any other state.
    pub fn pause(&self) {
        let mut shared = self.shared.lock();
        if shared.state == PlaybackState::Play {
            shared.state = PlaybackState::Pause;
            self.cv.notify_one();
        }
    }

    /// Resume: `PAUSE -> PLAY`. No-op from any other state.
    pub fn resume(&self) {
        let mut shared = self.shared.lock();
        if shared.state == PlaybackState::Pause {
            shared.state = PlaybackState::Play;
            self.cv.notify_one();
        }
    }

    /// One-shot discard: stop the current utterance and drop the queue,
    /// from any state. Terminal for whatever was playing when called.
    pub fn discard(&self) {
        self.handle.lock().discard();
        let mut shared = self.shared.lock();
        shared.state = PlaybackState::Discard;
        self.cv.notify_one();
    }

    /// Stop the playback thread. Blocks until it exits.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.lock().discard();
        self.cv.notify_all();
    }

    fn run_playback_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let text = {
                let mut shared = self.shared.lock();
                loop {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    match shared.state {
                        PlaybackState::Discard => {
                            shared.queue.clear();
                            shared.state = PlaybackState::Idle;
                            // Fresh handle: a discard must never bleed into
                            // the next speak().
                            *self.handle.lock() = PlaybackHandle::new();
                            continue;
                        }
                        PlaybackState::Pause => {
                            self.cv.wait(&mut shared);
                            continue;
                        }
                        PlaybackState::Play | PlaybackState::Idle => {
                            if let Some(text) = shared.queue.pop_front() {
                                shared.state = PlaybackState::Play;
                                break text;
                            }
                            shared.state = PlaybackState::Idle;
                            self.cv.wait(&mut shared);
                            continue;
                        }
                    }
                }
            };

            let samples = match self.engine.synthesize(&text) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("TTS synthesis failed for sentence: {e}");
                    continue;
                }
            };

            let handle = self.handle.lock().clone();
            match self.sink.play(&samples, &handle) {
                Ok(_) => self.metrics.record_tts_utterance(),
                Err(e) => warn!("TTS playback failed: {e}"),
            }
        }
    }
}

/// Strip tool-tag fragments and simple emoji/markup before handing text to
/// the synthesizer, so the voice doesn't read out `<command>...</command>`
/// spans or glyphs that have no pronunciation.
pub fn sanitize_for_speech(text: &str) -> String {
    let without_tags = strip_tool_tags(text);
    without_tags
        .chars()
        .filter(|c| !is_likely_emoji(*c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_tool_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<command>") {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        if let Some(end) = rest.find("</command>") {
            rest = &rest[end + "</command>".len()..];
        } else {
            rest = "";
            break;
        }
    }
    out.push_str(rest);
    out
}

fn is_likely_emoji(c: char) -> bool {
    let cp = c as u32;
    (0x1F300..=0x1FAFF).contains(&cp) || (0x2600..=0x27BF).contains(&cp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gateway() -> Arc<TtsGateway> {
        TtsGateway::new(
            Arc::new(StubTtsEngine::new(16_000)),
            Arc::new(NullPlaybackSink),
            Arc::new(Metrics::new()),
        )
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn speak_transitions_idle_to_play_then_settles_idle() {
        let gw = gateway();
        assert_eq!(gw.state(), PlaybackState::Idle);
        gw.speak("hello there");
        settle();
        assert_eq!(gw.state(), PlaybackState::Idle);
        gw.shutdown();
    }

    #[test]
    fn pause_from_idle_is_a_noop() {
        let gw = gateway();
        gw.pause();
        assert_eq!(gw.state(), PlaybackState::Idle);
        gw.shutdown();
    }

    #[test]
    fn discard_clears_queue_and_returns_to_idle() {
        let gw = gateway();
        gw.speak("one");
        gw.speak("two");
        gw.discard();
        settle();
        assert_eq!(gw.state(), PlaybackState::Idle);
        gw.shutdown();
    }

    #[test]
    fn resume_from_pause_continues_queue() {
        let gw = gateway();
        {
            let mut shared = gw.shared.lock();
            shared.state = PlaybackState::Pause;
        }
        gw.speak("queued while paused");
        settle();
        assert_eq!(gw.state(), PlaybackState::Pause);
        gw.resume();
        settle();
        assert_eq!(gw.state(), PlaybackState::Idle);
        gw.shutdown();
    }

    #[test]
    fn sanitize_strips_command_tags() {
        let text = "Sure, turning it on. <command>{\"device\":\"lamp\"}</command> Done.";
        assert_eq!(sanitize_for_speech(text), "Sure, turning it on. Done.");
    }

    #[test]
    fn sanitize_strips_emoji() {
        assert_eq!(sanitize_for_speech("All set! \u{1F389}"), "All set!");
    }
}
