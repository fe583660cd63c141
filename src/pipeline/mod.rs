//! The interactive voice pipeline (C7): a five-state driver wiring the
//! ring buffer, VAD, preroll, ASR, input queue, LLM worker, conversation
//! log, TTS gateway and command dispatcher into one session.
//!
//! This generalizes the teacher's channel-per-stage coordinator into a
//! single polling driver loop, per the state machine this spec calls for:
//! one primary control thread reads frames from C1 and walks the five
//! states below, rather than a pipeline of independently-scheduled async
//! stages. The concurrency that matters (capture, LLM, TTS) still runs on
//! its own thread/task; this module is what ties their results together.

use crate::asr::ChunkingManager;
use crate::config::{PipelineConfig, PipelineMode, SpeechConfig};
use crate::conversation::{ChatMessage, Conversation};
use crate::dispatcher::{CallbackOutcome, CommandDispatcher};
use crate::error::Result;
use crate::input_queue::InputQueue;
use crate::llm::api::{ApiLlm, LlmOutcome};
use crate::llm::worker::{LlmJob, LlmWorker, SentenceSink};
use crate::metrics::Metrics;
use crate::preroll::Preroll;
use crate::ring_buffer::RingBuffer;
use crate::tts::{TtsGateway, sanitize_for_speech};
use crate::vad::VadGate;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The five states driving one local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum States {
    Silence,
    WakewordListen,
    CommandRecording,
    ProcessCommand,
    VisionReady,
}

/// Reduces music output volume while the user is speaking over it; a no-op
/// implementer is fine where no music device is registered.
pub trait MusicDucking: Send + Sync {
    /// Duck output to `volume_fraction` of its current level.
    fn duck(&self, volume_fraction: f32);
    /// Restore the saved pre-duck volume.
    fn restore(&self);
}

/// A pending vision turn: an image captured out-of-band (e.g. by a camera
/// client) waiting to be paired with the next LLM call.
pub struct VisionRequest {
    pub image_bytes: Vec<u8>,
}

struct SentenceForwarder {
    tts: Arc<TtsGateway>,
}

impl SentenceSink for SentenceForwarder {
    fn on_sentence(&self, text: &str) {
        let text = sanitize_for_speech(text);
        if !text.is_empty() {
            self.tts.speak(&text);
        }
    }
}

/// Everything the session needs across states, grouped per the spec's
/// "pass a `SessionContext` struct through the state machine" redesign
/// note, rather than global singletons.
pub struct Pipeline {
    state: States,
    silence_next: States,

    ring_buffer: Arc<RingBuffer>,
    vad: VadGate,
    preroll: Preroll,
    asr: ChunkingManager,

    input_queue: Arc<InputQueue>,
    conversation: Conversation,
    llm: Arc<ApiLlm>,
    llm_worker: LlmWorker,
    tts: Arc<TtsGateway>,
    dispatcher: Option<CommandDispatcher>,
    music_ducking: Option<Arc<dyn MusicDucking>>,
    metrics: Arc<Metrics>,

    cancel_llm: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,

    wake_words: Vec<String>,
    goodbye_phrases: Vec<String>,
    cancel_phrases: Vec<String>,
    empty_wake_ack: String,
    farewell: String,

    pipeline_mode: PipelineMode,
    iteration: Duration,
    command_timeout_iterations: u32,
    max_recording_duration: Duration,
    blank_placeholders: Vec<String>,
    sentence_pacing: Duration,

    // COMMAND_RECORDING / WAKEWORD_LISTEN in-progress tracking.
    recording_started_at: Option<Instant>,
    silent_iterations: u32,

    // Cross-state payload.
    command_text: String,
    vision_pending: Option<VisionRequest>,
    ducked_at: Option<Instant>,
    request_started_at: Option<Instant>,
    tool_chain_depth: u32,
}

impl Pipeline {
    /// Assemble a pipeline from its already-constructed parts. Called once
    /// at startup after config/device initialization.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SpeechConfig,
        ring_buffer: Arc<RingBuffer>,
        vad: VadGate,
        asr: ChunkingManager,
        input_queue: Arc<InputQueue>,
        llm: Arc<ApiLlm>,
        tts: Arc<TtsGateway>,
        dispatcher: Option<CommandDispatcher>,
        music_ducking: Option<Arc<dyn MusicDucking>>,
        metrics: Arc<Metrics>,
        cancel_llm: Arc<AtomicBool>,
        quit: Arc<AtomicBool>,
    ) -> Self {
        let wake_words = build_wake_words(&config.conversation.wake_prefixes, &config.conversation.ai_name);
        let PipelineConfig {
            mode,
            iteration_ms,
            command_timeout_iterations,
            max_recording_duration_ms,
            blank_placeholders,
        } = config.pipeline.clone();

        Self {
            state: States::Silence,
            silence_next: States::WakewordListen,
            ring_buffer,
            vad,
            preroll: Preroll::new(&config.preroll),
            asr,
            input_queue,
            conversation: Conversation::new(config.llm.system_prompt.clone(), config.llm.max_history_messages),
            llm,
            llm_worker: LlmWorker::new(Arc::clone(&cancel_llm)),
            tts,
            dispatcher,
            music_ducking,
            metrics,
            cancel_llm,
            quit,
            wake_words,
            goodbye_phrases: config.conversation.goodbye_phrases.clone(),
            cancel_phrases: config.conversation.cancel_phrases.clone(),
            empty_wake_ack: config.conversation.empty_wake_ack.clone(),
            farewell: config.conversation.farewell.clone(),
            pipeline_mode: mode,
            iteration: Duration::from_millis(iteration_ms),
            command_timeout_iterations,
            max_recording_duration: Duration::from_millis(max_recording_duration_ms as u64),
            blank_placeholders,
            sentence_pacing: Duration::from_millis(config.llm.sentence_pacing_ms),
            recording_started_at: None,
            silent_iterations: 0,
            command_text: String::new(),
            vision_pending: None,
            ducked_at: None,
            request_started_at: None,
            tool_chain_depth: 0,
        }
    }

    /// Current state (exposed for logging/diagnostics and tests).
    pub fn state(&self) -> States {
        self.state
    }

    /// Queue a vision turn for the next SILENCE iteration.
    pub fn submit_vision(&mut self, image_bytes: Vec<u8>) {
        self.vision_pending = Some(VisionRequest { image_bytes });
    }

    /// True once a goodbye phrase or SIGINT has set the quit flag.
    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Persisted conversation snapshot, e.g. for `chat_history_*.json`.
    pub fn conversation_snapshot(&self) -> Vec<ChatMessage> {
        self.conversation.snapshot()
    }

    /// Direct access to the LLM worker for shutdown (awaiting or
    /// force-aborting an in-flight job past the grace period).
    pub fn llm_worker_mut(&mut self) -> &mut LlmWorker {
        &mut self.llm_worker
    }

    /// Run one iteration of the driver loop: poll for LLM completion, then
    /// advance the current state by one step.
    pub async fn tick(&mut self, now: Instant) -> Result<()> {
        self.poll_llm_completion(now).await;

        match self.state {
            States::Silence => self.tick_silence(now)?,
            States::WakewordListen | States::CommandRecording => self.tick_listening(now)?,
            States::ProcessCommand => self.tick_process_command(now).await?,
            States::VisionReady => self.tick_vision_ready(now).await?,
        }
        Ok(())
    }

    fn tick_silence(&mut self, now: Instant) -> Result<()> {
        if self.vision_pending.is_some() {
            self.state = States::VisionReady;
            return Ok(());
        }

        if let Some(item) = self.input_queue.pop() {
            self.command_text = item.text;
            self.silence_next = States::WakewordListen;
            self.state = States::ProcessCommand;
            return Ok(());
        }

        let frame_bytes = self.vad_frame_bytes();
        let mut buf = vec![0u8; frame_bytes];
        let available = self.ring_buffer.wait_for(frame_bytes, Duration::from_secs(2));
        if available < frame_bytes {
            return Ok(());
        }
        let read = self.ring_buffer.read(&mut buf);
        buf.truncate(read);
        if buf.len() < frame_bytes {
            return Ok(());
        }

        self.preroll.append(&buf);
        let samples = pcm16_bytes_to_f32(&buf);
        self.vad.set_tts_active(self.tts.state() == crate::tts::PlaybackState::Play, now);
        let output = self.vad.process_frame(&samples, now)?;

        if let Some(ducking) = &self.music_ducking {
            if output.is_speech {
                if self.ducked_at.is_none() {
                    ducking.duck(0.3);
                }
                self.ducked_at = Some(now);
            } else if let Some(since) = self.ducked_at {
                if now.saturating_duration_since(since) >= Duration::from_secs(2) {
                    ducking.restore();
                    self.ducked_at = None;
                }
            }
        }

        if output.speech_started {
            let preroll_bytes = self.preroll.flush();
            let preroll_samples = pcm16_bytes_to_f32(&preroll_bytes);
            self.asr.reset();
            let _ = self.asr.feed_frame(&preroll_samples, true, now);
            let _ = self.asr.feed_frame(&samples, true, now);

            self.vad.reset();
            self.recording_started_at = Some(now);
            self.silent_iterations = 0;
            self.state = self.silence_next;
        }

        Ok(())
    }

    fn tick_listening(&mut self, now: Instant) -> Result<()> {
        if self.recording_started_at.is_none() {
            // Entering WAKEWORD_LISTEN / COMMAND_RECORDING fresh (no prior
            // SILENCE speech-onset primed it): soft-pause or discard TTS.
            self.recording_started_at = Some(now);
            self.silent_iterations = 0;
            if self.state == States::WakewordListen {
                self.tts.pause();
            } else {
                self.tts.discard();
            }
        }

        let frame_bytes = self.vad_frame_bytes();
        let mut buf = vec![0u8; frame_bytes];
        let available = self.ring_buffer.wait_for(frame_bytes, self.iteration);
        let samples = if available >= frame_bytes {
            let read = self.ring_buffer.read(&mut buf);
            buf.truncate(read);
            pcm16_bytes_to_f32(&buf)
        } else {
            Vec::new()
        };

        let is_speech = if samples.is_empty() {
            false
        } else {
            self.vad.set_tts_active(self.tts.state() == crate::tts::PlaybackState::Play, now);
            self.vad.process_frame(&samples, now)?.is_speech
        };

        if !samples.is_empty() && self.asr.feed_frame(&samples, is_speech, now)?.is_some() {
            self.metrics.record_asr_chunk();
        }

        if is_speech {
            self.silent_iterations = 0;
        } else {
            self.silent_iterations += 1;
        }

        let started = self.recording_started_at.expect("set above");
        let recording_duration = now.saturating_duration_since(started);
        let timed_out_silent = self.silent_iterations >= self.command_timeout_iterations;
        let over_max_duration = recording_duration >= self.max_recording_duration;

        if timed_out_silent || over_max_duration {
            let transcript = self.asr.get_full_text().to_owned();
            self.asr.reset();
            self.vad.reset();
            self.recording_started_at = None;
            self.silent_iterations = 0;
            self.metrics.record_command_recorded();
            self.handle_finalized_transcript(&transcript, now)?;
        }

        Ok(())
    }

    /// Apply the wake-word logic to a finalized, listening-window
    /// transcript. Public so callers (and tests) can drive it directly
    /// without a real audio loop.
    pub fn handle_finalized_transcript(&mut self, raw_transcript: &str, now: Instant) -> Result<()> {
        let tokens = tokenize_normalized(raw_transcript);
        let normalized_words: Vec<&str> = tokens.iter().map(|t| t.normalized.as_str()).collect();

        if phrase_present(&normalized_words, &self.goodbye_phrases) {
            self.tts.discard();
            self.tts.speak(&self.farewell);
            self.quit.store(true, Ordering::SeqCst);
            self.state = States::Silence;
            self.silence_next = States::WakewordListen;
            return Ok(());
        }

        if self.tts.state() == crate::tts::PlaybackState::Pause
            && phrase_present(&normalized_words, &self.cancel_phrases)
        {
            self.tts.discard();
            self.state = States::Silence;
            self.silence_next = States::WakewordListen;
            return Ok(());
        }

        let wake_match = find_longest_wake_word(&tokens, &self.wake_words);
        let Some(match_end_byte) = wake_match else {
            self.tts.resume();
            self.state = States::Silence;
            self.silence_next = States::WakewordListen;
            return Ok(());
        };
        self.metrics.record_wake_word();

        if self.llm_worker.is_processing() {
            self.cancel_llm.store(true, Ordering::SeqCst);
            self.metrics.record_barge_in();
        }

        let tail = raw_transcript[match_end_byte..].trim();
        if tail.is_empty() {
            self.tts.speak(&self.empty_wake_ack);
            self.state = States::CommandRecording;
            self.recording_started_at = None;
        } else {
            self.command_text = tail.to_owned();
            self.silence_next = States::WakewordListen;
            self.state = States::ProcessCommand;
        }

        Ok(())
    }

    async fn tick_process_command(&mut self, now: Instant) -> Result<()> {
        let text = self.command_text.trim().to_owned();
        self.command_text.clear();

        if text.is_empty() || self.blank_placeholders.iter().any(|p| p == &text) {
            self.state = States::Silence;
            return Ok(());
        }

        if matches!(self.pipeline_mode, PipelineMode::DirectOnly | PipelineMode::DirectFirst) {
            if let Some(dispatcher) = &self.dispatcher {
                if let Some(outcome) = dispatcher.try_direct(&text) {
                    self.metrics.record_direct_dispatch();
                    self.tool_chain_depth = 0;
                    match outcome {
                        // Direct-only has no LLM to hand the result to; speak
                        // it rather than drop it silently.
                        CallbackOutcome::FeedToLlm(result)
                            if matches!(self.pipeline_mode, PipelineMode::DirectOnly) =>
                        {
                            self.tts.speak(&result);
                        }
                        CallbackOutcome::FeedToLlm(result) => self.feed_tool_result_to_llm(result, now),
                        other => self.apply_callback_outcome(other),
                    }
                    self.state = States::Silence;
                    return Ok(());
                }
            }
            if matches!(self.pipeline_mode, PipelineMode::DirectOnly) {
                self.state = States::Silence;
                return Ok(());
            }
        }

        self.tool_chain_depth = 0;
        self.conversation.append(ChatMessage::user(text));

        if self.llm_worker.is_processing() {
            self.conversation.remove_last();
            self.state = States::Silence;
            return Ok(());
        }

        self.metrics.record_llm_dispatch();
        self.start_llm_job(now);
        self.state = States::Silence;
        Ok(())
    }

    async fn tick_vision_ready(&mut self, now: Instant) -> Result<()> {
        let Some(request) = self.vision_pending.take() else {
            self.state = States::Silence;
            return Ok(());
        };

        // Collapse trailing turns so a vision follow-up can't recursively
        // re-trigger the vision pathway through stale history.
        if self.conversation.len() > 1 {
            self.conversation.remove_last();
        }
        self.conversation.append(ChatMessage::user(
            "Describe what you currently see and respond to the user.",
        ));

        self.metrics.record_llm_call();
        let messages = self.conversation.snapshot();

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let tts = Arc::clone(&self.tts);
        let drain = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let text = sanitize_for_speech(&chunk.text);
                if !text.is_empty() {
                    tts.speak(&text);
                }
            }
        });

        let outcome = self
            .llm
            .generate_response(&messages, Some(&request.image_bytes), &tx, &self.cancel_llm)
            .await;
        drop(tx);
        let _ = drain.await;

        match outcome {
            Ok(LlmOutcome::Completed(text)) if !text.trim().is_empty() => {
                self.conversation.append(ChatMessage::assistant(text.trim().to_owned()));
            }
            Ok(_) => {
                self.conversation.remove_last();
            }
            Err(e) => {
                warn!("vision LLM call failed: {e}");
                self.conversation.remove_last();
            }
        }

        let _ = now;
        self.state = States::Silence;
        Ok(())
    }

    fn start_llm_job(&mut self, now: Instant) {
        self.request_started_at = Some(now);
        let job = LlmJob {
            messages: self.conversation.snapshot(),
            vision_image_bytes: None,
        };
        let sentence_sink = Arc::new(SentenceForwarder { tts: Arc::clone(&self.tts) });
        self.metrics.record_llm_call();
        self.llm_worker.spawn(
            Arc::clone(&self.llm),
            job,
            sentence_sink,
            self.sentence_pacing,
        );
    }

    /// Checked every tick: picks up a finished LLM job, if any, and folds
    /// its outcome back into the conversation and TTS queue.
    async fn poll_llm_completion(&mut self, now: Instant) {
        if self.llm_worker.is_processing() {
            return;
        }
        let Some(outcome) = self.llm_worker.take_result() else {
            return;
        };
        self.llm_worker.join().await;

        if let Some(started) = self.request_started_at.take() {
            let elapsed = now.saturating_duration_since(started);
            info!("LLM turn completed in {:.2}s", elapsed.as_secs_f64());
        }

        let was_cancelled = self.cancel_llm.swap(false, Ordering::SeqCst);

        match outcome {
            LlmOutcome::Cancelled => {
                self.metrics.record_llm_cancelled();
                self.conversation.remove_last();
            }
            LlmOutcome::Completed(text) if text.trim().is_empty() => {
                if was_cancelled {
                    self.conversation.remove_last();
                } else {
                    self.tts.speak("I'm sorry but I'm currently unavailable.");
                    self.conversation.remove_last();
                }
            }
            LlmOutcome::Completed(text) => {
                self.conversation
                    .append(ChatMessage::assistant(text.trim_end().to_owned()));

                let processed = self
                    .dispatcher
                    .as_ref()
                    .map(|d| d.process_tool_tags(&text))
                    .map(|r| r.executed)
                    .unwrap_or_default();
                for (tag, outcome) in processed {
                    match outcome {
                        Some(CallbackOutcome::FeedToLlm(result)) => {
                            self.feed_tool_result_to_llm(result, now)
                        }
                        Some(other) => self.apply_callback_outcome(other),
                        None => warn!("tool tag referenced unregistered device '{}'", tag.device),
                    }
                }
            }
        }
    }

    fn apply_callback_outcome(&mut self, outcome: CallbackOutcome) {
        match outcome {
            CallbackOutcome::Silent => {}
            CallbackOutcome::Spoken(text) => self.tts.speak(&text),
            CallbackOutcome::FeedToLlm(text) => {
                self.conversation
                    .append(ChatMessage::system(format!("Tool result: {text}")));
            }
        }
    }

    /// Append a tool result as a synthetic system turn and, while the chain
    /// depth stays under the dispatcher's configured limit, immediately
    /// continue the conversation with another LLM call so the assistant can
    /// react to the tool's output (fixed-point command chaining).
    fn feed_tool_result_to_llm(&mut self, result: String, now: Instant) {
        self.conversation
            .append(ChatMessage::system(format!("Tool result: {result}")));

        if self.llm_worker.is_processing() {
            self.conversation.remove_last();
            return;
        }

        let limit = self.dispatcher.as_ref().map(CommandDispatcher::max_recursion).unwrap_or(0);
        if self.tool_chain_depth >= limit {
            warn!("tool-tag recursion limit ({limit}) reached; not issuing a follow-up LLM call");
            return;
        }

        self.tool_chain_depth += 1;
        self.metrics.record_llm_dispatch();
        self.start_llm_job(now);
    }

    fn vad_frame_bytes(&self) -> usize {
        // 16-bit mono samples; VAD_FRAME = 512 samples per the data model.
        512 * 2
    }
}

fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
        .collect()
}

fn build_wake_words(prefixes: &[String], ai_name: &str) -> Vec<String> {
    let mut words: Vec<String> = prefixes
        .iter()
        .map(|prefix| {
            if prefix.is_empty() {
                ai_name.to_owned()
            } else {
                format!("{prefix} {ai_name}")
            }
        })
        .collect();
    // Longest phrase first so "hey friday" is preferred over a bare
    // "friday" match when both are present in the table.
    words.sort_by_key(|w| std::cmp::Reverse(w.split_whitespace().count()));
    words
}

struct Token {
    normalized: String,
    end: usize,
}

fn tokenize_normalized(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(make_token(&text[s..i], i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(make_token(&text[s..], text.len()));
    }
    tokens
}

fn make_token(word: &str, end: usize) -> Token {
    Token {
        normalized: normalize_word(word),
        end,
    }
}

fn normalize_word(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// True if `phrase` (whitespace-separated, case/punctuation-insensitive)
/// appears anywhere in `normalized_words` as a contiguous word sequence.
fn phrase_present(normalized_words: &[&str], phrases: &[String]) -> bool {
    phrases.iter().any(|phrase| {
        let phrase_words: Vec<String> = phrase
            .split_whitespace()
            .map(normalize_word)
            .filter(|w| !w.is_empty())
            .collect();
        contains_subsequence(normalized_words, &phrase_words)
    })
}

fn contains_subsequence(haystack: &[&str], needle: &[String]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    (0..=(haystack.len() - needle.len()))
        .any(|start| (0..needle.len()).all(|i| haystack[start + i] == needle[i]))
}

/// Find the first (by token position), longest-phrase-preferred wake word
/// in `tokens`, returning the original-text byte offset immediately after
/// the match so the caller can slice out the command tail.
fn find_longest_wake_word(tokens: &[Token], wake_words: &[String]) -> Option<usize> {
    let normalized: Vec<&str> = tokens.iter().map(|t| t.normalized.as_str()).collect();
    let mut best: Option<(usize, usize)> = None; // (start_token, end_byte)

    for phrase in wake_words {
        let phrase_words: Vec<String> = phrase
            .split_whitespace()
            .map(normalize_word)
            .filter(|w| !w.is_empty())
            .collect();
        if phrase_words.is_empty() || normalized.len() < phrase_words.len() {
            continue;
        }
        for start in 0..=(normalized.len() - phrase_words.len()) {
            let matches = (0..phrase_words.len()).all(|i| normalized[start + i] == phrase_words[i]);
            if matches {
                let end_byte = tokens[start + phrase_words.len() - 1].end;
                let better = match best {
                    None => true,
                    Some((best_start, _)) => start < best_start,
                };
                if better {
                    best = Some((start, end_byte));
                }
                break;
            }
        }
    }

    best.map(|(_, end_byte)| end_byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::{ChunkingManager, StubAsrEngine};
    use crate::config::{ConversationConfig, PipelineConfig, RingBufferConfig, SttConfig, VadConfig};
    use crate::dispatcher::{ActionEntry, CommandTable, DeviceCallback, DeviceEntry, DeviceRegistry};
    use crate::tts::{NullPlaybackSink, StubTtsEngine};

    struct EchoCallback;
    impl DeviceCallback for EchoCallback {
        fn invoke(&self, action: &str, value: Option<&str>) -> CallbackOutcome {
            CallbackOutcome::Spoken(format!("{action}:{}", value.unwrap_or("")))
        }
    }

    fn make_pipeline(mode: PipelineMode) -> Pipeline {
        let mut config = SpeechConfig::default();
        config.pipeline = PipelineConfig {
            mode,
            ..PipelineConfig::default()
        };
        config.conversation = ConversationConfig::default();

        let table = CommandTable {
            devices: vec![DeviceEntry {
                device_type: "speaker".into(),
                name: "music".into(),
                actions: vec![ActionEntry {
                    name: "play".into(),
                    trigger_wildcard: Some("play *".into()),
                    trigger_regex: None,
                    emit_topic: "music/play".into(),
                    emit_template: "play %s".into(),
                }],
            }],
        };
        let mut registry = DeviceRegistry::new();
        registry.register("music", Box::new(EchoCallback));
        let dispatcher = CommandDispatcher::new(table, registry, 4);

        let ring = Arc::new(RingBuffer::new(&RingBufferConfig::default()));
        let vad = VadGate::new(&VadConfig::default(), 16_000).unwrap();
        let asr = ChunkingManager::new(Box::new(StubAsrEngine::new(16_000)), &SttConfig::default());
        let tts = TtsGateway::new(
            Arc::new(StubTtsEngine::new(16_000)),
            Arc::new(NullPlaybackSink),
            Arc::new(Metrics::new()),
        );
        let llm = Arc::new(ApiLlm::new(&config.llm).unwrap());
        let cancel = Arc::new(AtomicBool::new(false));
        let quit = Arc::new(AtomicBool::new(false));

        Pipeline::new(
            &config,
            ring,
            vad,
            asr,
            Arc::new(InputQueue::new()),
            llm,
            tts,
            Some(dispatcher),
            None,
            Arc::new(Metrics::new()),
            cancel,
            quit,
        )
    }

    #[tokio::test]
    async fn s1_direct_command_dispatches_without_llm_and_stays_stateless() {
        let mut p = make_pipeline(PipelineMode::DirectOnly);
        p.handle_finalized_transcript("friday play iron man", Instant::now()).unwrap();
        assert_eq!(p.state(), States::ProcessCommand);

        p.tick_process_command(Instant::now()).await.unwrap();
        assert_eq!(p.state(), States::Silence);
        assert_eq!(p.conversation.len(), 1, "direct command never touches C9");
    }

    #[tokio::test]
    async fn s4_empty_utterance_acks_then_filters_blank_on_timeout() {
        let mut p = make_pipeline(PipelineMode::DirectFirst);
        p.handle_finalized_transcript("friday", Instant::now()).unwrap();
        assert_eq!(p.state(), States::CommandRecording);

        p.command_text = "[BLANK_AUDIO]".to_owned();
        p.state = States::ProcessCommand;
        p.tick_process_command(Instant::now()).await.unwrap();
        assert_eq!(p.state(), States::Silence);
        assert_eq!(p.conversation.len(), 1);
    }

    #[test]
    fn s5_goodbye_discards_tts_and_sets_quit() {
        let mut p = make_pipeline(PipelineMode::DirectFirst);
        p.handle_finalized_transcript("friday goodbye", Instant::now()).unwrap();
        assert!(p.should_quit());
        assert_eq!(p.state(), States::Silence);
    }

    #[tokio::test]
    async fn s6_new_command_dropped_when_llm_already_in_flight() {
        let mut p = make_pipeline(PipelineMode::LlmOnly);
        p.llm_worker.mark_processing_for_test();

        p.command_text = "what time is it".to_owned();
        p.state = States::ProcessCommand;
        let before = p.conversation.len();
        p.tick_process_command(Instant::now()).await.unwrap();

        assert_eq!(p.state(), States::Silence);
        assert_eq!(p.conversation.len(), before, "dropped command must not persist in C9");
    }

    #[tokio::test]
    async fn completion_polling_rolls_back_on_cancellation() {
        let mut p = make_pipeline(PipelineMode::LlmOnly);
        p.conversation.append(ChatMessage::user("write a long poem about rain"));
        let before = p.conversation.len();
        p.cancel_llm.store(true, Ordering::SeqCst);
        p.llm_worker.inject_result_for_test(LlmOutcome::Cancelled);

        p.poll_llm_completion(Instant::now()).await;
        assert_eq!(p.conversation.len(), before - 1, "rollback removes the pending user turn");
    }

    #[tokio::test]
    async fn completion_polling_appends_assistant_turn_on_success() {
        let mut p = make_pipeline(PipelineMode::LlmOnly);
        p.conversation.append(ChatMessage::user("hello"));
        p.llm_worker
            .inject_result_for_test(LlmOutcome::Completed("Hi there!".to_owned()));

        p.poll_llm_completion(Instant::now()).await;
        let snapshot = p.conversation_snapshot();
        assert_eq!(snapshot.last().unwrap().role, "assistant");
        assert_eq!(snapshot.last().unwrap().content, "Hi there!");
    }

    #[test]
    fn wake_word_tail_extraction_trims_to_original_tail() {
        let tokens = tokenize_normalized("Friday, play Iron Man.");
        let wake_words = build_wake_words(&["".to_owned(), "hey".to_owned()], "friday");
        let end = find_longest_wake_word(&tokens, &wake_words).unwrap();
        assert_eq!("Friday, play Iron Man.".trim_start()[end..].trim(), "play Iron Man.");
    }

    #[test]
    fn longer_wake_phrase_preferred_over_shorter_prefix() {
        let tokens = tokenize_normalized("hey friday what time is it");
        let wake_words = build_wake_words(&["".to_owned(), "hey".to_owned()], "friday");
        let end = find_longest_wake_word(&tokens, &wake_words).unwrap();
        assert_eq!("hey friday what time is it"[end..].trim(), "what time is it");
    }

    #[test]
    fn phrase_present_matches_as_a_word_subsequence() {
        let tokens = tokenize_normalized("friday goodbye");
        let words: Vec<&str> = tokens.iter().map(|t| t.normalized.as_str()).collect();
        assert!(phrase_present(&words, &["goodbye".to_owned()]));
        assert!(!phrase_present(&words, &["bye bye".to_owned()]));
    }
}
