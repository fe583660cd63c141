//! Background LLM worker (C8): runs at most one HTTP completion job at a
//! time, streams sentences to the TTS gateway as they complete, and exposes
//! a release/acquire `processing` flag so the state machine can detect
//! completion without polling the join handle directly.
//!
//! The state machine owns the conversation log (C9); this worker never
//! touches it. It is handed a message snapshot, generates a response, and
//! reports the outcome back through a mutex-protected slot.

use crate::llm::SentenceChunk;
use crate::llm::api::{ApiLlm, LlmOutcome};
use crate::conversation::ChatMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// A pending request for the worker: the message history to send plus any
/// attached vision bytes. Ownership is transferred into the spawned task.
pub struct LlmJob {
    /// Full message snapshot (system + history + the just-appended user
    /// turn), ready to send as-is.
    pub messages: Vec<ChatMessage>,
    /// Optional image bytes for a vision-augmented turn.
    pub vision_image_bytes: Option<Vec<u8>>,
}

/// Sink that receives completed sentences as the LLM streams its response.
/// Implemented by the TTS gateway; abstracted here so the worker has no
/// direct dependency on the audio stack.
pub trait SentenceSink: Send + Sync {
    /// Enqueue one sentence for synthesis.
    fn on_sentence(&self, text: &str);
}

/// Runs at most one [`LlmJob`] at a time in a background Tokio task.
///
/// `processing` transitions `false -> true` when [`LlmWorker::spawn`] is
/// called and `true -> false` exactly once, after the result has been
/// written, using `Release` ordering; the state machine polls with
/// `Acquire` and is guaranteed to observe the result once it sees `false`.
pub struct LlmWorker {
    processing: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    result: Arc<Mutex<Option<LlmOutcome>>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl LlmWorker {
    /// Create an idle worker sharing the given process-wide cancel flag
    /// (the same flag SIGINT and the wake-word handler set).
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            processing: Arc::new(AtomicBool::new(false)),
            cancel,
            result: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }

    /// True if a job is currently in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Shared handle to the process-wide interrupt flag.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Start a new job. Panics (debug-only assumption) if one is already in
    /// flight; callers must check [`LlmWorker::is_processing`] first, per
    /// the single-LLM invariant.
    pub fn spawn(
        &mut self,
        llm: Arc<ApiLlm>,
        job: LlmJob,
        sentence_sink: Arc<dyn SentenceSink>,
        sentence_pacing: Duration,
    ) {
        debug_assert!(!self.is_processing(), "at most one LLM job may be in flight");

        self.processing.store(true, Ordering::Release);
        *self.result.lock() = None;

        let processing = Arc::clone(&self.processing);
        let result = Arc::clone(&self.result);
        let cancel = Arc::clone(&self.cancel);

        self.handle = Some(tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<SentenceChunk>(8);

            let sink = Arc::clone(&sentence_sink);
            let pacer = tokio::spawn(async move {
                let mut first = true;
                while let Some(chunk) = rx.recv().await {
                    if !first {
                        tokio::time::sleep(sentence_pacing).await;
                    }
                    first = false;
                    if !chunk.text.is_empty() {
                        sink.on_sentence(&chunk.text);
                    }
                }
            });

            let outcome = llm
                .generate_response(
                    &job.messages,
                    job.vision_image_bytes.as_deref(),
                    &tx,
                    &cancel,
                )
                .await;
            drop(tx);
            let _ = pacer.await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("LLM generation failed: {e}");
                    LlmOutcome::Cancelled
                }
            };

            *result.lock() = Some(outcome);
            processing.store(false, Ordering::Release);
        }));
    }

    /// Join the completed task exactly once (idempotent if already joined).
    /// Call after observing `processing` go from `true` to `false`.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Take the stored result, if the job has completed. Returns `None` if
    /// still processing or already taken.
    pub fn take_result(&self) -> Option<LlmOutcome> {
        self.result.lock().take()
    }

    /// Force-abort an in-flight job past its shutdown grace period. Sets
    /// the cancel flag and aborts the Tokio task directly.
    pub fn force_abort(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.processing.store(false, Ordering::Release);
    }

    /// Mark a job as in flight without spawning one. Exists only so the
    /// state machine's single-LLM-in-flight branch can be exercised in
    /// tests without a real HTTP backend.
    #[cfg(test)]
    pub(crate) fn mark_processing_for_test(&mut self) {
        self.processing.store(true, Ordering::Release);
    }

    /// Deliver a result as if a job had just completed, without spawning
    /// one. Test-only seam for exercising the completion-polling rollback
    /// and append paths deterministically.
    #[cfg(test)]
    pub(crate) fn inject_result_for_test(&mut self, outcome: LlmOutcome) {
        *self.result.lock() = Some(outcome);
        self.processing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_worker_reports_not_processing() {
        let worker = LlmWorker::new(Arc::new(AtomicBool::new(false)));
        assert!(!worker.is_processing());
        assert!(worker.take_result().is_none());
    }
}
