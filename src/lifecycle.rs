//! Signal handling and graceful shutdown (C12).
//!
//! SIGINT sets a process-wide quit flag and the shared LLM cancel flag in
//! the same stroke, since an in-flight HTTP completion can otherwise hold
//! the worker thread for tens of seconds past the point the user asked to
//! quit. Shutdown then proceeds in a fixed order: stop accepting new
//! input, wait for the in-flight LLM to abort or complete (bounded by a
//! grace period), stop the capture worker, close the TTS gateway, persist
//! the conversation snapshot and metrics, and return.

use crate::conversation::ChatMessage;
use crate::error::{Result, SpeechError};
use crate::llm::worker::LlmWorker;
use crate::metrics::Metrics;
use crate::tts::TtsGateway;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long the worker gets to abort or finish after shutdown begins
/// before it is forcibly aborted.
pub const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Installs the SIGINT handler and owns the process-wide quit/cancel
/// flags shared with the pipeline.
pub struct Lifecycle {
    quit: Arc<AtomicBool>,
    cancel_llm: Arc<AtomicBool>,
    capture_cancel: CancellationToken,
}

impl Lifecycle {
    /// Build a lifecycle controller sharing the pipeline's quit/cancel
    /// flags. Does not install the signal handler yet; call
    /// [`Lifecycle::install_sigint_handler`] once the runtime is up.
    pub fn new(quit: Arc<AtomicBool>, cancel_llm: Arc<AtomicBool>) -> Self {
        Self {
            quit,
            cancel_llm,
            capture_cancel: CancellationToken::new(),
        }
    }

    /// Token passed to the capture worker's `run` loop; cancelled on
    /// shutdown.
    pub fn capture_cancel_token(&self) -> CancellationToken {
        self.capture_cancel.clone()
    }

    /// Spawn a task that waits for SIGINT and sets both process-wide
    /// flags. Idempotent across repeated SIGINTs (subsequent signals are
    /// simply ignored once the flag is set).
    pub fn install_sigint_handler(&self) {
        let quit = Arc::clone(&self.quit);
        let cancel = Arc::clone(&self.cancel_llm);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, shutting down");
                quit.store(true, Ordering::SeqCst);
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    /// Run the shutdown sequence: wait out the LLM worker, stop capture,
    /// close TTS, and persist the conversation + metrics snapshots to
    /// `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot files cannot be written; shutdown
    /// otherwise always completes (subsystem failures are logged, not
    /// propagated).
    pub async fn shutdown(
        &self,
        llm_worker: &mut LlmWorker,
        tts: &Arc<TtsGateway>,
        conversation: Vec<ChatMessage>,
        metrics: &Metrics,
        data_dir: &Path,
    ) -> Result<()> {
        self.cancel_llm.store(true, Ordering::SeqCst);

        let wait_start = std::time::Instant::now();
        while llm_worker.is_processing() && wait_start.elapsed() < WORKER_SHUTDOWN_GRACE {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if llm_worker.is_processing() {
            warn!("LLM worker did not abort within grace period, forcing abort");
            llm_worker.force_abort();
        } else {
            llm_worker.join().await;
        }

        self.capture_cancel.cancel();
        tts.shutdown();

        persist_conversation(&conversation, data_dir)?;
        persist_metrics(metrics, data_dir)?;

        info!("shutdown complete");
        Ok(())
    }
}

fn timestamped_path(data_dir: &Path, prefix: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    data_dir.join(format!("{prefix}_{stamp}.json"))
}

/// Write the conversation log to `chat_history_YYYYMMDD_HHMMSS.json`,
/// pretty-printed, creating `data_dir` if needed.
pub fn persist_conversation(conversation: &[ChatMessage], data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = timestamped_path(data_dir, "chat_history");
    let json = serde_json::to_string_pretty(conversation)
        .map_err(|e| SpeechError::Io(std::io::Error::other(e)))?;
    std::fs::write(&path, json)?;
    info!("conversation snapshot written to {}", path.display());
    Ok(())
}

/// Write the metrics snapshot to `dawn_stats_YYYYMMDD_HHMMSS.json`,
/// pretty-printed, creating `data_dir` if needed.
pub fn persist_metrics(metrics: &Metrics, data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = timestamped_path(data_dir, "dawn_stats");
    let snapshot = metrics.snapshot();
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| SpeechError::Io(std::io::Error::other(e)))?;
    std::fs::write(&path, json)?;
    info!("metrics snapshot written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;

    #[test]
    fn persist_conversation_writes_pretty_json_to_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        persist_conversation(&messages, dir.path()).expect("persist");

        let mut found = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned());
        let name = found.find(|n| n.starts_with("chat_history_")).expect("file written");
        let contents = std::fs::read_to_string(dir.path().join(name)).expect("read");
        assert!(contents.contains("\"hi\""));
    }

    #[test]
    fn persist_metrics_writes_snapshot_to_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let metrics = Metrics::new();
        metrics.record_wake_word();
        persist_metrics(&metrics, dir.path()).expect("persist");

        let found = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("dawn_stats_"));
        assert!(found);
    }

    #[tokio::test]
    async fn shutdown_persists_snapshots_and_stops_tts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let quit = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let lifecycle = Lifecycle::new(Arc::clone(&quit), Arc::clone(&cancel));

        let mut worker = LlmWorker::new(Arc::clone(&cancel));
        let tts = TtsGateway::new(
            Arc::new(crate::tts::StubTtsEngine::new(16_000)),
            Arc::new(crate::tts::NullPlaybackSink),
            Arc::new(Metrics::new()),
        );
        let metrics = Metrics::new();

        lifecycle
            .shutdown(&mut worker, &tts, vec![ChatMessage::system("sys")], &metrics, dir.path())
            .await
            .expect("shutdown");

        assert!(cancel.load(Ordering::SeqCst));
        assert!(lifecycle.capture_cancel_token().is_cancelled());
    }
}
