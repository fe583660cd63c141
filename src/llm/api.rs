//! OpenAI-compatible API backend for LLM inference.
//!
//! Supports any server implementing the OpenAI chat completions API:
//! Ollama (`http://localhost:11434`), vLLM, llama.cpp server, etc.
//!
//! This type is deliberately conversation-agnostic: it takes a message
//! snapshot and returns a streamed outcome. Conversation history (C9) is
//! owned and mutated exclusively by the state machine, per the single-writer
//! discipline the core relies on for rollback-on-cancellation correctness.

use crate::config::LlmConfig;
use crate::conversation::ChatMessage;
use crate::error::{Result, SpeechError};
use crate::llm::{SentenceChunk, find_clause_boundary};
use base64::Engine;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

/// Outcome of one streamed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmOutcome {
    /// Generation ran to completion; the joined, trimmed response text.
    /// Empty text is possible (e.g. the model emitted only a think-block)
    /// and is treated by the caller as equivalent to cancellation.
    Completed(String),
    /// The interrupt flag was observed before or during the stream; no
    /// assistant turn should be recorded.
    Cancelled,
}

/// LLM backend using an OpenAI-compatible HTTP API.
///
/// Streams responses token-by-token and forwards complete sentences to the
/// TTS gateway as soon as a sentence boundary is seen, for low end-to-end
/// latency.
pub struct ApiLlm {
    config: LlmConfig,
    client: reqwest::Client,
}

impl ApiLlm {
    /// Create a new API-based LLM instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_s))
            .build()
            .map_err(|e| SpeechError::Llm(format!("failed to build HTTP client: {e}")))?;

        info!(
            "API LLM configured: {} model={}",
            config.api_url, config.api_model
        );

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    /// Generate a streaming response from the API over the given message
    /// history (already trimmed/snapshotted by the caller; the caller is
    /// responsible for appending the user turn before calling and rolling
    /// back or appending the assistant turn after, based on the returned
    /// [`LlmOutcome`]).
    ///
    /// `interrupt` is cleared at the start of the call and checked on every
    /// received chunk and at every line boundary within a chunk, bounding
    /// cancellation latency to roughly one network read plus one line.
    /// `vision_image_bytes`, if present, is attached to the final user
    /// message as a base64 image content part.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the response
    /// cannot be parsed. Cancellation is reported via `Ok(LlmOutcome::Cancelled)`,
    /// never as an `Err`.
    pub async fn generate_response(
        &self,
        messages: &[ChatMessage],
        vision_image_bytes: Option<&[u8]>,
        tx: &mpsc::Sender<SentenceChunk>,
        interrupt: &Arc<AtomicBool>,
    ) -> Result<LlmOutcome> {
        interrupt.store(false, Ordering::Relaxed);

        info!("API generating response over {} turns", messages.len());
        let gen_start = Instant::now();

        let body = serde_json::json!({
            "model": self.config.api_model,
            "messages": render_messages(messages, vision_image_bytes),
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });

        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url);
        let base = base.trim_end_matches('/');
        let url = format!("{base}/v1/chat/completions");

        let mut request = self.client.post(&url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SpeechError::Llm(format!("API request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SpeechError::Llm(format!(
                "API returned status {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut generated_text = String::new();
        let mut sentence_buffer = String::new();
        let mut token_count: usize = 0;
        let mut was_interrupted = false;
        let mut in_think_block = false;
        let probe_interval = Duration::from_millis(self.config.progress_probe_ms.max(1));

        'read_loop: loop {
            if interrupt.load(Ordering::Relaxed) {
                was_interrupted = true;
                break;
            }

            // Bound cancellation latency even if the server stalls between
            // chunks: re-check the interrupt flag at least every probe
            // interval rather than only when a chunk actually arrives.
            let next = match tokio::time::timeout(probe_interval, stream.next()).await {
                Ok(next) => next,
                Err(_) => continue,
            };
            let Some(next) = next else { break };

            if interrupt.load(Ordering::Relaxed) {
                was_interrupted = true;
                break;
            }

            let bytes = next.map_err(|e| SpeechError::Llm(format!("stream read error: {e}")))?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline_pos) = line_buf.find('\n') {
                let line = line_buf[..newline_pos].trim_end_matches('\r').to_owned();
                line_buf.drain(..=newline_pos);

                if interrupt.load(Ordering::Relaxed) {
                    was_interrupted = true;
                    break 'read_loop;
                }

                if line.is_empty() {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read_loop;
                }

                let chunk: serde_json::Value = serde_json::from_str(data)
                    .map_err(|e| SpeechError::Llm(format!("JSON parse error: {e}")))?;

                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                    if !content.is_empty() {
                        token_count += 1;

                        if content.contains("<think>") {
                            in_think_block = true;
                            continue;
                        }
                        if content.contains("</think>") {
                            in_think_block = false;
                            continue;
                        }
                        if in_think_block {
                            continue;
                        }

                        generated_text.push_str(content);
                        sentence_buffer.push_str(content);

                        if let Some(pos) = find_clause_boundary(&sentence_buffer) {
                            let sentence = sentence_buffer[..=pos].trim().to_owned();
                            if !sentence.is_empty() {
                                tx.send(SentenceChunk {
                                    text: sentence,
                                    is_final: false,
                                })
                                .await
                                .map_err(|e| {
                                    SpeechError::Channel(format!(
                                        "LLM output channel closed: {e}"
                                    ))
                                })?;
                            }
                            sentence_buffer = sentence_buffer[pos + 1..].to_owned();
                        }
                    }
                }

                if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
                    break 'read_loop;
                }
            }
        }

        let elapsed = gen_start.elapsed();

        if was_interrupted {
            info!(
                "API generation interrupted after {token_count} tokens ({:.1}s)",
                elapsed.as_secs_f64()
            );
            return Ok(LlmOutcome::Cancelled);
        }

        let remaining = sentence_buffer.trim().to_owned();
        tx.send(SentenceChunk {
            text: remaining,
            is_final: true,
        })
        .await
        .map_err(|e| SpeechError::Channel(format!("LLM output channel closed: {e}")))?;

        let tokens_per_sec = if elapsed.as_secs_f64() > 0.0 {
            token_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        info!(
            "API generated {token_count} tokens in {:.1}s ({:.1} tok/s)",
            elapsed.as_secs_f64(),
            tokens_per_sec,
        );

        Ok(LlmOutcome::Completed(generated_text.trim().to_owned()))
    }
}

/// Render a conversation snapshot (plus an optional trailing image) into the
/// OpenAI chat-completions message array. When an image is present it is
/// attached as an additional content part on the last user turn.
fn render_messages(
    messages: &[ChatMessage],
    vision_image_bytes: Option<&[u8]>,
) -> Vec<serde_json::Value> {
    let last_user_idx = vision_image_bytes
        .is_some()
        .then(|| messages.iter().rposition(|m| m.role == "user"))
        .flatten();

    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if Some(i) == last_user_idx {
                let image_bytes = vision_image_bytes.expect("checked above");
                let b64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);
                serde_json::json!({
                    "role": m.role,
                    "content": [
                        {"type": "text", "text": m.content},
                        {"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{b64}")}},
                    ],
                })
            } else {
                serde_json::json!({"role": m.role, "content": m.content})
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_messages_without_image_is_plain_content() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let rendered = render_messages(&messages, None);
        assert_eq!(rendered[1]["content"], "hi");
    }

    #[test]
    fn render_messages_attaches_image_to_last_user_turn() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("describe this"),
        ];
        let rendered = render_messages(&messages, Some(&[1, 2, 3]));
        assert!(rendered[1]["content"].is_array());
        assert_eq!(rendered[1]["content"][0]["text"], "describe this");
        assert!(
            rendered[1]["content"][1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/jpeg;base64,")
        );
    }
}
