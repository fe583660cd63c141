//! Integration tests for [`ApiLlm::generate_response`] against a mock
//! OpenAI-compatible SSE endpoint: sentence-boundary chunking, think-block
//! filtering, and HTTP-call cancellation.

use dawn_voice::config::LlmConfig;
use dawn_voice::conversation::ChatMessage;
use dawn_voice::llm::SentenceChunk;
use dawn_voice::llm::api::{ApiLlm, LlmOutcome};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(lines: &[&str]) -> String {
    let mut body = String::new();
    for line in lines {
        body.push_str("data: ");
        body.push_str(line);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn chunk(content: &str) -> String {
    serde_json::json!({
        "choices": [{"delta": {"content": content}, "finish_reason": serde_json::Value::Null}]
    })
    .to_string()
}

async fn llm_for(mock_server: &MockServer) -> ApiLlm {
    let config = LlmConfig {
        api_url: mock_server.uri(),
        ..LlmConfig::default()
    };
    ApiLlm::new(&config).expect("client builds")
}

#[tokio::test]
async fn streams_sentences_at_clause_boundaries_and_joins_full_text() {
    let mock_server = MockServer::start().await;
    let body = sse_body(&[
        &chunk("Hello there. "),
        &chunk("How can I help"),
        &chunk(" you today?"),
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&mock_server)
        .await;

    let llm = llm_for(&mock_server).await;
    let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
    let (tx, mut rx) = mpsc::channel::<SentenceChunk>(8);
    let cancel = Arc::new(AtomicBool::new(false));

    let outcome = llm
        .generate_response(&messages, None, &tx, &cancel)
        .await
        .expect("generation succeeds");
    drop(tx);

    let mut sentences = Vec::new();
    while let Some(c) = rx.recv().await {
        if !c.text.is_empty() {
            sentences.push(c.text);
        }
    }

    assert_eq!(sentences[0], "Hello there.");
    assert_eq!(
        outcome,
        LlmOutcome::Completed("Hello there. How can I help you today?".to_owned())
    );
}

#[tokio::test]
async fn think_block_content_is_excluded_from_the_spoken_and_joined_text() {
    let mock_server = MockServer::start().await;
    let body = sse_body(&[
        &chunk("<think>"),
        &chunk("scratch notes the user never hears"),
        &chunk("</think>"),
        &chunk("Final answer."),
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&mock_server)
        .await;

    let llm = llm_for(&mock_server).await;
    let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
    let (tx, mut rx) = mpsc::channel::<SentenceChunk>(8);
    let cancel = Arc::new(AtomicBool::new(false));

    let outcome = llm
        .generate_response(&messages, None, &tx, &cancel)
        .await
        .expect("generation succeeds");
    drop(tx);
    while rx.recv().await.is_some() {}

    assert_eq!(outcome, LlmOutcome::Completed("Final answer.".to_owned()));
}

#[tokio::test]
async fn cancel_flag_set_during_the_http_call_yields_cancelled_outcome() {
    let mock_server = MockServer::start().await;
    let body = sse_body(&[&chunk("This response should never be spoken.")]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/event-stream")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&mock_server)
        .await;

    let llm = Arc::new(llm_for(&mock_server).await);
    let messages = vec![ChatMessage::system("sys"), ChatMessage::user("write a long poem")];
    let (tx, mut rx) = mpsc::channel::<SentenceChunk>(8);
    let cancel = Arc::new(AtomicBool::new(false));

    let task_llm = Arc::clone(&llm);
    let task_cancel = Arc::clone(&cancel);
    let handle = tokio::spawn(async move {
        task_llm
            .generate_response(&messages, None, &tx, &task_cancel)
            .await
    });

    // The mock delays its response by 200ms; set the interrupt flag well
    // before it arrives so the very first interrupt check (at the top of
    // the streaming read loop) observes it, simulating a wake-word
    // detected mid-call.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.store(true, Ordering::SeqCst);

    let outcome = handle.await.expect("task completes").expect("no transport error");
    while rx.recv().await.is_some() {}

    assert_eq!(outcome, LlmOutcome::Cancelled);
}
