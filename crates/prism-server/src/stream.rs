//! SSE session state machine.
//!
//! One session per streaming request: `opening → streaming → {completed,
//! errored, timed_out}`. Content chunks pass straight through; a heartbeat
//! fires after every quiet interval; the duration cap forces a terminal
//! event no matter what the provider does. Dropping the stream (client
//! disconnect) releases the request's cancellation guard, which tears down
//! the LLM call and any still-live lane tasks.

use axum::response::sse::Event as SseEvent;
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::info;

use prism_core::{ErrorKind, TraceId};
use prism_llm::{StreamChunk, TokenUsage};

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Opening,
    Streaming,
    Completed,
    Errored,
    TimedOut,
}

/// Metadata carried into the terminal `complete` event.
#[derive(Debug, Clone)]
pub struct CompleteMeta {
    pub provider_id: String,
    pub model_id: String,
    pub citations_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub heartbeat: Duration,
    pub cap: Duration,
}

fn event(kind: &str, data: serde_json::Value) -> SseEvent {
    SseEvent::default()
        .event(kind.to_string())
        .data(data.to_string())
}

/// Wrap a chunk receiver in the session state machine. `cancel_guard` is
/// held for the life of the stream; dropping the stream cancels the
/// request's descendants.
pub fn session_stream(
    trace_id: TraceId,
    mut rx: mpsc::Receiver<StreamChunk>,
    meta: CompleteMeta,
    opts: SessionOptions,
    metrics: Metrics,
    cancel_guard: DropGuard,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        // Held until the stream is dropped or finishes.
        let _guard = cancel_guard;

        let started = Instant::now();
        let mut state = SessionState::Opening;
        let mut usage: Option<TokenUsage> = None;
        let mut heartbeats_sent = 0u64;
        let mut bytes_sent = 0u64;
        let mut last_event_at = Instant::now();

        let cap_sleep = tokio::time::sleep(opts.cap);
        tokio::pin!(cap_sleep);

        loop {
            let until_heartbeat = opts.heartbeat.saturating_sub(last_event_at.elapsed());

            // Decide the next step inside select!, emit outside it.
            let step = tokio::select! {
                biased;
                _ = &mut cap_sleep => Step::Cap,
                chunk = rx.recv() => Step::Chunk(chunk),
                _ = tokio::time::sleep(until_heartbeat) => Step::Heartbeat,
            };

            match step {
                Step::Cap => {
                    state = SessionState::TimedOut;
                    info!(trace_id = %trace_id, elapsed_ms = started.elapsed().as_millis() as u64, "sse session hit duration cap");
                    yield Ok(event("error", serde_json::json!({
                        "type": "error",
                        "trace_id": trace_id.as_str(),
                        "error_kind": ErrorKind::StreamTimedOut.as_str(),
                        "retryable": ErrorKind::StreamTimedOut.retryable(),
                    })));
                    break;
                }
                Step::Heartbeat => {
                    heartbeats_sent += 1;
                    metrics.inc_sse_heartbeats();
                    last_event_at = Instant::now();
                    info!(trace_id = %trace_id, elapsed_ms = started.elapsed().as_millis() as u64, "sse heartbeat");
                    yield Ok(event("heartbeat", serde_json::json!({
                        "type": "heartbeat",
                        "trace_id": trace_id.as_str(),
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                        "state": state,
                    })));
                }
                Step::Chunk(Some(StreamChunk::TextDelta(text))) => {
                    state = SessionState::Streaming;
                    bytes_sent += text.len() as u64;
                    last_event_at = Instant::now();
                    yield Ok(event("content_chunk", serde_json::json!({
                        "type": "content_chunk",
                        "trace_id": trace_id.as_str(),
                        "text": text,
                    })));
                }
                Step::Chunk(Some(StreamChunk::Usage(u))) => {
                    usage = Some(u);
                }
                Step::Chunk(Some(StreamChunk::Error(reason))) => {
                    state = SessionState::Errored;
                    info!(trace_id = %trace_id, reason = %reason, "sse session errored");
                    yield Ok(event("error", serde_json::json!({
                        "type": "error",
                        "trace_id": trace_id.as_str(),
                        "error_kind": ErrorKind::ProviderError.as_str(),
                        "retryable": ErrorKind::ProviderError.retryable(),
                    })));
                    break;
                }
                // Done, or the provider closed the channel.
                Step::Chunk(Some(StreamChunk::Done)) | Step::Chunk(None) => {
                    state = SessionState::Completed;
                    let usage = usage.take().unwrap_or_default();
                    info!(
                        trace_id = %trace_id,
                        bytes_sent,
                        heartbeats_sent,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "sse session complete"
                    );
                    yield Ok(event("complete", serde_json::json!({
                        "type": "complete",
                        "trace_id": trace_id.as_str(),
                        "citations_count": meta.citations_count,
                        "token_usage": usage,
                        "provider_id": meta.provider_id,
                        "model_id": meta.model_id,
                    })));
                    break;
                }
            }
        }

        let _ = state;
        metrics.observe_sse_duration(started.elapsed().as_millis() as f64);
    }
}

/// What the session loop decided to do next.
enum Step {
    Cap,
    Heartbeat,
    Chunk(Option<StreamChunk>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn opts(heartbeat_ms: u64, cap_ms: u64) -> SessionOptions {
        SessionOptions {
            heartbeat: Duration::from_millis(heartbeat_ms),
            cap: Duration::from_millis(cap_ms),
        }
    }

    fn meta() -> CompleteMeta {
        CompleteMeta {
            provider_id: "local_stub".into(),
            model_id: "stub-small".into(),
            citations_count: 2,
        }
    }

    async fn collect(stream: impl Stream<Item = Result<SseEvent, Infallible>>) -> Vec<String> {
        // SseEvent has no public accessor for the event name; format the
        // frames and pull the `event:` lines back out.
        stream
            .map(|e| format!("{:?}", e.unwrap()))
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_chunks_then_complete() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let stream = session_stream(
            TraceId::new(),
            rx,
            meta(),
            opts(5_000, 60_000),
            Metrics::new(),
            cancel.clone().drop_guard(),
        );

        tokio::spawn(async move {
            tx.send(StreamChunk::TextDelta("hello ".into())).await.unwrap();
            tx.send(StreamChunk::TextDelta("world".into())).await.unwrap();
            tx.send(StreamChunk::Usage(TokenUsage::default())).await.unwrap();
            tx.send(StreamChunk::Done).await.unwrap();
        });

        let frames = collect(stream).await;
        assert!(frames.iter().any(|f| f.contains("content_chunk")));
        assert!(frames.last().unwrap().contains("complete"));
        assert!(frames.last().unwrap().contains("citations_count"));
    }

    #[tokio::test]
    async fn test_heartbeat_on_silence() {
        let (tx, rx) = mpsc::channel::<StreamChunk>(16);
        let cancel = CancellationToken::new();
        let stream = session_stream(
            TraceId::new(),
            rx,
            meta(),
            opts(50, 60_000),
            Metrics::new(),
            cancel.clone().drop_guard(),
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(StreamChunk::Done).await;
        });

        let frames = collect(stream).await;
        let heartbeats = frames.iter().filter(|f| f.contains("heartbeat")).count();
        assert!(heartbeats >= 2, "expected heartbeats during silence, got {heartbeats}");
        assert!(frames.last().unwrap().contains("complete"));
    }

    #[tokio::test]
    async fn test_duration_cap_forces_terminal_error() {
        // Sender never finishes; keep it alive so the channel stays open.
        let (tx, rx) = mpsc::channel::<StreamChunk>(16);
        let cancel = CancellationToken::new();
        let stream = session_stream(
            TraceId::new(),
            rx,
            meta(),
            opts(20, 100),
            Metrics::new(),
            cancel.clone().drop_guard(),
        );

        let frames = collect(stream).await;
        drop(tx);
        let last = frames.last().unwrap();
        assert!(last.contains("error"));
        assert!(last.contains("stream_timed_out"));
    }

    #[tokio::test]
    async fn test_provider_error_is_terminal_and_not_retryable() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let stream = session_stream(
            TraceId::new(),
            rx,
            meta(),
            opts(5_000, 60_000),
            Metrics::new(),
            cancel.clone().drop_guard(),
        );
        tokio::spawn(async move {
            tx.send(StreamChunk::Error("upstream exploded".into()))
                .await
                .unwrap();
        });
        let frames = collect(stream).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("provider_error"));
        assert!(frames[0].contains("\"retryable\":false"));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_request() {
        let (_tx, rx) = mpsc::channel::<StreamChunk>(16);
        let cancel = CancellationToken::new();
        let stream = session_stream(
            TraceId::new(),
            rx,
            meta(),
            opts(5_000, 60_000),
            Metrics::new(),
            cancel.clone().drop_guard(),
        );
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }
}
