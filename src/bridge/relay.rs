//! Streaming relay from Ollama to the proxy.
//!
//! The backend body is newline-delimited JSON, one `{"response": ...}` record
//! per generated fragment. Records may be split across transport chunks, so
//! the tail of each chunk is carried over until its newline arrives.
//! Records that are not JSON are forwarded as raw text, minus the line
//! terminator (`\n` or `\r\n`).
//!
//! Every stream ends with the completion text frame followed by a
//! `finished_message_stream` control frame, whether it completed or failed.

use super::llm::OllamaBackend;
use super::session::FrameSink;
use crate::error::BackendError;
use crate::protocol::{MessageId, OutboundFrame};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Reasoning markers emitted by some models. Never forwarded.
pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// Text of the last content frame of every stream.
pub const COMPLETION_TEXT: &str = "\n\n[Generation complete]";

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct StreamRecord {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Per-stream bookkeeping. Dropped when the stream ends.
#[derive(Debug)]
pub struct StreamState {
    full_text: String,
    raw_chunks: usize,
    json_chunks: usize,
    text_chunks: usize,
    bytes_received: usize,
    started: Instant,
    pending: Vec<u8>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            full_text: String::new(),
            raw_chunks: 0,
            json_chunks: 0,
            text_chunks: 0,
            bytes_received: 0,
            started: Instant::now(),
            pending: Vec::new(),
        }
    }

    /// Feed one transport chunk. Returns the fragments to forward, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes_received += chunk.len();
        self.pending.extend_from_slice(chunk);

        let mut fragments = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(fragment) = self.ingest_record(&line[..newline]) {
                fragments.push(fragment);
            }
        }
        fragments
    }

    /// Flush a trailing record that had no newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        self.ingest_record(&rest)
    }

    fn ingest_record(&mut self, bytes: &[u8]) -> Option<String> {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!("Skipping stream record that is not valid UTF-8: {}", e);
                return None;
            }
        };
        let record = text.strip_suffix('\r').unwrap_or(text);
        if record.trim().is_empty() {
            return None;
        }
        self.raw_chunks += 1;

        match serde_json::from_str::<StreamRecord>(record) {
            Ok(parsed) => {
                self.json_chunks += 1;
                if let Some(err) = parsed.error {
                    warn!("Ollama reported an error mid-stream: {}", err);
                }
                parsed.response.and_then(|fragment| self.accept(fragment))
            }
            Err(_) => {
                debug!("Forwarding non-JSON record: {:.30}", record);
                self.full_text.push_str(record);
                self.text_chunks += 1;
                Some(record.to_string())
            }
        }
    }

    fn accept(&mut self, fragment: String) -> Option<String> {
        if fragment == THINK_OPEN || fragment == THINK_CLOSE {
            return None;
        }
        self.full_text.push_str(&fragment);
        if fragment.trim().is_empty() {
            return None;
        }
        self.text_chunks += 1;
        Some(fragment)
    }

    #[cfg(test)]
    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    #[cfg(test)]
    pub fn text_chunks(&self) -> usize {
        self.text_chunks
    }

    fn log_summary(&self, message_id: &MessageId) {
        let elapsed = self.started.elapsed().as_secs_f64();
        info!(
            %message_id,
            "Stream finished in {:.2}s: {} bytes in {} records",
            elapsed,
            self.bytes_received,
            self.raw_chunks
        );
        info!(
            %message_id,
            "Parsed {} JSON records, forwarded {} text fragments",
            self.json_chunks,
            self.text_chunks
        );
    }
}

/// Open a streaming generation for `prompt` and relay it to `sink`.
///
/// Returns the accumulated text, or the error text if the stream could not
/// be opened.
pub async fn relay_prompt(
    backend: &OllamaBackend,
    prompt: &str,
    sink: &mut dyn FrameSink,
    message_id: &MessageId,
) -> String {
    info!(%message_id, "Starting stream");
    match backend.open_stream(prompt).await {
        Ok(chunks) => relay(chunks, sink, message_id).await,
        Err(e) => {
            error!(%message_id, "Could not start stream: {}", e);
            let text = e.user_message();
            finish_stream(sink, message_id, &StreamOutcome::Failed(text.clone())).await;
            text
        }
    }
}

/// Relay a raw chunk stream to `sink`, tagging every frame with `message_id`.
pub async fn relay<S>(mut chunks: S, sink: &mut dyn FrameSink, message_id: &MessageId) -> String
where
    S: Stream<Item = Result<Bytes, BackendError>> + Unpin + Send,
{
    let mut state = StreamState::new();

    let outcome = loop {
        match chunks.next().await {
            Some(Ok(chunk)) => {
                for fragment in state.push_chunk(&chunk) {
                    forward(sink, fragment, message_id).await;
                }
            }
            Some(Err(e)) => {
                error!(%message_id, "Stream interrupted: {}", e);
                break StreamOutcome::Failed(e.user_message());
            }
            None => {
                if let Some(fragment) = state.finish() {
                    forward(sink, fragment, message_id).await;
                }
                break StreamOutcome::Completed;
            }
        }
    };

    state.log_summary(message_id);
    finish_stream(sink, message_id, &outcome).await;
    state.full_text
}

async fn forward(sink: &mut dyn FrameSink, fragment: String, message_id: &MessageId) {
    debug!(%message_id, "Sending fragment: {:.50}", fragment);
    let frame = OutboundFrame::reply(fragment, message_id.clone());
    if let Err(e) = sink.send(&frame).await {
        warn!(%message_id, "Failed to send stream fragment: {}", e);
    }
}

/// Emit the closing frames. Both terminal states end up here.
async fn finish_stream(sink: &mut dyn FrameSink, message_id: &MessageId, outcome: &StreamOutcome) {
    if let StreamOutcome::Failed(reason) = outcome {
        forward(sink, reason.clone(), message_id).await;
    }
    forward(sink, COMPLETION_TEXT.to_string(), message_id).await;

    let finished = OutboundFrame::stream_finished(message_id.clone());
    match sink.send(&finished).await {
        Ok(()) => info!(%message_id, "Sent stream completion"),
        Err(e) => warn!(%message_id, "Failed to send stream completion: {}", e),
    }
}
