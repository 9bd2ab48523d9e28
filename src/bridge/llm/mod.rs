//! LLM backend used by the bridge.
//!
//! Only Ollama's `/api/generate` is supported. Requests are sent either in
//! single-shot mode (one JSON answer) or streaming mode (newline-delimited
//! JSON records, handed to the stream relay as raw byte chunks).

pub mod ollama;

use crate::error::BackendError;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

pub use ollama::OllamaBackend;

/// Raw body chunks of a streaming generation, in transport order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;
