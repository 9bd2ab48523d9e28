//! The bridge between the remote proxy and Ollama.
//!
//! - `session` holds the WebSocket connection and runs the receive loop
//! - `dispatcher` routes each request to the backend
//! - `relay` forwards streamed generations fragment by fragment
//! - `llm` talks to the Ollama HTTP API
//! - `client` wires everything together

pub mod client;
pub mod dispatcher;
pub mod llm;
pub mod relay;
pub mod session;

pub use client::ProxyClient;
