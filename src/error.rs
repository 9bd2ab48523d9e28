//! Error types for the bridge.
//!
//! Each layer has its own error enum. Backend errors are turned into reply
//! text at the dispatcher boundary, protocol errors are logged and dropped,
//! and only an invalid endpoint is allowed to stop the process.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the WebSocket session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The endpoint cannot be turned into a WebSocket request at all.
    #[error("invalid WebSocket endpoint {uri}: {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    /// The proxy refused the connection or the transport failed.
    #[error("failed to connect to {uri}: {source}")]
    Connection {
        uri: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// A frame was sent while no connection was open.
    #[error("not connected to the proxy")]
    NotConnected,

    /// Writing a frame to an open connection failed.
    #[error("failed to send frame: {0}")]
    Send(#[source] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be serialized.
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether the error is a configuration problem that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::InvalidEndpoint { .. })
    }
}

/// Errors decoding an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Errors talking to the Ollama HTTP API.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("timed out waiting for Ollama after {secs}s")]
    Timeout { secs: u64 },

    #[error("could not connect to Ollama at {url}")]
    Unreachable { url: String },

    #[error("Ollama returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("could not decode Ollama response: {0}")]
    Decode(String),

    #[error("HTTP transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Map a reqwest failure onto the backend taxonomy.
    pub fn from_reqwest(err: reqwest::Error, url: &str, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            BackendError::Timeout { secs: timeout_secs }
        } else if err.is_connect() {
            BackendError::Unreachable {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }

    /// Text sent back to the requester in place of a generated answer.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Timeout { .. } => {
                "Error: timed out waiting for a response from Ollama. Check the server and try again."
                    .to_string()
            }
            BackendError::Unreachable { url } => format!(
                "Error: could not connect to the Ollama API at {}. Make sure the Ollama server is running.",
                url
            ),
            BackendError::Http { status, body } => format!("API error: {} - {}", status, body),
            BackendError::Decode(detail) => format!("Error processing response: {}", detail),
            BackendError::Transport(detail) => {
                format!("An error occurred while processing the request: {}", detail)
            }
        }
    }
}

/// Errors reading the persisted configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
