//! Ollama backend implementation.
//!
//! Every call builds its own HTTP client; requests are already handled one at
//! a time, so there is nothing to gain from sharing a pool.

use super::ChunkStream;
use crate::config::Config;
use crate::error::BackendError;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// Total time allowed for a single-shot generation.
pub const GENERATE_TIMEOUT: Duration = Duration::from_secs(180);
/// Connect and per-read timeout for streaming generations.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Ollama backend for local LLM inference.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    pub model: String,
    base_url: String,
    generate_timeout: Duration,
}

impl OllamaBackend {
    /// Create a new Ollama backend rooted at `base_url` (e.g. `http://localhost:11434`).
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            generate_timeout: GENERATE_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.model.clone(), config.ollama_url())
    }

    #[cfg(test)]
    pub fn with_generate_timeout(mut self, timeout: Duration) -> Self {
        self.generate_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Generate a full answer. Failures come back as readable text.
    pub async fn generate_once(&self, prompt: &str) -> String {
        match self.try_generate(prompt).await {
            Ok(text) => text,
            Err(e) => {
                error!("Ollama generation failed: {}", e);
                e.user_message()
            }
        }
    }

    /// Generate a full answer, keeping the failure typed.
    pub async fn try_generate(&self, prompt: &str) -> Result<String, BackendError> {
        let url = self.generate_url();
        let request = OllamaRequest::new(&self.model, prompt, false);
        let timeout_secs = self.generate_timeout.as_secs();

        info!(
            "Sending request to Ollama API ({}): {}",
            self.model,
            preview(prompt, 100)
        );
        debug!("Request parameters: {:?}", request);

        let client = Client::builder()
            .timeout(self.generate_timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &url, timeout_secs))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &url, timeout_secs))?;
        debug!("Raw Ollama response: {}", body);

        let parsed: OllamaResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::Decode(format!("{} in {:?}", e, preview(&body, 200))))?;

        if parsed.response.is_empty() {
            return Err(BackendError::Decode("empty response from Ollama API".to_string()));
        }

        info!(
            "Received response from Ollama API, {} characters",
            parsed.response.chars().count()
        );
        Ok(parsed.response)
    }

    /// Start a streaming generation and hand back the raw body chunks.
    ///
    /// The HTTP status is checked before any chunk is yielded.
    pub async fn open_stream(&self, prompt: &str) -> Result<ChunkStream, BackendError> {
        let url = self.generate_url();
        let request = OllamaRequest::new(&self.model, prompt, true);
        let timeout_secs = STREAM_READ_TIMEOUT.as_secs();

        info!(
            "Sending streaming request to Ollama API ({}): {}",
            self.model,
            preview(prompt, 100)
        );
        debug!("Request parameters: {:?}", request);

        let client = Client::builder()
            .connect_timeout(STREAM_READ_TIMEOUT)
            .read_timeout(STREAM_READ_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &url, timeout_secs))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let chunks = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| BackendError::from_reqwest(e, &url, timeout_secs)));
        Ok(Box::pin(chunks))
    }

    /// Check if Ollama is reachable.
    pub async fn health_check(&self) -> Result<(), BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let client = Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, &url, HEALTH_CHECK_TIMEOUT.as_secs()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    raw: bool,
    keep_alive: &'static str,
    options: OllamaOptions,
}

impl OllamaRequest {
    fn new(model: &str, prompt: &str, stream: bool) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream,
            raw: false,
            keep_alive: "5m",
            options: if stream {
                OllamaOptions::streaming()
            } else {
                OllamaOptions::default()
            },
        }
    }
}

/// Fixed generation parameters. Not tunable per request.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct OllamaOptions {
    num_predict: i32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    repeat_penalty: f32,
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tfs_z: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

impl Default for OllamaOptions {
    fn default() -> Self {
        Self {
            num_predict: 2048,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            stop: vec!["<end>".to_string(), "<stop>".to_string()],
            num_ctx: None,
            num_gpu: None,
            tfs_z: None,
            seed: None,
        }
    }
}

impl OllamaOptions {
    /// Defaults plus the larger context window used for streaming.
    fn streaming() -> Self {
        Self {
            num_ctx: Some(4096),
            num_gpu: Some(1),
            tfs_z: Some(1.0),
            seed: Some(-1),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// First `max` characters of `text`, for log lines.
fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    #[test]
    fn test_request_body_single_shot() {
        let body = serde_json::to_value(OllamaRequest::new("llama2", "hello", false)).unwrap();
        assert_eq!(body["model"], "llama2");
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["stream"], false);
        assert_eq!(body["raw"], false);
        assert_eq!(body["options"]["num_predict"], 2048);
        assert_eq!(body["options"]["top_k"], 40);
        assert_eq!(body["options"]["stop"], json!(["<end>", "<stop>"]));
        assert!(body["options"].get("num_ctx").is_none());
    }

    #[test]
    fn test_request_body_streaming_adds_tuning() {
        let body = serde_json::to_value(OllamaRequest::new("llama2", "hello", true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_ctx"], 4096);
        assert_eq!(body["options"]["seed"], -1);
        assert_eq!(body["options"]["num_predict"], 2048);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("привет мир", 6), "привет...");
    }

    #[tokio::test]
    async fn test_generate_once_returns_response_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "llama2", "prompt": "hello", "stream": false })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "response": "hi there", "done": true })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("llama2", server.uri());
        assert_eq!(backend.generate_once("hello").await, "hi there");
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model 'nope' not found"))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("nope", server.uri());
        let err = backend.try_generate("hello").await.unwrap_err();
        assert!(matches!(err, BackendError::Http { status: 404, .. }));
        assert_eq!(
            backend.generate_once("hello").await,
            "API error: 404 - model 'nope' not found"
        );
    }

    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("llama2", server.uri());
        let err = backend.try_generate("hello").await.unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn test_empty_response_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "" })))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("llama2", server.uri());
        assert!(matches!(
            backend.try_generate("hello").await,
            Err(BackendError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_returns_text() {
        let backend = OllamaBackend::new("llama2", closed_port_url().await);
        let err = backend.try_generate("hello").await.unwrap_err();
        assert!(matches!(err, BackendError::Unreachable { .. }));
        assert!(backend
            .generate_once("hello")
            .await
            .contains("could not connect to the Ollama API"));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "response": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("llama2", server.uri())
            .with_generate_timeout(Duration::from_millis(100));
        assert!(matches!(
            backend.try_generate("hello").await,
            Err(BackendError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_stream_yields_body() {
        let server = MockServer::start().await;
        let body = "{\"response\":\"A\"}\n{\"response\":\"B\"}\n";
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("llama2", server.uri());
        let chunks: Vec<_> = backend
            .open_stream("hello")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(String::from_utf8(joined).unwrap(), body);
    }

    #[tokio::test]
    async fn test_open_stream_checks_status_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new("llama2", server.uri());
        assert!(matches!(
            backend.open_stream("hello").await,
            Err(BackendError::Http { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
            .mount(&server)
            .await;

        assert!(OllamaBackend::new("llama2", server.uri())
            .health_check()
            .await
            .is_ok());
        assert!(OllamaBackend::new("llama2", closed_port_url().await)
            .health_check()
            .await
            .is_err());
    }
}
