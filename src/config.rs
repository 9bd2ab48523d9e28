//! Configuration management for ollama-bridge.
//!
//! Persistent settings live in `~/.config/ollama_proxy/config.json`. The
//! WebSocket endpoint itself comes from the command line.

use crate::error::ConfigError;
use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_HOST: &str = "bober.app";
pub const DEFAULT_PORT: u16 = 5050;
pub const DEFAULT_PATH: &str = "/auth-proxy";

pub const DEFAULT_MODEL: &str = "llama2";
pub const DEFAULT_OLLAMA_HOST: &str = "localhost";
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// Settings as stored on disk. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_port: Option<u16>,
}

impl StoredConfig {
    /// Load the config file. A missing file is an empty config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the config file, treating an unreadable file as no configuration.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("{}; starting with an empty configuration", e);
                Self::default()
            }
        }
    }

    /// Rewrite the whole config file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub token: String,
    pub model: String,
    pub ollama_host: String,
    pub ollama_port: u16,
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("ollama_proxy"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Get the log directory path.
    pub fn log_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("logs"))
    }

    /// Base URL of the Ollama HTTP API.
    pub fn ollama_url(&self) -> String {
        format!("http://{}:{}", self.ollama_host, self.ollama_port)
    }
}

impl From<&Config> for StoredConfig {
    fn from(config: &Config) -> Self {
        Self {
            token: Some(config.token.clone()),
            model: Some(config.model.clone()),
            ollama_host: Some(config.ollama_host.clone()),
            ollama_port: Some(config.ollama_port),
        }
    }
}

/// Token with all but the last four characters hidden.
fn masked(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("********{}", tail)
}

/// Render the stored configuration for `--show-config`.
pub fn describe(stored: &StoredConfig, endpoint: &Endpoint) -> String {
    let token = stored
        .token
        .as_deref()
        .map(masked)
        .unwrap_or_else(|| "not set".to_string());
    format!(
        "Current configuration:\nAuth token: {}\nOllama model: {}\nServer: {}\nOllama API server: http://{}:{}\n",
        token,
        stored.model.as_deref().unwrap_or(DEFAULT_MODEL),
        endpoint.base_uri(),
        stored.ollama_host.as_deref().unwrap_or(DEFAULT_OLLAMA_HOST),
        stored.ollama_port.unwrap_or(DEFAULT_OLLAMA_PORT),
    )
}

/// WebSocket endpoint of the remote proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, DEFAULT_PATH)
    }
}

impl Endpoint {
    /// Create a `wss://` endpoint. A missing leading `/` on the path is added.
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            secure: true,
            host: host.into(),
            port,
            path,
        }
    }

    /// Use plain `ws://` instead of TLS.
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    /// URI without the token, safe to log.
    pub fn base_uri(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }

    /// Full connection URI carrying the percent-encoded token.
    pub fn uri(&self, token: &str) -> String {
        format!(
            "{}?token={}",
            self.base_uri(),
            utf8_percent_encode(token, NON_ALPHANUMERIC)
        )
    }
}

/// Values given on the command line that take precedence over stored ones.
#[derive(Debug, Clone, Default)]
pub struct SetupOverrides {
    pub token: Option<String>,
    pub model: Option<String>,
    pub ollama_host: Option<String>,
    pub ollama_port: Option<u16>,
}

/// Source of answers for first-run setup questions.
pub trait Prompter {
    /// Ask a question; returns the (untrimmed) answer.
    fn ask(&mut self, question: &str) -> Result<String>;
}

/// Prompts on the terminal.
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&mut self, question: &str) -> Result<String> {
        eprint!("{}", question);
        std::io::stderr().flush()?;
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("Failed to read from stdin")?;
        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Resolve the runtime configuration.
///
/// Command-line overrides win. Fields still missing are prompted for; with
/// `force` every field not overridden is asked again. Returns the resolved
/// config and whether it differs from what was stored.
pub fn setup(
    stored: &StoredConfig,
    overrides: SetupOverrides,
    force: bool,
    prompter: &mut dyn Prompter,
) -> Result<(Config, bool)> {
    let token = match overrides.token {
        Some(token) => token,
        None => match (&stored.token, force) {
            (Some(token), false) => token.clone(),
            _ => {
                let answer = prompter.ask("Enter auth token: ")?;
                info!("Auth token received from user");
                answer.trim().to_string()
            }
        },
    };

    let model = match overrides.model {
        Some(model) => model,
        None => match (&stored.model, force) {
            (Some(model), false) => model.clone(),
            _ => or_default(
                prompter.ask(&format!("Enter Ollama model name (default: {}): ", DEFAULT_MODEL))?,
                DEFAULT_MODEL,
            ),
        },
    };

    let ollama_host = match overrides.ollama_host {
        Some(host) => host,
        None => match (&stored.ollama_host, force) {
            (Some(host), false) => host.clone(),
            _ => or_default(
                prompter.ask(&format!(
                    "Enter Ollama API host (default: {}): ",
                    DEFAULT_OLLAMA_HOST
                ))?,
                DEFAULT_OLLAMA_HOST,
            ),
        },
    };

    let ollama_port = match overrides.ollama_port {
        Some(port) => port,
        None => match (stored.ollama_port, force) {
            (Some(port), false) => port,
            _ => {
                let answer = prompter.ask(&format!(
                    "Enter Ollama API port (default: {}): ",
                    DEFAULT_OLLAMA_PORT
                ))?;
                parse_port(&answer)
            }
        },
    };

    let config = Config {
        token,
        model,
        ollama_host,
        ollama_port,
    };
    let changed = StoredConfig::from(&config) != *stored;
    Ok((config, changed))
}

fn or_default(answer: String, default: &str) -> String {
    let answer = answer.trim();
    if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    }
}

fn parse_port(answer: &str) -> u16 {
    let answer = answer.trim();
    if answer.is_empty() {
        return DEFAULT_OLLAMA_PORT;
    }
    match answer.parse() {
        Ok(port) => port,
        Err(_) => {
            warn!(
                "Invalid port {:?}, using default {}",
                answer, DEFAULT_OLLAMA_PORT
            );
            DEFAULT_OLLAMA_PORT
        }
    }
}
