//! Top-level proxy client.
//!
//! Wires the session, dispatcher and backend together and runs the receive
//! loop until Ctrl-C or a fatal endpoint error.

use super::dispatcher::Dispatcher;
use super::llm::OllamaBackend;
use super::session::Session;
use crate::context::BridgeContext;
use anyhow::{Context, Result};
use tracing::{error, info, warn, Instrument};

pub struct ProxyClient {
    ctx: BridgeContext,
}

impl ProxyClient {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// Run until interrupted.
    pub async fn run(&self) -> Result<()> {
        let span = self.ctx.span().clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<()> {
        let backend = OllamaBackend::from_config(&self.ctx.config);
        info!("Checking Ollama at {}...", backend.base_url());
        match backend.health_check().await {
            Ok(()) => info!("Ollama ready ({})", backend.model),
            Err(e) => warn!(
                "Ollama health check failed: {}. Requests will fail until it is reachable",
                e
            ),
        }

        let dispatcher = Dispatcher::new(&self.ctx);
        let mut session = Session::from_context(&self.ctx);

        info!("Connecting to server {}", self.ctx.endpoint.base_uri());
        let result = tokio::select! {
            result = session.listen(&dispatcher) => result
                .with_context(|| format!("Cannot connect to {}", self.ctx.endpoint.base_uri())),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Stopped by user (Ctrl-C)");
                Ok(())
            }
        };

        session.disconnect().await;
        info!("Shutting down");
        result
    }
}
