//! Shared context handed to each bridge component at construction.
//!
//! Holds the resolved configuration, the proxy endpoint and the tracing span
//! all bridge log events are recorded under.

use crate::config::{Config, Endpoint};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Default base delay between reconnect attempts.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub config: Arc<Config>,
    pub endpoint: Endpoint,
    pub reconnect_base_delay: Duration,
    span: Span,
}

impl BridgeContext {
    pub fn new(config: Config, endpoint: Endpoint) -> Self {
        let span = tracing::info_span!(
            "bridge",
            proxy = %endpoint.base_uri(),
            model = %config.model,
        );
        Self {
            config: Arc::new(config),
            endpoint,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            span,
        }
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Span that bridge components record their events under.
    pub fn span(&self) -> &Span {
        &self.span
    }
}
