//! WebSocket session with the remote proxy.
//!
//! The session owns the only connection handle. `listen` runs the receive
//! loop: each decoded message is handed to a [`MessageHandler`] and the next
//! frame is not read until the handler returns, so replies go out in request
//! order. Lost connections are retried with a linear backoff capped at 60s.

use crate::config::Endpoint;
use crate::context::BridgeContext;
use crate::error::SessionError;
use crate::protocol::{InboundMessage, OutboundFrame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before reconnect attempt number `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt).min(MAX_BACKOFF)
}

/// Where outbound frames go.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SessionError>;
}

/// Receives every decoded inbound message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage, sink: &mut dyn FrameSink);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct Session {
    endpoint: Endpoint,
    token: String,
    base_delay: Duration,
    conn: Option<WsStream>,
    state: ConnectionState,
    reconnect_attempts: u32,
    #[cfg(test)]
    delays: Vec<Duration>,
}

impl Session {
    pub fn new(endpoint: Endpoint, token: impl Into<String>, base_delay: Duration) -> Self {
        Self {
            endpoint,
            token: token.into(),
            base_delay,
            conn: None,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            #[cfg(test)]
            delays: Vec::new(),
        }
    }

    pub fn from_context(ctx: &BridgeContext) -> Self {
        Self::new(
            ctx.endpoint.clone(),
            ctx.config.token.clone(),
            ctx.reconnect_base_delay,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Make one connection attempt. Any previous handle is closed first.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.disconnect().await;

        let display_uri = self.endpoint.base_uri();
        let request = self.request()?;

        info!("Connecting to {}", display_uri);
        self.state = ConnectionState::Connecting;

        match connect_async(request).await {
            Ok((ws, _response)) => {
                self.conn = Some(ws);
                self.state = ConnectionState::Connected;
                self.reconnect_attempts = 0;
                info!("Connection established");
                Ok(())
            }
            Err(tungstenite::Error::Url(e)) => {
                self.state = ConnectionState::Disconnected;
                Err(SessionError::InvalidEndpoint {
                    uri: display_uri,
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                error!("Failed to connect to {}: {}", display_uri, e);
                Err(SessionError::Connection {
                    uri: display_uri,
                    source: e,
                })
            }
        }
    }

    fn request(&self) -> Result<tungstenite::handshake::client::Request, SessionError> {
        let invalid = |reason: String| SessionError::InvalidEndpoint {
            uri: self.endpoint.base_uri(),
            reason,
        };
        if self.endpoint.host.trim().is_empty() {
            return Err(invalid("empty host".to_string()));
        }
        self.endpoint
            .uri(&self.token)
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))
    }

    /// Run the receive loop. Only returns on a fatal (configuration) error.
    pub async fn listen<H>(&mut self, handler: &H) -> Result<(), SessionError>
    where
        H: MessageHandler + ?Sized,
    {
        loop {
            if self.conn.is_none() {
                match self.connect().await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!("Reconnect failed: {}", e);
                        self.back_off().await;
                        continue;
                    }
                }
            }

            let Some(conn) = self.conn.as_mut() else {
                continue;
            };

            let next = conn.next().await;
            match next {
                Some(Ok(Message::Text(text))) => {
                    self.reconnect_attempts = 0;
                    debug!("Received message from server: {}", text);
                    match InboundMessage::parse(&text) {
                        Ok(message) => {
                            debug!(kind = message.kind(), "Dispatching message");
                            handler.handle(message, &mut *self).await
                        }
                        Err(e) => warn!("Dropping inbound frame: {} (frame: {})", e, text),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Server closed the connection: {:?}", frame);
                    self.drop_connection();
                    self.back_off().await;
                }
                Some(Ok(_)) => {
                    // ping/pong/binary: the connection is alive
                    self.reconnect_attempts = 0;
                }
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    self.drop_connection();
                    self.back_off().await;
                }
                None => {
                    info!("WebSocket stream ended");
                    self.drop_connection();
                    self.back_off().await;
                }
            }
        }
    }

    async fn back_off(&mut self) {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let delay = backoff_delay(self.base_delay, self.reconnect_attempts);
        warn!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, reconnecting in {:?}",
            delay
        );
        #[cfg(test)]
        self.delays.push(delay);
        tokio::time::sleep(delay).await;
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Serialize and send one frame. Without a connection the frame is dropped.
    /// A failed write drops the handle so the receive loop reconnects.
    pub async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SessionError> {
        let json = frame.to_json()?;
        let Some(conn) = self.conn.as_mut() else {
            error!(
                message_id = %frame.message_id,
                "Attempted to send a frame without an open connection"
            );
            return Err(SessionError::NotConnected);
        };
        let sent = conn.send(Message::Text(json.into())).await;
        if let Err(e) = sent {
            warn!(message_id = %frame.message_id, "Send failed, dropping connection: {}", e);
            self.drop_connection();
            return Err(SessionError::Send(e));
        }
        debug!(message_id = %frame.message_id, "Sent frame ({} chars)", frame.content.chars().count());
        Ok(())
    }

    /// Close the connection if one is open. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close(None).await {
                debug!("Error while closing WebSocket: {}", e);
            }
            info!("WebSocket connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[async_trait]
impl FrameSink for Session {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SessionError> {
        Session::send(self, frame).await
    }
}
