//! Routes inbound messages to the backend.

use super::llm::OllamaBackend;
use super::relay;
use super::session::{FrameSink, MessageHandler};
use crate::context::BridgeContext;
use crate::protocol::{InboundMessage, MessageId, OutboundFrame};
use async_trait::async_trait;
use tracing::{debug, error, info, Instrument, Span};

pub struct Dispatcher {
    backend: OllamaBackend,
    span: Span,
}

impl Dispatcher {
    pub fn new(ctx: &BridgeContext) -> Self {
        Self::with_backend(OllamaBackend::from_config(&ctx.config), ctx.span().clone())
    }

    pub fn with_backend(backend: OllamaBackend, span: Span) -> Self {
        Self { backend, span }
    }

    /// Handle one message. Errors are logged here and never propagate.
    pub async fn route(&self, message: InboundMessage, sink: &mut dyn FrameSink) {
        match message {
            InboundMessage::UserRequest {
                prompt,
                message_id,
                stream,
            } => {
                let span = tracing::info_span!(parent: &self.span, "request", %message_id, stream);
                self.answer(&prompt, message_id, stream, sink)
                    .instrument(span)
                    .await
            }
            InboundMessage::SystemNotice { content } => {
                debug!("Received system message: {:?}", content);
            }
            InboundMessage::Unknown { kind } => {
                debug!("Ignoring message of type {}", kind);
            }
        }
    }

    async fn answer(
        &self,
        prompt: &str,
        message_id: MessageId,
        stream: bool,
        sink: &mut dyn FrameSink,
    ) {
        info!(
            "Received request (messageId: {}, stream: {}): {}",
            message_id, stream, prompt
        );

        if stream {
            let text = relay::relay_prompt(&self.backend, prompt, sink, &message_id).await;
            info!(
                "Streamed answer sent (messageId: {}, {} characters)",
                message_id,
                text.chars().count()
            );
            return;
        }

        let text = self.backend.generate_once(prompt).await;
        let frame = OutboundFrame::reply(text, message_id);
        match sink.send(&frame).await {
            Ok(()) => info!("Answer sent (messageId: {})", frame.message_id),
            Err(e) => error!(
                "Failed to send answer (messageId: {}): {}",
                frame.message_id, e
            ),
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: InboundMessage, sink: &mut dyn FrameSink) {
        self.route(message, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::relay::tests::RecordingSink;
    use crate::bridge::relay::COMPLETION_TEXT;
    use crate::error::SessionError;
    use crate::protocol::FrameKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(base_url: String) -> Dispatcher {
        Dispatcher::with_backend(OllamaBackend::new("llama2", base_url), Span::none())
    }

    /// A sink whose connection is gone.
    struct ClosedSink;

    #[async_trait]
    impl FrameSink for ClosedSink {
        async fn send(&mut self, _frame: &OutboundFrame) -> Result<(), SessionError> {
            Err(SessionError::NotConnected)
        }
    }

    #[tokio::test]
    async fn test_single_shot_reply_echoes_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "prompt": "hello", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "hi there" })))
            .mount(&server)
            .await;

        let message = InboundMessage::parse(
            r#"{"type":"buyer_message","content":"hello","messageId":"m1","stream":false}"#,
        )
        .unwrap();
        let mut sink = RecordingSink::default();
        dispatcher(server.uri()).route(message, &mut sink).await;

        assert_eq!(sink.frames.len(), 1);
        let frame = &sink.frames[0];
        assert_eq!(frame.kind, FrameKind::FromOwner);
        assert_eq!(frame.content, "hi there");
        assert_eq!(frame.message_id, MessageId::from("m1"));
    }

    #[tokio::test]
    async fn test_non_buyer_messages_get_no_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "x" })))
            .expect(0)
            .mount(&server)
            .await;

        let d = dispatcher(server.uri());
        let mut sink = RecordingSink::default();
        for raw in [
            r#"{"type":"system","content":"maintenance at 5"}"#,
            r#"{"type":"typing","content":"..."}"#,
        ] {
            d.route(InboundMessage::parse(raw).unwrap(), &mut sink).await;
        }
        assert!(sink.frames.is_empty());
    }

    #[tokio::test]
    async fn test_backend_unreachable_becomes_reply_text() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let message = InboundMessage::UserRequest {
            prompt: "hello".to_string(),
            message_id: MessageId::Int(12),
            stream: false,
        };
        let mut sink = RecordingSink::default();
        dispatcher(format!("http://127.0.0.1:{}", port))
            .route(message, &mut sink)
            .await;

        assert_eq!(sink.frames.len(), 1);
        assert!(sink.frames[0].content.contains("could not connect"));
        assert_eq!(sink.frames[0].message_id, MessageId::Int(12));
    }

    #[tokio::test]
    async fn test_streaming_request_uses_relay() {
        let server = MockServer::start().await;
        let body = "{\"response\":\"A\"}\n{\"response\":\"<think>\"}\n{\"response\":\"B\"}\n";
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let message = InboundMessage::UserRequest {
            prompt: "hello".to_string(),
            message_id: MessageId::from("s1"),
            stream: true,
        };
        let mut sink = RecordingSink::default();
        dispatcher(server.uri()).route(message, &mut sink).await;

        assert_eq!(sink.contents(), vec!["A", "B", COMPLETION_TEXT, ""]);
        assert_eq!(
            sink.frames.last().unwrap().kind,
            FrameKind::FinishedMessageStream
        );
        assert!(sink
            .frames
            .iter()
            .all(|f| f.message_id == MessageId::from("s1")));
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "hi" })))
            .mount(&server)
            .await;

        let message = InboundMessage::UserRequest {
            prompt: "hello".to_string(),
            message_id: MessageId::default(),
            stream: false,
        };
        dispatcher(server.uri()).route(message, &mut ClosedSink).await;
    }
}
