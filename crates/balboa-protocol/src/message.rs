use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One frame on the control connection. `message_id` is unique per message;
/// an `ACK` reuses the id of the message it acknowledges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessageBody {
    #[serde(rename = "IDENTIFY")]
    Identify(IdentifyPayload),
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "REQUEST")]
    Request(RequestPayload),
    #[serde(rename = "RESPONSE")]
    Response(ResponsePayload),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
    #[serde(rename = "SSE_EVENT")]
    SseEvent(SseEventPayload),
    #[serde(rename = "SSE_CLOSE")]
    SseClose(SseClosePayload),
    #[serde(rename = "SSE_ERROR")]
    SseError(SseErrorPayload),
    #[serde(rename = "SSE_CONNECTION_READY")]
    SseConnectionReady(SseConnectionReadyPayload),
    #[serde(rename = "WEBSOCKET_SHOULD_PROXY_REQUEST")]
    WebSocketShouldProxyRequest(WebSocketShouldProxyRequestPayload),
    #[serde(rename = "WEBSOCKET_SHOULD_PROXY_RESPONSE")]
    WebSocketShouldProxyResponse(WebSocketShouldProxyResponsePayload),
    #[serde(rename = "WEBSOCKET_CONNECTION_READY")]
    WebSocketConnectionReady(WebSocketConnectionReadyPayload),
    #[serde(rename = "WEBSOCKET_ON_MESSAGE")]
    WebSocketOnMessage(WebSocketOnMessagePayload),
    #[serde(rename = "WEBSOCKET_DISPATCH_MESSAGE")]
    WebSocketDispatchMessage(WebSocketDispatchMessagePayload),
    #[serde(rename = "WEBSOCKET_CLOSE")]
    WebSocketClose(WebSocketClosePayload),
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identify,
    Ack,
    Request,
    Response,
    Error,
    SseEvent,
    SseClose,
    SseError,
    SseConnectionReady,
    WebSocketShouldProxyRequest,
    WebSocketShouldProxyResponse,
    WebSocketConnectionReady,
    WebSocketOnMessage,
    WebSocketDispatchMessage,
    WebSocketClose,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyPayload {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub request_id: String,
    pub client_id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<MockResponsePayload>,
}

impl ResponsePayload {
    pub fn is_error(&self) -> bool {
        self.error.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponsePayload {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseEventPayload {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseClosePayload {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseErrorPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseConnectionReadyPayload {
    pub request_id: String,
    /// Original URL the EventSource was opened against, so the test process
    /// can match its SSE routes without a prior round trip.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketShouldProxyRequestPayload {
    pub request_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketShouldProxyResponsePayload {
    pub request_id: String,
    pub proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketConnectionReadyPayload {
    pub request_id: String,
}

/// `data` carries UTF-8 text, or base64 bytes when `binary` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketOnMessagePayload {
    pub request_id: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub binary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketDispatchMessagePayload {
    pub request_id: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub binary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosePayload {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
        }
    }

    /// Builds the acknowledgement for a received message. The ack reuses the
    /// acknowledged message's id so the sender can correlate it.
    pub fn ack(acknowledged_message_id: &str) -> Self {
        Self {
            message_id: acknowledged_message_id.to_string(),
            body: MessageBody::Ack,
        }
    }

    pub fn identify(client_id: impl Into<String>) -> Self {
        Self::new(MessageBody::Identify(IdentifyPayload {
            client_id: client_id.into(),
        }))
    }

    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Identify(_) => MessageKind::Identify,
            MessageBody::Ack => MessageKind::Ack,
            MessageBody::Request(_) => MessageKind::Request,
            MessageBody::Response(_) => MessageKind::Response,
            MessageBody::Error(_) => MessageKind::Error,
            MessageBody::SseEvent(_) => MessageKind::SseEvent,
            MessageBody::SseClose(_) => MessageKind::SseClose,
            MessageBody::SseError(_) => MessageKind::SseError,
            MessageBody::SseConnectionReady(_) => MessageKind::SseConnectionReady,
            MessageBody::WebSocketShouldProxyRequest(_) => MessageKind::WebSocketShouldProxyRequest,
            MessageBody::WebSocketShouldProxyResponse(_) => {
                MessageKind::WebSocketShouldProxyResponse
            }
            MessageBody::WebSocketConnectionReady(_) => MessageKind::WebSocketConnectionReady,
            MessageBody::WebSocketOnMessage(_) => MessageKind::WebSocketOnMessage,
            MessageBody::WebSocketDispatchMessage(_) => MessageKind::WebSocketDispatchMessage,
            MessageBody::WebSocketClose(_) => MessageKind::WebSocketClose,
            MessageBody::Unknown => MessageKind::Unknown,
        }
    }

    /// Request-scoped correlation id carried by the payload, when the message
    /// type has one. `ACK` correlates through `message_id` instead.
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Request(p) => Some(&p.request_id),
            MessageBody::Response(p) => Some(&p.request_id),
            MessageBody::Error(p) => p.request_id.as_deref(),
            MessageBody::SseEvent(p) => Some(&p.request_id),
            MessageBody::SseClose(p) => Some(&p.request_id),
            MessageBody::SseError(p) => Some(&p.request_id),
            MessageBody::SseConnectionReady(p) => Some(&p.request_id),
            MessageBody::WebSocketShouldProxyRequest(p) => Some(&p.request_id),
            MessageBody::WebSocketShouldProxyResponse(p) => Some(&p.request_id),
            MessageBody::WebSocketConnectionReady(p) => Some(&p.request_id),
            MessageBody::WebSocketOnMessage(p) => Some(&p.request_id),
            MessageBody::WebSocketDispatchMessage(p) => Some(&p.request_id),
            MessageBody::WebSocketClose(p) => Some(&p.request_id),
            MessageBody::Identify(_) | MessageBody::Ack | MessageBody::Unknown => None,
        }
    }

    /// Whether the receiver must answer this message with an `ACK`.
    pub fn expects_ack(&self) -> bool {
        !matches!(self.body, MessageBody::Ack | MessageBody::Unknown)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // A Message is always representable as JSON; keep the failure
            // observable instead of panicking in a transport path.
            format!(
                "{{\"type\":\"UNKNOWN\",\"messageId\":\"{}\"}}",
                self.message_id
            )
        })
    }

    /// Decoding never fails: frames that do not match the schema degrade to
    /// `UNKNOWN`, keeping whatever `messageId` could be salvaged.
    pub fn decode(text: &str) -> Self {
        if let Ok(message) = serde_json::from_str::<Message>(text) {
            return message;
        }

        let message_id = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|value| {
                value
                    .get("messageId")
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self {
            message_id,
            body: MessageBody::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_with_camel_case_payload() {
        let message = Message::new(MessageBody::Request(RequestPayload {
            request_id: "req-1".to_string(),
            client_id: "client-1".to_string(),
            method: "POST".to_string(),
            url: "https://api.example.com/users".to_string(),
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: Some("{\"name\":\"rocky\"}".to_string()),
        }));

        let encoded = message.encode();
        assert!(encoded.contains("\"type\":\"REQUEST\""), "{encoded}");
        assert!(encoded.contains("\"requestId\":\"req-1\""), "{encoded}");
        assert!(encoded.contains("\"clientId\":\"client-1\""), "{encoded}");

        let decoded = Message::decode(&encoded);
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), MessageKind::Request);
        assert_eq!(decoded.correlation_id(), Some("req-1"));
    }

    #[test]
    fn malformed_frames_degrade_to_unknown() {
        let decoded = Message::decode("{\"type\":\"NO_SUCH_TYPE\",\"messageId\":\"m-7\"}");
        assert_eq!(decoded.body, MessageBody::Unknown);
        assert_eq!(decoded.message_id, "m-7");
        assert!(!decoded.expects_ack());

        let garbage = Message::decode("not json at all");
        assert_eq!(garbage.body, MessageBody::Unknown);
        assert_eq!(garbage.message_id, "");
    }

    #[test]
    fn ack_reuses_the_acknowledged_message_id() {
        let identify = Message::identify("client-9");
        let ack = Message::ack(&identify.message_id);
        assert_eq!(ack.message_id, identify.message_id);
        assert_eq!(ack.kind(), MessageKind::Ack);
        assert!(!ack.expects_ack());
    }

    #[test]
    fn message_ids_are_unique_per_message() {
        let first = Message::identify("client-1");
        let second = Message::identify("client-1");
        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn response_payload_error_flag_defaults_to_false() {
        let text = "{\"type\":\"RESPONSE\",\"messageId\":\"m-1\",\"payload\":{\"requestId\":\"req-1\"}}";
        let decoded = Message::decode(text);
        let MessageBody::Response(payload) = &decoded.body else {
            panic!("expected RESPONSE, got {decoded:?}");
        };
        assert!(!payload.is_error());
        assert!(payload.response.is_none());
    }
}
