mod message;

pub use message::{
    ErrorPayload, IdentifyPayload, Message, MessageBody, MessageKind, MockResponsePayload,
    RequestPayload, ResponsePayload, SseClosePayload, SseConnectionReadyPayload, SseErrorPayload,
    SseEventPayload, WebSocketClosePayload, WebSocketConnectionReadyPayload,
    WebSocketDispatchMessagePayload, WebSocketOnMessagePayload,
    WebSocketShouldProxyRequestPayload, WebSocketShouldProxyResponsePayload,
};

/// Reserved header carrying the client identity from the test process to the
/// server under test; also reused as a query parameter key by the streaming
/// proxy endpoints.
pub const CLIENT_ID_HEADER: &str = "x-mocky-balboa-client-id";

/// Default port for the control-plane WebSocket server.
pub const DEFAULT_CONTROL_PORT: u16 = 58152;

/// Default port for the streaming proxy server.
pub const DEFAULT_PROXY_PORT: u16 = 58153;
