use std::io;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use balboa_core::{Subscription, SubscriptionFilter};
use balboa_protocol::{
    Message, MessageBody, MessageKind, SseConnectionReadyPayload, SseEventPayload,
};
use serde::Deserialize;

use crate::server::ProxyState;

#[derive(Debug, Deserialize)]
pub(crate) struct SseProxyParams {
    #[serde(rename = "requestId")]
    request_id: String,
    url: String,
    #[serde(rename = "x-mocky-balboa-client-id")]
    client_id: String,
}

/// SSE proxy endpoint: binds the response stream to `(SSE_EVENT | SSE_CLOSE
/// | SSE_ERROR, requestId)` traffic on the owning control connection, then
/// tells the test process the stream is ready to receive dispatches.
pub(crate) async fn sse_proxy(
    State(state): State<ProxyState>,
    Query(params): Query<SseProxyParams>,
) -> Response {
    let Some(handle) = state.registry.get(&params.client_id) else {
        return (
            StatusCode::BAD_REQUEST,
            "no control connection registered for client identity",
        )
            .into_response();
    };

    // Subscribe before notifying readiness so the first dispatch cannot
    // race past the listener.
    let subscription = handle.subscribe(SubscriptionFilter {
        kinds: vec![
            MessageKind::SseEvent,
            MessageKind::SseClose,
            MessageKind::SseError,
        ],
        correlation_id: Some(params.request_id.clone()),
    });

    let ready = Message::new(MessageBody::SseConnectionReady(SseConnectionReadyPayload {
        request_id: params.request_id.clone(),
        url: params.url.clone(),
    }));
    if handle.send(ready).await.is_err() {
        return (StatusCode::BAD_REQUEST, "control connection closed").into_response();
    }
    tracing::debug!(
        request_id = %params.request_id,
        url = %params.url,
        "sse proxy stream ready"
    );

    let stream = futures_util::stream::unfold(
        Some(subscription),
        |subscription: Option<Subscription>| async move {
            let mut subscription = subscription?;
            loop {
                let message = subscription.recv().await?;
                match message.body {
                    MessageBody::SseEvent(payload) => {
                        let rendered = render_sse_event(&payload);
                        return Some((Ok(rendered.into_bytes()), Some(subscription)));
                    }
                    MessageBody::SseClose(_) => return None,
                    MessageBody::SseError(_) => {
                        return Some((
                            Err(io::Error::other("test client reported an SSE error")),
                            None,
                        ));
                    }
                    _ => continue,
                }
            }
        },
    );

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Renders one event in the SSE field grammar: optional `event`/`id`/
/// `retry` lines, `data` lines split on newlines, blank-line terminator.
pub fn render_sse_event(payload: &SseEventPayload) -> String {
    let mut out = String::new();
    if let Some(event) = &payload.event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(id) = &payload.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(retry) = payload.retry {
        out.push_str("retry: ");
        out.push_str(&retry.to_string());
        out.push('\n');
    }
    for line in payload.data.as_deref().unwrap_or("").split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}
