use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use balboa_protocol::{
    Message, MessageBody, SseClosePayload, SseErrorPayload, SseEventPayload,
};
use balboa_routes::{MockRequest, RouteMatcher};
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::errors::ClientError;
use crate::sender::MessageSender;

pub(crate) type SseHandler = Arc<dyn Fn(SseHandle) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to one ready SSE proxy stream; dispatches are correlated by the
/// stream's request id.
#[derive(Clone)]
pub struct SseHandle {
    request_id: String,
    url: String,
    sender: Arc<MessageSender>,
}

impl SseHandle {
    pub(crate) fn new(request_id: String, url: String, sender: Arc<MessageSender>) -> Self {
        Self {
            request_id,
            url,
            sender,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Original URL the EventSource was opened against.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Emits one event on the browser-visible stream.
    pub async fn dispatch(
        &self,
        event: Option<&str>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.sender
            .send_and_ack(Message::new(MessageBody::SseEvent(SseEventPayload {
                request_id: self.request_id.clone(),
                event: event.map(str::to_string),
                data: Some(data.into()),
                id: None,
                retry: None,
            })))
            .await
    }

    pub async fn dispatch_event(&self, payload: SseEventPayload) -> Result<(), ClientError> {
        let mut payload = payload;
        payload.request_id = self.request_id.clone();
        self.sender
            .send_and_ack(Message::new(MessageBody::SseEvent(payload)))
            .await
    }

    /// Ends the stream cleanly.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.sender
            .send_and_ack(Message::new(MessageBody::SseClose(SseClosePayload {
                request_id: self.request_id.clone(),
            })))
            .await
    }

    /// Ends the stream as a transport error.
    pub async fn error(&self) -> Result<(), ClientError> {
        self.sender
            .send_and_ack(Message::new(MessageBody::SseError(SseErrorPayload {
                request_id: self.request_id.clone(),
            })))
            .await
    }
}

struct SseRouteEntry {
    id: u64,
    matcher: RouteMatcher,
    handler: SseHandler,
    times: Option<u64>,
    calls: AtomicU64,
}

impl SseRouteEntry {
    fn exhausted(&self) -> bool {
        self.times
            .is_some_and(|times| self.calls.load(Ordering::SeqCst) >= times)
    }
}

/// Ordered sse-transport route entries; same registration-order and
/// call-count semantics as the HTTP table, dispatched on stream readiness
/// rather than on intercepted requests.
#[derive(Default)]
pub(crate) struct SseRouteTable {
    entries: Mutex<Vec<Arc<SseRouteEntry>>>,
    next_id: AtomicU64,
}

impl SseRouteTable {
    pub(crate) fn register(
        &self,
        matcher: RouteMatcher,
        handler: SseHandler,
        times: Option<u64>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().push(Arc::new(SseRouteEntry {
            id,
            matcher,
            handler,
            times,
            calls: AtomicU64::new(0),
        }));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// First matching entry in registration order, consuming one call.
    pub(crate) async fn match_url(&self, url: &str) -> Option<SseHandler> {
        let probe = MockRequest::get(url);
        let snapshot: Vec<Arc<SseRouteEntry>> = self.entries.lock().clone();
        for entry in snapshot {
            if entry.exhausted() || !entry.matcher.matches(&probe).await {
                continue;
            }
            let calls = entry.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if entry.times == Some(calls) {
                self.entries.lock().retain(|candidate| candidate.id != entry.id);
            }
            return Some(Arc::clone(&entry.handler));
        }
        None
    }
}
