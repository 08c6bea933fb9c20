use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use balboa_protocol::{Message, MessageKind};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::pending::PendingTable;

/// Process-wide map from client identity to its live control connection.
/// Held by the control-plane server and shared with the interception engine
/// and the streaming proxy; an explicit object, never a global.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the connection for `client_id`. At most one live entry per
    /// identity; a newer connection replaces a stale one.
    pub fn insert(&self, client_id: &str, handle: ConnectionHandle) {
        if self.connections.insert(client_id.to_string(), handle).is_some() {
            tracing::warn!(client_id, "replaced existing control connection for identity");
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(client_id).map(|entry| entry.clone())
    }

    /// Removes the entry only if it still belongs to `connection_id`,
    /// so a replaced connection's teardown cannot evict its successor.
    pub fn remove(&self, client_id: &str, connection_id: u64) {
        self.connections
            .remove_if(client_id, |_, handle| handle.connection_id == connection_id);
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Sender half plus message fan-out for one control connection. Cloneable;
/// all clones feed the same per-connection writer task, which preserves
/// send order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: u64,
    outbound: mpsc::Sender<Message>,
    replies: Arc<PendingTable>,
    acks: Arc<PendingTable>,
    subscriptions: Arc<DashMap<u64, SubscriptionEntry>>,
    next_subscription_id: Arc<AtomicU64>,
    subscription_buffer: usize,
}

#[derive(Debug)]
struct SubscriptionEntry {
    kinds: Vec<MessageKind>,
    correlation_id: Option<String>,
    sender: mpsc::Sender<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub kinds: Vec<MessageKind>,
    pub correlation_id: Option<String>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<Message>, subscription_buffer: usize) -> Self {
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            replies: Arc::new(PendingTable::new()),
            acks: Arc::new(PendingTable::new()),
            subscriptions: Arc::new(DashMap::new()),
            next_subscription_id: Arc::new(AtomicU64::new(1)),
            subscription_buffer,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Waiters for correlated replies (`RESPONSE`,
    /// `WEBSOCKET_SHOULD_PROXY_RESPONSE`), keyed by request id.
    pub fn replies(&self) -> &PendingTable {
        &self.replies
    }

    /// Waiters for acknowledgements, keyed by the sent message's id.
    pub fn acks(&self) -> &PendingTable {
        &self.acks
    }

    pub async fn send(&self, message: Message) -> Result<(), ConnectionClosed> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ConnectionClosed)
    }

    /// Non-blocking send used for best-effort notifications (`ERROR`
    /// relays); a full channel or closed connection drops the message.
    pub fn send_best_effort(&self, message: Message) {
        if let Err(error) = self.outbound.try_send(message) {
            tracing::debug!(%error, "dropped best-effort control message");
        }
    }

    /// Streams every inbound message matching the filter. Dropping the
    /// returned subscription deregisters it.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.subscription_buffer);
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                kinds: filter.kinds,
                correlation_id: filter.correlation_id,
                sender,
            },
        );
        Subscription {
            id,
            receiver,
            entries: Arc::clone(&self.subscriptions),
        }
    }

    /// Routes one inbound, already-acknowledged message: one-shot reply
    /// waiters win, then matching subscriptions. Returns whether anything
    /// consumed it.
    pub fn dispatch(&self, message: Message) -> bool {
        if message.kind() == MessageKind::Ack {
            let acked_id = message.message_id.clone();
            return self.acks.complete(&acked_id, message);
        }

        if let Some(correlation_id) = message.correlation_id() {
            if self.replies.complete(correlation_id, message.clone()) {
                return true;
            }
        }

        let mut consumed = false;
        let mut closed = Vec::new();
        for entry in self.subscriptions.iter() {
            if !entry.kinds.contains(&message.kind()) {
                continue;
            }
            if let Some(wanted) = &entry.correlation_id {
                if message.correlation_id() != Some(wanted.as_str()) {
                    continue;
                }
            }
            match entry.sender.try_send(message.clone()) {
                Ok(()) => consumed = true,
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscription_id = *entry.key(),
                        "subscription buffer full; dropping control message"
                    );
                }
            }
        }
        for id in closed {
            self.subscriptions.remove(&id);
        }
        consumed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionClosed;

impl std::fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("control connection closed")
    }
}

impl std::error::Error for ConnectionClosed {}

pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Message>,
    entries: Arc<DashMap<u64, SubscriptionEntry>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.entries.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use balboa_protocol::{MessageBody, SseClosePayload, SseEventPayload};

    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(tx, 16), rx)
    }

    fn sse_event(request_id: &str, data: &str) -> Message {
        Message::new(MessageBody::SseEvent(SseEventPayload {
            request_id: request_id.to_string(),
            event: None,
            data: Some(data.to_string()),
            id: None,
            retry: None,
        }))
    }

    #[tokio::test]
    async fn replaced_connection_teardown_does_not_evict_successor() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = handle();
        let (new, _new_rx) = handle();
        let old_id = old.connection_id();

        registry.insert("client-1", old);
        registry.insert("client-1", new.clone());
        registry.remove("client-1", old_id);

        let survivor = registry.get("client-1").expect("successor must survive");
        assert_eq!(survivor.connection_id(), new.connection_id());

        registry.remove("client-1", new.connection_id());
        assert!(!registry.contains("client-1"));
    }

    #[tokio::test]
    async fn dispatch_prefers_reply_waiters_over_subscriptions() {
        let (handle, _rx) = handle();
        let mut subscription = handle.subscribe(SubscriptionFilter {
            kinds: vec![MessageKind::SseEvent],
            correlation_id: Some("req-1".to_string()),
        });
        let reply = handle.replies().register("req-1");

        assert!(handle.dispatch(sse_event("req-1", "hello")));
        let message = reply
            .wait(std::time::Duration::from_millis(100))
            .await
            .expect("reply waiter wins");
        assert_eq!(message.correlation_id(), Some("req-1"));

        // Waiter resolved; the next dispatch reaches the subscription.
        assert!(handle.dispatch(sse_event("req-1", "world")));
        let streamed = subscription.recv().await.expect("subscription delivery");
        assert_eq!(streamed.correlation_id(), Some("req-1"));
    }

    #[tokio::test]
    async fn subscriptions_filter_on_kind_and_correlation() {
        let (handle, _rx) = handle();
        let mut subscription = handle.subscribe(SubscriptionFilter {
            kinds: vec![MessageKind::SseEvent, MessageKind::SseClose],
            correlation_id: Some("req-2".to_string()),
        });

        assert!(!handle.dispatch(sse_event("req-other", "ignored")));
        assert!(handle.dispatch(Message::new(MessageBody::SseClose(SseClosePayload {
            request_id: "req-2".to_string(),
        }))));

        let delivered = subscription.recv().await.expect("filtered delivery");
        assert_eq!(delivered.kind(), MessageKind::SseClose);
    }

    #[tokio::test]
    async fn dropping_a_subscription_deregisters_it() {
        let (handle, _rx) = handle();
        let subscription = handle.subscribe(SubscriptionFilter {
            kinds: vec![MessageKind::SseEvent],
            correlation_id: None,
        });
        drop(subscription);
        assert!(!handle.dispatch(sse_event("req-3", "nobody home")));
    }
}
