use std::sync::Arc;
use std::time::Duration;

use balboa_protocol::Message;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::errors::PendingError;

/// One-shot correlation table: send a request, await the uniquely-tagged
/// reply, deregister on first match or timeout. Shared by HTTP interception,
/// the WebSocket should-proxy round trip, SSE readiness, and ack waits.
#[derive(Debug, Default)]
pub struct PendingTable {
    slots: Arc<DashMap<String, oneshot::Sender<Message>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter before the correlated request is sent, so a fast
    /// reply cannot race past the listener.
    pub fn register(&self, key: &str) -> PendingReply {
        let key = key.to_string();
        let (sender, receiver) = oneshot::channel();
        self.slots.insert(key.clone(), sender);
        PendingReply {
            key,
            receiver,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Resolves the waiter registered under `key`, if any. Returns whether a
    /// waiter consumed the message.
    pub fn complete(&self, key: &str, message: Message) -> bool {
        match self.slots.remove(key) {
            Some((_, sender)) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct PendingReply {
    key: String,
    receiver: oneshot::Receiver<Message>,
    slots: Arc<DashMap<String, oneshot::Sender<Message>>>,
}

impl PendingReply {
    /// Waits for the correlated reply. Both failure paths deregister the
    /// slot so stale waiters never accumulate.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message, PendingError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(PendingError::ConnectionClosed),
            Err(_) => Err(PendingError::TimedOut),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use balboa_protocol::{Message, MessageBody, SseConnectionReadyPayload};

    use super::*;

    fn ready_message(request_id: &str) -> Message {
        Message::new(MessageBody::SseConnectionReady(SseConnectionReadyPayload {
            request_id: request_id.to_string(),
            url: "http://app.test/events".to_string(),
        }))
    }

    #[tokio::test]
    async fn reply_resolves_the_registered_waiter() {
        let table = PendingTable::new();
        let reply = table.register("req-1");
        assert!(table.complete("req-1", ready_message("req-1")));

        let message = reply
            .wait(Duration::from_millis(100))
            .await
            .expect("reply must resolve");
        assert_eq!(message.correlation_id(), Some("req-1"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timeout_deregisters_the_slot() {
        let table = PendingTable::new();
        let reply = table.register("req-2");
        let outcome = reply.wait(Duration::from_millis(10)).await;
        assert_eq!(outcome.unwrap_err(), PendingError::TimedOut);
        assert!(table.is_empty());
        assert!(!table.complete("req-2", ready_message("req-2")));
    }

    #[tokio::test]
    async fn completing_an_unknown_key_is_a_no_op() {
        let table = PendingTable::new();
        assert!(!table.complete("missing", ready_message("missing")));
    }

    #[tokio::test]
    async fn dropped_waiters_leave_no_stale_slots() {
        let table = PendingTable::new();
        let reply = table.register("req-3");
        drop(reply);
        assert!(table.is_empty());
    }
}
