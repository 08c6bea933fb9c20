use std::time::Duration;

use balboa_core::{PendingError, PendingTable};
use balboa_protocol::Message;
use tokio::sync::mpsc;

use crate::errors::ClientError;

/// Outbound half of the control connection: a clone-cheap sender feeding the
/// single writer task, plus the ack-wait table keyed by message id.
#[derive(Debug)]
pub(crate) struct MessageSender {
    outbound: mpsc::Sender<Message>,
    acks: PendingTable,
    ack_timeout: Duration,
}

impl MessageSender {
    pub(crate) fn new(outbound: mpsc::Sender<Message>, ack_timeout: Duration) -> Self {
        Self {
            outbound,
            acks: PendingTable::new(),
            ack_timeout,
        }
    }

    pub(crate) fn acks(&self) -> &PendingTable {
        &self.acks
    }

    pub(crate) async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Sends and waits for the receiver's acknowledgement of this message's
    /// id, the liveness signal independent of semantic processing.
    pub(crate) async fn send_and_ack(&self, message: Message) -> Result<(), ClientError> {
        let wait = self.acks.register(message.message_id.as_str());
        self.send(message).await?;
        match wait.wait(self.ack_timeout).await {
            Ok(_) => Ok(()),
            Err(PendingError::TimedOut) => Err(ClientError::AckTimeout),
            Err(PendingError::ConnectionClosed) => Err(ClientError::ConnectionClosed),
        }
    }
}
