// ABOUTME: Registry of outbound instructions awaiting a server ack.
// ABOUTME: Maps instruction id to a completion cell resolved by inbound acks.

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::ConnectorError;

/// Outcome delivered to the producer of an instruction.
pub(crate) type AckResult = Result<(), ConnectorError>;

/// A completion handle for one outbound instruction.
///
/// Instructions with an empty id never receive an ack, so their handle is
/// already resolved at creation.
#[derive(Debug)]
pub struct AckFuture(Inner);

#[derive(Debug)]
enum Inner {
    Ready(AckResult),
    Waiting(oneshot::Receiver<AckResult>),
}

impl AckFuture {
    pub(crate) fn ready(result: AckResult) -> Self {
        AckFuture(Inner::Ready(result))
    }

    fn waiting(rx: oneshot::Receiver<AckResult>) -> Self {
        AckFuture(Inner::Waiting(rx))
    }

    /// Wait for the instruction outcome.
    pub async fn wait(self) -> AckResult {
        match self.0 {
            Inner::Ready(result) => result,
            // A dropped sender means the registry went away with the channel.
            Inner::Waiting(rx) => rx.await.unwrap_or(Err(ConnectorError::Disconnected)),
        }
    }
}

/// Tracks outbound instructions until a terminal ack arrives.
///
/// An id is present iff a producer is awaiting its ack. A terminal ack
/// removes the entry exactly once; late or duplicate acks are discarded.
#[derive(Debug, Default)]
pub(crate) struct PendingInstructions {
    awaiting: DashMap<String, oneshot::Sender<AckResult>>,
}

impl PendingInstructions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instruction and return its completion handle.
    ///
    /// An empty id means fire-and-forget: the returned handle is already
    /// resolved and nothing is recorded.
    pub fn track(&self, instruction_id: &str) -> AckFuture {
        if instruction_id.is_empty() {
            return AckFuture::ready(Ok(()));
        }
        let (tx, rx) = oneshot::channel();
        self.awaiting.insert(instruction_id.to_string(), tx);
        AckFuture::waiting(rx)
    }

    /// Resolve the instruction with the given outcome.
    ///
    /// No-op when the id is unknown (duplicate or late ack).
    pub fn ack(&self, instruction_id: &str, outcome: AckResult) {
        if let Some((_, tx)) = self.awaiting.remove(instruction_id) {
            let _ = tx.send(outcome);
        }
    }

    /// Drain every pending instruction and fail it with `cause`.
    ///
    /// Safe under concurrent `track` and `ack`: entries added while draining
    /// are either failed here or resolved by a later ack.
    pub fn fail_all(&self, cause: &ConnectorError) {
        let ids: Vec<String> = self.awaiting.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.awaiting.remove(&id) {
                let _ = tx.send(Err(cause.clone()));
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.awaiting.len()
    }
}
