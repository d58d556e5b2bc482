// ABOUTME: The handle returned to user code for an active handler subscription.
// ABOUTME: Owns the subscription acks and the cancel action that unsubscribes.

use futures::future::BoxFuture;

use crate::error::ConnectorError;
use crate::pending::AckFuture;

type CancelFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ConnectorError>> + Send>;

/// Handle for an active handler registration.
///
/// Completion of the subscription is the conjunction of every per-name ack.
/// Cancelling sends the matching unsubscribe instructions; a second cancel is
/// a no-op.
pub struct Registration {
    acks: Vec<AckFuture>,
    cancel: Option<CancelFn>,
}

impl Registration {
    pub(crate) fn new(acks: Vec<AckFuture>, cancel: CancelFn) -> Self {
        Self {
            acks,
            cancel: Some(cancel),
        }
    }

    /// Wait until the server has acknowledged every subscribe instruction.
    pub async fn wait_ack(&mut self) -> Result<(), ConnectorError> {
        for ack in self.acks.drain(..) {
            ack.wait().await?;
        }
        Ok(())
    }

    /// Cancel the registration, unsubscribing from the server.
    ///
    /// Idempotent: only the first call produces wire traffic.
    pub async fn cancel(&mut self) -> Result<(), ConnectorError> {
        match self.cancel.take() {
            Some(cancel) => cancel().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("pending_acks", &self.acks.len())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}
