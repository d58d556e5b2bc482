// ABOUTME: Reconnect supervision for a logical channel.
// ABOUTME: Tracks connection state and schedules backed-off reconnect attempts.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ConnectorError;

/// Lifecycle state of a logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The outbound send side is established.
    Connected,
    /// A connection was lost; a new attempt is scheduled.
    Reconnecting,
}

/// Schedules reconnect attempts for one channel.
///
/// Attempts run on a dedicated task, never on the inbound dispatch path. An
/// explicit disconnect cancels scheduled attempts. The supervisor holds only
/// a weak reference back to its channel, so dropping the channel stops the
/// loop.
pub(crate) struct ReconnectSupervisor {
    state: Mutex<ConnectionState>,
    wake: mpsc::UnboundedSender<bool>,
}

impl ReconnectSupervisor {
    /// Spawn the supervisor loop. `connect` is invoked for every scheduled
    /// attempt; a failed attempt is retried after the backoff interval.
    pub fn spawn<C, Fut>(interval: Duration, connect: C) -> Arc<Self>
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectorError>> + Send + 'static,
    {
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<bool>();
        let supervisor = Arc::new(Self {
            state: Mutex::new(ConnectionState::Disconnected),
            wake: wake_tx,
        });

        let weak = Arc::downgrade(&supervisor);
        tokio::spawn(async move {
            while let Some(immediate) = wake_rx.recv().await {
                if !immediate {
                    tokio::time::sleep(interval).await;
                }
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                // An explicit disconnect in the meantime cancels the attempt.
                if supervisor.state() == ConnectionState::Disconnected {
                    continue;
                }
                if let Err(error) = connect().await {
                    warn!(%error, "reconnect attempt failed, scheduling retry");
                    supervisor.set_state(ConnectionState::Reconnecting);
                    let _ = supervisor.wake.send(false);
                } else {
                    debug!("reconnect attempt succeeded");
                }
            }
        });

        supervisor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Schedule a reconnect attempt after the backoff interval.
    pub fn schedule_reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
        let _ = self.wake.send(false);
    }

    /// Schedule a reconnect attempt without waiting for the backoff.
    pub fn schedule_immediate_reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
        let _ = self.wake.send(true);
    }
}
