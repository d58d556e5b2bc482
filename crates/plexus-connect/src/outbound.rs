// ABOUTME: Outbound stream wrappers and the single-slot holder for the active send side.
// ABOUTME: At any instant exactly one stream sender per channel is authoritative.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ConnectorError;

/// Default buffer size for outbound frame channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// Sender half of a bidirectional stream.
///
/// Wraps an mpsc sender for outgoing frames. Cloneable; all clones feed the
/// same single-writer queue, which serializes concurrent producers.
#[derive(Debug)]
pub struct StreamSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> StreamSender<T> {
    /// Create a stream sender from an mpsc sender.
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self { inner: sender }
    }

    /// Send a frame on the stream.
    pub async fn send(&self, msg: T) -> Result<(), ConnectorError> {
        self.inner
            .send(msg)
            .await
            .map_err(|_| ConnectorError::StreamClosed)
    }

    /// Try to send a frame without waiting.
    pub fn try_send(&self, msg: T) -> Result<(), ConnectorError> {
        self.inner
            .try_send(msg)
            .map_err(|_| ConnectorError::StreamClosed)
    }

    /// Check if the stream is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether this sender feeds the same stream as `other`.
    pub fn same_stream(&self, other: &StreamSender<T>) -> bool {
        self.inner.same_channel(&other.inner)
    }
}

/// A sender plus the stream to hand to the gRPC client method.
pub(crate) struct OutboundStream<T> {
    /// Sender for pushing frames onto the stream.
    pub sender: StreamSender<T>,
    /// The stream to pass to the gRPC method.
    pub stream: ReceiverStream<T>,
}

impl<T> OutboundStream<T> {
    /// Create an outbound stream pair with the specified buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            sender: StreamSender::new(tx),
            stream: ReceiverStream::new(rx),
        }
    }
}

/// Single-cell reference to the currently authoritative send side.
///
/// Swapped on reconnect; the previous sender is dropped after the swap, which
/// ends its stream cleanly once buffered frames have drained.
#[derive(Debug)]
pub(crate) struct OutboundStreamHolder<T> {
    slot: Mutex<Option<StreamSender<T>>>,
}

impl<T> Default for OutboundStreamHolder<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> OutboundStreamHolder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<StreamSender<T>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current sender, if any.
    pub fn get(&self) -> Option<StreamSender<T>> {
        self.lock().clone()
    }

    /// Replace the current sender, returning the previous one.
    pub fn get_and_set(&self, new: Option<StreamSender<T>>) -> Option<StreamSender<T>> {
        std::mem::replace(&mut *self.lock(), new)
    }

    /// Clear the slot only if it still holds `expected`.
    ///
    /// Returns true when the swap happened. Used by a dying stream so it does
    /// not clobber a replacement that already took over.
    pub fn compare_and_clear(&self, expected: &StreamSender<T>) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(current) if current.same_stream(expected) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a sender is currently installed.
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }
}
