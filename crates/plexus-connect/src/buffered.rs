// ABOUTME: Bounded, back-pressured consumer stream fed from an open server stream.
// ABOUTME: Delivers errors at consumption time and credits the producer per consumed batch.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::flow::FlowControlGovernor;

/// Called with the refill delta each time a consumed batch warrants a new
/// grant upstream. A stream without flow control simply has no hook.
pub(crate) type RefillFn = Box<dyn Fn(u64) + Send + Sync>;

enum StreamItem<T> {
    Value(T),
    Terminal,
    Failed(ConnectorError),
}

/// Producer side of a [`ResultStream`]. Held by the task forwarding frames
/// off the transport.
pub(crate) struct ResultStreamSink<T> {
    tx: mpsc::Sender<StreamItem<T>>,
}

impl<T> ResultStreamSink<T> {
    /// Queue an element for the consumer. Blocks while the buffer is full;
    /// fails when the consumer side has been closed.
    pub async fn push(&self, value: T) -> Result<(), ConnectorError> {
        self.tx
            .send(StreamItem::Value(value))
            .await
            .map_err(|_| ConnectorError::StreamClosed)
    }

    /// Mark normal completion.
    pub async fn complete(&self) {
        let _ = self.tx.send(StreamItem::Terminal).await;
    }

    /// Record an error, raised on the consumer's next read.
    pub async fn fail(&self, error: ConnectorError) {
        let _ = self.tx.send(StreamItem::Failed(error)).await;
    }
}

/// A bounded, back-pressured stream of results from the server.
///
/// Normal completion yields `None`; errors are raised on the read that
/// reaches them. Each delivered element consumes one unit of credit, and a
/// full batch of consumed credit triggers the refill hook.
pub struct ResultStream<T> {
    rx: Option<mpsc::Receiver<StreamItem<T>>>,
    governor: FlowControlGovernor,
    refill: Option<RefillFn>,
    done: bool,
}

impl<T> ResultStream<T> {
    /// Create a sink/stream pair with `buffer_size` initial credit and a
    /// refill every `fetch_size` consumed elements.
    pub(crate) fn channel(
        buffer_size: usize,
        fetch_size: u64,
        refill: Option<RefillFn>,
    ) -> (ResultStreamSink<T>, ResultStream<T>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let stream = ResultStream {
            rx: Some(rx),
            governor: FlowControlGovernor::new(buffer_size as u64, fetch_size),
            refill,
            done: false,
        };
        (ResultStreamSink { tx }, stream)
    }

    /// Receive the next element.
    ///
    /// Returns `Ok(None)` on normal completion and keeps returning it
    /// afterwards. An error is returned once, then the stream is finished.
    pub async fn next(&mut self) -> Result<Option<T>, ConnectorError> {
        if self.done {
            return Ok(None);
        }
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(StreamItem::Value(value)) => {
                self.credit_one();
                Ok(Some(value))
            }
            Some(StreamItem::Terminal) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamItem::Failed(error)) => {
                self.done = true;
                Err(error)
            }
            // Producer dropped without a terminal marker.
            None => {
                self.done = true;
                Err(ConnectorError::StreamClosed)
            }
        }
    }

    /// Detach the consumer side without cancelling the underlying RPC.
    pub fn close(&mut self) {
        self.rx = None;
        self.done = true;
    }

    fn credit_one(&self) {
        if let Some(delta) = self.governor.consume_one() {
            if let Some(refill) = &self.refill {
                refill(delta);
            }
        }
    }
}

impl<T> futures::Stream for ResultStream<T> {
    type Item = Result<T, ConnectorError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamItem::Value(value))) => {
                this.credit_one();
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(Some(StreamItem::Terminal)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Failed(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(ConnectorError::StreamClosed)))
            }
        }
    }
}

impl<T> std::fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("open", &self.rx.is_some())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_values_then_terminal() {
        let (sink, mut stream) = ResultStream::<u32>::channel(8, 0, None);
        sink.push(1).await.unwrap();
        sink.push(2).await.unwrap();
        sink.complete().await;

        assert_eq!(stream.next().await.unwrap(), Some(1));
        assert_eq!(stream.next().await.unwrap(), Some(2));
        assert_eq!(stream.next().await.unwrap(), None);
        // Completion is sticky.
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_raised_at_consumption() {
        let (sink, mut stream) = ResultStream::<u32>::channel(8, 0, None);
        sink.push(1).await.unwrap();
        sink.fail(ConnectorError::StreamError("boom".to_string()))
            .await;

        // Buffered value is delivered first, the error on the read after it.
        assert_eq!(stream.next().await.unwrap(), Some(1));
        assert!(matches!(
            stream.next().await,
            Err(ConnectorError::StreamError(_))
        ));
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_producer_surfaces_as_closed() {
        let (sink, mut stream) = ResultStream::<u32>::channel(8, 0, None);
        drop(sink);
        assert!(matches!(
            stream.next().await,
            Err(ConnectorError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_refill_fires_per_consumed_batch() {
        let refills = Arc::new(AtomicU64::new(0));
        let refills_clone = Arc::clone(&refills);
        let (sink, mut stream) = ResultStream::<u32>::channel(
            8,
            3,
            Some(Box::new(move |delta| {
                refills_clone.fetch_add(delta, Ordering::SeqCst);
            })),
        );

        for i in 0..6 {
            sink.push(i).await.unwrap();
        }
        for _ in 0..2 {
            stream.next().await.unwrap();
        }
        assert_eq!(refills.load(Ordering::SeqCst), 0, "batch not yet exhausted");

        stream.next().await.unwrap();
        assert_eq!(refills.load(Ordering::SeqCst), 3, "one batch consumed");

        for _ in 0..3 {
            stream.next().await.unwrap();
        }
        assert_eq!(refills.load(Ordering::SeqCst), 6, "two batches consumed");
    }

    #[tokio::test]
    async fn test_close_detaches_consumer() {
        let (sink, mut stream) = ResultStream::<u32>::channel(2, 0, None);
        sink.push(1).await.unwrap();
        stream.close();
        assert_eq!(stream.next().await.unwrap(), None);

        // The producer observes the closed buffer on a later push.
        sink.push(2).await.unwrap_or(());
        assert!(sink.push(3).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_trait_yields_results() {
        use futures::StreamExt;

        let (sink, stream) = ResultStream::<u32>::channel(8, 0, None);
        sink.push(7).await.unwrap();
        sink.complete().await;

        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected.len(), 1);
        assert_eq!(*collected[0].as_ref().unwrap(), 7);
    }
}
