// ABOUTME: Reply channel used by incoming-frame dispatch to emit outbound frames.
// ABOUTME: Defines the per-channel frame constructors shared by the instruction pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plexus_proto::{FlowControl, InstructionAck};
use tracing::warn;

use crate::error::{ConnectorError, ErrorCategory};
use crate::outbound::StreamSender;

/// The frame constructors a channel contributes to the shared instruction
/// pump. Implemented once per logical channel (command, query).
pub(crate) trait FrameSet: Send + Sync + 'static {
    type Inbound: Send + 'static;
    type Outbound: Send + 'static;

    /// Extract the optional instruction id from an inbound frame.
    fn instruction_id(frame: &Self::Inbound) -> &str;

    /// Wrap an ack into an outbound frame.
    fn ack_frame(ack: InstructionAck) -> Self::Outbound;

    /// Wrap a flow-control grant into an outbound frame.
    fn flow_control_frame(flow_control: FlowControl) -> Self::Outbound;
}

/// Callback surface handed to frame dispatch routines.
///
/// Wraps the authoritative outbound sender with helpers for the instruction
/// currently being dispatched. Acks and nacks are sent at most once per
/// instruction; frames with an empty instruction id expect no ack at all.
pub(crate) struct ReplyChannel<F: FrameSet> {
    sender: StreamSender<F::Outbound>,
    instruction_id: String,
    client_id: String,
    ack_sent: Arc<AtomicBool>,
}

impl<F: FrameSet> Clone for ReplyChannel<F> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            instruction_id: self.instruction_id.clone(),
            client_id: self.client_id.clone(),
            ack_sent: Arc::clone(&self.ack_sent),
        }
    }
}

impl<F: FrameSet> ReplyChannel<F> {
    pub fn new(
        sender: StreamSender<F::Outbound>,
        instruction_id: String,
        client_id: String,
    ) -> Self {
        Self {
            sender,
            instruction_id,
            client_id,
            ack_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send an arbitrary outbound frame.
    pub async fn send(&self, frame: F::Outbound) -> Result<(), ConnectorError> {
        self.sender.send(frame).await
    }

    /// Acknowledge the instruction. No-op when no ack is expected or one was
    /// already sent.
    pub async fn send_ack(&self) {
        if self.instruction_id.is_empty() || self.ack_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let ack = InstructionAck {
            instruction_id: self.instruction_id.clone(),
            success: true,
            error: None,
        };
        if self.sender.send(F::ack_frame(ack)).await.is_err() {
            warn!(instruction_id = %self.instruction_id, "failed to send ack, stream closed");
        }
    }

    /// Reject the instruction with a structured error.
    pub async fn send_nack(&self, category: ErrorCategory, message: &str) {
        if self.instruction_id.is_empty() || self.ack_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        let ack = InstructionAck {
            instruction_id: self.instruction_id.clone(),
            success: false,
            error: Some(category.error_message(message, self.client_id.clone())),
        };
        if self.sender.send(F::ack_frame(ack)).await.is_err() {
            warn!(instruction_id = %self.instruction_id, "failed to send nack, stream closed");
        }
    }

    /// Mark the instruction as fully handled, acknowledging it if no ack or
    /// nack has gone out yet.
    pub async fn complete(&self) {
        self.send_ack().await;
    }

    /// Mark the instruction as failed, rejecting it if no ack or nack has
    /// gone out yet.
    pub async fn complete_with_error(&self, category: ErrorCategory, message: &str) {
        self.send_nack(category, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Minimal frame set used to exercise the reply channel in isolation.
    struct TestFrames;

    #[derive(Debug, PartialEq)]
    enum TestOutbound {
        Ack(InstructionAck),
        Flow(FlowControl),
    }

    impl FrameSet for TestFrames {
        type Inbound = String;
        type Outbound = TestOutbound;

        fn instruction_id(frame: &String) -> &str {
            frame
        }

        fn ack_frame(ack: InstructionAck) -> TestOutbound {
            TestOutbound::Ack(ack)
        }

        fn flow_control_frame(flow_control: FlowControl) -> TestOutbound {
            TestOutbound::Flow(flow_control)
        }
    }

    fn reply_channel(
        instruction_id: &str,
    ) -> (ReplyChannel<TestFrames>, mpsc::Receiver<TestOutbound>) {
        let (tx, rx) = mpsc::channel(8);
        let reply = ReplyChannel::new(
            StreamSender::new(tx),
            instruction_id.to_string(),
            "client-1".to_string(),
        );
        (reply, rx)
    }

    #[tokio::test]
    async fn test_ack_sent_at_most_once() {
        let (reply, mut rx) = reply_channel("i-1");
        reply.send_ack().await;
        reply.send_ack().await;
        reply.complete().await;

        let frame = rx.recv().await.unwrap();
        match frame {
            TestOutbound::Ack(ack) => {
                assert_eq!(ack.instruction_id, "i-1");
                assert!(ack.success);
            }
            other => panic!("expected ack, got {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "only one ack may be sent");
    }

    #[tokio::test]
    async fn test_nack_carries_category_and_location() {
        let (reply, mut rx) = reply_channel("i-2");
        reply
            .send_nack(ErrorCategory::UnsupportedInstruction, "unknown frame")
            .await;

        match rx.recv().await.unwrap() {
            TestOutbound::Ack(ack) => {
                assert!(!ack.success);
                let error = ack.error.unwrap();
                assert_eq!(error.error_code, "UNSUPPORTED_INSTRUCTION");
                assert_eq!(error.message, "unknown frame");
                assert_eq!(error.location, "client-1");
            }
            other => panic!("expected nack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_after_nack_is_noop() {
        let (reply, mut rx) = reply_channel("i-3");
        reply
            .send_nack(ErrorCategory::NoHandlerForCommand, "no handler")
            .await;
        reply.complete().await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TestOutbound::Ack(ref a) if !a.success));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_instruction_id_sends_nothing() {
        let (reply, mut rx) = reply_channel("");
        reply.send_ack().await;
        reply
            .send_nack(ErrorCategory::UnsupportedInstruction, "x")
            .await;
        reply.complete().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_the_ack_guard() {
        let (reply, mut rx) = reply_channel("i-4");
        let clone = reply.clone();
        reply.send_ack().await;
        clone.send_ack().await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
