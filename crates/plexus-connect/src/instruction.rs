// ABOUTME: The incoming instruction stream pump shared by all channels.
// ABOUTME: Dispatches frames serially, meters permits, and reports the disconnect cause once.

use std::sync::Arc;

use async_trait::async_trait;
use plexus_proto::FlowControl;
use tokio::task::JoinHandle;
use tonic::Streaming;
use tracing::{debug, warn};

use crate::error::{ConnectorError, ErrorCategory};
use crate::flow::FlowControlGovernor;
use crate::outbound::StreamSender;
use crate::reply::{FrameSet, ReplyChannel};

/// Frame-kind dispatch implemented by each channel.
#[async_trait]
pub(crate) trait InstructionDispatch<F: FrameSet>: Send + Sync + 'static {
    /// Dispatch one inbound frame.
    ///
    /// Returns false when the frame kind is unknown, in which case the pump
    /// nacks the instruction and carries on. Handler futures spawned here must
    /// not block the dispatch call itself: the permit for a frame is released
    /// when dispatch returns, not when handler work finishes.
    async fn dispatch(&self, frame: F::Inbound, reply: &ReplyChannel<F>) -> bool;

    /// Invoked exactly once when the stream terminates.
    async fn on_disconnect(&self, cause: ConnectorError);
}

/// Run the receive loop of a bidirectional instruction stream.
///
/// Frames are processed in receive order, one at a time. After each dispatch
/// one permit is consumed; when a batch has been exhausted a flow-control
/// grant is queued on the outbound side.
pub(crate) fn spawn_instruction_stream<F, D>(
    client_id: String,
    mut inbound: Streaming<F::Inbound>,
    sender: StreamSender<F::Outbound>,
    governor: FlowControlGovernor,
    dispatcher: Arc<D>,
) -> JoinHandle<()>
where
    F: FrameSet,
    D: InstructionDispatch<F>,
{
    tokio::spawn(async move {
        let cause = loop {
            match inbound.message().await {
                Ok(Some(frame)) => {
                    let instruction_id = F::instruction_id(&frame).to_string();
                    let reply = ReplyChannel::<F>::new(
                        sender.clone(),
                        instruction_id.clone(),
                        client_id.clone(),
                    );
                    if !dispatcher.dispatch(frame, &reply).await {
                        warn!(
                            instruction_id = %instruction_id,
                            "unsupported instruction received"
                        );
                        reply
                            .send_nack(
                                ErrorCategory::UnsupportedInstruction,
                                "Unsupported instruction",
                            )
                            .await;
                    }
                    if let Some(refill) = governor.consume_one() {
                        let grant = FlowControl {
                            client_id: client_id.clone(),
                            permits: refill,
                        };
                        if sender.send(F::flow_control_frame(grant)).await.is_err() {
                            break ConnectorError::StreamClosed;
                        }
                    }
                }
                Ok(None) => break ConnectorError::StreamClosed,
                Err(status) => break ConnectorError::StreamError(status.to_string()),
            }
        };
        debug!(cause = %cause, "instruction stream terminated");
        dispatcher.on_disconnect(cause).await;
    })
}
