// ABOUTME: Command channel: handler subscription and command dispatch over a managed stream.
// ABOUTME: Binds the instruction pump, pending registry, and reconnect supervision for commands.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use plexus_proto::client::CommandServiceClient;
use plexus_proto::{
    command_provider_inbound, command_provider_outbound, meta_data_value, Command,
    CommandProviderInbound, CommandProviderOutbound, CommandResponse, CommandSubscription,
    FlowControl, InstructionAck, MetaDataValue, ProcessingInstruction, ProcessingKey,
};
use tonic::transport::Channel;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConnectorError, ErrorCategory};
use crate::flow::FlowControlGovernor;
use crate::identity::ClientIdentity;
use crate::instruction::{spawn_instruction_stream, InstructionDispatch};
use crate::outbound::{OutboundStream, OutboundStreamHolder, StreamSender};
use crate::pending::{AckFuture, PendingInstructions};
use crate::reconnect::{ConnectionState, ReconnectSupervisor};
use crate::registration::Registration;
use crate::reply::{FrameSet, ReplyChannel};
use crate::transport::ConnectorSettings;

/// Handles commands routed to this client.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process one command and produce its response.
    ///
    /// An error is converted into a `COMMAND_EXECUTION_ERROR` response; it is
    /// never treated as a transport failure.
    async fn handle(&self, command: Command) -> anyhow::Result<CommandResponse>;
}

struct RegisteredCommandHandler {
    handler: Arc<dyn CommandHandler>,
    load_factor: u32,
}

/// The command connection between this client and the platform.
///
/// Must be constructed inside a Tokio runtime: reconnect supervision runs on
/// a background task from the moment of construction.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<CommandChannelInner>,
}

struct CommandChannelInner {
    identity: ClientIdentity,
    settings: ConnectorSettings,
    client: CommandServiceClient<Channel>,
    outbound: OutboundStreamHolder<CommandProviderOutbound>,
    handlers: DashMap<String, RegisteredCommandHandler>,
    pending: PendingInstructions,
    supervisor: Arc<ReconnectSupervisor>,
}

impl CommandChannel {
    /// Create a command channel over the given transport.
    pub fn new(identity: ClientIdentity, settings: ConnectorSettings, channel: Channel) -> Self {
        let client = CommandServiceClient::new(channel);
        let reconnect_interval = settings.reconnect_interval;
        let inner = Arc::new_cyclic(|weak: &Weak<CommandChannelInner>| {
            let weak = weak.clone();
            let supervisor = ReconnectSupervisor::spawn(reconnect_interval, move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.connect().await,
                        None => Ok(()),
                    }
                }
            });
            CommandChannelInner {
                identity,
                settings,
                client,
                outbound: OutboundStreamHolder::new(),
                handlers: DashMap::new(),
                pending: PendingInstructions::new(),
                supervisor,
            }
        });
        Self { inner }
    }

    /// Open the instruction stream. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        self.inner.connect().await
    }

    /// Force a reconnect: unsubscribe best-effort, drop the stream, and
    /// schedule an immediate re-open.
    pub async fn reconnect(&self) {
        let names: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            let _ = self.inner.send_unsubscribe(name).await;
        }
        drop(self.inner.outbound.get_and_set(None));
        self.inner.supervisor.schedule_immediate_reconnect();
    }

    /// Unsubscribe best-effort, clear the handler registry, and close the
    /// outbound side.
    pub async fn disconnect(&self) {
        let names: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            let _ = self.inner.send_unsubscribe(name).await;
        }
        self.inner.handlers.clear();
        self.inner.supervisor.set_state(ConnectionState::Disconnected);
        drop(self.inner.outbound.get_and_set(None));
        self.inner.pending.fail_all(&ConnectorError::Disconnected);
    }

    /// Unsubscribe every registered command and wait for the acks. Does not
    /// tear down the transport.
    pub async fn prepare_disconnect(&self) -> Result<(), ConnectorError> {
        let names: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        let mut acks = Vec::with_capacity(names.len());
        for name in &names {
            acks.push(self.inner.send_unsubscribe(name).await);
        }
        for ack in acks {
            ack.wait().await?;
        }
        Ok(())
    }

    /// Whether an outbound stream is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner.outbound.is_set()
    }

    /// The current lifecycle state of this channel.
    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Register `handler` for each of `command_names`.
    ///
    /// Re-registering a name replaces the previous handler locally; the
    /// subscribe/unsubscribe instructions are paired so the server's view
    /// converges. The returned registration completes when every per-name
    /// subscribe has been acknowledged, and its cancel unsubscribes only the
    /// names still bound to this handler instance.
    pub async fn register_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
        load_factor: u32,
        command_names: &[&str],
    ) -> Registration {
        let mut acks = Vec::with_capacity(command_names.len());
        for name in command_names {
            self.inner.handlers.insert(
                name.to_string(),
                RegisteredCommandHandler {
                    handler: Arc::clone(&handler),
                    load_factor,
                },
            );
            info!(command = %name, "registered handler for command");
            let instruction_id = Uuid::new_v4().to_string();
            let frame = self.inner.subscribe_frame(name, &instruction_id, load_factor);
            acks.push(self.inner.send_instruction(frame).await);
        }

        let weak = Arc::downgrade(&self.inner);
        let names: Vec<String> = command_names.iter().map(|s| s.to_string()).collect();
        Registration::new(
            acks,
            Box::new(move || {
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.unsubscribe(handler, names).await,
                        None => Ok(()),
                    }
                })
            }),
        )
    }

    /// Dispatch a command and wait for its single response.
    ///
    /// A missing message id is generated, client identity is stamped, and a
    /// routing key is synthesized from the message id when the caller did not
    /// provide one.
    pub async fn send_command(&self, command: Command) -> Result<CommandResponse, ConnectorError> {
        let command = prepare_command(&self.inner.identity, command);
        let mut client = self.inner.client.clone();
        match client.dispatch(command).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) if status.code() == tonic::Code::ResourceExhausted => {
                Err(ConnectorError::DispatchFailed {
                    message: "unable to buffer command for dispatching".to_string(),
                })
            }
            Err(status) => Err(ConnectorError::DispatchFailed {
                message: format!("error while dispatching command: {}", status.message()),
            }),
        }
    }
}

impl CommandChannelInner {
    async fn connect(self: &Arc<Self>) -> Result<(), ConnectorError> {
        if self.outbound.is_set() {
            // we're already connected on this channel
            return Ok(());
        }
        self.supervisor.set_state(ConnectionState::Connecting);
        match self.open_and_bind().await {
            Ok(()) => {
                self.supervisor.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                self.supervisor.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    async fn open_and_bind(self: &Arc<Self>) -> Result<(), ConnectorError> {
        let outbound = OutboundStream::new(self.settings.outbound_buffer);
        let mut client = self.client.clone();
        let inbound = client
            .open_stream(outbound.stream)
            .await
            .map_err(ConnectorError::from)?
            .into_inner();
        let sender = outbound.sender;

        // Replay the handler registry on the new stream, each subscription
        // with a fresh instruction id.
        let registered: Vec<(String, u32)> = self
            .handlers
            .iter()
            .map(|e| (e.key().clone(), e.value().load_factor))
            .collect();
        for (name, load_factor) in &registered {
            let frame = self.subscribe_frame(name, &Uuid::new_v4().to_string(), *load_factor);
            sender.send(frame).await?;
        }
        info!(
            handlers = registered.len(),
            "command channel connected, handlers resubscribed"
        );

        drop(self.outbound.get_and_set(Some(sender.clone())));

        let governor =
            FlowControlGovernor::new(self.settings.permits, self.settings.permits_batch);
        let initial_permits = governor.initial_permits();
        let dispatcher = Arc::new(CommandDispatcher {
            inner: Arc::downgrade(self),
            sender: sender.clone(),
        });
        spawn_instruction_stream::<CommandFrames, _>(
            self.identity.client_id().to_string(),
            inbound,
            sender.clone(),
            governor,
            dispatcher,
        );

        sender
            .send(CommandFrames::flow_control_frame(FlowControl {
                client_id: self.identity.client_id().to_string(),
                permits: initial_permits,
            }))
            .await?;
        Ok(())
    }

    /// Track the instruction and hand it to the active stream, if any.
    /// Without a stream the ack stays pending until reconnect fails it.
    async fn send_instruction(&self, frame: CommandProviderOutbound) -> AckFuture {
        let ack = self.pending.track(&frame.instruction_id);
        if let Some(sender) = self.outbound.get() {
            if let Err(error) = sender.send(frame).await {
                debug!(%error, "failed to send instruction, stream closing");
            }
        }
        ack
    }

    async fn send_unsubscribe(&self, command_name: &str) -> AckFuture {
        let instruction_id = Uuid::new_v4().to_string();
        let frame = self.unsubscribe_frame(command_name, &instruction_id);
        self.send_instruction(frame).await
    }

    async fn unsubscribe(
        &self,
        handler: Arc<dyn CommandHandler>,
        command_names: Vec<String>,
    ) -> Result<(), ConnectorError> {
        for name in command_names {
            let still_bound = self
                .handlers
                .get(&name)
                .map(|entry| Arc::ptr_eq(&entry.handler, &handler))
                .unwrap_or(false);
            if !still_bound {
                // a newer registration took over this name
                continue;
            }
            let ack = self.send_unsubscribe(&name).await;
            let result = ack.wait().await;
            self.handlers
                .remove_if(&name, |_, entry| Arc::ptr_eq(&entry.handler, &handler));
            info!(command = %name, "unregistered handler for command");
            result?;
        }
        Ok(())
    }

    fn subscription(&self, command_name: &str, instruction_id: &str, load_factor: u32) -> CommandSubscription {
        CommandSubscription {
            message_id: instruction_id.to_string(),
            command: command_name.to_string(),
            component_name: self.identity.component_name().to_string(),
            client_id: self.identity.client_id().to_string(),
            load_factor,
        }
    }

    fn subscribe_frame(
        &self,
        command_name: &str,
        instruction_id: &str,
        load_factor: u32,
    ) -> CommandProviderOutbound {
        CommandProviderOutbound {
            instruction_id: instruction_id.to_string(),
            request: Some(command_provider_outbound::Request::Subscribe(
                self.subscription(command_name, instruction_id, load_factor),
            )),
        }
    }

    fn unsubscribe_frame(&self, command_name: &str, instruction_id: &str) -> CommandProviderOutbound {
        CommandProviderOutbound {
            instruction_id: instruction_id.to_string(),
            request: Some(command_provider_outbound::Request::Unsubscribe(
                self.subscription(command_name, instruction_id, 0),
            )),
        }
    }

    async fn handle_incoming_command(
        &self,
        command: Command,
        reply: ReplyChannel<CommandFrames>,
    ) {
        let handler = self
            .handlers
            .get(&command.name)
            .map(|entry| Arc::clone(&entry.handler));
        let request_identifier = command.message_identifier.clone();

        match handler {
            Some(handler) => {
                reply.send_ack().await;
                // Handler work must not block frame intake.
                tokio::spawn(async move {
                    let response = match handler.handle(command).await {
                        Ok(response) => response,
                        Err(error) => CommandResponse {
                            error_code: ErrorCategory::CommandExecutionError
                                .error_code()
                                .to_string(),
                            error_message: Some(
                                ErrorCategory::CommandExecutionError
                                    .error_message(error.to_string(), String::new()),
                            ),
                            ..Default::default()
                        },
                    };
                    let response = CommandResponse {
                        request_identifier,
                        ..response
                    };
                    let frame = CommandProviderOutbound {
                        instruction_id: String::new(),
                        request: Some(command_provider_outbound::Request::CommandResponse(
                            response,
                        )),
                    };
                    if let Err(error) = reply.send(frame).await {
                        warn!(%error, "failed to send command response");
                    }
                    reply.complete().await;
                });
            }
            None => {
                warn!(command = %command.name, "no handler for incoming command");
                reply
                    .send_nack(ErrorCategory::NoHandlerForCommand, "No handler for command")
                    .await;
                let response = CommandResponse {
                    request_identifier,
                    error_code: ErrorCategory::NoHandlerForCommand.error_code().to_string(),
                    error_message: Some(ErrorCategory::NoHandlerForCommand.error_message(
                        "No handler for command",
                        self.identity.client_id().to_string(),
                    )),
                    ..Default::default()
                };
                let frame = CommandProviderOutbound {
                    instruction_id: String::new(),
                    request: Some(command_provider_outbound::Request::CommandResponse(response)),
                };
                if let Err(error) = reply.send(frame).await {
                    warn!(%error, "failed to send no-handler response");
                }
                reply.complete().await;
            }
        }
    }

    fn handle_ack(&self, ack: InstructionAck) {
        let outcome = if ack.success {
            Ok(())
        } else {
            Err(ConnectorError::from_ack_error(ack.error))
        };
        self.pending.ack(&ack.instruction_id, outcome);
    }
}

/// Stamp identity, assign a message id when missing, and synthesize a routing
/// key from the message id when the caller omitted one.
fn prepare_command(identity: &ClientIdentity, mut command: Command) -> Command {
    if command.message_identifier.is_empty() {
        command.message_identifier = Uuid::new_v4().to_string();
    }
    command.client_id = identity.client_id().to_string();
    command.component_name = identity.component_name().to_string();

    let has_routing_key = command
        .processing_instructions
        .iter()
        .any(|pi| pi.key == ProcessingKey::RoutingKey as i32);
    if !has_routing_key {
        command.processing_instructions.push(ProcessingInstruction {
            key: ProcessingKey::RoutingKey as i32,
            value: Some(MetaDataValue {
                data: Some(meta_data_value::Data::TextValue(
                    command.message_identifier.clone(),
                )),
            }),
        });
    }
    command
}

pub(crate) struct CommandFrames;

impl FrameSet for CommandFrames {
    type Inbound = CommandProviderInbound;
    type Outbound = CommandProviderOutbound;

    fn instruction_id(frame: &CommandProviderInbound) -> &str {
        &frame.instruction_id
    }

    fn ack_frame(ack: InstructionAck) -> CommandProviderOutbound {
        CommandProviderOutbound {
            instruction_id: String::new(),
            request: Some(command_provider_outbound::Request::Ack(ack)),
        }
    }

    fn flow_control_frame(flow_control: FlowControl) -> CommandProviderOutbound {
        CommandProviderOutbound {
            instruction_id: String::new(),
            request: Some(command_provider_outbound::Request::FlowControl(flow_control)),
        }
    }
}

struct CommandDispatcher {
    inner: Weak<CommandChannelInner>,
    sender: StreamSender<CommandProviderOutbound>,
}

#[async_trait]
impl InstructionDispatch<CommandFrames> for CommandDispatcher {
    async fn dispatch(
        &self,
        frame: CommandProviderInbound,
        reply: &ReplyChannel<CommandFrames>,
    ) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return true;
        };
        match frame.request {
            Some(command_provider_inbound::Request::Command(command)) => {
                inner.handle_incoming_command(command, reply.clone()).await;
                true
            }
            Some(command_provider_inbound::Request::Ack(ack)) => {
                inner.handle_ack(ack);
                true
            }
            None => false,
        }
    }

    async fn on_disconnect(&self, cause: ConnectorError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // Only the stream that is still authoritative may trigger recovery.
        if inner.outbound.compare_and_clear(&self.sender) {
            inner.pending.fail_all(&cause);
            inner.supervisor.schedule_reconnect();
        }
    }
}
