// ABOUTME: In-process platform server used by the channel integration tests.
// ABOUTME: Captures provider-outbound frames and lets tests inject server-initiated frames.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use plexus_proto::server::{
    CommandService, CommandServiceServer, QueryService, QueryServiceServer,
};
use plexus_proto::{
    command_provider_inbound, command_provider_outbound, Command, CommandProviderInbound,
    CommandProviderOutbound, CommandResponse, InstructionAck, QueryProviderInbound,
    QueryProviderOutbound, QueryRequest, QueryResponse, SubscriptionQueryRequest,
    SubscriptionQueryResponse,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// Sender with which a test pushes server-initiated frames (or errors) onto a
/// client's command stream.
pub type CommandInbound = mpsc::Sender<Result<CommandProviderInbound, Status>>;
/// Same, for the query stream.
pub type QueryInbound = mpsc::Sender<Result<QueryProviderInbound, Status>>;
/// Same, for a subscription-query session.
pub type SubscriptionInbound = mpsc::Sender<Result<SubscriptionQueryResponse, Status>>;

// ---------------------------------------------------------------------------
// Command platform
// ---------------------------------------------------------------------------

struct CommandState {
    captured: mpsc::UnboundedSender<CommandProviderOutbound>,
    connections: mpsc::UnboundedSender<CommandInbound>,
    dispatched: mpsc::UnboundedSender<Command>,
    current: Mutex<Option<CommandInbound>>,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResponse>>>,
    auto_ack: bool,
}

#[derive(Clone)]
struct TestCommandService {
    state: Arc<CommandState>,
}

#[tonic::async_trait]
impl CommandService for TestCommandService {
    type OpenStreamStream = ReceiverStream<Result<CommandProviderInbound, Status>>;

    async fn open_stream(
        &self,
        request: Request<Streaming<CommandProviderOutbound>>,
    ) -> Result<Response<Self::OpenStreamStream>, Status> {
        let mut client_frames = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        *self.state.current.lock().await = Some(tx.clone());
        let _ = self.state.connections.send(tx.clone());

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Ok(Some(frame)) = client_frames.message().await {
                if state.auto_ack && !frame.instruction_id.is_empty() {
                    let wants_ack = matches!(
                        frame.request,
                        Some(command_provider_outbound::Request::Subscribe(_))
                            | Some(command_provider_outbound::Request::Unsubscribe(_))
                    );
                    if wants_ack {
                        let ack = CommandProviderInbound {
                            instruction_id: String::new(),
                            request: Some(command_provider_inbound::Request::Ack(InstructionAck {
                                instruction_id: frame.instruction_id.clone(),
                                success: true,
                                error: None,
                            })),
                        };
                        let _ = tx.send(Ok(ack)).await;
                    }
                }
                if let Some(command_provider_outbound::Request::CommandResponse(ref response)) =
                    frame.request
                {
                    if let Some(waiter) = state
                        .pending
                        .lock()
                        .await
                        .remove(&response.request_identifier)
                    {
                        let _ = waiter.send(response.clone());
                    }
                }
                let _ = state.captured.send(frame);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn dispatch(&self, request: Request<Command>) -> Result<Response<CommandResponse>, Status> {
        let command = request.into_inner();
        let _ = self.state.dispatched.send(command.clone());
        let message_id = command.message_identifier.clone();

        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().await.insert(message_id.clone(), tx);

        let Some(stream) = self.state.current.lock().await.clone() else {
            return Err(Status::unavailable("no connected handler"));
        };
        let frame = CommandProviderInbound {
            instruction_id: Uuid::new_v4().to_string(),
            request: Some(command_provider_inbound::Request::Command(command)),
        };
        stream
            .send(Ok(frame))
            .await
            .map_err(|_| Status::unavailable("handler stream closed"))?;

        match timeout(WAIT, rx).await {
            Ok(Ok(response)) => Ok(Response::new(response)),
            _ => {
                self.state.pending.lock().await.remove(&message_id);
                Err(Status::deadline_exceeded("no response from handler"))
            }
        }
    }
}

pub struct CommandHarness {
    pub channel: Channel,
    frames: mpsc::UnboundedReceiver<CommandProviderOutbound>,
    connections: mpsc::UnboundedReceiver<CommandInbound>,
    dispatched: mpsc::UnboundedReceiver<Command>,
}

impl CommandHarness {
    /// Next captured provider-outbound frame, failing the test after a grace
    /// period.
    pub async fn next_frame(&mut self) -> CommandProviderOutbound {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("platform closed")
    }

    /// Next frame matching the predicate; intermediate frames are discarded.
    pub async fn next_frame_matching(
        &mut self,
        mut predicate: impl FnMut(&CommandProviderOutbound) -> bool,
    ) -> CommandProviderOutbound {
        loop {
            let frame = self.next_frame().await;
            if predicate(&frame) {
                return frame;
            }
        }
    }

    /// Every frame that arrives within `window`.
    pub async fn drain_frames(&mut self, window: Duration) -> Vec<CommandProviderOutbound> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = timeout(window, self.frames.recv()).await {
            frames.push(frame);
        }
        frames
    }

    /// The server end of the next accepted stream.
    pub async fn next_connection(&mut self) -> CommandInbound {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("platform closed")
    }

    pub fn try_next_connection(&mut self) -> Option<CommandInbound> {
        self.connections.try_recv().ok()
    }

    /// The next command that arrived through the unary dispatch RPC.
    pub async fn next_dispatched(&mut self) -> Command {
        timeout(WAIT, self.dispatched.recv())
            .await
            .expect("timed out waiting for a dispatched command")
            .expect("platform closed")
    }
}

pub async fn start_command_platform(auto_ack: bool) -> CommandHarness {
    let (captured_tx, captured_rx) = mpsc::unbounded_channel();
    let (connections_tx, connections_rx) = mpsc::unbounded_channel();
    let (dispatched_tx, dispatched_rx) = mpsc::unbounded_channel();
    let service = TestCommandService {
        state: Arc::new(CommandState {
            captured: captured_tx,
            connections: connections_tx,
            dispatched: dispatched_tx,
            current: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            auto_ack,
        }),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(CommandServiceServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let channel = plexus_connect::create_channel(&plexus_connect::ChannelConfig::new(format!(
        "http://{}",
        addr
    )))
    .await
    .unwrap();

    CommandHarness {
        channel,
        frames: captured_rx,
        connections: connections_rx,
        dispatched: dispatched_rx,
    }
}

// ---------------------------------------------------------------------------
// Query platform
// ---------------------------------------------------------------------------

struct QueryState {
    captured: mpsc::UnboundedSender<QueryProviderOutbound>,
    connections: mpsc::UnboundedSender<QueryInbound>,
    subscription_requests: mpsc::UnboundedSender<SubscriptionQueryRequest>,
    subscription_sessions: mpsc::UnboundedSender<SubscriptionInbound>,
    auto_ack: bool,
}

#[derive(Clone)]
struct TestQueryService {
    state: Arc<QueryState>,
}

#[tonic::async_trait]
impl QueryService for TestQueryService {
    type OpenStreamStream = ReceiverStream<Result<QueryProviderInbound, Status>>;
    type QueryStream = ReceiverStream<Result<QueryResponse, Status>>;
    type SubscriptionStream = ReceiverStream<Result<SubscriptionQueryResponse, Status>>;

    async fn open_stream(
        &self,
        request: Request<Streaming<QueryProviderOutbound>>,
    ) -> Result<Response<Self::OpenStreamStream>, Status> {
        let mut client_frames = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let _ = self.state.connections.send(tx.clone());

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Ok(Some(frame)) = client_frames.message().await {
                if state.auto_ack && !frame.instruction_id.is_empty() {
                    use plexus_proto::query_provider_outbound::Request as Out;
                    let wants_ack =
                        matches!(frame.request, Some(Out::Subscribe(_)) | Some(Out::Unsubscribe(_)));
                    if wants_ack {
                        let ack = QueryProviderInbound {
                            instruction_id: String::new(),
                            request: Some(plexus_proto::query_provider_inbound::Request::Ack(
                                InstructionAck {
                                    instruction_id: frame.instruction_id.clone(),
                                    success: true,
                                    error: None,
                                },
                            )),
                        };
                        let _ = tx.send(Ok(ack)).await;
                    }
                }
                let _ = state.captured.send(frame);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    /// Streams scripted responses based on the query name: "stream3" yields
    /// three responses and completes, "boom" fails the call outright.
    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<Self::QueryStream>, Status> {
        let query = request.into_inner();
        match query.query.as_str() {
            "stream3" => {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    for i in 0..3 {
                        let response = QueryResponse {
                            message_identifier: format!("r{}", i),
                            request_identifier: query.message_identifier.clone(),
                            ..Default::default()
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(Response::new(ReceiverStream::new(rx)))
            }
            "boom" => Err(Status::internal("scripted failure")),
            other => Err(Status::not_found(format!("no script for query '{}'", other))),
        }
    }

    async fn subscription(
        &self,
        request: Request<Streaming<SubscriptionQueryRequest>>,
    ) -> Result<Response<Self::SubscriptionStream>, Status> {
        let mut requests = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let _ = self.state.subscription_sessions.send(tx);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Ok(Some(request)) = requests.message().await {
                let _ = state.subscription_requests.send(request);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct QueryHarness {
    pub channel: Channel,
    frames: mpsc::UnboundedReceiver<QueryProviderOutbound>,
    connections: mpsc::UnboundedReceiver<QueryInbound>,
    subscription_requests: mpsc::UnboundedReceiver<SubscriptionQueryRequest>,
    subscription_sessions: mpsc::UnboundedReceiver<SubscriptionInbound>,
}

impl QueryHarness {
    pub async fn next_frame(&mut self) -> QueryProviderOutbound {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("platform closed")
    }

    pub async fn next_frame_matching(
        &mut self,
        mut predicate: impl FnMut(&QueryProviderOutbound) -> bool,
    ) -> QueryProviderOutbound {
        loop {
            let frame = self.next_frame().await;
            if predicate(&frame) {
                return frame;
            }
        }
    }

    pub async fn drain_frames(&mut self, window: Duration) -> Vec<QueryProviderOutbound> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = timeout(window, self.frames.recv()).await {
            frames.push(frame);
        }
        frames
    }

    pub async fn next_connection(&mut self) -> QueryInbound {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("platform closed")
    }

    pub async fn next_subscription_session(&mut self) -> SubscriptionInbound {
        timeout(WAIT, self.subscription_sessions.recv())
            .await
            .expect("timed out waiting for a subscription session")
            .expect("platform closed")
    }

    pub async fn next_subscription_request(&mut self) -> SubscriptionQueryRequest {
        timeout(WAIT, self.subscription_requests.recv())
            .await
            .expect("timed out waiting for a subscription request")
            .expect("platform closed")
    }

    pub async fn drain_subscription_requests(
        &mut self,
        window: Duration,
    ) -> Vec<SubscriptionQueryRequest> {
        let mut requests = Vec::new();
        while let Ok(Some(request)) = timeout(window, self.subscription_requests.recv()).await {
            requests.push(request);
        }
        requests
    }
}

pub async fn start_query_platform(auto_ack: bool) -> QueryHarness {
    let (captured_tx, captured_rx) = mpsc::unbounded_channel();
    let (connections_tx, connections_rx) = mpsc::unbounded_channel();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
    let service = TestQueryService {
        state: Arc::new(QueryState {
            captured: captured_tx,
            connections: connections_tx,
            subscription_requests: requests_tx,
            subscription_sessions: sessions_tx,
            auto_ack,
        }),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(QueryServiceServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let channel = plexus_connect::create_channel(&plexus_connect::ChannelConfig::new(format!(
        "http://{}",
        addr
    )))
    .await
    .unwrap();

    QueryHarness {
        channel,
        frames: captured_rx,
        connections: connections_rx,
        subscription_requests: requests_rx,
        subscription_sessions: sessions_rx,
    }
}
