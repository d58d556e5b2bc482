// ABOUTME: Query channel: query handling, server-streaming query, and subscription queries.
// ABOUTME: Fans incoming queries out to all registered handlers and multiplexes their replies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use plexus_proto::client::QueryServiceClient;
use plexus_proto::{
    query_provider_inbound, query_provider_outbound, subscription_query_request,
    subscription_query_response, FlowControl, InstructionAck, QueryComplete, QueryProviderInbound,
    QueryProviderOutbound, QueryRequest, QueryResponse, QuerySubscription, QueryUpdate,
    QueryUpdateComplete, SerializedObject, SubscriptionQuery, SubscriptionQueryRequest,
    SubscriptionQueryResponse,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffered::ResultStream;
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

/// Buffer capacity for plain server-streaming query results. The transport
/// applies its own backpressure, so no refill frames are sent.
const DEFAULT_QUERY_BUFFER: usize = 256;

/// A query this client can answer: the query name plus the result type it
/// produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryDefinition {
    query_name: String,
    result_type: String,
}

impl QueryDefinition {
    pub fn new(query_name: impl Into<String>, result_type: impl Into<String>) -> Self {
        Self {
            query_name: query_name.into(),
            result_type: result_type.into(),
        }
    }

    pub fn query_name(&self) -> &str {
        &self.query_name
    }

    pub fn result_type(&self) -> &str {
        &self.result_type
    }
}

/// Sink through which a query handler emits its responses.
///
/// Responses from every handler registered for the query are multiplexed onto
/// the channel's outbound stream; a response whose request identifier does not
/// match the incoming query is rewritten before it hits the wire.
pub struct QueryResponseSink {
    route: Route,
    completed: Arc<AtomicBool>,
}

enum Route {
    /// Direct query: responses stream out as query-response frames; the last
    /// handler to complete emits the single query-complete frame.
    Query {
        reply: ReplyChannel<QueryFrames>,
        request_id: String,
        remaining: Arc<AtomicUsize>,
    },
    /// Initial result of a subscription query: the first response is packaged
    /// as the initial result; completion acknowledges the instruction.
    InitialResult {
        reply: ReplyChannel<QueryFrames>,
        subscription_id: String,
        request_id: String,
        sent: Arc<AtomicBool>,
    },
}

impl QueryResponseSink {
    fn for_query(
        reply: ReplyChannel<QueryFrames>,
        request_id: String,
        remaining: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            route: Route::Query {
                reply,
                request_id,
                remaining,
            },
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn for_initial_result(
        reply: ReplyChannel<QueryFrames>,
        subscription_id: String,
        request_id: String,
    ) -> Self {
        Self {
            route: Route::InitialResult {
                reply,
                subscription_id,
                request_id,
                sent: Arc::new(AtomicBool::new(false)),
            },
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit one response for the query being handled.
    pub async fn send(&self, mut response: QueryResponse) {
        match &self.route {
            Route::Query {
                reply, request_id, ..
            } => {
                if response.request_identifier != *request_id {
                    debug!("request identifier not set by handler, rewriting");
                    response.request_identifier = request_id.clone();
                }
                let frame = query_response_frame(response);
                if let Err(error) = reply.send(frame).await {
                    warn!(%error, "failed to send query response");
                }
            }
            Route::InitialResult {
                reply,
                subscription_id,
                request_id,
                sent,
            } => {
                if sent.swap(true, Ordering::AcqRel) {
                    // only the first response becomes the initial result
                    return;
                }
                if response.request_identifier != *request_id {
                    response.request_identifier = request_id.clone();
                }
                let frame = QueryProviderOutbound {
                    instruction_id: String::new(),
                    request: Some(
                        query_provider_outbound::Request::SubscriptionQueryResponse(
                            SubscriptionQueryResponse {
                                message_identifier: response.message_identifier.clone(),
                                subscription_identifier: subscription_id.clone(),
                                response: Some(
                                    subscription_query_response::Response::InitialResult(response),
                                ),
                            },
                        ),
                    ),
                };
                if let Err(error) = reply.send(frame).await {
                    warn!(%error, "failed to send initial result");
                }
            }
        }
    }

    async fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.route {
            Route::Query {
                reply,
                request_id,
                remaining,
            } => {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    send_query_complete(reply, request_id).await;
                    reply.complete().await;
                }
            }
            Route::InitialResult { reply, .. } => {
                reply.send_ack().await;
            }
        }
    }

    async fn complete_with_error(&self, category: ErrorCategory, message: &str) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.route {
            Route::Query { reply, .. } | Route::InitialResult { reply, .. } => {
                reply.complete_with_error(category, message).await;
            }
        }
    }
}

/// Handle through which a handler pushes subscription-query updates.
#[derive(Clone)]
pub struct UpdateHandle {
    subscription_id: String,
    identity: ClientIdentity,
    reply: ReplyChannel<QueryFrames>,
}

impl UpdateHandle {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Forward one update to the subscriber.
    pub async fn send_update(&self, mut update: QueryUpdate) {
        if update.message_identifier.is_empty() {
            update.message_identifier = Uuid::new_v4().to_string();
        }
        update.client_id = self.identity.client_id().to_string();
        update.component_name = self.identity.component_name().to_string();
        let frame = QueryProviderOutbound {
            instruction_id: String::new(),
            request: Some(query_provider_outbound::Request::SubscriptionQueryResponse(
                SubscriptionQueryResponse {
                    message_identifier: update.message_identifier.clone(),
                    subscription_identifier: self.subscription_id.clone(),
                    response: Some(subscription_query_response::Response::Update(update)),
                },
            )),
        };
        if let Err(error) = self.reply.send(frame).await {
            warn!(%error, subscription = %self.subscription_id, "failed to send update");
        } else {
            debug!(subscription = %self.subscription_id, "subscription query update sent");
        }
    }

    /// Signal that no further updates will follow.
    pub async fn complete(&self) {
        let frame = QueryProviderOutbound {
            instruction_id: String::new(),
            request: Some(query_provider_outbound::Request::SubscriptionQueryResponse(
                SubscriptionQueryResponse {
                    message_identifier: Uuid::new_v4().to_string(),
                    subscription_identifier: self.subscription_id.clone(),
                    response: Some(subscription_query_response::Response::Complete(
                        QueryUpdateComplete {
                            message_identifier: Uuid::new_v4().to_string(),
                            client_id: self.identity.client_id().to_string(),
                            component_name: self.identity.component_name().to_string(),
                        },
                    )),
                },
            )),
        };
        if let Err(error) = self.reply.send(frame).await {
            warn!(%error, subscription = %self.subscription_id, "failed to send update completion");
        }
    }
}

/// Cancel handle for one handler's participation in a subscription query.
pub struct UpdateRegistration {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl UpdateRegistration {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detach the handler from the subscription. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for UpdateRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRegistration")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Handles queries routed to this client.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Answer one query, emitting any number of responses through `responses`.
    ///
    /// Returning `Ok` completes this handler's contribution; an error is
    /// surfaced to the peer as a failed completion.
    async fn handle(&self, query: QueryRequest, responses: &QueryResponseSink)
        -> anyhow::Result<()>;

    /// Attach to a subscription query, returning a registration whose cancel
    /// detaches again. The default implementation does not participate.
    async fn register_subscription_query(
        &self,
        _query: &SubscriptionQuery,
        _updates: UpdateHandle,
    ) -> Option<UpdateRegistration> {
        None
    }
}

/// Client-side session for an active subscription query.
pub struct SubscriptionQueryResult {
    subscription_id: String,
    query: QueryRequest,
    upstream: StreamSender<SubscriptionQueryRequest>,
    initial: watch::Receiver<Option<Result<QueryResponse, ConnectorError>>>,
    initial_requested: bool,
    updates: ResultStream<QueryUpdate>,
}

impl SubscriptionQueryResult {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// The initial result of the subscription query.
    ///
    /// The request is sent lazily on the first call and at most once;
    /// subsequent calls await the same outcome.
    pub async fn initial_result(&mut self) -> Result<QueryResponse, ConnectorError> {
        let resolved = self.initial.borrow().is_some();
        if !resolved && !self.initial_requested {
            self.initial_requested = true;
            let request = SubscriptionQueryRequest {
                request: Some(subscription_query_request::Request::GetInitialResult(
                    SubscriptionQuery {
                        subscription_identifier: self.subscription_id.clone(),
                        query_request: Some(self.query.clone()),
                        ..Default::default()
                    },
                )),
            };
            self.upstream.send(request).await?;
        }
        loop {
            if let Some(result) = self.initial.borrow().clone() {
                return result;
            }
            self.initial
                .changed()
                .await
                .map_err(|_| ConnectorError::StreamClosed)?;
        }
    }

    /// The stream of updates for this subscription.
    pub fn updates(&mut self) -> &mut ResultStream<QueryUpdate> {
        &mut self.updates
    }

    /// End the subscription: unsubscribes at the server and closes the
    /// session stream.
    pub async fn cancel(mut self) {
        self.updates.close();
        let request = SubscriptionQueryRequest {
            request: Some(subscription_query_request::Request::Unsubscribe(
                SubscriptionQuery {
                    subscription_identifier: self.subscription_id.clone(),
                    ..Default::default()
                },
            )),
        };
        let _ = self.upstream.send(request).await;
        // dropping the upstream sender ends the bidi stream
    }
}

/// Handler bookkeeping guarded by a single monitor: the decision whether an
/// add or remove requires wire traffic must be atomic with the mutation.
/// The sends themselves happen outside the lock.
#[derive(Default)]
struct QueryHandlerRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<Arc<dyn QueryHandler>>>,
    supported: HashSet<QueryDefinition>,
}

impl QueryHandlerRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add the handler for each definition; returns the definitions that need
    /// a subscribe instruction (first handler for that name/result pair).
    fn register(
        &self,
        handler: &Arc<dyn QueryHandler>,
        definitions: &[QueryDefinition],
    ) -> Vec<QueryDefinition> {
        let mut state = self.lock();
        let mut to_subscribe = Vec::new();
        for definition in definitions {
            state
                .handlers
                .entry(definition.query_name.clone())
                .or_default()
                .push(Arc::clone(handler));
            if state.supported.insert(definition.clone()) {
                to_subscribe.push(definition.clone());
            }
        }
        to_subscribe
    }

    /// Remove the handler for each definition; returns the definitions that
    /// need an unsubscribe instruction (last handler for that name removed).
    fn unregister(
        &self,
        handler: &Arc<dyn QueryHandler>,
        definitions: &[QueryDefinition],
    ) -> Vec<QueryDefinition> {
        let mut state = self.lock();
        let mut to_unsubscribe = Vec::new();
        for definition in definitions {
            let Some(list) = state.handlers.get_mut(&definition.query_name) else {
                continue;
            };
            let Some(position) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
                continue;
            };
            list.remove(position);
            if list.is_empty() {
                state.handlers.remove(&definition.query_name);
                if state.supported.remove(definition) {
                    to_unsubscribe.push(definition.clone());
                }
            }
        }
        to_unsubscribe
    }

    fn handlers_for(&self, query_name: &str) -> Vec<Arc<dyn QueryHandler>> {
        self.lock()
            .handlers
            .get(query_name)
            .cloned()
            .unwrap_or_default()
    }

    fn supported(&self) -> Vec<QueryDefinition> {
        self.lock().supported.iter().cloned().collect()
    }

    fn handler_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }
}

/// The query connection between this client and the platform.
///
/// Must be constructed inside a Tokio runtime: reconnect supervision runs on
/// a background task from the moment of construction.
#[derive(Clone)]
pub struct QueryChannel {
    inner: Arc<QueryChannelInner>,
}

struct QueryChannelInner {
    identity: ClientIdentity,
    settings: ConnectorSettings,
    client: QueryServiceClient<Channel>,
    outbound: OutboundStreamHolder<QueryProviderOutbound>,
    registry: QueryHandlerRegistry,
    sessions: DashMap<String, Vec<UpdateRegistration>>,
    pending: PendingInstructions,
    supervisor: Arc<ReconnectSupervisor>,
}

impl QueryChannel {
    /// Create a query channel over the given transport.
    pub fn new(identity: ClientIdentity, settings: ConnectorSettings, channel: Channel) -> Self {
        let client = QueryServiceClient::new(channel);
        let reconnect_interval = settings.reconnect_interval;
        let inner = Arc::new_cyclic(|weak: &Weak<QueryChannelInner>| {
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
            QueryChannelInner {
                identity,
                settings,
                client,
                outbound: OutboundStreamHolder::new(),
                registry: QueryHandlerRegistry::default(),
                sessions: DashMap::new(),
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

    /// Drop the stream and schedule an immediate re-open.
    pub async fn reconnect(&self) {
        drop(self.inner.outbound.get_and_set(None));
        self.inner.cancel_all_subscription_queries();
        self.inner.supervisor.schedule_immediate_reconnect();
    }

    /// Close the outbound side and tear down subscription-query sessions.
    /// Registered handlers are kept and resubscribed on a later connect.
    pub async fn disconnect(&self) {
        self.inner.supervisor.set_state(ConnectionState::Disconnected);
        drop(self.inner.outbound.get_and_set(None));
        self.inner.cancel_all_subscription_queries();
        self.inner.pending.fail_all(&ConnectorError::Disconnected);
    }

    /// Unsubscribe every supported query and wait for the acks; tears down
    /// subscription-query sessions but not the transport.
    pub async fn prepare_disconnect(&self) -> Result<(), ConnectorError> {
        let supported = self.inner.registry.supported();
        let mut acks = Vec::with_capacity(supported.len());
        for definition in &supported {
            acks.push(self.inner.send_unsubscribe(definition).await);
        }
        self.inner.cancel_all_subscription_queries();
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

    /// Register `handler` for each query definition.
    ///
    /// Only the first handler for a (name, result type) pair causes a
    /// subscribe instruction; removal of the last one causes the unsubscribe.
    pub async fn register_handler(
        &self,
        handler: Arc<dyn QueryHandler>,
        definitions: &[QueryDefinition],
    ) -> Registration {
        let to_subscribe = self.inner.registry.register(&handler, definitions);
        let mut acks = Vec::with_capacity(to_subscribe.len());
        for definition in &to_subscribe {
            let instruction_id = Uuid::new_v4().to_string();
            let frame = self.inner.subscribe_frame(definition, &instruction_id);
            acks.push(self.inner.send_instruction(frame).await);
        }
        for definition in definitions {
            debug!(query = %definition.query_name(), "registered handler for query");
        }

        let weak = Arc::downgrade(&self.inner);
        let definitions = definitions.to_vec();
        Registration::new(
            acks,
            Box::new(move || {
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    let to_unsubscribe = inner.registry.unregister(&handler, &definitions);
                    let mut acks = Vec::with_capacity(to_unsubscribe.len());
                    for definition in &to_unsubscribe {
                        acks.push(inner.send_unsubscribe(definition).await);
                        debug!(query = %definition.query_name(), "unregistered handlers for query");
                    }
                    for ack in acks {
                        ack.wait().await?;
                    }
                    Ok(())
                })
            }),
        )
    }

    /// Send a query and stream its responses.
    ///
    /// Errors, including connection failures, surface on consumption of the
    /// returned stream.
    pub fn query(&self, query: QueryRequest) -> ResultStream<QueryResponse> {
        let query = self.inner.prepare_query(query);
        let (sink, stream) = ResultStream::channel(DEFAULT_QUERY_BUFFER, 0, None);
        let mut client = self.inner.client.clone();
        tokio::spawn(async move {
            match client.query(query).await {
                Ok(response) => {
                    let mut messages = response.into_inner();
                    loop {
                        match messages.message().await {
                            Ok(Some(item)) => {
                                if sink.push(item).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                sink.complete().await;
                                break;
                            }
                            Err(status) => {
                                sink.fail(status.into()).await;
                                break;
                            }
                        }
                    }
                }
                Err(status) => sink.fail(status.into()).await,
            }
        });
        stream
    }

    /// Open a subscription query: an initial result plus a stream of updates
    /// until cancelled.
    ///
    /// `buffer_size` is the update credit extended to the server and
    /// `fetch_size` the refill batch.
    pub async fn subscription_query(
        &self,
        query: QueryRequest,
        update_response_type: SerializedObject,
        buffer_size: usize,
        fetch_size: u64,
    ) -> Result<SubscriptionQueryResult, ConnectorError> {
        let query = self.inner.prepare_query(query);
        let subscription_id = Uuid::new_v4().to_string();
        let client_id = self.inner.identity.client_id().to_string();

        let (upstream_tx, upstream_rx) =
            mpsc::channel::<SubscriptionQueryRequest>(self.inner.settings.outbound_buffer);
        let upstream = StreamSender::new(upstream_tx);
        let mut client = self.inner.client.clone();
        let mut responses = client
            .subscription(ReceiverStream::new(upstream_rx))
            .await
            .map_err(ConnectorError::from)?
            .into_inner();

        // Initial update credit, then the subscription itself.
        upstream
            .send(SubscriptionQueryRequest {
                request: Some(subscription_query_request::Request::FlowControl(
                    FlowControl {
                        client_id: client_id.clone(),
                        permits: buffer_size as u64,
                    },
                )),
            })
            .await?;
        upstream
            .send(SubscriptionQueryRequest {
                request: Some(subscription_query_request::Request::Subscribe(
                    SubscriptionQuery {
                        subscription_identifier: subscription_id.clone(),
                        number_of_permits: buffer_size as u64,
                        query_request: Some(query.clone()),
                        update_response_type: Some(update_response_type),
                    },
                )),
            })
            .await?;

        let refill_upstream = upstream.clone();
        let refill_client_id = client_id.clone();
        let (update_sink, updates) = ResultStream::channel(
            buffer_size,
            fetch_size,
            Some(Box::new(move |delta| {
                let _ = refill_upstream.try_send(SubscriptionQueryRequest {
                    request: Some(subscription_query_request::Request::FlowControl(
                        FlowControl {
                            client_id: refill_client_id.clone(),
                            permits: delta,
                        },
                    )),
                });
            })),
        );

        let (initial_tx, initial_rx) =
            watch::channel::<Option<Result<QueryResponse, ConnectorError>>>(None);

        tokio::spawn(async move {
            loop {
                match responses.message().await {
                    Ok(Some(response)) => match response.response {
                        Some(subscription_query_response::Response::InitialResult(result)) => {
                            initial_tx.send_if_modified(|slot| {
                                if slot.is_none() {
                                    *slot = Some(Ok(result));
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        Some(subscription_query_response::Response::Update(update)) => {
                            if update_sink.push(update).await.is_err() {
                                debug!("update consumer closed, dropping update");
                            }
                        }
                        Some(subscription_query_response::Response::Complete(_)) => {
                            update_sink.complete().await;
                        }
                        None => {}
                    },
                    Ok(None) => {
                        update_sink.complete().await;
                        break;
                    }
                    Err(status) => {
                        let error: ConnectorError = status.into();
                        update_sink.fail(error.clone()).await;
                        initial_tx.send_if_modified(|slot| {
                            if slot.is_none() {
                                *slot = Some(Err(error));
                                true
                            } else {
                                false
                            }
                        });
                        break;
                    }
                }
            }
        });

        Ok(SubscriptionQueryResult {
            subscription_id,
            query,
            upstream,
            initial: initial_rx,
            initial_requested: false,
            updates,
        })
    }
}

impl QueryChannelInner {
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

        // Replay every supported query on the new stream, each subscription
        // with a fresh instruction id.
        let supported = self.registry.supported();
        for definition in &supported {
            let frame = self.subscribe_frame(definition, &Uuid::new_v4().to_string());
            sender.send(frame).await?;
        }
        info!(
            registrations = self.registry.handler_count(),
            "query channel connected, registrations resubscribed"
        );

        drop(self.outbound.get_and_set(Some(sender.clone())));

        let governor =
            FlowControlGovernor::new(self.settings.permits, self.settings.permits_batch);
        let initial_permits = governor.initial_permits();
        let dispatcher = Arc::new(QueryDispatcher {
            inner: Arc::downgrade(self),
            sender: sender.clone(),
        });
        spawn_instruction_stream::<QueryFrames, _>(
            self.identity.client_id().to_string(),
            inbound,
            sender.clone(),
            governor,
            dispatcher,
        );

        sender
            .send(QueryFrames::flow_control_frame(FlowControl {
                client_id: self.identity.client_id().to_string(),
                permits: initial_permits,
            }))
            .await?;
        Ok(())
    }

    /// Hand the instruction to the active stream. Without a stream the ack
    /// resolves immediately: the subscription is replayed on connect anyway.
    async fn send_instruction(&self, frame: QueryProviderOutbound) -> AckFuture {
        match self.outbound.get() {
            Some(sender) => {
                let ack = self.pending.track(&frame.instruction_id);
                if let Err(error) = sender.send(frame).await {
                    debug!(%error, "failed to send instruction, stream closing");
                }
                ack
            }
            None => AckFuture::ready(Ok(())),
        }
    }

    async fn send_unsubscribe(&self, definition: &QueryDefinition) -> AckFuture {
        let instruction_id = Uuid::new_v4().to_string();
        let frame = self.unsubscribe_frame(definition, &instruction_id);
        self.send_instruction(frame).await
    }

    fn subscription(&self, definition: &QueryDefinition, instruction_id: &str) -> QuerySubscription {
        QuerySubscription {
            message_id: instruction_id.to_string(),
            query: definition.query_name.clone(),
            result_name: definition.result_type.clone(),
            component_name: self.identity.component_name().to_string(),
            client_id: self.identity.client_id().to_string(),
        }
    }

    fn subscribe_frame(
        &self,
        definition: &QueryDefinition,
        instruction_id: &str,
    ) -> QueryProviderOutbound {
        QueryProviderOutbound {
            instruction_id: instruction_id.to_string(),
            request: Some(query_provider_outbound::Request::Subscribe(
                self.subscription(definition, instruction_id),
            )),
        }
    }

    fn unsubscribe_frame(
        &self,
        definition: &QueryDefinition,
        instruction_id: &str,
    ) -> QueryProviderOutbound {
        QueryProviderOutbound {
            instruction_id: instruction_id.to_string(),
            request: Some(query_provider_outbound::Request::Unsubscribe(
                self.subscription(definition, instruction_id),
            )),
        }
    }

    fn prepare_query(&self, mut query: QueryRequest) -> QueryRequest {
        if query.message_identifier.is_empty() {
            query.message_identifier = Uuid::new_v4().to_string();
        }
        query.client_id = self.identity.client_id().to_string();
        query.component_name = self.identity.component_name().to_string();
        query
    }

    async fn handle_query(&self, query: QueryRequest, reply: ReplyChannel<QueryFrames>) {
        let handlers = self.registry.handlers_for(&query.query);
        let request_id = query.message_identifier.clone();

        if handlers.is_empty() {
            warn!(query = %query.query, "no handler for incoming query");
            reply
                .send_nack(ErrorCategory::NoHandlerForQuery, "No handler for query")
                .await;
            let response = QueryResponse {
                request_identifier: request_id.clone(),
                error_code: ErrorCategory::NoHandlerForQuery.error_code().to_string(),
                error_message: Some(ErrorCategory::NoHandlerForQuery.error_message(
                    "No handler for query",
                    self.identity.client_id().to_string(),
                )),
                ..Default::default()
            };
            if let Err(error) = reply.send(query_response_frame(response)).await {
                warn!(%error, "failed to send no-handler response");
            }
            send_query_complete(&reply, &request_id).await;
            reply.complete().await;
            return;
        }

        reply.send_ack().await;
        let remaining = Arc::new(AtomicUsize::new(handlers.len()));
        for handler in handlers {
            let sink =
                QueryResponseSink::for_query(reply.clone(), request_id.clone(), Arc::clone(&remaining));
            let query = query.clone();
            // Handler work must not block frame intake.
            tokio::spawn(async move {
                match handler.handle(query, &sink).await {
                    Ok(()) => sink.complete().await,
                    Err(error) => {
                        sink.complete_with_error(
                            ErrorCategory::QueryExecutionError,
                            &error.to_string(),
                        )
                        .await
                    }
                }
            });
        }
    }

    async fn handle_get_initial_result(
        &self,
        get: SubscriptionQuery,
        reply: ReplyChannel<QueryFrames>,
    ) {
        let subscription_id = get.subscription_identifier.clone();
        let Some(query) = get.query_request else {
            reply
                .send_nack(
                    ErrorCategory::UnsupportedInstruction,
                    "initial result request without query",
                )
                .await;
            return;
        };
        let request_id = query.message_identifier.clone();
        let sink = QueryResponseSink::for_initial_result(reply.clone(), subscription_id, request_id);

        let handlers = self.registry.handlers_for(&query.query);
        let Some(handler) = handlers.into_iter().next() else {
            warn!(query = %query.query, "no handler for initial result request");
            reply
                .send_nack(ErrorCategory::NoHandlerForQuery, "No handler for query")
                .await;
            let response = QueryResponse {
                request_identifier: query.message_identifier.clone(),
                error_code: ErrorCategory::NoHandlerForQuery.error_code().to_string(),
                error_message: Some(ErrorCategory::NoHandlerForQuery.error_message(
                    "No handler for query",
                    self.identity.client_id().to_string(),
                )),
                ..Default::default()
            };
            sink.send(response).await;
            return;
        };

        tokio::spawn(async move {
            match handler.handle(query, &sink).await {
                Ok(()) => sink.complete().await,
                Err(error) => {
                    sink.complete_with_error(ErrorCategory::QueryExecutionError, &error.to_string())
                        .await
                }
            }
        });
    }

    async fn handle_subscribe_updates(
        &self,
        subscribe: SubscriptionQuery,
        reply: ReplyChannel<QueryFrames>,
    ) {
        let subscription_id = subscribe.subscription_identifier.clone();
        let query_name = subscribe
            .query_request
            .as_ref()
            .map(|q| q.query.clone())
            .unwrap_or_default();
        let handlers = self.registry.handlers_for(&query_name);
        for handler in handlers {
            let updates = UpdateHandle {
                subscription_id: subscription_id.clone(),
                identity: self.identity.clone(),
                reply: reply.clone(),
            };
            if let Some(registration) = handler.register_subscription_query(&subscribe, updates).await
            {
                self.sessions
                    .entry(subscription_id.clone())
                    .or_default()
                    .push(registration);
            }
        }
    }

    fn handle_unsubscribe_updates(&self, unsubscribe: &SubscriptionQuery) {
        if let Some((_, registrations)) = self
            .sessions
            .remove(&unsubscribe.subscription_identifier)
        {
            for mut registration in registrations {
                registration.cancel();
            }
        }
    }

    fn cancel_all_subscription_queries(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, registrations)) = self.sessions.remove(&id) {
                for mut registration in registrations {
                    registration.cancel();
                }
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

fn query_response_frame(response: QueryResponse) -> QueryProviderOutbound {
    QueryProviderOutbound {
        instruction_id: String::new(),
        request: Some(query_provider_outbound::Request::QueryResponse(response)),
    }
}

async fn send_query_complete(reply: &ReplyChannel<QueryFrames>, request_id: &str) {
    let frame = QueryProviderOutbound {
        instruction_id: String::new(),
        request: Some(query_provider_outbound::Request::QueryComplete(
            QueryComplete {
                message_id: Uuid::new_v4().to_string(),
                request_id: request_id.to_string(),
            },
        )),
    };
    if let Err(error) = reply.send(frame).await {
        warn!(%error, "failed to send query completion");
    }
}

pub(crate) struct QueryFrames;

impl FrameSet for QueryFrames {
    type Inbound = QueryProviderInbound;
    type Outbound = QueryProviderOutbound;

    fn instruction_id(frame: &QueryProviderInbound) -> &str {
        &frame.instruction_id
    }

    fn ack_frame(ack: InstructionAck) -> QueryProviderOutbound {
        QueryProviderOutbound {
            instruction_id: String::new(),
            request: Some(query_provider_outbound::Request::Ack(ack)),
        }
    }

    fn flow_control_frame(flow_control: FlowControl) -> QueryProviderOutbound {
        QueryProviderOutbound {
            instruction_id: String::new(),
            request: Some(query_provider_outbound::Request::FlowControl(flow_control)),
        }
    }
}

struct QueryDispatcher {
    inner: Weak<QueryChannelInner>,
    sender: StreamSender<QueryProviderOutbound>,
}

#[async_trait]
impl InstructionDispatch<QueryFrames> for QueryDispatcher {
    async fn dispatch(
        &self,
        frame: QueryProviderInbound,
        reply: &ReplyChannel<QueryFrames>,
    ) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return true;
        };
        match frame.request {
            Some(query_provider_inbound::Request::Query(query)) => {
                inner.handle_query(query, reply.clone()).await;
                true
            }
            Some(query_provider_inbound::Request::Ack(ack)) => {
                inner.handle_ack(ack);
                true
            }
            Some(query_provider_inbound::Request::SubscriptionQueryRequest(request)) => {
                match request.request {
                    Some(subscription_query_request::Request::GetInitialResult(get)) => {
                        inner.handle_get_initial_result(get, reply.clone()).await;
                        true
                    }
                    Some(subscription_query_request::Request::Subscribe(subscribe)) => {
                        inner.handle_subscribe_updates(subscribe, reply.clone()).await;
                        true
                    }
                    Some(subscription_query_request::Request::Unsubscribe(unsubscribe)) => {
                        inner.handle_unsubscribe_updates(&unsubscribe);
                        true
                    }
                    _ => false,
                }
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
            inner.cancel_all_subscription_queries();
            inner.pending.fail_all(&cause);
            inner.supervisor.schedule_reconnect();
        }
    }
}
