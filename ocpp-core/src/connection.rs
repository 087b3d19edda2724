//! Connection lifecycle
//!
//! A [`Connection`] glues one link to the engine: it owns the correlation
//! table and role binding, runs the inbound loop, and is the handle the
//! business layer sends requests through. It is created once a transport
//! handshake completes and is gone when the link closes, at which point
//! every request still pending on it fails with `ConnectionClosed`.
//!
//! ```text
//!            send_request ─▶ CorrelationTable ─▶ codec ─▶ FrameSender ═▶ wire
//!  wire ═▶ FrameReceiver ─▶ codec ─▶ Router ─┬▶ Call     ─▶ ActionDispatcher ─▶ reply
//!                                            ├▶ response ─▶ CorrelationTable ─▶ waiter
//!                                            └▶ elsewhere ─▶ neighbor connection
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::codec::{SoapContext, TransportKind, WireCodec};
use crate::config::OcppConfig;
use crate::correlation::CorrelationTable;
use crate::dispatcher::ActionDispatcher;
use crate::error::{CloseReason, DecodeError, RequestError, TransportError};
use crate::events::{EventBus, ProtocolEvent};
use crate::messages::{Call, Envelope, Message};
use crate::registry::PeerRegistry;
use crate::role::{Direction, Initiation, RoleBinding, Side};
use crate::router::{RouteDecision, Router};
use crate::schema::SchemaRegistry;
use crate::transport::{FrameReceiver, FrameSender, Link, LinkControl, LinkEvent, LinkState};
use crate::types::{Action, Payload, PeerIdentity, ProtocolVersion, Route};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a node's connections share
pub struct EngineContext {
    pub config: Arc<OcppConfig>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub events: EventBus,
    pub registry: Arc<PeerRegistry>,
    pub router: Arc<Router>,
    schemas: Mutex<HashMap<ProtocolVersion, Arc<SchemaRegistry>>>,
}

impl EngineContext {
    pub fn new(config: OcppConfig) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(PeerRegistry::new());
        let router = Arc::new(Router::new(config.node_id.clone(), registry.clone(), events.clone()));
        let dispatcher = Arc::new(ActionDispatcher::new(config.side, config.handler_timeout));

        Arc::new(Self {
            config: Arc::new(config),
            dispatcher,
            events,
            registry,
            router,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    /// Schema table used for `version`, built from the catalogue on first use
    pub fn schema_for(&self, version: ProtocolVersion) -> Arc<SchemaRegistry> {
        self.schemas
            .lock()
            .entry(version)
            .or_insert_with(|| {
                Arc::new(SchemaRegistry::for_protocol(version).strict(self.config.strict_schema))
            })
            .clone()
    }

    /// Open a connection to `remote` with this node's configured side and
    /// the preferred protocol for the link's transport
    pub fn open(self: &Arc<Self>, link: Link, remote: PeerIdentity) -> (Connection, JoinHandle<CloseReason>) {
        let protocol = match link.kind {
            TransportKind::Json => self.config.preferred_protocol(),
            TransportKind::Soap => self.config.soap.protocol,
        };
        self.open_with(link, remote, protocol)
    }

    pub fn open_with(
        self: &Arc<Self>,
        link: Link,
        remote: PeerIdentity,
        protocol: ProtocolVersion,
    ) -> (Connection, JoinHandle<CloseReason>) {
        let binding = RoleBinding::new(
            self.config.node_id.clone(),
            remote,
            self.config.side,
            link.kind,
            protocol,
        );
        Connection::open(link, binding, self.clone())
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("node_id", &self.config.node_id)
            .field("side", &self.config.side)
            .field("peers", &self.registry.len())
            .finish()
    }
}

struct Inner {
    id: u64,
    binding: RoleBinding,
    codec: WireCodec,
    sender: FrameSender,
    control: LinkControl,
    table: CorrelationTable,
    ctx: Arc<EngineContext>,
    close_reason: Mutex<Option<CloseReason>>,
    cancelled: AtomicUsize,
}

/// Handle to one live connection; clones share it
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Register the connection and start its inbound loop.
    ///
    /// The returned task ends with the reason the connection closed.
    pub fn open(link: Link, binding: RoleBinding, ctx: Arc<EngineContext>) -> (Connection, JoinHandle<CloseReason>) {
        let Link {
            kind,
            sender,
            receiver,
            control,
        } = link;

        let schema = ctx.schema_for(binding.protocol);
        let codec = match kind {
            TransportKind::Json => WireCodec::json(schema),
            TransportKind::Soap => {
                // chargeBoxIdentity always names the station end
                let station = match binding.side {
                    Side::ChargingStation => PeerIdentity::from(binding.local.as_str()),
                    _ => binding.remote.clone(),
                };
                let context = SoapContext::for_identity(station)
                    .with_namespace(ctx.config.soap.service_namespace.clone());
                WireCodec::soap(context, schema)
            }
        };

        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            table: CorrelationTable::new(ctx.config.request_timeout, ctx.events.clone()),
            binding,
            codec,
            sender,
            control,
            ctx,
            close_reason: Mutex::new(None),
            cancelled: AtomicUsize::new(0),
        });
        let connection = Connection { inner };

        info!(
            "{} connected to {} over {} ({}, connection #{})",
            connection.inner.binding.local,
            connection.peer(),
            kind,
            connection.inner.binding.protocol,
            connection.id()
        );
        connection.inner.ctx.registry.attach(connection.clone());
        connection.inner.ctx.events.publish(ProtocolEvent::ConnectionOpened {
            peer: connection.peer().clone(),
            transport: kind,
        });

        let task = tokio::spawn(connection.clone().run(receiver));
        (connection, task)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.inner.binding.remote
    }

    pub fn binding(&self) -> &RoleBinding {
        &self.inner.binding
    }

    pub fn is_closed(&self) -> bool {
        self.inner.control.is_closed()
    }

    /// Requests awaiting an answer
    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.ctx.events
    }

    async fn run(self, mut receiver: FrameReceiver) -> CloseReason {
        let period = self
            .inner
            .ctx
            .config
            .expiry_sweep_interval
            .max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.inner.control.closed() => break self.close_reason(),

                event = receiver.recv() => match event {
                    LinkEvent::Frame(bytes) => self.handle_frame(bytes).await,
                    LinkEvent::Closed(None) => {
                        info!("{} closed the connection", self.peer());
                        break CloseReason::PeerClosed;
                    }
                    LinkEvent::Closed(Some(e)) => {
                        error!("Connection to {} failed: {}", self.peer(), e);
                        break CloseReason::Transport(e);
                    }
                },

                _ = sweep.tick() => {
                    self.inner.table.expire_overdue(Instant::now());
                }
            }
        };

        self.shutdown(reason.clone());
        reason
    }

    fn shutdown(&self, reason: CloseReason) {
        self.record_close(reason.clone());
        // Closed before draining: a request registering from here on sees
        // `is_closed` and fails itself
        self.inner.control.close();
        let cancelled = self.inner.table.cancel_all(reason.clone());
        let cancelled = self.inner.cancelled.fetch_add(cancelled, Ordering::AcqRel) + cancelled;
        self.inner.ctx.registry.detach(self.peer(), self.id());

        info!("Connection #{} to {} ended: {}", self.id(), self.peer(), reason);
        self.inner.ctx.events.publish(ProtocolEvent::ConnectionClosed {
            peer: self.peer().clone(),
            reason,
            cancelled,
        });
    }

    fn record_close(&self, reason: CloseReason) {
        self.inner.close_reason.lock().get_or_insert(reason);
    }

    /// Why the connection closed (or `Local` if it is still open)
    pub fn close_reason(&self) -> CloseReason {
        if let Some(reason) = self.inner.close_reason.lock().clone() {
            return reason;
        }
        match self.inner.control.state() {
            LinkState::Failed(e) => CloseReason::Transport(e),
            _ => CloseReason::Local,
        }
    }

    /// Close locally
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Close and fail every pending request with `reason` before returning
    pub fn close_with(&self, reason: CloseReason) {
        self.record_close(reason.clone());
        self.inner.control.close();
        let cancelled = self.inner.table.cancel_all(reason);
        self.inner.cancelled.fetch_add(cancelled, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_frame(&self, bytes: Vec<u8>) {
        debug!("Received: {}", String::from_utf8_lossy(&bytes));
        match self.inner.codec.decode(&bytes) {
            Ok(envelope) => self.route_inbound(envelope).await,
            Err(e) => self.decode_failed(e).await,
        }
    }

    async fn decode_failed(&self, e: DecodeError) {
        warn!("Failed to decode message from {}: {}", self.peer(), e);
        self.inner.ctx.events.publish(ProtocolEvent::DecodeFailed {
            peer: self.peer().clone(),
            reason: e.to_string(),
        });

        // Routed Calls are answered along their path like any other answer
        if let Some(answer) = e.reply() {
            if let Err(send_error) = self.send_envelope(&answer).await {
                warn!("Failed to answer undecodable Call: {}", send_error);
            }
        }
        // The response arrived but is unusable; its caller hears about it now
        if let Some(id) = e.failed_response() {
            let _ = self
                .inner
                .table
                .resolve(id, Err(RequestError::InvalidResponse(e.to_string())));
        }
    }

    /// Payloads are only checked once a Call is known to be ours; transit
    /// traffic is passed on as read. Forwarding runs in its own task so a
    /// slow next hop never holds up this connection's inbound loop.
    async fn route_inbound(&self, envelope: Envelope) {
        let router = self.inner.ctx.router.clone();
        match router.decide(&envelope) {
            RouteDecision::Local => match self.inner.codec.validate_call(&envelope) {
                Ok(()) => self.deliver(envelope),
                Err(e) => self.decode_failed(e).await,
            },
            RouteDecision::Forward { next_hop } => {
                let connection = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = router.forward(envelope.clone(), &next_hop).await {
                        connection.reject(&envelope, e).await;
                    }
                });
            }
            RouteDecision::Back { previous_hop } => {
                let events = self.inner.ctx.events.clone();
                tokio::spawn(async move {
                    let id = envelope.correlation_id().clone();
                    if let Err(e) = router.route_back(envelope, &previous_hop).await {
                        warn!("Dropping answer {}: {}", id, e);
                        events.publish(ProtocolEvent::RoutingRejected {
                            correlation_id: id,
                            error: e,
                        });
                    }
                });
            }
            RouteDecision::Reject(e) => self.reject(&envelope, e).await,
            RouteDecision::Drop(e) => {
                warn!("Dropping answer {}: {}", envelope.correlation_id(), e);
                self.inner.ctx.events.publish(ProtocolEvent::RoutingRejected {
                    correlation_id: envelope.correlation_id().clone(),
                    error: e,
                });
            }
        }
    }

    /// Answer an unroutable Call on the connection it arrived on
    async fn reject(&self, envelope: &Envelope, error: crate::error::RoutingError) {
        if let Some(answer) = self.inner.ctx.router.rejection(envelope, &error) {
            if let Err(e) = self.send_envelope(&answer).await {
                warn!("Failed to send routing failure for {}: {}", envelope.correlation_id(), e);
            }
        }
    }

    fn deliver(&self, envelope: Envelope) {
        let Envelope { message, route, .. } = envelope;
        debug!(
            "{:?} {} from {} ({:?})",
            message.message_type(),
            message.correlation_id(),
            self.peer(),
            self.inner.binding.role_for(&message, Direction::Inbound)
        );
        match message {
            Message::Call(call) => self.spawn_dispatch(call, route),
            Message::CallResult(result) => {
                let id = result.correlation_id;
                let outcome = match self.inner.table.action_of(&id) {
                    Some(action) => self
                        .inner
                        .codec
                        .schema()
                        .validate_response(&action, &result.payload)
                        .map(|()| result.payload)
                        .map_err(|violation| RequestError::InvalidResponse(violation.to_string())),
                    None => Ok(result.payload),
                };
                self.resolve(id, outcome, false);
            }
            Message::CallError(error) => {
                let id = error.correlation_id.clone();
                self.resolve(id, Err(RequestError::from(error)), true);
            }
        }
    }

    fn resolve(&self, id: crate::types::CorrelationId, outcome: Result<Payload, RequestError>, is_error: bool) {
        match self.inner.table.resolve(&id, outcome) {
            Ok(action) => {
                debug!("{} {} answered by {}", action, id, self.peer());
                self.inner.ctx.events.publish(ProtocolEvent::ResponseReceived {
                    peer: self.peer().clone(),
                    correlation_id: id,
                    is_error,
                });
            }
            Err(e) => {
                warn!("Stray response from {}: {}", self.peer(), e);
                self.inner.ctx.events.publish(ProtocolEvent::StrayResponse {
                    peer: self.peer().clone(),
                    correlation_id: id,
                });
            }
        }
    }

    /// Run the handler in its own task so one slow handler never holds up
    /// the inbound loop. Exactly one answer goes back per Call.
    fn spawn_dispatch(&self, call: Call, route: Option<Route>) {
        let connection = self.clone();
        tokio::spawn(async move {
            let peer = route
                .as_ref()
                .and_then(|r| r.network_path.originator())
                .map(|origin| PeerIdentity::from(origin.as_str()))
                .unwrap_or_else(|| connection.peer().clone());
            let correlation_id = call.correlation_id.clone();
            let action = call.action.clone();

            connection.inner.ctx.events.publish(ProtocolEvent::RequestReceived {
                peer: peer.clone(),
                correlation_id: correlation_id.clone(),
                action: action.clone(),
            });

            let reply = connection.inner.ctx.dispatcher.dispatch(peer.clone(), call).await;
            let is_error = matches!(reply, Message::CallError(_));
            let envelope = Envelope::direct(reply)
                .with_route(route.as_ref().and_then(Route::reply))
                .with_action(action.clone());

            match connection.send_envelope(&envelope).await {
                Ok(()) => connection.inner.ctx.events.publish(ProtocolEvent::ResponseSent {
                    peer,
                    correlation_id,
                    is_error,
                }),
                Err(e) => warn!("Could not answer {} {}: {}", action, correlation_id, e),
            }
        });
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Encode and write one envelope
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), RequestError> {
        let frame = self.inner.codec.encode(envelope)?;
        debug!(
            "Sending ({:?}): {}",
            self.inner.binding.role_for(&envelope.message, Direction::Outbound),
            String::from_utf8_lossy(&frame)
        );
        self.inner.sender.send(frame).await.map_err(|e| match e {
            TransportError::Closed => RequestError::ConnectionClosed(self.close_reason()),
            other => RequestError::ConnectionClosed(CloseReason::Transport(other)),
        })
    }

    /// Send a Call and suspend until its answer, a timeout or connection loss
    pub async fn send_request(&self, action: impl Into<Action>, payload: Payload) -> Result<Payload, RequestError> {
        self.request(action.into(), payload, None).await
    }

    /// Send a Call carrying a multi-hop route
    pub async fn send_routed_request(
        &self,
        route: Route,
        action: impl Into<Action>,
        payload: Payload,
    ) -> Result<Payload, RequestError> {
        self.request(action.into(), payload, Some(route)).await
    }

    /// `send_request`, repeated with a fresh correlation id after each
    /// timeout, up to the configured `max_retries` extra attempts
    pub async fn send_request_with_retry(
        &self,
        action: impl Into<Action>,
        payload: Payload,
    ) -> Result<Payload, RequestError> {
        let action = action.into();
        let max_retries = self.inner.ctx.config.max_retries;
        let mut attempt = 0;
        loop {
            match self.request(action.clone(), payload.clone(), None).await {
                Err(RequestError::Timeout) if attempt < max_retries => {
                    attempt += 1;
                    warn!("{} to {} timed out, retry {}/{}", action, self.peer(), attempt, max_retries);
                }
                outcome => return outcome,
            }
        }
    }

    async fn request(&self, action: Action, payload: Payload, route: Option<Route>) -> Result<Payload, RequestError> {
        if self.is_closed() {
            return Err(RequestError::ConnectionClosed(self.close_reason()));
        }

        let pending = self.inner.table.register(action.clone());
        let id = pending.id().clone();

        // A close racing the registration would have missed this entry
        if self.is_closed() {
            let _ = self
                .inner
                .table
                .resolve(&id, Err(RequestError::ConnectionClosed(self.close_reason())));
            return pending.wait().await;
        }

        let envelope = Envelope::direct(Call::new(id.clone(), action.clone(), payload)).with_route(route);
        let initiation = self.inner.binding.initiation();
        match self.send_envelope(&envelope).await {
            Ok(()) => {
                if initiation == Initiation::Queued {
                    debug!("{} {} held until {} polls", action, id, self.peer());
                }
                self.inner.ctx.events.publish(ProtocolEvent::RequestSent {
                    peer: self.peer().clone(),
                    correlation_id: id,
                    action,
                    initiation,
                })
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", action, self.peer(), e);
                let _ = self.inner.table.resolve(&id, Err(e));
            }
        }

        pending.wait().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("binding", &self.inner.binding)
            .field("pending", &self.inner.table.len())
            .finish()
    }
}
