//! OCPP-S over HTTP
//!
//! Every exchange is one POST. A station's Call gets its CallResult or Fault
//! in the HTTP response body. The central system has no channel of its own
//! to the station: its Calls wait in a per-station queue until the station
//! polls with a header-only envelope, and the station POSTs the answers back
//! (acknowledged with 202).
//!
//! A queued Call is dropped once the request it belongs to would have
//! timed out, so a late poll never delivers a Call whose caller already
//! gave up. At most [`MAX_QUEUED_CALLS`] wait per station.
//!
//! Status codes on the central side:
//! - 200 response envelope, or queued Call for a poll
//! - 202 answer to a polled Call accepted
//! - 204 poll with nothing queued
//! - 400 unreadable envelope or no charge box identity
//! - 401 credentials missing or wrong
//! - 500 response envelope carrying a Fault
//! - 503 / 504 no answer could be produced

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use parking_lot::Mutex;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{basic_auth_header, link, Accepted, Link, LinkControl, LinkDriver, LinkEvent};
use crate::codec::soap::{peek_header, SoapCodec, SoapContext, CONTENT_TYPE};
use crate::codec::TransportKind;
use crate::config::{BasicAuth, OcppConfig};
use crate::error::TransportError;
use crate::schema::SchemaRegistry;
use crate::types::{CorrelationId, PeerIdentity};

/// Extra time an HTTP exchange waits beyond the engine's own deadlines
const EXCHANGE_GRACE: Duration = Duration::from_secs(5);

/// Central-system Calls held for one station; further Calls are dropped
pub const MAX_QUEUED_CALLS: usize = 32;

// ---------------------------------------------------------------------------
// Station side
// ---------------------------------------------------------------------------

struct StationChannel {
    http: reqwest::Client,
    endpoint: String,
    auth: Option<BasicAuth>,
    inbound: mpsc::Sender<LinkEvent>,
    control: LinkControl,
}

impl StationChannel {
    async fn post(&self, body: Vec<u8>) {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("SOAP POST to {} failed: {}", self.endpoint, e);
                self.control.abort(TransportError::Io(e.to_string()));
                return;
            }
        };
        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            Err(e) => {
                error!("Failed to read SOAP response body: {}", e);
                self.control.abort(TransportError::Io(e.to_string()));
                return;
            }
        };

        match status {
            200 if !body.is_empty() => self.deliver(body).await,
            200 | 202 | 204 => {}
            code => {
                // A Fault is a protocol answer even on an error status
                let is_fault = peek_header(&body).map(|h| h.is_fault).unwrap_or(false);
                if is_fault {
                    self.deliver(body).await;
                } else {
                    warn!("SOAP endpoint {} answered HTTP {}", self.endpoint, code);
                    self.control.abort(TransportError::HttpStatus(code));
                }
            }
        }
    }

    async fn deliver(&self, body: Vec<u8>) {
        debug!("Received: {}", String::from_utf8_lossy(&body));
        let _ = self.inbound.send(LinkEvent::Frame(body)).await;
    }
}

/// Open a station-side OCPP-S link towards a central system endpoint
pub fn connect(config: &OcppConfig, endpoint: &str, identity: &PeerIdentity) -> Result<Link, TransportError> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout + EXCHANGE_GRACE)
        .build()
        .map_err(|e| TransportError::Io(e.to_string()))?;

    let (link, driver) = link(TransportKind::Soap);
    let LinkDriver {
        mut outbound,
        inbound,
        control,
    } = driver;

    let channel = Arc::new(StationChannel {
        http,
        endpoint: endpoint.to_string(),
        auth: config.basic_auth.clone(),
        inbound,
        control,
    });
    let poller = SoapCodec::new(
        SoapContext::for_identity(identity.clone()).with_namespace(config.soap.service_namespace.clone()),
        Arc::new(SchemaRegistry::new()),
    );
    let poll_interval = config.soap.poll_interval;

    info!("{} using OCPP-S endpoint {}", identity, endpoint);

    tokio::spawn(async move {
        let polling = Arc::new(AtomicBool::new(false));
        let mut poll = (!poll_interval.is_zero())
            .then(|| tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval));

        loop {
            tokio::select! {
                biased;

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    debug!("Sending: {}", String::from_utf8_lossy(&frame));
                    let channel = channel.clone();
                    tokio::spawn(async move { channel.post(frame).await });
                }

                _ = channel.control.closed() => break,

                _ = async {
                    match poll.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if polling.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    match poller.encode_poll() {
                        Ok(body) => {
                            let channel = channel.clone();
                            let polling = polling.clone();
                            tokio::spawn(async move {
                                channel.post(body).await;
                                polling.store(false, Ordering::Release);
                            });
                        }
                        Err(e) => {
                            error!("Failed to encode poll envelope: {}", e);
                            polling.store(false, Ordering::Release);
                        }
                    }
                }
            }
        }
        debug!("OCPP-S station link to {} stopped", channel.endpoint);
    });

    Ok(link)
}

// ---------------------------------------------------------------------------
// Central system side
// ---------------------------------------------------------------------------

struct QueuedCall {
    id: Option<CorrelationId>,
    frame: Vec<u8>,
    expires_at: Instant,
}

/// One station as seen by the central system
struct SoapSession {
    identity: PeerIdentity,
    inbound: mpsc::Sender<LinkEvent>,
    control: LinkControl,
    request_timeout: Duration,
    /// Central-system Calls waiting for the next poll, oldest first
    queue: Mutex<VecDeque<QueuedCall>>,
    /// Station Calls whose HTTP request is still open, by MessageID
    exchanges: Mutex<HashMap<CorrelationId, oneshot::Sender<Vec<u8>>>>,
}

impl SoapSession {
    fn route_outbound(&self, frame: Vec<u8>) {
        match peek_header(&frame) {
            Ok(header) => match header.relates_to {
                Some(id) => match self.exchanges.lock().remove(&id) {
                    Some(exchange) => {
                        let _ = exchange.send(frame);
                    }
                    None => warn!("No open HTTP exchange for response {} to {}", id, self.identity),
                },
                None => self.enqueue(header.message_id, frame),
            },
            Err(e) => error!("Dropping unreadable outbound envelope for {}: {}", self.identity, e),
        }
    }

    fn enqueue(&self, id: Option<CorrelationId>, frame: Vec<u8>) {
        let now = Instant::now();
        let mut queue = self.queue.lock();
        self.purge_expired(&mut queue, now);
        if queue.len() >= MAX_QUEUED_CALLS {
            warn!(
                "{} has {} requests waiting for a poll, dropping {:?}",
                self.identity,
                queue.len(),
                id
            );
            return;
        }
        queue.push_back(QueuedCall {
            id,
            frame,
            expires_at: now + self.request_timeout,
        });
        debug!("Queued request for {} until it polls ({} waiting)", self.identity, queue.len());
    }

    /// Oldest Call whose request is still live
    fn next_queued(&self) -> Option<Vec<u8>> {
        let mut queue = self.queue.lock();
        self.purge_expired(&mut queue, Instant::now());
        queue.pop_front().map(|call| call.frame)
    }

    fn queued(&self) -> usize {
        let mut queue = self.queue.lock();
        self.purge_expired(&mut queue, Instant::now());
        queue.len()
    }

    fn purge_expired(&self, queue: &mut VecDeque<QueuedCall>, now: Instant) {
        queue.retain(|call| {
            let live = call.expires_at > now;
            if !live {
                debug!("Request {:?} for {} expired before it was polled", call.id, self.identity);
            }
            live
        });
    }
}

struct ServerState {
    config: Arc<OcppConfig>,
    expected_auth: Option<String>,
    sessions: Mutex<HashMap<PeerIdentity, Arc<SoapSession>>>,
    accepted: mpsc::Sender<Accepted>,
}

impl ServerState {
    /// Live session for `identity`, announcing a new link when there is none
    async fn session_for(&self, identity: PeerIdentity) -> Result<Arc<SoapSession>, StatusCode> {
        let (session, link) = {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get(&identity) {
                if !session.control.is_closed() {
                    return Ok(session.clone());
                }
            }

            let (link, driver) = link(TransportKind::Soap);
            let LinkDriver {
                outbound,
                inbound,
                control,
            } = driver;
            let session = Arc::new(SoapSession {
                identity: identity.clone(),
                inbound,
                control,
                request_timeout: self.config.request_timeout,
                queue: Mutex::new(VecDeque::new()),
                exchanges: Mutex::new(HashMap::new()),
            });
            sessions.insert(identity.clone(), session.clone());
            spawn_session_pump(session.clone(), outbound);
            (session, link)
        };

        info!("{} connected over OCPP-S", identity);
        self.accepted
            .send(Accepted {
                link,
                identity,
                protocol: self.config.soap.protocol,
                remote_addr: None,
            })
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
        Ok(session)
    }

    fn exchange_timeout(&self) -> Duration {
        self.config.request_timeout.max(self.config.handler_timeout) + EXCHANGE_GRACE
    }
}

fn spawn_session_pump(session: Arc<SoapSession>, mut outbound: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    session.route_outbound(frame);
                }

                _ = session.control.closed() => break,
            }
        }
        // Open HTTP requests see their sender dropped and answer 503
        session.exchanges.lock().clear();
        session.queue.lock().clear();
        debug!("OCPP-S session for {} ended", session.identity);
    });
}

fn soap_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

async fn handle_post(State(state): State<Arc<ServerState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(expected) = &state.expected_auth {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"OCPP\"")],
            )
                .into_response();
        }
    }

    let soap_header = match peek_header(&body) {
        Ok(soap_header) => soap_header,
        Err(e) => {
            warn!("Rejecting unreadable SOAP request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let Some(identity) = soap_header.charge_box_identity.clone() else {
        return (StatusCode::BAD_REQUEST, "missing chargeBoxIdentity").into_response();
    };
    let session = match state.session_for(identity).await {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };

    if soap_header.is_poll() {
        return match session.next_queued() {
            Some(frame) => soap_response(StatusCode::OK, frame),
            None => StatusCode::NO_CONTENT.into_response(),
        };
    }

    debug!("Received: {}", String::from_utf8_lossy(&body));

    if soap_header.is_response() {
        return match session.inbound.send(LinkEvent::Frame(body.to_vec())).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        };
    }

    let Some(id) = soap_header.message_id.clone() else {
        return (StatusCode::BAD_REQUEST, "missing wsa:MessageID").into_response();
    };
    let (exchange, answer) = oneshot::channel();
    session.exchanges.lock().insert(id.clone(), exchange);

    if session.inbound.send(LinkEvent::Frame(body.to_vec())).await.is_err() {
        session.exchanges.lock().remove(&id);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match tokio::time::timeout(state.exchange_timeout(), answer).await {
        Ok(Ok(frame)) => {
            let is_fault = peek_header(&frame).map(|h| h.is_fault).unwrap_or(false);
            let status = if is_fault {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            soap_response(status, frame)
        }
        Ok(Err(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(_) => {
            session.exchanges.lock().remove(&id);
            warn!("No answer for {} from {} in time", id, session.identity);
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// Central-system OCPP-S endpoint; accepts POSTs on any path
pub struct SoapServer {
    local_addr: SocketAddr,
    accepted: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    state: Arc<ServerState>,
    server: JoinHandle<()>,
}

impl SoapServer {
    pub async fn bind(addr: impl ToSocketAddrs, config: Arc<OcppConfig>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (accepted_tx, accepted_rx) = mpsc::channel(super::LINK_CAPACITY);

        let state = Arc::new(ServerState {
            expected_auth: config.basic_auth.as_ref().map(basic_auth_header),
            config,
            sessions: Mutex::new(HashMap::new()),
            accepted: accepted_tx,
        });

        let app = axum::Router::new()
            .route("/", post(handle_post))
            .route("/*path", post(handle_post))
            .with_state(state.clone());

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("OCPP-S server stopped: {}", e);
            }
        });

        info!("Listening for OCPP-S on {}", local_addr);
        Ok(Self {
            local_addr,
            accepted: tokio::sync::Mutex::new(accepted_rx),
            state,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next station that started a session
    pub async fn accept(&self) -> Result<Accepted, TransportError> {
        self.accepted
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    /// Calls waiting for `identity` to poll
    pub fn queued_for(&self, identity: &PeerIdentity) -> usize {
        self.state
            .sessions
            .lock()
            .get(identity)
            .map(|session| session.queued())
            .unwrap_or(0)
    }
}

impl Drop for SoapServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Call, CallResult, Envelope, Message};
    use serde_json::json;

    fn codec(identity: &str) -> SoapCodec {
        SoapCodec::new(SoapContext::for_identity(identity.into()), Arc::new(SchemaRegistry::new()))
    }

    /// Poll as a station would, returning the HTTP status
    async fn poll(endpoint: &str, codec: &SoapCodec) -> (u16, Vec<u8>) {
        let response = reqwest::Client::new()
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(codec.encode_poll().unwrap())
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.bytes().await.unwrap().to_vec())
    }

    async fn wait_until_queued(server: &SoapServer, identity: &str, count: usize) {
        for _ in 0..200 {
            if server.queued_for(&identity.into()) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never had {} queued requests", identity, count);
    }

    async fn frame(link: &mut Link) -> Vec<u8> {
        match link.receiver.recv().await {
            LinkEvent::Frame(bytes) => bytes,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_station_call_answered_in_http_response() {
        let config = Arc::new(OcppConfig::default().with_poll_interval(Duration::ZERO));
        let server = SoapServer::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let endpoint = format!("http://{}/ocpp", server.local_addr());
        let mut station = connect(&config, &endpoint, &"CB1".into()).unwrap();
        let codec = codec("CB1");

        let call = Envelope::direct(Call::new("m-1", "Heartbeat", json!({})));
        station.sender.send(codec.encode(&call).unwrap()).await.unwrap();

        let mut central = server.accept().await.unwrap();
        assert_eq!(central.identity, "CB1");
        let received = codec.decode(&frame(&mut central.link).await).unwrap();
        assert_eq!(received, call);

        let answer = Envelope::direct(CallResult::new("m-1", json!({"currentTime": "now"})))
            .with_action("Heartbeat".into());
        central.link.sender.send(codec.encode(&answer).unwrap()).await.unwrap();

        let reply = codec.decode(&frame(&mut station).await).unwrap();
        assert_eq!(reply, answer);
    }

    #[tokio::test]
    async fn test_central_calls_wait_for_poll() {
        let config = Arc::new(OcppConfig::default().with_poll_interval(Duration::from_millis(50)));
        let server = SoapServer::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let endpoint = format!("http://{}/", server.local_addr());
        let mut station = connect(&config, &endpoint, &"CB2".into()).unwrap();
        let codec = codec("CB2");

        // The first poll opens the session
        let mut central = server.accept().await.unwrap();
        let reset = Envelope::direct(Call::new("c-9", "Reset", json!({"type": "Soft"})));
        central.link.sender.send(codec.encode(&reset).unwrap()).await.unwrap();

        let polled = codec.decode(&frame(&mut station).await).unwrap();
        assert_eq!(polled, reset);
        assert_eq!(server.queued_for(&"CB2".into()), 0);

        let answer = Envelope::direct(CallResult::new("c-9", json!({"status": "Accepted"})))
            .with_action("Reset".into());
        station.sender.send(codec.encode(&answer).unwrap()).await.unwrap();
        match codec.decode(&frame(&mut central.link).await).unwrap().message {
            Message::CallResult(result) => assert_eq!(result.correlation_id, "c-9"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_credentials_fail_the_link() {
        let server_config = Arc::new(OcppConfig::default().with_basic_auth("CB3", "right"));
        let server = SoapServer::bind("127.0.0.1:0", server_config).await.unwrap();
        let endpoint = format!("http://{}/ocpp", server.local_addr());

        let station_config = OcppConfig::default()
            .with_basic_auth("CB3", "wrong")
            .with_poll_interval(Duration::ZERO);
        let station = connect(&station_config, &endpoint, &"CB3".into()).unwrap();
        let call = Envelope::direct(Call::new("m-2", "Heartbeat", json!({})));
        station.sender.send(codec("CB3").encode(&call).unwrap()).await.unwrap();

        station.control.closed().await;
        assert_eq!(
            station.control.state(),
            super::super::LinkState::Failed(TransportError::HttpStatus(401))
        );
    }

    #[tokio::test]
    async fn test_expired_calls_are_not_polled() {
        let config = Arc::new(OcppConfig::default().with_request_timeout(Duration::from_millis(100)));
        let server = SoapServer::bind("127.0.0.1:0", config).await.unwrap();
        let endpoint = format!("http://{}/ocpp", server.local_addr());
        let codec = codec("CB4");

        assert_eq!(poll(&endpoint, &codec).await.0, 204);
        let central = server.accept().await.unwrap();

        let reset = Envelope::direct(Call::new("c-1", "Reset", json!({"type": "Hard"})));
        central.link.sender.send(codec.encode(&reset).unwrap()).await.unwrap();
        wait_until_queued(&server, "CB4", 1).await;

        // the caller's request has timed out by now
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(poll(&endpoint, &codec).await.0, 204);
        assert_eq!(server.queued_for(&"CB4".into()), 0);
    }

    #[tokio::test]
    async fn test_queue_depth_is_capped() {
        let config = Arc::new(OcppConfig::default());
        let server = SoapServer::bind("127.0.0.1:0", config).await.unwrap();
        let endpoint = format!("http://{}/ocpp", server.local_addr());
        let codec = codec("CB5");

        assert_eq!(poll(&endpoint, &codec).await.0, 204);
        let central = server.accept().await.unwrap();

        for i in 0..MAX_QUEUED_CALLS + 5 {
            let call = Envelope::direct(Call::new(format!("q-{}", i), "Reset", json!({"type": "Soft"})));
            central.link.sender.send(codec.encode(&call).unwrap()).await.unwrap();
        }
        wait_until_queued(&server, "CB5", MAX_QUEUED_CALLS).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.queued_for(&"CB5".into()), MAX_QUEUED_CALLS);

        // oldest first
        let (status, body) = poll(&endpoint, &codec).await;
        assert_eq!(status, 200);
        assert_eq!(codec.decode(&body).unwrap().correlation_id(), "q-0");
    }
}
